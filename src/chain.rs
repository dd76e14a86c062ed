use crate::api::{
    Address, Category, ChainId, Market, MarketId, MarketStats, NewMarketRequest, Outcome,
    Prediction, TxHash, TxStatus, Wei, WinningOutcome,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct MarketCreated {
    pub market: MarketId,
}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMarket {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub bet_amount: Wei,
    pub end_time: DateTime<Utc>,
    pub settlement_source: String,
    pub tags: Vec<String>,
}
impl NewMarket {
    pub fn from_request(request: &NewMarketRequest, bet_amount: Wei) -> Self {
        Self {
            title: request.title.trim().to_string(),
            description: request.description.trim().to_string(),
            category: request.category,
            bet_amount,
            end_time: request.end_time,
            settlement_source: request.settlement_source.trim().to_string(),
            tags: request.tags.clone(),
        }
    }
}

#[async_trait]
pub trait ChainClient {
    async fn chain_id(&self) -> Result<ChainId>;
    async fn get_market_count(&self) -> Result<u64>;
    async fn get_market_ids(&self, offset: u64, limit: u64) -> Result<Vec<MarketId>>;
    async fn get_market(&self, market: MarketId) -> Result<(Market, MarketStats)>;
    async fn get_market_stats(&self, market: MarketId) -> Result<MarketStats>;
    async fn has_user_predicted(&self, market: MarketId, user: &Address) -> Result<bool>;
    async fn get_user_prediction(&self, market: MarketId, user: &Address) -> Result<Prediction>;
    async fn tx_status(&self, tx: &TxHash) -> Result<TxStatus>;
    async fn create_market(&self, market: NewMarket, user: &Address) -> Result<TxHash>;
    async fn make_prediction(
        &self,
        market: MarketId,
        outcome: Outcome,
        value: Wei,
        user: &Address,
    ) -> Result<TxHash>;
    async fn claim_winnings(&self, market: MarketId, user: &Address) -> Result<TxHash>;
    async fn batch_claim_winnings(&self, markets: &[MarketId], user: &Address) -> Result<TxHash>;
    fn subscribe_market_created(&self) -> broadcast::Receiver<MarketCreated>;
}

#[derive(Debug, Clone)]
pub struct TestChain {
    chain_id: ChainId,
    markets: Arc<Mutex<Vec<Market>>>,
    predictions: Arc<Mutex<HashMap<(MarketId, Address), Prediction>>>,
    failing: Arc<Mutex<HashSet<MarketId>>>,
    txs: Arc<Mutex<HashMap<TxHash, TxStatus>>>,
    next_tx: Arc<Mutex<u64>>,
    created: broadcast::Sender<MarketCreated>,
}
impl TestChain {
    pub fn new(chain_id: ChainId) -> Self {
        let (created, _) = broadcast::channel(16);
        Self {
            chain_id,
            markets: Arc::new(Mutex::new(vec![])),
            predictions: Arc::new(Mutex::new(HashMap::new())),
            failing: Arc::new(Mutex::new(HashSet::new())),
            txs: Arc::new(Mutex::new(HashMap::new())),
            next_tx: Arc::new(Mutex::new(0)),
            created,
        }
    }
    pub fn seed_market(&self, market: Market) {
        self.markets.lock().unwrap().push(market);
    }
    pub fn fail_market(&self, market: MarketId) {
        self.failing.lock().unwrap().insert(market);
    }
    pub fn resolve_market(&self, market: MarketId, outcome: Outcome) -> Result<()> {
        let mut markets = self.markets.lock().unwrap();
        let market = match markets.iter_mut().find(|entry| entry.id == market) {
            Some(market) => market,
            None => bail!("Market {} doesn't exist", market),
        };
        market.is_resolved = true;
        market.is_active = false;
        market.winning_outcome = match outcome {
            Outcome::No => WinningOutcome::No,
            Outcome::Yes => WinningOutcome::Yes,
        };
        Ok(())
    }
    fn confirm_tx(&self) -> TxHash {
        let mut next = self.next_tx.lock().unwrap();
        *next += 1;
        let tx = format!("0xtest{:04x}", *next);
        self.txs
            .lock()
            .unwrap()
            .insert(tx.clone(), TxStatus::Confirmed);
        tx
    }
    fn stats_for(&self, market: MarketId) -> MarketStats {
        let predictions = self.predictions.lock().unwrap();
        let mut stats = MarketStats::default();
        let mut predictors = HashSet::new();
        for prediction in predictions.values().filter(|p| p.market == market) {
            stats.total_predictions += 1;
            stats.total_pool += prediction.amount;
            match prediction.outcome {
                Outcome::Yes => stats.yes_pool += prediction.amount,
                Outcome::No => stats.no_pool += prediction.amount,
            }
            predictors.insert(prediction.predictor.clone());
        }
        stats.unique_predictors = predictors.len() as u64;
        stats
    }
    fn apply_claim(&self, market: MarketId, user: &Address) -> Result<()> {
        let (is_resolved, winning_outcome) = {
            let markets = self.markets.lock().unwrap();
            let entry = match markets.iter().find(|entry| entry.id == market) {
                Some(entry) => entry,
                None => bail!("Market {} doesn't exist", market),
            };
            (entry.is_resolved, entry.winning_outcome)
        };
        if !is_resolved {
            bail!("Market {} isn't resolved yet", market);
        }
        let mut predictions = self.predictions.lock().unwrap();
        let prediction = match predictions.get_mut(&(market, user.clone())) {
            Some(prediction) => prediction,
            None => bail!("No prediction for user {} on market {}", user, market),
        };
        let won = matches!(
            (prediction.outcome, winning_outcome),
            (Outcome::Yes, WinningOutcome::Yes) | (Outcome::No, WinningOutcome::No)
        );
        if !won {
            bail!("Prediction on market {} didn't win", market);
        }
        if prediction.claimed {
            bail!("Winnings for market {} were already claimed", market);
        }
        prediction.claimed = true;
        Ok(())
    }
}
#[async_trait]
impl ChainClient for TestChain {
    async fn chain_id(&self) -> Result<ChainId> {
        Ok(self.chain_id)
    }
    async fn get_market_count(&self) -> Result<u64> {
        Ok(self.markets.lock().unwrap().len() as u64)
    }
    async fn get_market_ids(&self, offset: u64, limit: u64) -> Result<Vec<MarketId>> {
        let markets = self.markets.lock().unwrap();
        Ok(markets
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|market| market.id)
            .collect())
    }
    async fn get_market(&self, market: MarketId) -> Result<(Market, MarketStats)> {
        if self.failing.lock().unwrap().contains(&market) {
            bail!("Injected fetch failure for market {}", market);
        }
        let entry = {
            let markets = self.markets.lock().unwrap();
            match markets.iter().find(|entry| entry.id == market) {
                Some(entry) => entry.clone(),
                None => bail!("Market {} doesn't exist", market),
            }
        };
        let stats = self.stats_for(market);
        Ok((entry, stats))
    }
    async fn get_market_stats(&self, market: MarketId) -> Result<MarketStats> {
        let exists = self
            .markets
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.id == market);
        if !exists {
            bail!("Market {} doesn't exist", market);
        }
        Ok(self.stats_for(market))
    }
    async fn has_user_predicted(&self, market: MarketId, user: &Address) -> Result<bool> {
        Ok(self
            .predictions
            .lock()
            .unwrap()
            .contains_key(&(market, user.clone())))
    }
    async fn get_user_prediction(&self, market: MarketId, user: &Address) -> Result<Prediction> {
        match self
            .predictions
            .lock()
            .unwrap()
            .get(&(market, user.clone()))
        {
            Some(prediction) => Ok(prediction.clone()),
            None => bail!("No prediction for user {} on market {}", user, market),
        }
    }
    async fn tx_status(&self, tx: &TxHash) -> Result<TxStatus> {
        match self.txs.lock().unwrap().get(tx) {
            Some(status) => Ok(*status),
            None => bail!("Unknown transaction {}", tx),
        }
    }
    async fn create_market(&self, market: NewMarket, user: &Address) -> Result<TxHash> {
        let id = {
            let mut markets = self.markets.lock().unwrap();
            let id = markets.len() as MarketId + 1;
            markets.push(Market {
                id,
                title: market.title,
                description: market.description,
                category: market.category,
                bet_amount: market.bet_amount,
                end_time: market.end_time,
                is_resolved: false,
                settlement_source: market.settlement_source,
                creator: user.clone(),
                created_at: Utc::now(),
                winning_outcome: WinningOutcome::Unresolved,
                is_active: true,
                tags: market.tags,
            });
            id
        };
        let tx = self.confirm_tx();
        let _ = self.created.send(MarketCreated { market: id });
        Ok(tx)
    }
    async fn make_prediction(
        &self,
        market: MarketId,
        outcome: Outcome,
        value: Wei,
        user: &Address,
    ) -> Result<TxHash> {
        {
            let markets = self.markets.lock().unwrap();
            let entry = match markets.iter().find(|entry| entry.id == market) {
                Some(entry) => entry,
                None => bail!("Market {} doesn't exist", market),
            };
            if entry.is_resolved {
                bail!("Market {} is already resolved", market);
            }
            if entry.end_time <= Utc::now() {
                bail!("Trading on market {} has ended", market);
            }
            if value != entry.bet_amount {
                bail!(
                    "Sent {} wei but the fixed bet amount is {} wei",
                    value,
                    entry.bet_amount
                );
            }
        }
        let mut predictions = self.predictions.lock().unwrap();
        if predictions.contains_key(&(market, user.clone())) {
            bail!("User {} has already predicted on market {}", user, market);
        }
        predictions.insert(
            (market, user.clone()),
            Prediction {
                predictor: user.clone(),
                market,
                outcome,
                amount: value,
                timestamp: Utc::now(),
                claimed: false,
            },
        );
        drop(predictions);
        Ok(self.confirm_tx())
    }
    async fn claim_winnings(&self, market: MarketId, user: &Address) -> Result<TxHash> {
        self.apply_claim(market, user)?;
        Ok(self.confirm_tx())
    }
    async fn batch_claim_winnings(&self, markets: &[MarketId], user: &Address) -> Result<TxHash> {
        for market in markets {
            self.apply_claim(*market, user)?;
        }
        Ok(self.confirm_tx())
    }
    fn subscribe_market_created(&self) -> broadcast::Receiver<MarketCreated> {
        self.created.subscribe()
    }
}

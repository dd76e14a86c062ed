use crate::api::*;
use crate::chain::{ChainClient, NewMarket};
use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use futures_util::future::join_all;
use log::{debug, warn};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const CONFIRM_POLL: StdDuration = StdDuration::from_millis(500);
const CONFIRM_ATTEMPTS: u32 = 120;

#[derive(Debug, Error, PartialEq)]
pub enum MatchupError {
    #[error("Connected to chain {actual} but expected chain {expected}")]
    WrongNetwork { expected: ChainId, actual: ChainId },
    #[error("{0}")]
    Validation(String),
    #[error("User {user} has already predicted on market {market}")]
    AlreadyPredicted { market: MarketId, user: Address },
    #[error("Market {0} is closed for predictions")]
    MarketClosed(MarketId),
}

pub struct Matchup {
    chain: Arc<Box<dyn ChainClient + Send + Sync>>,
    expected_chain: ChainId,
    finality_delay: StdDuration,
    snapshot: Vec<MarketOverview>,
}

impl Matchup {
    pub fn new(
        chain: Box<dyn ChainClient + Send + Sync>,
        expected_chain: ChainId,
        finality_delay: StdDuration,
    ) -> Self {
        Self {
            chain: Arc::new(chain),
            expected_chain,
            finality_delay,
            snapshot: vec![],
        }
    }
    pub fn snapshot(&self) -> Vec<MarketOverview> {
        self.snapshot.clone()
    }
    pub async fn sync_markets(&mut self) -> Result<Vec<MarketOverview>> {
        let actual = self.chain.chain_id().await?;
        if actual != self.expected_chain {
            self.snapshot = vec![];
            return Err(MatchupError::WrongNetwork {
                expected: self.expected_chain,
                actual,
            }
            .into());
        }
        let count = self.chain.get_market_count().await?;
        if count == 0 {
            self.snapshot = vec![];
            return Ok(vec![]);
        }
        let ids = self.chain.get_market_ids(0, count).await?;
        debug!("Fetching {} markets", ids.len());
        let fetches = ids.iter().map(|id| self.fetch_overview(*id));
        let markets: Vec<MarketOverview> = join_all(fetches).await.into_iter().flatten().collect();
        self.snapshot = markets.clone();
        Ok(markets)
    }
    async fn fetch_overview(&self, id: MarketId) -> Option<MarketOverview> {
        let (market, stats) = match self.chain.get_market(id).await {
            Ok(result) => result,
            Err(e) => {
                debug!("Failed to fetch market {}: {:#}", id, e);
                return None;
            }
        };
        if market.title.is_empty() {
            debug!("Market {} has empty data, skipping", id);
            return None;
        }
        let status = if market.is_resolved || market.end_time <= Utc::now() {
            MarketStatus::Ended
        } else {
            MarketStatus::Active
        };
        Some(MarketOverview {
            id: market.id,
            title: market.title,
            category: market.category,
            description: market.description,
            participants: stats.total_predictions,
            end_time: market.end_time,
            status,
            bet_amount_eth: format_eth(market.bet_amount),
            settlement_source: market.settlement_source,
        })
    }
    pub async fn create_market(&mut self, request: NewMarketRequest) -> Result<TxHash> {
        let bet_amount = validate_new_market(&request)?;
        let market = NewMarket::from_request(&request, bet_amount);
        debug!(
            "Creating market \"{}\" with bet amount {} wei ending {}",
            market.title, market.bet_amount, market.end_time
        );
        let tx = self.chain.create_market(market, &request.user).await?;
        self.await_confirmation(&tx).await?;
        Ok(tx)
    }
    pub async fn make_prediction(
        &mut self,
        market: MarketId,
        user: &Address,
        outcome: Outcome,
    ) -> Result<TxHash> {
        if self.chain.has_user_predicted(market, user).await? {
            return Err(MatchupError::AlreadyPredicted {
                market,
                user: user.clone(),
            }
            .into());
        }
        let (record, _) = self
            .chain
            .get_market(market)
            .await
            .context("failed to get market")?;
        if record.is_resolved || record.end_time <= Utc::now() {
            return Err(MatchupError::MarketClosed(market).into());
        }
        debug!(
            "User {} predicting {} on market {} for {} wei",
            user, outcome, market, record.bet_amount
        );
        let tx = self
            .chain
            .make_prediction(market, outcome, record.bet_amount, user)
            .await?;
        self.await_confirmation(&tx).await?;
        Ok(tx)
    }
    pub async fn claim_winnings(&mut self, market: MarketId, user: &Address) -> Result<TxHash> {
        let tx = self.chain.claim_winnings(market, user).await?;
        self.await_confirmation(&tx).await?;
        debug!("User {} claimed winnings on market {}", user, market);
        Ok(tx)
    }
    pub async fn batch_claim_winnings(
        &mut self,
        markets: &[MarketId],
        user: &Address,
    ) -> Result<TxHash> {
        if markets.is_empty() {
            bail!("No markets to claim winnings for");
        }
        let tx = self.chain.batch_claim_winnings(markets, user).await?;
        self.await_confirmation(&tx).await?;
        debug!(
            "User {} claimed winnings on {} markets",
            user,
            markets.len()
        );
        Ok(tx)
    }
    pub async fn has_user_predicted(&self, market: MarketId, user: &Address) -> Result<bool> {
        self.chain.has_user_predicted(market, user).await
    }
    pub async fn get_user_prediction(
        &self,
        market: MarketId,
        user: &Address,
    ) -> Result<Prediction> {
        self.chain.get_user_prediction(market, user).await
    }
    pub async fn get_market(&self, market: MarketId) -> Result<(Market, MarketStats)> {
        self.chain.get_market(market).await
    }
    pub async fn get_market_stats(&self, market: MarketId) -> Result<MarketStats> {
        self.chain.get_market_stats(market).await
    }
    pub async fn market_data(&self, market: MarketId) -> Result<MarketDataResponse> {
        let (market, stats) = self.chain.get_market(market).await?;
        Ok(MarketDataResponse {
            id: market.id,
            title: market.title,
            description: market.description,
            category: market.category,
            bet_amount: market.bet_amount,
            end_time: market.end_time,
            is_resolved: market.is_resolved,
            settlement_source: market.settlement_source,
            creator: market.creator,
            created_at: market.created_at,
            winning_outcome: market.winning_outcome,
            is_active: market.is_active,
            tags: market.tags,
            total_predictions: stats.total_predictions,
            total_pool: stats.total_pool,
            yes_pool: stats.yes_pool,
            no_pool: stats.no_pool,
            unique_predictors: stats.unique_predictors,
        })
    }
    pub async fn user_predictions(&self, user: &Address) -> Result<Vec<UserPredictionResponse>> {
        let count = self.chain.get_market_count().await?;
        if count == 0 {
            return Ok(vec![]);
        }
        let ids = self.chain.get_market_ids(0, count).await?;
        let fetches = ids.iter().map(|id| self.fetch_user_prediction(*id, user));
        Ok(join_all(fetches).await.into_iter().flatten().collect())
    }
    async fn fetch_user_prediction(
        &self,
        id: MarketId,
        user: &Address,
    ) -> Option<UserPredictionResponse> {
        match self.chain.has_user_predicted(id, user).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                debug!("Failed to check prediction on market {}: {:#}", id, e);
                return None;
            }
        }
        let prediction = match self.chain.get_user_prediction(id, user).await {
            Ok(prediction) => prediction,
            Err(e) => {
                debug!("Failed to fetch prediction on market {}: {:#}", id, e);
                return None;
            }
        };
        let (market, _) = match self.chain.get_market(id).await {
            Ok(result) => result,
            Err(e) => {
                debug!("Failed to fetch market {}: {:#}", id, e);
                return None;
            }
        };
        Some(UserPredictionResponse {
            market: id,
            title: market.title,
            outcome: prediction.outcome,
            bet_amount_eth: format_eth(prediction.amount),
            timestamp: prediction.timestamp,
            claimed: prediction.claimed,
            is_resolved: market.is_resolved,
            winning_outcome: market.winning_outcome,
        })
    }
    async fn await_confirmation(&self, tx: &TxHash) -> Result<()> {
        for _ in 0..CONFIRM_ATTEMPTS {
            match self.chain.tx_status(tx).await? {
                TxStatus::Confirmed => return Ok(()),
                TxStatus::Failed => bail!("Transaction {} failed", tx),
                TxStatus::Pending => tokio::time::sleep(CONFIRM_POLL).await,
            }
        }
        bail!("Transaction {} wasn't confirmed in time", tx)
    }
    pub fn subscribe_market_created(&self) -> broadcast::Receiver<crate::chain::MarketCreated> {
        self.chain.subscribe_market_created()
    }
}

pub fn validate_new_market(request: &NewMarketRequest) -> Result<Wei> {
    if request.title.trim().is_empty() {
        return Err(MatchupError::Validation("Market title can't be empty".to_string()).into());
    }
    if request.description.trim().is_empty() {
        return Err(
            MatchupError::Validation("Market description can't be empty".to_string()).into(),
        );
    }
    let bet_amount = parse_eth(&request.bet_amount_eth)
        .map_err(|e| MatchupError::Validation(format!("{:#}", e)))?;
    if bet_amount == 0 {
        return Err(
            MatchupError::Validation("Bet amount needs to be greater than 0".to_string()).into(),
        );
    }
    let min_end = Utc::now() + Duration::hours(1);
    if request.end_time < min_end {
        return Err(MatchupError::Validation(format!(
            "End time was {} but needs to be at least an hour from now",
            request.end_time
        ))
        .into());
    }
    let source = request.settlement_source.trim();
    let url = Url::parse(source).map_err(|_| {
        MatchupError::Validation(format!(
            "Settlement source needs to be a http(s) URL, got \"{}\"",
            source
        ))
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(MatchupError::Validation(format!(
            "Settlement source needs to be a http(s) URL, got \"{}\"",
            source
        ))
        .into());
    }
    Ok(bet_amount)
}

pub fn spawn_event_watcher(state: Arc<RwLock<Matchup>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut events, delay) = {
            let matchup = state.read().await;
            (matchup.subscribe_market_created(), matchup.finality_delay)
        };
        loop {
            match events.recv().await {
                Ok(event) => {
                    debug!(
                        "New market {} created, refreshing in {:?}",
                        event.market, delay
                    );
                    // Give the transaction time to reach finality before refetching.
                    tokio::time::sleep(delay).await;
                    if let Err(e) = state.write().await.sync_markets().await {
                        warn!("Failed to refresh markets after creation event: {:#}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event watcher lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::TestChain;

    const BASE: ChainId = 8453;

    fn new_market_request(title: &str) -> NewMarketRequest {
        NewMarketRequest {
            title: title.to_string(),
            description: "A test market".to_string(),
            category: Category::Crypto,
            bet_amount_eth: "0.0005".to_string(),
            end_time: Utc::now() + Duration::days(3),
            settlement_source: "https://www.coingecko.com/en/coins/bitcoin".to_string(),
            tags: vec![],
            user: "0xalice".to_string(),
        }
    }
    fn empty_market(id: MarketId) -> Market {
        Market {
            id,
            title: "".to_string(),
            description: "".to_string(),
            category: Category::Custom,
            bet_amount: 0,
            end_time: Utc::now(),
            is_resolved: false,
            settlement_source: "".to_string(),
            creator: "".to_string(),
            created_at: Utc::now(),
            winning_outcome: WinningOutcome::Unresolved,
            is_active: false,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn sync_drops_empty_and_failed_markets() {
        let chain = TestChain::new(BASE);
        let mut matchup = Matchup::new(
            Box::new(chain.clone()),
            BASE,
            StdDuration::from_millis(100),
        );
        matchup
            .create_market(new_market_request("First"))
            .await
            .unwrap();
        matchup
            .create_market(new_market_request("Second"))
            .await
            .unwrap();
        matchup
            .create_market(new_market_request("Third"))
            .await
            .unwrap();
        chain.seed_market(empty_market(4));
        chain.fail_market(2);
        let markets = matchup.sync_markets().await.unwrap();
        assert_eq!(
            markets.iter().map(|market| market.id).collect::<Vec<_>>(),
            vec![1, 3]
        );
        for market in &markets {
            assert!(!market.title.is_empty());
            assert_eq!(market.status, MarketStatus::Active);
            assert_eq!(market.bet_amount_eth, "0.0005");
        }
    }
    #[tokio::test]
    async fn wrong_network_yields_empty_list_and_error() {
        let chain = TestChain::new(1);
        let mut matchup = Matchup::new(
            Box::new(chain.clone()),
            BASE,
            StdDuration::from_millis(100),
        );
        let request = new_market_request("Unreachable");
        let market = NewMarket::from_request(&request, 100);
        chain
            .create_market(market, &"0xalice".to_string())
            .await
            .unwrap();
        let error = matchup.sync_markets().await.unwrap_err();
        assert_eq!(
            error.downcast_ref::<MatchupError>(),
            Some(&MatchupError::WrongNetwork {
                expected: BASE,
                actual: 1
            })
        );
        assert!(matchup.snapshot().is_empty());
    }
    #[tokio::test]
    async fn short_end_time_is_rejected_without_a_chain_call() {
        let chain = TestChain::new(BASE);
        let mut matchup = Matchup::new(
            Box::new(chain.clone()),
            BASE,
            StdDuration::from_millis(100),
        );
        let mut request = new_market_request("Too soon");
        request.end_time = Utc::now() + Duration::minutes(30);
        let error = matchup.create_market(request).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<MatchupError>(),
            Some(MatchupError::Validation(_))
        ));
        assert_eq!(chain.get_market_count().await.unwrap(), 0);
    }
    #[tokio::test]
    async fn invalid_fields_are_rejected_without_a_chain_call() {
        let chain = TestChain::new(BASE);
        let mut matchup = Matchup::new(
            Box::new(chain.clone()),
            BASE,
            StdDuration::from_millis(100),
        );
        let mut request = new_market_request("");
        matchup.create_market(request).await.unwrap_err();
        request = new_market_request("No description");
        request.description = " ".to_string();
        matchup.create_market(request).await.unwrap_err();
        request = new_market_request("Zero bet");
        request.bet_amount_eth = "0".to_string();
        matchup.create_market(request).await.unwrap_err();
        request = new_market_request("Bad source");
        request.settlement_source = "coingecko.com".to_string();
        matchup.create_market(request).await.unwrap_err();
        assert_eq!(chain.get_market_count().await.unwrap(), 0);
    }
    #[tokio::test]
    async fn duplicate_prediction_is_refused_before_the_write() {
        let chain = TestChain::new(BASE);
        let mut matchup = Matchup::new(
            Box::new(chain.clone()),
            BASE,
            StdDuration::from_millis(100),
        );
        let user = "0xbob".to_string();
        matchup
            .create_market(new_market_request("One bet each"))
            .await
            .unwrap();
        matchup
            .make_prediction(1, &user, Outcome::Yes)
            .await
            .unwrap();
        let error = matchup
            .make_prediction(1, &user, Outcome::No)
            .await
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<MatchupError>(),
            Some(&MatchupError::AlreadyPredicted {
                market: 1,
                user: user.clone()
            })
        );
        assert_eq!(
            chain.get_market_stats(1).await.unwrap().total_predictions,
            1
        );
    }
    #[tokio::test]
    async fn predictions_on_closed_markets_are_refused() {
        let chain = TestChain::new(BASE);
        let mut matchup = Matchup::new(
            Box::new(chain.clone()),
            BASE,
            StdDuration::from_millis(100),
        );
        let request = new_market_request("Already over");
        let mut market = NewMarket::from_request(&request, 100);
        market.end_time = Utc::now() - Duration::hours(1);
        chain
            .create_market(market, &"0xalice".to_string())
            .await
            .unwrap();
        let error = matchup
            .make_prediction(1, &"0xbob".to_string(), Outcome::Yes)
            .await
            .unwrap_err();
        assert_eq!(
            error.downcast_ref::<MatchupError>(),
            Some(&MatchupError::MarketClosed(1))
        );
    }
    #[tokio::test]
    async fn creation_event_refreshes_the_snapshot_after_the_delay() {
        let chain = TestChain::new(BASE);
        let state = Arc::new(RwLock::new(Matchup::new(
            Box::new(chain.clone()),
            BASE,
            StdDuration::from_millis(100),
        )));
        let _watcher = spawn_event_watcher(state.clone());
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        let request = new_market_request("Fresh off the chain");
        let market = NewMarket::from_request(&request, 100);
        chain
            .create_market(market, &"0xalice".to_string())
            .await
            .unwrap();
        assert!(state.read().await.snapshot().is_empty());
        tokio::time::sleep(StdDuration::from_millis(300)).await;
        let snapshot = state.read().await.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.first().unwrap().title, "Fresh off the chain");
    }
    #[tokio::test]
    async fn claims_and_history() {
        let chain = TestChain::new(BASE);
        let mut matchup = Matchup::new(
            Box::new(chain.clone()),
            BASE,
            StdDuration::from_millis(100),
        );
        let user = "0xbob".to_string();
        matchup
            .create_market(new_market_request("Winner"))
            .await
            .unwrap();
        matchup
            .create_market(new_market_request("Still open"))
            .await
            .unwrap();
        matchup
            .make_prediction(1, &user, Outcome::Yes)
            .await
            .unwrap();
        matchup
            .make_prediction(2, &user, Outcome::No)
            .await
            .unwrap();
        chain.resolve_market(1, Outcome::Yes).unwrap();
        matchup.claim_winnings(1, &user).await.unwrap();
        let history = matchup.user_predictions(&user).await.unwrap();
        assert_eq!(history.len(), 2);
        let won = history.iter().find(|entry| entry.market == 1).unwrap();
        assert!(won.claimed);
        assert!(won.is_resolved);
        assert_eq!(won.winning_outcome, WinningOutcome::Yes);
        let open = history.iter().find(|entry| entry.market == 2).unwrap();
        assert!(!open.claimed);
        assert!(!open.is_resolved);
        assert!(matchup
            .user_predictions(&"0xnobody".to_string())
            .await
            .unwrap()
            .is_empty());
    }
    #[test]
    fn validation_accepts_a_well_formed_request() {
        let request = new_market_request("Valid");
        assert_eq!(validate_new_market(&request).unwrap(), 500_000_000_000_000);
    }
    #[test]
    fn validation_rejects_non_http_sources() {
        let mut request = new_market_request("Valid");
        request.settlement_source = "ftp://example.com/data".to_string();
        validate_new_market(&request).unwrap_err();
        request.settlement_source = "https://example.com/data".to_string();
        validate_new_market(&request).unwrap();
    }
}

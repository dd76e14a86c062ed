use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::api::{
    Address, ChainId, Market, MarketId, MarketStats, Outcome, Prediction, TxHash, TxStatus, Wei,
};
use crate::chain::{ChainClient, MarketCreated, NewMarket};

const EVENT_POLL: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

async fn rpc_call<P: Serialize, T: DeserializeOwned>(
    client: &Client,
    url: &str,
    id: u64,
    method: &str,
    params: P,
) -> Result<T> {
    let request = RpcRequest {
        jsonrpc: "2.0",
        id,
        method,
        params,
    };
    let response = client.post(url).json(&request).send().await?;
    if response.status() != StatusCode::OK {
        bail!("{}: {}", response.status(), response.text().await?);
    }
    let response = response.json::<RpcResponse<T>>().await?;
    if let Some(error) = response.error {
        bail!(
            "RPC error {} calling {}: {}",
            error.code,
            method,
            error.message
        );
    }
    response
        .result
        .ok_or(anyhow!("RPC response for {} carried no result", method))
}

pub struct WalletRpc {
    client: Client,
    url: String,
    next_id: Arc<AtomicU64>,
    created: broadcast::Sender<MarketCreated>,
}
impl WalletRpc {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::new();
        let next_id = Arc::new(AtomicU64::new(1));
        let (created, _) = broadcast::channel(16);
        // The gateway offers no push channel, so creation events are
        // synthesized from a market count poll.
        spawn_count_poller(client.clone(), url.clone(), next_id.clone(), created.clone());
        Self {
            client,
            url,
            next_id,
            created,
        }
    }
    async fn call<P: Serialize, T: DeserializeOwned>(&self, method: &str, params: P) -> Result<T> {
        rpc_call(
            &self.client,
            &self.url,
            self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        )
        .await
    }
}
#[async_trait]
impl ChainClient for WalletRpc {
    async fn chain_id(&self) -> Result<ChainId> {
        self.call("wallet_chainId", ()).await
    }
    async fn get_market_count(&self) -> Result<u64> {
        self.call("market_getTotalMarkets", ()).await
    }
    async fn get_market_ids(&self, offset: u64, limit: u64) -> Result<Vec<MarketId>> {
        self.call("market_getAllMarkets", (offset, limit)).await
    }
    async fn get_market(&self, market: MarketId) -> Result<(Market, MarketStats)> {
        self.call("market_getMarket", (market,)).await
    }
    async fn get_market_stats(&self, market: MarketId) -> Result<MarketStats> {
        self.call("prediction_getMarketPredictionStats", (market,))
            .await
    }
    async fn has_user_predicted(&self, market: MarketId, user: &Address) -> Result<bool> {
        self.call("prediction_hasUserPredicted", (market, user))
            .await
    }
    async fn get_user_prediction(&self, market: MarketId, user: &Address) -> Result<Prediction> {
        self.call("prediction_getUserPrediction", (market, user))
            .await
    }
    async fn tx_status(&self, tx: &TxHash) -> Result<TxStatus> {
        self.call("wallet_txStatus", (tx,)).await
    }
    async fn create_market(&self, market: NewMarket, user: &Address) -> Result<TxHash> {
        self.call("market_createMarket", (market, user)).await
    }
    async fn make_prediction(
        &self,
        market: MarketId,
        outcome: Outcome,
        value: Wei,
        user: &Address,
    ) -> Result<TxHash> {
        self.call(
            "prediction_makePrediction",
            (market, outcome.as_u64(), value, user),
        )
        .await
    }
    async fn claim_winnings(&self, market: MarketId, user: &Address) -> Result<TxHash> {
        self.call("prediction_claimWinnings", (market, user)).await
    }
    async fn batch_claim_winnings(&self, markets: &[MarketId], user: &Address) -> Result<TxHash> {
        self.call("prediction_batchClaimWinnings", (markets, user))
            .await
    }
    fn subscribe_market_created(&self) -> broadcast::Receiver<MarketCreated> {
        self.created.subscribe()
    }
}

fn spawn_count_poller(
    client: Client,
    url: String,
    next_id: Arc<AtomicU64>,
    created: broadcast::Sender<MarketCreated>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut known: Option<u64> = None;
        loop {
            tokio::time::sleep(EVENT_POLL).await;
            let count = match rpc_call::<_, u64>(
                &client,
                &url,
                next_id.fetch_add(1, Ordering::Relaxed),
                "market_getTotalMarkets",
                (),
            )
            .await
            {
                Ok(count) => count,
                Err(e) => {
                    warn!("Failed to poll market count: {:#}", e);
                    continue;
                }
            };
            if let Some(last) = known {
                for market in last + 1..=count {
                    debug!("Detected new market {} on chain", market);
                    let _ = created.send(MarketCreated { market });
                }
            }
            known = Some(known.map_or(count, |last| last.max(count)));
        }
    })
}

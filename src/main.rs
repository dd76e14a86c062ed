#![allow(unused)]
use crate::api::*;
use crate::chain::{ChainClient, TestChain};
use crate::matchup::{spawn_event_watcher, Matchup, MatchupError};
use crate::rpc::WalletRpc;
use anyhow::{Context, Result};
use axum::extract::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use axum_macros::debug_handler;
use clap::Parser;
use env_logger::{Builder, WriteStyle};
use log::{debug, LevelFilter};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

mod api;
mod chain;
mod client;
mod matchup;
mod rpc;

fn map_matchup_err(e: anyhow::Error) -> (StatusCode, String) {
    match e.downcast_ref::<MatchupError>() {
        Some(MatchupError::Validation(_))
        | Some(MatchupError::AlreadyPredicted { .. })
        | Some(MatchupError::MarketClosed(_)) => {
            debug!("Error: {:#}", e);
            (StatusCode::BAD_REQUEST, format!("{:#}", e))
        }
        Some(MatchupError::WrongNetwork { .. }) => {
            debug!("Error: {:#}", e);
            (StatusCode::PRECONDITION_FAILED, format!("{:#}", e))
        }
        None => map_any_err_and_code(e),
    }
}

#[debug_handler]
async fn get_markets(
    State(state): State<Arc<RwLock<Matchup>>>,
) -> Result<Json<Vec<MarketOverview>>, (StatusCode, String)> {
    let mut backend = state.write().await;
    let markets = backend.sync_markets().await.map_err(map_matchup_err)?;
    Ok(Json(markets))
}
#[debug_handler]
async fn get_market(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<MarketRequest>,
) -> Result<Json<(Market, MarketStats)>, (StatusCode, String)> {
    let backend = state.read().await;
    let market = backend
        .get_market(request.market)
        .await
        .map_err(map_any_err_and_code)?;
    Ok(Json(market))
}
#[debug_handler]
async fn market_data(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<MarketDataRequest>,
) -> Result<Json<MarketDataResponse>, (StatusCode, Json<serde_json::Value>)> {
    let market = match request.market_id {
        Some(market) => market,
        None => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Market ID is required" })),
            ))
        }
    };
    let backend = state.read().await;
    match backend.market_data(market).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            debug!("Error fetching market data: {:#}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch market data" })),
            ))
        }
    }
}
#[debug_handler]
async fn create_market(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<NewMarketRequest>,
) -> Result<(StatusCode, Json<TxHash>), (StatusCode, String)> {
    let mut backend = state.write().await;
    let title = request.title.clone();
    let tx = backend
        .create_market(request)
        .await
        .map_err(map_matchup_err)?;
    debug!("Created market \"{}\" in {}", title, tx);
    Ok((StatusCode::CREATED, Json(tx)))
}
#[debug_handler]
async fn make_prediction(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<MakePredictionRequest>,
) -> Result<(StatusCode, Json<TxHash>), (StatusCode, String)> {
    let mut backend = state.write().await;
    let tx = backend
        .make_prediction(request.market, &request.user, request.outcome)
        .await
        .map_err(map_matchup_err)?;
    debug!(
        "User {} predicted {} on market {} in {}",
        request.user, request.outcome, request.market, tx
    );
    Ok((StatusCode::CREATED, Json(tx)))
}
async fn claim_winnings(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<TxHash>, (StatusCode, String)> {
    let mut backend = state.write().await;
    let tx = backend
        .claim_winnings(request.market, &request.user)
        .await
        .map_err(map_any_err_and_code)?;
    Ok(Json(tx))
}
async fn batch_claim_winnings(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<BatchClaimRequest>,
) -> Result<Json<TxHash>, (StatusCode, String)> {
    let mut backend = state.write().await;
    let tx = backend
        .batch_claim_winnings(&request.markets, &request.user)
        .await
        .map_err(map_any_err_and_code)?;
    Ok(Json(tx))
}
async fn has_user_predicted(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<MarketUserRequest>,
) -> Result<Json<bool>, (StatusCode, String)> {
    let backend = state.read().await;
    let predicted = backend
        .has_user_predicted(request.market, &request.user)
        .await
        .map_err(map_any_err_and_code)?;
    Ok(Json(predicted))
}
async fn get_user_prediction(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<MarketUserRequest>,
) -> Result<Json<Prediction>, (StatusCode, String)> {
    let backend = state.read().await;
    let prediction = backend
        .get_user_prediction(request.market, &request.user)
        .await
        .map_err(map_any_err_and_code)?;
    Ok(Json(prediction))
}
async fn get_market_stats(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<MarketRequest>,
) -> Result<Json<MarketStats>, (StatusCode, String)> {
    let backend = state.read().await;
    let stats = backend
        .get_market_stats(request.market)
        .await
        .map_err(map_any_err_and_code)?;
    Ok(Json(stats))
}
async fn get_user_predictions(
    State(state): State<Arc<RwLock<Matchup>>>,
    Json(request): Json<UserRequest>,
) -> Result<Json<Vec<UserPredictionResponse>>, (StatusCode, String)> {
    let backend = state.read().await;
    let predictions = backend
        .user_predictions(&request.user)
        .await
        .map_err(map_any_err_and_code)?;
    Ok(Json(predictions))
}

#[derive(Debug, Deserialize)]
struct Settings {
    rpc_url: Option<String>,
    chain_id: ChainId,
    port: u16,
    finality_delay_ms: u64,
}
impl Settings {
    fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("chain_id", 8453i64)?
            .set_default("port", 8081i64)?
            .set_default("finality_delay_ms", 2000i64)?
            .add_source(config::File::with_name("matchup").required(false))
            .add_source(config::Environment::with_prefix("MATCHUP"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}

#[derive(Parser)]
struct Args {
    #[arg(short, long)]
    port: Option<u16>,
    #[arg(short, long)]
    rpc_url: Option<String>,
    #[arg(short, long)]
    chain_id: Option<ChainId>,
    #[arg(short, long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    Builder::default()
        .filter_level(LevelFilter::Debug)
        .write_style(WriteStyle::Always)
        .init();
    let cli = Args::parse();
    let mut settings = Settings::load()?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(rpc_url) = cli.rpc_url {
        settings.rpc_url = Some(rpc_url);
    }
    if let Some(chain_id) = cli.chain_id {
        settings.chain_id = chain_id;
    }
    let chain: Box<dyn ChainClient + Send + Sync> = if cli.test {
        Box::new(TestChain::new(settings.chain_id))
    } else {
        let url = settings
            .rpc_url
            .clone()
            .context("No wallet RPC url configured, pass --rpc-url or set MATCHUP_RPC_URL")?;
        Box::new(WalletRpc::new(url))
    };
    let (_port, handle) = run_server(
        Some(settings.port),
        chain,
        settings.chain_id,
        StdDuration::from_millis(settings.finality_delay_ms),
    )
    .await;
    handle.await?;
    Ok(())
}

async fn run_server(
    port: Option<u16>,
    chain: Box<dyn ChainClient + Send + Sync>,
    expected_chain: ChainId,
    finality_delay: StdDuration,
) -> (u16, JoinHandle<()>) {
    let state = Arc::new(RwLock::new(Matchup::new(
        chain,
        expected_chain,
        finality_delay,
    )));
    spawn_event_watcher(state.clone());
    let app = Router::new()
        .route("/get_markets", get(get_markets))
        .route("/get_market", post(get_market))
        .route("/market_data", post(market_data))
        .route("/create_market", post(create_market))
        .route("/make_prediction", post(make_prediction))
        .route("/claim_winnings", post(claim_winnings))
        .route("/batch_claim_winnings", post(batch_claim_winnings))
        .route("/has_user_predicted", post(has_user_predicted))
        .route("/get_user_prediction", post(get_user_prediction))
        .route("/get_market_stats", post(get_market_stats))
        .route("/get_user_predictions", post(get_user_predictions))
        .with_state(state);

    let addr = "127.0.0.1:".to_string() + port.unwrap_or(0).to_string().as_str();
    let server = axum::Server::bind(&addr.parse().unwrap()).serve(app.into_make_service());
    let port = server.local_addr().port();
    debug!("Listening on {}", server.local_addr());
    let handle = tokio::spawn(async move {
        server.await.unwrap();
    });
    (port, handle)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::TestChain;
    use crate::client::Client;
    use chrono::{Duration, Utc};

    const BASE: ChainId = 8453;
    const TEST_DELAY: StdDuration = StdDuration::from_millis(100);

    fn new_market_request(title: &str, user: &str) -> NewMarketRequest {
        NewMarketRequest {
            title: title.to_string(),
            description: "A test market".to_string(),
            category: Category::Crypto,
            bet_amount_eth: "0.0005".to_string(),
            end_time: Utc::now() + Duration::days(3),
            settlement_source: "https://www.coingecko.com/en/coins/bitcoin".to_string(),
            tags: vec!["btc".to_string()],
            user: user.to_string(),
        }
    }

    #[tokio::test]
    async fn market_data_endpoint() {
        let chain = TestChain::new(BASE);
        let (port, _) = run_server(None, Box::new(chain.clone()), BASE, TEST_DELAY).await;
        let client = Client::new("http://127.0.0.1:".to_string() + port.to_string().as_str());

        // Missing id and unknown id map to the endpoint's JSON error bodies
        let error = client
            .market_data(MarketDataRequest { market_id: None })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("Market ID is required"));
        let error = client
            .market_data(MarketDataRequest {
                market_id: Some(42),
            })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("Failed to fetch market data"));

        client
            .create_market(new_market_request("BTC above 100k", "0xalice"))
            .await
            .unwrap();
        let data = client
            .market_data(MarketDataRequest { market_id: Some(1) })
            .await
            .unwrap();
        assert_eq!(data.id, 1);
        assert_eq!(data.title, "BTC above 100k");
        assert_eq!(data.creator, "0xalice");
        assert_eq!(data.bet_amount, 500_000_000_000_000);
        assert_eq!(data.total_predictions, 0);
        assert!(!data.is_resolved);
        assert_eq!(data.winning_outcome, WinningOutcome::Unresolved);
    }

    #[tokio::test]
    async fn wrong_network_is_a_hard_failure() {
        let chain = TestChain::new(1);
        let (port, _) = run_server(None, Box::new(chain), BASE, TEST_DELAY).await;
        let client = Client::new("http://127.0.0.1:".to_string() + port.to_string().as_str());
        let error = client.get_markets().await.unwrap_err();
        assert!(error.to_string().contains("expected chain 8453"));
    }

    #[tokio::test]
    async fn rejected_creations_never_reach_the_chain() {
        let chain = TestChain::new(BASE);
        let (port, _) = run_server(None, Box::new(chain.clone()), BASE, TEST_DELAY).await;
        let client = Client::new("http://127.0.0.1:".to_string() + port.to_string().as_str());

        let mut request = new_market_request("Ends too soon", "0xalice");
        request.end_time = Utc::now() + Duration::minutes(30);
        let error = client.create_market(request).await.unwrap_err();
        assert!(error.to_string().contains("at least an hour"));
        assert_eq!(chain.get_market_count().await.unwrap(), 0);
        assert!(client.get_markets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn all() {
        let chain = TestChain::new(BASE);
        let (port, _) = run_server(None, Box::new(chain.clone()), BASE, TEST_DELAY).await;
        let client = Client::new("http://127.0.0.1:".to_string() + port.to_string().as_str());
        let bob = "0xbob".to_string();
        let carol = "0xcarol".to_string();

        // Create two markets
        client
            .create_market(new_market_request("BTC above 100k", "0xalice"))
            .await
            .unwrap();
        client
            .create_market(new_market_request("ETH flips BTC", "0xalice"))
            .await
            .unwrap();
        let markets = client.get_markets().await.unwrap();
        assert_eq!(markets.len(), 2);
        assert!(markets
            .iter()
            .all(|market| market.status == MarketStatus::Active));

        // Predict on the first market with two users
        assert!(!client
            .has_user_predicted(MarketUserRequest {
                market: 1,
                user: bob.clone(),
            })
            .await
            .unwrap());
        client
            .make_prediction(MakePredictionRequest {
                market: 1,
                user: bob.clone(),
                outcome: Outcome::Yes,
            })
            .await
            .unwrap();
        client
            .make_prediction(MakePredictionRequest {
                market: 1,
                user: carol.clone(),
                outcome: Outcome::No,
            })
            .await
            .unwrap();
        assert!(client
            .has_user_predicted(MarketUserRequest {
                market: 1,
                user: bob.clone(),
            })
            .await
            .unwrap());

        // A second prediction from the same user is refused
        let error = client
            .make_prediction(MakePredictionRequest {
                market: 1,
                user: bob.clone(),
                outcome: Outcome::No,
            })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("already predicted"));

        let stats = client
            .get_market_stats(MarketRequest { market: 1 })
            .await
            .unwrap();
        assert_eq!(stats.total_predictions, 2);
        assert_eq!(stats.total_pool, 1_000_000_000_000_000);
        assert_eq!(stats.yes_pool, 500_000_000_000_000);
        assert_eq!(stats.no_pool, 500_000_000_000_000);
        assert_eq!(stats.unique_predictors, 2);

        let (market, stats) = client.get_market(MarketRequest { market: 1 }).await.unwrap();
        assert_eq!(market.title, "BTC above 100k");
        assert_eq!(stats.total_predictions, 2);

        // Resolution happens contract side, claims go through the API
        chain.resolve_market(1, Outcome::Yes).unwrap();
        client
            .claim_winnings(ClaimRequest {
                market: 1,
                user: bob.clone(),
            })
            .await
            .unwrap();
        let error = client
            .claim_winnings(ClaimRequest {
                market: 1,
                user: carol.clone(),
            })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("didn't win"));
        let error = client
            .batch_claim_winnings(BatchClaimRequest {
                markets: vec![1],
                user: bob.clone(),
            })
            .await
            .unwrap_err();
        assert!(error.to_string().contains("already claimed"));

        // History reflects the claim
        let history = client
            .get_user_predictions(UserRequest { user: bob.clone() })
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        let entry = history.first().unwrap();
        assert_eq!(entry.market, 1);
        assert_eq!(entry.outcome, Outcome::Yes);
        assert!(entry.claimed);
        assert_eq!(entry.winning_outcome, WinningOutcome::Yes);
        let prediction = client
            .get_user_prediction(MarketUserRequest {
                market: 1,
                user: bob.clone(),
            })
            .await
            .unwrap();
        assert!(prediction.claimed);

        // The resolved market now lists as ended
        let markets = client.get_markets().await.unwrap();
        assert_eq!(
            markets
                .iter()
                .find(|market| market.id == 1)
                .unwrap()
                .status,
            MarketStatus::Ended
        );
    }
}

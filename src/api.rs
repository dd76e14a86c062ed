use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::StatusCode;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type MarketId = u64;
pub type ChainId = u64;
pub type Wei = u128;
pub type Address = String;
pub type TxHash = String;

pub const WEI_PER_ETH: Wei = 1_000_000_000_000_000_000;

// Requests
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MarketRequest {
    pub market: MarketId,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MarketDataRequest {
    pub market_id: Option<MarketId>,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NewMarketRequest {
    pub title: String,
    pub description: String,
    pub category: Category,
    pub bet_amount_eth: String,
    pub end_time: DateTime<Utc>,
    pub settlement_source: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub user: Address,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MakePredictionRequest {
    pub market: MarketId,
    pub user: Address,
    pub outcome: Outcome,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClaimRequest {
    pub market: MarketId,
    pub user: Address,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BatchClaimRequest {
    pub markets: Vec<MarketId>,
    pub user: Address,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MarketUserRequest {
    pub market: MarketId,
    pub user: Address,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct UserRequest {
    pub user: Address,
}

// Responses
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MarketOverview {
    pub id: MarketId,
    pub title: String,
    pub category: Category,
    pub description: String,
    pub participants: u64,
    pub end_time: DateTime<Utc>,
    pub status: MarketStatus,
    pub bet_amount_eth: String,
    pub settlement_source: String,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MarketDataResponse {
    pub id: MarketId,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub bet_amount: Wei,
    pub end_time: DateTime<Utc>,
    pub is_resolved: bool,
    pub settlement_source: String,
    pub creator: Address,
    pub created_at: DateTime<Utc>,
    pub winning_outcome: WinningOutcome,
    pub is_active: bool,
    pub tags: Vec<String>,
    pub total_predictions: u64,
    pub total_pool: Wei,
    pub yes_pool: Wei,
    pub no_pool: Wei,
    pub unique_predictors: u64,
}
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct UserPredictionResponse {
    pub market: MarketId,
    pub title: String,
    pub outcome: Outcome,
    pub bet_amount_eth: String,
    pub timestamp: DateTime<Utc>,
    pub claimed: bool,
    pub is_resolved: bool,
    pub winning_outcome: WinningOutcome,
}

// helper functions
pub fn map_any_err_and_code(e: anyhow::Error) -> (StatusCode, String) {
    debug!("Error: {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:?}", e))
}
pub fn map_any_err(e: anyhow::Error) -> String {
    debug!("Error: {:#}", e);
    format!("{:?}", e)
}
pub fn friendly_chain_error(e: &anyhow::Error) -> String {
    let message = format!("{:#}", e);
    if message.contains("does not have a transaction hash") {
        "Transaction failed - check your connection and make sure the wallet is on the expected network".to_string()
    } else if message.contains("User rejected") {
        "Transaction was cancelled by user".to_string()
    } else if message.contains("insufficient funds") {
        "Insufficient funds for transaction".to_string()
    } else {
        format!("Failed to submit transaction: {}", message)
    }
}
pub fn format_eth(amount: Wei) -> String {
    let whole = amount / WEI_PER_ETH;
    let frac = amount % WEI_PER_ETH;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:018}", frac);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}
pub fn parse_eth(amount: &str) -> Result<Wei> {
    let eth = Decimal::from_str(amount.trim())
        .with_context(|| format!("Couldn't parse \"{}\" as an ether amount", amount))?;
    if eth.is_sign_negative() {
        bail!("Ether amount was {} but can't be negative", amount);
    }
    let wei = eth
        .checked_mul(Decimal::from(1_000_000_000_000_000_000u64))
        .ok_or(anyhow!("Ether amount {} is too large", amount))?;
    if wei.fract() != Decimal::ZERO {
        bail!("Ether amount {} has more than 18 decimal places", amount);
    }
    wei.to_u128()
        .ok_or(anyhow!("Ether amount {} is too large", amount))
}

// Types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Market {
    pub id: MarketId,
    pub title: String,
    pub description: String,
    pub category: Category,
    pub bet_amount: Wei,
    pub end_time: DateTime<Utc>,
    pub is_resolved: bool,
    pub settlement_source: String,
    pub creator: Address,
    pub created_at: DateTime<Utc>,
    pub winning_outcome: WinningOutcome,
    pub is_active: bool,
    pub tags: Vec<String>,
}
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MarketStats {
    pub total_predictions: u64,
    pub total_pool: Wei,
    pub yes_pool: Wei,
    pub no_pool: Wei,
    pub unique_predictors: u64,
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub predictor: Address,
    pub market: MarketId,
    pub outcome: Outcome,
    pub amount: Wei,
    pub timestamp: DateTime<Utc>,
    pub claimed: bool,
}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Sports,
    Crypto,
    Custom,
}
impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Sports => "sports",
            Self::Crypto => "crypto",
            Self::Custom => "custom",
        };
        write!(f, "{}", output)
    }
}
impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sports" => Ok(Self::Sports),
            "crypto" => Ok(Self::Crypto),
            "custom" => Ok(Self::Custom),
            e => bail!("Couldn't deserialize to Category: {}", e),
        }
    }
}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum Outcome {
    No,
    Yes,
}
impl Outcome {
    pub fn as_u64(&self) -> u64 {
        match self {
            Self::No => 0,
            Self::Yes => 1,
        }
    }
    pub fn from_u64(outcome: u64) -> Result<Self> {
        match outcome {
            0 => Ok(Self::No),
            1 => Ok(Self::Yes),
            e => bail!("Couldn't deserialize to Outcome: {}", e),
        }
    }
}
impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::No => "No",
            Self::Yes => "Yes",
        };
        write!(f, "{}", output)
    }
}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum WinningOutcome {
    Unresolved,
    No,
    Yes,
}
impl WinningOutcome {
    pub fn as_u64(&self) -> u64 {
        match self {
            Self::Unresolved => 0,
            Self::No => 1,
            Self::Yes => 2,
        }
    }
    pub fn from_u64(outcome: u64) -> Result<Self> {
        match outcome {
            0 => Ok(Self::Unresolved),
            1 => Ok(Self::No),
            2 => Ok(Self::Yes),
            e => bail!("Couldn't deserialize to WinningOutcome: {}", e),
        }
    }
}
impl Display for WinningOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Unresolved => "Unresolved",
            Self::No => "No",
            Self::Yes => "Yes",
        };
        write!(f, "{}", output)
    }
}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum MarketStatus {
    Active,
    Ended,
}
impl Display for MarketStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Active => "active",
            Self::Ended => "ended",
        };
        write!(f, "{}", output)
    }
}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}
impl Display for TxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Pending => "Pending",
            Self::Confirmed => "Confirmed",
            Self::Failed => "Failed",
        };
        write!(f, "{}", output)
    }
}

#![allow(unused)]
use std::str::FromStr;

use anyhow::Result;
use api::*;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use crate::client::Client;

mod api;
mod client;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long)]
    url: String,
}
#[derive(Subcommand)]
enum Commands {
    GetMarkets,
    GetMarket {
        #[arg(short, long)]
        market: MarketId,
    },
    MarketData {
        #[arg(short, long)]
        market: MarketId,
    },
    CreateMarket {
        #[arg(short, long)]
        title: String,
        #[arg(short, long)]
        description: String,
        #[arg(short, long, default_value = "custom")]
        category: String,
        #[arg(short, long)]
        bet_amount_eth: String,
        #[arg(short, long)]
        end_time: String,
        #[arg(short, long)]
        settlement_source: String,
        #[arg(long)]
        tags: Vec<String>,
        #[arg(short, long)]
        user: Address,
    },
    Predict {
        #[arg(short, long)]
        market: MarketId,
        #[arg(short, long)]
        yes: bool,
        #[arg(short, long)]
        user: Address,
    },
    Claim {
        #[arg(short, long, required = true)]
        markets: Vec<MarketId>,
        #[arg(short, long)]
        user: Address,
    },
    History {
        #[arg(short, long)]
        user: Address,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Args::parse();
    let client = Client::new(cli.url);

    match cli.command {
        Commands::GetMarkets => {
            let response = client.get_markets().await?;
            println!("{:#?}", response);
        }
        Commands::GetMarket { market } => {
            let (market, stats) = client.get_market(MarketRequest { market }).await?;
            println!("{:#?}", market);
            println!(
                "Yes: {} ETH | No: {} ETH over {} predictions from {} predictors",
                format_eth(stats.yes_pool),
                format_eth(stats.no_pool),
                stats.total_predictions,
                stats.unique_predictors
            );
        }
        Commands::MarketData { market } => {
            let response = client
                .market_data(MarketDataRequest {
                    market_id: Some(market),
                })
                .await?;
            println!("{:#?}", response);
        }
        Commands::CreateMarket {
            title,
            description,
            category,
            bet_amount_eth,
            end_time,
            settlement_source,
            tags,
            user,
        } => {
            let end_time: DateTime<Utc> = end_time.parse()?;
            let request = NewMarketRequest {
                title,
                description,
                category: Category::from_str(category.as_str())?,
                bet_amount_eth,
                end_time,
                settlement_source,
                tags,
                user,
            };
            match client.create_market(request).await {
                Ok(tx) => println!("Created market in {}", tx),
                Err(e) => println!("{}", friendly_chain_error(&e)),
            }
        }
        Commands::Predict { market, yes, user } => {
            let request = MakePredictionRequest {
                market,
                user,
                outcome: if yes { Outcome::Yes } else { Outcome::No },
            };
            match client.make_prediction(request).await {
                Ok(tx) => println!("Prediction made in {}", tx),
                Err(e) => println!("{}", friendly_chain_error(&e)),
            }
        }
        Commands::Claim { markets, user } => {
            let tx = if let [market] = markets.as_slice() {
                client
                    .claim_winnings(ClaimRequest {
                        market: *market,
                        user,
                    })
                    .await?
            } else {
                client
                    .batch_claim_winnings(BatchClaimRequest { markets, user })
                    .await?
            };
            println!("Claimed winnings in {}", tx);
        }
        Commands::History { user } => {
            let response = client.get_user_predictions(UserRequest { user }).await?;
            println!("{:#?}", response);
        }
    }
    Ok(())
}

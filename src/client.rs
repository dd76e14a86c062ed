use anyhow::{bail, Result};
use reqwest::{Response, StatusCode};

use crate::api::*;

pub async fn bail_if_err(response: Response, expected_code: StatusCode) -> Result<Response> {
    if response.status() != expected_code {
        bail!("{}: {}", response.status(), response.text().await?)
    }
    Ok(response)
}

pub struct Client {
    url: String,
    client: reqwest::Client,
}
impl Client {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::new();
        Self { url, client }
    }
    async fn post(
        &self,
        path: &str,
        request: impl serde::Serialize,
        expected_code: StatusCode,
    ) -> Result<Response> {
        let response = self
            .client
            .post(self.url.clone() + path)
            .json(&request)
            .send()
            .await?;
        bail_if_err(response, expected_code).await
    }
    pub async fn get_markets(&self) -> Result<Vec<MarketOverview>> {
        let response = self
            .client
            .get(self.url.clone() + "/get_markets")
            .send()
            .await?;
        let response = bail_if_err(response, StatusCode::OK).await?;
        Ok(response.json::<Vec<MarketOverview>>().await?)
    }
    pub async fn get_market(&self, request: MarketRequest) -> Result<(Market, MarketStats)> {
        let response = self.post("/get_market", request, StatusCode::OK).await?;
        Ok(response.json::<(Market, MarketStats)>().await?)
    }
    pub async fn market_data(&self, request: MarketDataRequest) -> Result<MarketDataResponse> {
        let response = self.post("/market_data", request, StatusCode::OK).await?;
        Ok(response.json::<MarketDataResponse>().await?)
    }
    pub async fn create_market(&self, request: NewMarketRequest) -> Result<TxHash> {
        let response = self
            .post("/create_market", request, StatusCode::CREATED)
            .await?;
        Ok(response.json::<TxHash>().await?)
    }
    pub async fn make_prediction(&self, request: MakePredictionRequest) -> Result<TxHash> {
        let response = self
            .post("/make_prediction", request, StatusCode::CREATED)
            .await?;
        Ok(response.json::<TxHash>().await?)
    }
    pub async fn claim_winnings(&self, request: ClaimRequest) -> Result<TxHash> {
        let response = self.post("/claim_winnings", request, StatusCode::OK).await?;
        Ok(response.json::<TxHash>().await?)
    }
    pub async fn batch_claim_winnings(&self, request: BatchClaimRequest) -> Result<TxHash> {
        let response = self
            .post("/batch_claim_winnings", request, StatusCode::OK)
            .await?;
        Ok(response.json::<TxHash>().await?)
    }
    pub async fn has_user_predicted(&self, request: MarketUserRequest) -> Result<bool> {
        let response = self
            .post("/has_user_predicted", request, StatusCode::OK)
            .await?;
        Ok(response.json::<bool>().await?)
    }
    pub async fn get_user_prediction(&self, request: MarketUserRequest) -> Result<Prediction> {
        let response = self
            .post("/get_user_prediction", request, StatusCode::OK)
            .await?;
        Ok(response.json::<Prediction>().await?)
    }
    pub async fn get_market_stats(&self, request: MarketRequest) -> Result<MarketStats> {
        let response = self
            .post("/get_market_stats", request, StatusCode::OK)
            .await?;
        Ok(response.json::<MarketStats>().await?)
    }
    pub async fn get_user_predictions(
        &self,
        request: UserRequest,
    ) -> Result<Vec<UserPredictionResponse>> {
        let response = self
            .post("/get_user_predictions", request, StatusCode::OK)
            .await?;
        Ok(response.json::<Vec<UserPredictionResponse>>().await?)
    }
}

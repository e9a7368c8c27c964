//! Adapter over the external forecasting service.
//!
//! The model's mathematics are opaque to the pipeline: the contract is a
//! prepared, gap-free series plus its holiday mask in, an ordered horizon
//! out. Too little history is a structural failure, reported rather than
//! retried — it will recur until the entity accumulates more data.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::CredentialProvider;
use crate::error::PipelineError;
use crate::models::{ForecastPoint, ForecastRun, HolidayMask};

#[async_trait]
pub trait ForecastService: Send + Sync {
    async fn generate(
        &self,
        entity_id: &str,
        series: &[(DateTime<Utc>, f64)],
        holiday_mask: &[HolidayMask],
        horizon_length: usize,
    ) -> Result<ForecastRun, PipelineError>;
}

#[derive(Debug, Serialize)]
struct ForecastRequest<'a> {
    entity_id: &'a str,
    series: Vec<SeriesPoint>,
    holiday_mask: &'a [HolidayMask],
    horizon_length: usize,
}

#[derive(Debug, Serialize)]
struct SeriesPoint {
    timestamp: DateTime<Utc>,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    horizon: Vec<ForecastPoint>,
}

pub struct HttpForecastService {
    client: Client,
    base_url: String,
    min_observations: usize,
    provider: Arc<dyn CredentialProvider>,
}

impl HttpForecastService {
    pub fn new(
        base_url: String,
        min_observations: usize,
        provider: Arc<dyn CredentialProvider>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url,
            min_observations,
            provider,
        }
    }
}

#[async_trait]
impl ForecastService for HttpForecastService {
    async fn generate(
        &self,
        entity_id: &str,
        series: &[(DateTime<Utc>, f64)],
        holiday_mask: &[HolidayMask],
        horizon_length: usize,
    ) -> Result<ForecastRun, PipelineError> {
        if series.len() < self.min_observations {
            return Err(PipelineError::InsufficientHistory {
                have: series.len(),
                need: self.min_observations,
            });
        }

        let token = self.provider.access_secret("FORECAST_ACCESS_TOKEN").await?;
        let account_id = self.provider.access_secret("FORECAST_ACCOUNT_ID").await?;

        let request = ForecastRequest {
            entity_id,
            series: series
                .iter()
                .map(|&(timestamp, value)| SeriesPoint { timestamp, value })
                .collect(),
            holiday_mask,
            horizon_length,
        };

        let response = self
            .client
            .post(format!("{}/forecasts", self.base_url))
            .bearer_auth(token.expose())
            .header("X-Account-Id", account_id.expose())
            .json(&request)
            .send()
            .await
            .context("POST /forecasts failed")
            .map_err(PipelineError::Forecast)?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Forecast(anyhow::anyhow!(
                "POST /forecasts {}: {}",
                status,
                text
            )));
        }

        let body: ForecastResponse = response
            .json()
            .await
            .context("Failed to parse forecast response")
            .map_err(PipelineError::Forecast)?;

        let run = ForecastRun {
            entity_id: entity_id.to_string(),
            run_id: Uuid::new_v4().to_string(),
            generated_at: Utc::now(),
            horizon: body.horizon,
        };
        info!(
            "Forecast generated for '{}': {} horizon points",
            entity_id,
            run.horizon.len()
        );
        Ok(run)
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{FetchMode, ForecastError, ForecastProvider};

#[derive(Deserialize)]
struct HourlyPoint {
    hour_start_utc: DateTime<Utc>,
    g_co2_per_kwh: f64,
}

/// HTTP client for the external carbon-intensity provider. One request per
/// zone, per spec §4.3.
pub struct HttpForecastProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpForecastProvider {
    pub fn new(base_url: String, token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            token,
        }
    }
}

#[async_trait]
impl ForecastProvider for HttpForecastProvider {
    async fn fetch_hourly(
        &self,
        zone: &str,
        mode: FetchMode,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, ForecastError> {
        let path = match mode {
            FetchMode::Forecast => "forecast",
            FetchMode::Historical => "history",
        };
        let url = format!("{}/{path}?zone={zone}", self.base_url);

        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ForecastError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(ForecastError::Transient(format!("server error: {status}")));
        }
        if !status.is_success() {
            return Err(ForecastError::Permanent(format!("client error: {status}")));
        }

        let points: Vec<HourlyPoint> = resp
            .json()
            .await
            .map_err(|e| ForecastError::Invalid(format!("malformed forecast body: {e}")))?;

        Ok(points
            .into_iter()
            .map(|p| (p.hour_start_utc, p.g_co2_per_kwh))
            .collect())
    }
}

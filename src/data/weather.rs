use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, info};
use crate::config::CityConfig;
use crate::data::types::{DataUnavailable, PercentileForecast};

/// Source of per-city percentile forecasts, pulled once per cycle.
#[async_trait]
pub trait ForecastProvider: Send + Sync {
    async fn fetch(&self, city: &CityConfig, now: DateTime<Utc>)
        -> Result<PercentileForecast, DataUnavailable>;
}

/// Source of realized daily highs for past dates.
#[async_trait]
pub trait ActualsProvider: Send + Sync {
    async fn actual_high(&self, city: &CityConfig, date: NaiveDate) -> Result<f64, DataUnavailable>;
}

/// Snapshot written by the bulletin downloader each cycle.
#[derive(Debug, Deserialize)]
struct ForecastSnapshot {
    generated_at: DateTime<Utc>,
    target_date: NaiveDate,
    cities: HashMap<String, SnapshotPercentiles>,
}

#[derive(Debug, Deserialize)]
struct SnapshotPercentiles {
    p10: f64,
    p50: f64,
    p90: f64,
}

/// Reads the percentile snapshot file dropped by the external NBM fetcher.
pub struct SnapshotForecastProvider {
    path: PathBuf,
    max_age: Duration,
}

impl SnapshotForecastProvider {
    pub fn new(path: impl Into<PathBuf>, max_age_hours: i64) -> Self {
        Self {
            path: path.into(),
            max_age: Duration::hours(max_age_hours),
        }
    }

    async fn load(&self) -> Result<ForecastSnapshot> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read forecast snapshot {}", self.path.display()))?;
        serde_json::from_str(&raw).context("Failed to parse forecast snapshot")
    }
}

#[async_trait]
impl ForecastProvider for SnapshotForecastProvider {
    async fn fetch(
        &self,
        city: &CityConfig,
        now: DateTime<Utc>,
    ) -> Result<PercentileForecast, DataUnavailable> {
        let snapshot = self.load().await.map_err(|e| DataUnavailable::Forecast {
            city: city.code.clone(),
            reason: format!("{:#}", e),
        })?;

        let age = now - snapshot.generated_at;
        if age > self.max_age {
            return Err(DataUnavailable::Stale {
                city: city.code.clone(),
                age_hours: age.num_hours(),
            });
        }

        let p = snapshot
            .cities
            .get(&city.code)
            .ok_or_else(|| DataUnavailable::Forecast {
                city: city.code.clone(),
                reason: "city missing from snapshot".to_string(),
            })?;

        debug!(
            "Forecast {}: p10={:.1} p50={:.1} p90={:.1} for {}",
            city.code, p.p10, p.p50, p.p90, snapshot.target_date
        );

        Ok(PercentileForecast {
            city: city.code.clone(),
            target_date: snapshot.target_date,
            p10: p.p10,
            p50: p.p50,
            p90: p.p90,
            issued_at: snapshot.generated_at,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ObservationCollection {
    features: Vec<ObservationFeature>,
}

#[derive(Debug, Deserialize)]
struct ObservationFeature {
    properties: ObservationProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationProperties {
    temperature: Option<QuantitativeValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuantitativeValue {
    value: Option<f64>,
    #[serde(default)]
    unit_code: String,
}

/// NWS station observations, used to settle trades and calibrate the model.
pub struct NwsActualsClient {
    client: Client,
    base_url: String,
    user_agent: String,
}

impl NwsActualsClient {
    pub fn new(base_url: String, user_agent: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build NWS HTTP client")?;
        Ok(Self { client, base_url, user_agent })
    }

    async fn fetch_observations(
        &self,
        station: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ObservationCollection> {
        let url = format!("{}/stations/{}/observations", self.base_url, station);
        let response = self
            .client
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .query(&[("start", start.to_rfc3339()), ("end", end.to_rfc3339())])
            .send()
            .await
            .context("Failed to fetch observations")?
            .error_for_status()
            .context("Observation request rejected")?
            .json()
            .await
            .context("Failed to parse observations")?;
        Ok(response)
    }
}

#[async_trait]
impl ActualsProvider for NwsActualsClient {
    async fn actual_high(&self, city: &CityConfig, date: NaiveDate) -> Result<f64, DataUnavailable> {
        let (start, end) = local_day_window(date, city.utc_offset_hours);
        let unavailable = |reason: String| DataUnavailable::Actual {
            city: city.code.clone(),
            date,
            reason,
        };

        let observations = self
            .fetch_observations(&city.nws_station, start, end)
            .await
            .map_err(|e| unavailable(format!("{:#}", e)))?;

        let high = max_temperature_f(&observations)
            .ok_or_else(|| unavailable("no temperature observations".to_string()))?;

        info!("Actual high {} {}: {:.1}°F ({})", city.code, date, high, city.nws_station);
        Ok(high)
    }
}

fn max_temperature_f(observations: &ObservationCollection) -> Option<f64> {
    observations
        .features
        .iter()
        .filter_map(|f| f.properties.temperature.as_ref())
        .filter_map(|t| {
            let v = t.value?;
            Some(if t.unit_code.ends_with("degF") { v } else { celsius_to_fahrenheit(v) })
        })
        .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.max(t))))
}

/// UTC span covering `date` in the city's local standard time.
fn local_day_window(date: NaiveDate, utc_offset_hours: i32) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    let start = local_midnight - Duration::hours(utc_offset_hours as i64);
    (start, start + Duration::hours(24))
}

fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

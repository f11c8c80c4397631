use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use crate::config::{CalibrationConfig, CityConfig};
use crate::execution::persistence::TradeLedger;

/// Stored per-city correction applied by the distribution model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub bias_correction: f64,
    pub sigma_scale: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            bias_correction: 0.0,
            sigma_scale: 1.0,
            last_updated: None,
        }
    }
}

/// One day's forecast-vs-actual pair for a city.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub city: String,
    pub forecast_date: NaiveDate,
    pub raw_mu: f64,
    pub raw_sigma: f64,
    pub actual_high: Option<f64>,
}

/// Calibration values read every cycle and written once a day.
///
/// Readers copy the value out, so a cycle never holds a shard lock across an await.
pub struct CalibrationStore {
    entries: DashMap<String, Calibration>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn load(ledger: &TradeLedger) -> Result<Self> {
        let store = Self::new();
        for (city, calibration) in ledger.load_calibrations()? {
            store.entries.insert(city, calibration);
        }
        Ok(store)
    }

    /// Current calibration, or the identity correction for an uncalibrated city.
    pub fn get(&self, city: &str) -> Calibration {
        self.entries.get(city).map(|e| *e).unwrap_or_default()
    }

    pub fn set(&self, city: &str, calibration: Calibration) {
        self.entries.insert(city.to_string(), calibration);
    }

    pub fn snapshot(&self) -> HashMap<String, Calibration> {
        self.entries.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// What the daily run did for one city.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Updated { city: String, calibration: Calibration, samples: usize },
    InsufficientHistory { city: String, samples: usize },
    NoActual { city: String },
    NoForecastRecord { city: String },
}

/// Daily recalibration from forecast-vs-actual history.
pub struct CalibrationEngine {
    config: CalibrationConfig,
    store: Arc<CalibrationStore>,
    ledger: Arc<TradeLedger>,
}

impl CalibrationEngine {
    pub fn new(config: CalibrationConfig, store: Arc<CalibrationStore>, ledger: Arc<TradeLedger>) -> Self {
        Self { config, store, ledger }
    }

    /// Folds `date`'s actual highs into the history and refreshes each city's correction.
    ///
    /// Re-running for the same date reproduces the same result.
    pub fn run(
        &self,
        date: NaiveDate,
        cities: &[CityConfig],
        actuals: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<CalibrationOutcome> {
        cities
            .iter()
            .map(|city| match self.calibrate_city(&city.code, date, actuals.get(&city.code), now) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Calibration failed for {}: {:#}", city.code, e);
                    CalibrationOutcome::NoForecastRecord { city: city.code.clone() }
                }
            })
            .collect()
    }

    fn calibrate_city(
        &self,
        city: &str,
        date: NaiveDate,
        actual: Option<&f64>,
        now: DateTime<Utc>,
    ) -> Result<CalibrationOutcome> {
        let Some(&actual) = actual else {
            warn!("{}: no actual high for {}, keeping previous calibration", city, date);
            return Ok(CalibrationOutcome::NoActual { city: city.to_string() });
        };

        if !self.ledger.record_actual_high(city, date, actual)? {
            warn!("{}: no stored forecast for {}, keeping previous calibration", city, date);
            return Ok(CalibrationOutcome::NoForecastRecord { city: city.to_string() });
        }

        let records = self.ledger.calibration_history(city, date, self.config.window_days)?;
        let Some(mut calibration) = compute_calibration(&records, &self.config) else {
            info!(
                "{}: {} calibration samples (< {}), keeping previous calibration",
                city, records.len(), self.config.min_records
            );
            return Ok(CalibrationOutcome::InsufficientHistory {
                city: city.to_string(),
                samples: records.len(),
            });
        };
        calibration.last_updated = Some(now);

        self.ledger.save_calibration(city, &calibration)?;
        self.store.set(city, calibration);

        info!(
            "Updated calibration {}: bias={:+.2}°F sigma_scale={:.3} (n={})",
            city, calibration.bias_correction, calibration.sigma_scale, records.len()
        );
        Ok(CalibrationOutcome::Updated {
            city: city.to_string(),
            calibration,
            samples: records.len(),
        })
    }
}

/// Moving-average bias and spread correction over the records that carry an actual.
///
/// bias  = mean(actual − raw_mu)
/// scale = mean(|actual − raw_mu| / raw_sigma) × √(π/2), clamped to the configured band
pub fn compute_calibration(records: &[CalibrationRecord], config: &CalibrationConfig) -> Option<Calibration> {
    let samples: Vec<(f64, f64)> = records
        .iter()
        .filter(|r| r.raw_sigma > 0.0)
        .filter_map(|r| r.actual_high.map(|a| (a - r.raw_mu, r.raw_sigma)))
        .collect();

    if samples.len() < config.min_records {
        return None;
    }

    let n = samples.len() as f64;
    let bias = samples.iter().map(|(e, _)| e).sum::<f64>() / n;
    // E|e| = σ·√(2/π) for a Normal error
    let mean_abs_ratio = samples.iter().map(|(e, s)| e.abs() / s).sum::<f64>() / n;
    let scale = (mean_abs_ratio * (std::f64::consts::PI / 2.0).sqrt())
        .clamp(config.sigma_scale_min, config.sigma_scale_max);

    Some(Calibration {
        bias_correction: bias,
        sigma_scale: scale,
        last_updated: None,
    })
}

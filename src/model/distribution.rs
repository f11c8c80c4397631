use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;
use crate::data::types::{MarketBin, PercentileForecast};
use crate::model::calibration::Calibration;

/// One-sided 90th-percentile z-score; (P90 - P10) spans 2 × Z90 standard deviations.
pub const Z90: f64 = 1.282;

/// Calibrated Normal distribution of a city's daily high for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityForecast {
    pub city: String,
    pub target_date: NaiveDate,
    pub mu: f64,
    pub sigma: f64,
    pub raw_mu: f64,
    pub raw_sigma: f64,
    pub bias_correction: f64,
    pub sigma_scale: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelError {
    #[error("degenerate percentiles for {city}: p90 ({p90}) must exceed p10 ({p10})")]
    DegeneratePercentiles { city: String, p10: f64, p90: f64 },

    #[error("non-finite forecast input for {city}")]
    NonFinite { city: String },
}

/// Fits per-city distributions from sparse percentile data.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistributionModel;

impl DistributionModel {
    pub fn new() -> Self {
        Self
    }

    /// μ = P50 + bias, σ = scale × (P90 − P10) / (2 × 1.282)
    pub fn fit(
        &self,
        forecast: &PercentileForecast,
        calibration: &Calibration,
    ) -> Result<CityForecast, ModelError> {
        let values = [forecast.p10, forecast.p50, forecast.p90];
        if values.iter().any(|v| !v.is_finite())
            || !calibration.bias_correction.is_finite()
            || !calibration.sigma_scale.is_finite()
        {
            return Err(ModelError::NonFinite { city: forecast.city.clone() });
        }
        if forecast.p90 <= forecast.p10 {
            return Err(ModelError::DegeneratePercentiles {
                city: forecast.city.clone(),
                p10: forecast.p10,
                p90: forecast.p90,
            });
        }

        let raw_mu = forecast.p50;
        let raw_sigma = raw_sigma(forecast.p10, forecast.p90);
        let mu = raw_mu + calibration.bias_correction;
        let sigma = raw_sigma * calibration.sigma_scale;

        debug!(
            "{}: raw_mu={:.1} -> mu={:.1} | raw_sigma={:.2} -> sigma={:.2} (bias={:+.2}, scale={:.3})",
            forecast.city, raw_mu, mu, raw_sigma, sigma,
            calibration.bias_correction, calibration.sigma_scale
        );

        Ok(CityForecast {
            city: forecast.city.clone(),
            target_date: forecast.target_date,
            mu,
            sigma,
            raw_mu,
            raw_sigma,
            bias_correction: calibration.bias_correction,
            sigma_scale: calibration.sigma_scale,
            timestamp: forecast.issued_at,
        })
    }

    /// P(daily high falls in `bin`) under N(μ, σ²).
    pub fn bin_probability(&self, dist: &CityForecast, bin: &MarketBin) -> f64 {
        let cdf = |x: f64| normal_cdf((x - dist.mu) / dist.sigma);

        let p = match (bin.is_open_low, bin.is_open_high, bin.temp_low, bin.temp_high) {
            (true, false, _, Some(hi)) => cdf(hi),
            (false, true, Some(lo), _) => 1.0 - cdf(lo),
            (false, false, Some(lo), Some(hi)) => cdf(hi) - cdf(lo),
            _ => 0.0,
        };
        p.clamp(0.0, 1.0)
    }
}

pub fn raw_sigma(p10: f64, p90: f64) -> f64 {
    (p90 - p10) / (2.0 * Z90)
}

/// Standard normal cumulative distribution function
pub fn normal_cdf(z: f64) -> f64 {
    if z < -8.0 {
        return 0.0;
    }
    if z > 8.0 {
        return 1.0;
    }
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Error function approximation (Abramowitz & Stegun 7.1.26, |error| < 1.5e-7)
fn erf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    sign * y
}

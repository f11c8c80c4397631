use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub paper_trading: PaperTradingConfig,
    pub cities: Vec<CityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    pub dry_run: bool,
    pub database_path: String,
}

/// Edge and sizing parameters shared by every city pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_min_edge")]
    pub min_edge_threshold: f64,
    #[serde(default = "default_max_spread")]
    pub max_spread: f64,
    #[serde(default = "default_min_ask")]
    pub min_ask: f64,
    #[serde(default = "default_max_ask")]
    pub max_ask: f64,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_city_exposure_pct")]
    pub max_city_exposure_pct: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: usize,
    #[serde(default = "default_daily_stop_loss_pct")]
    pub daily_stop_loss_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_calibration_window")]
    pub window_days: usize,
    #[serde(default = "default_calibration_min_records")]
    pub min_records: usize,
    #[serde(default = "default_sigma_scale_min")]
    pub sigma_scale_min: f64,
    #[serde(default = "default_sigma_scale_max")]
    pub sigma_scale_max: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_minutes: u64,
    #[serde(default = "default_calibration_hour")]
    pub calibration_hour_utc: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfrastructureConfig {
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_forecast_age")]
    pub max_forecast_age_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub csv_logging: bool,
    #[serde(default = "default_csv_path")]
    pub csv_log_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperTradingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fill_rate")]
    pub fill_rate: f64,
    #[serde(default = "default_balance")]
    pub initial_balance_usd: f64,
}

/// One traded temperature series.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CityConfig {
    pub code: String,
    pub display_name: String,
    pub kalshi_series: String,
    pub nws_station: String,
    /// Local standard time offset; settlement days are measured in standard time.
    pub utc_offset_hours: i32,
}

fn default_min_edge() -> f64 { 0.05 }
fn default_max_spread() -> f64 { 0.12 }
fn default_min_ask() -> f64 { 0.05 }
fn default_max_ask() -> f64 { 0.95 }
fn default_fee_rate() -> f64 { 0.01 }
fn default_kelly_fraction() -> f64 { 0.25 }
fn default_city_exposure_pct() -> f64 { 0.03 }
fn default_max_open_positions() -> usize { 10 }
fn default_daily_stop_loss_pct() -> f64 { 0.05 }
fn default_calibration_window() -> usize { 30 }
fn default_calibration_min_records() -> usize { 7 }
fn default_sigma_scale_min() -> f64 { 0.5 }
fn default_sigma_scale_max() -> f64 { 2.5 }
fn default_cycle_interval() -> u64 { 30 }
fn default_calibration_hour() -> u32 { 14 }
fn default_order_timeout() -> u64 { 10 }
fn default_http_timeout() -> u64 { 20 }
fn default_forecast_age() -> i64 { 12 }
fn default_csv_path() -> String { "trades.csv".to_string() }
fn default_true() -> bool { true }
fn default_fill_rate() -> f64 { 1.0 }
fn default_balance() -> f64 { 1000.0 }

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_edge_threshold: default_min_edge(),
            max_spread: default_max_spread(),
            min_ask: default_min_ask(),
            max_ask: default_max_ask(),
            fee_rate: default_fee_rate(),
            kelly_fraction: default_kelly_fraction(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_city_exposure_pct: default_city_exposure_pct(),
            max_open_positions: default_max_open_positions(),
            daily_stop_loss_pct: default_daily_stop_loss_pct(),
        }
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_days: default_calibration_window(),
            min_records: default_calibration_min_records(),
            sigma_scale_min: default_sigma_scale_min(),
            sigma_scale_max: default_sigma_scale_max(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cycle_interval_minutes: default_cycle_interval(),
            calibration_hour_utc: default_calibration_hour(),
        }
    }
}

impl Default for InfrastructureConfig {
    fn default() -> Self {
        Self {
            order_timeout_secs: default_order_timeout(),
            http_timeout_secs: default_http_timeout(),
            max_forecast_age_hours: default_forecast_age(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            csv_logging: false,
            csv_log_path: default_csv_path(),
        }
    }
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fill_rate: default_fill_rate(),
            initial_balance_usd: default_balance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("kelly_fraction must be in (0, 1], got {0}")]
    KellyFraction(f64),

    #[error("min_edge_threshold must be non-negative, got {0}")]
    NegativeEdgeThreshold(f64),

    #[error("{name} must be in (0, 1], got {value}")]
    Fraction { name: &'static str, value: f64 },

    #[error("ask band is empty or outside (0, 1): [{min}, {max}]")]
    AskBand { min: f64, max: f64 },

    #[error("fee_rate must be non-negative, got {0}")]
    NegativeFee(f64),

    #[error("max_open_positions must be at least 1")]
    NoPositionsAllowed,

    #[error("at least one city must be configured")]
    NoCities,

    #[error("duplicate city code: {0}")]
    DuplicateCity(String),

    #[error("{name} must be positive")]
    NonPositive { name: &'static str },

    #[error("calibration_hour_utc must be below 24, got {0}")]
    CalibrationHour(u32),

    #[error("sigma scale bounds invalid: [{min}, {max}]")]
    SigmaScaleBounds { min: f64, max: f64 },
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub kalshi_api_url: String,
    pub nws_api_url: String,
    pub nws_user_agent: String,
    pub forecast_snapshot_path: String,
    pub trading_mode: TradingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradingMode {
    Paper,
    Live,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_toml(&contents).with_context(|| format!("Invalid config file: {}", path))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects parameter sets the engine must never run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.strategy;
        if !(s.kelly_fraction > 0.0 && s.kelly_fraction <= 1.0) {
            return Err(ConfigError::KellyFraction(s.kelly_fraction));
        }
        if !(s.min_edge_threshold >= 0.0) {
            return Err(ConfigError::NegativeEdgeThreshold(s.min_edge_threshold));
        }
        if !(s.fee_rate >= 0.0) {
            return Err(ConfigError::NegativeFee(s.fee_rate));
        }
        if !(s.min_ask > 0.0 && s.min_ask <= s.max_ask && s.max_ask < 1.0) {
            return Err(ConfigError::AskBand { min: s.min_ask, max: s.max_ask });
        }
        check_fraction("max_spread", s.max_spread)?;

        let r = &self.risk;
        check_fraction("max_city_exposure_pct", r.max_city_exposure_pct)?;
        check_fraction("daily_stop_loss_pct", r.daily_stop_loss_pct)?;
        if r.max_open_positions == 0 {
            return Err(ConfigError::NoPositionsAllowed);
        }

        let c = &self.calibration;
        if c.window_days == 0 {
            return Err(ConfigError::NonPositive { name: "calibration.window_days" });
        }
        if c.min_records == 0 {
            return Err(ConfigError::NonPositive { name: "calibration.min_records" });
        }
        if !(c.sigma_scale_min > 0.0 && c.sigma_scale_min <= c.sigma_scale_max) {
            return Err(ConfigError::SigmaScaleBounds {
                min: c.sigma_scale_min,
                max: c.sigma_scale_max,
            });
        }

        if self.schedule.cycle_interval_minutes == 0 {
            return Err(ConfigError::NonPositive { name: "schedule.cycle_interval_minutes" });
        }
        if self.schedule.calibration_hour_utc >= 24 {
            return Err(ConfigError::CalibrationHour(self.schedule.calibration_hour_utc));
        }
        if self.infrastructure.order_timeout_secs == 0 {
            return Err(ConfigError::NonPositive { name: "infrastructure.order_timeout_secs" });
        }
        if self.infrastructure.max_forecast_age_hours <= 0 {
            return Err(ConfigError::NonPositive { name: "infrastructure.max_forecast_age_hours" });
        }
        check_fraction("paper_trading.fill_rate", self.paper_trading.fill_rate)?;
        if self.paper_trading.initial_balance_usd <= 0.0 {
            return Err(ConfigError::NonPositive { name: "paper_trading.initial_balance_usd" });
        }

        if self.cities.is_empty() {
            return Err(ConfigError::NoCities);
        }
        let mut seen = HashSet::new();
        for city in &self.cities {
            if !seen.insert(city.code.as_str()) {
                return Err(ConfigError::DuplicateCity(city.code.clone()));
            }
        }

        Ok(())
    }

    pub fn city(&self, code: &str) -> Option<&CityConfig> {
        self.cities.iter().find(|c| c.code == code)
    }
}

fn check_fraction(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::Fraction { name, value })
    }
}

impl EnvConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let trading_mode = match std::env::var("TRADING_MODE")
            .unwrap_or_else(|_| "paper".to_string())
            .to_lowercase()
            .as_str()
        {
            "paper" => TradingMode::Paper,
            "live" => TradingMode::Live,
            other => anyhow::bail!("TRADING_MODE must be `paper` or `live`, got `{}`", other),
        };

        Ok(Self {
            kalshi_api_url: std::env::var("KALSHI_API_URL")
                .unwrap_or_else(|_| "https://api.elections.kalshi.com/trade-api/v2".to_string()),
            nws_api_url: std::env::var("NWS_API_URL")
                .unwrap_or_else(|_| "https://api.weather.gov".to_string()),
            nws_user_agent: std::env::var("NWS_USER_AGENT")
                .unwrap_or_else(|_| "bracket-edge-trader/0.1".to_string()),
            forecast_snapshot_path: std::env::var("FORECAST_SNAPSHOT_PATH")
                .context("FORECAST_SNAPSHOT_PATH not set")?,
            trading_mode,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::from_toml(
        r#"
        [system]
        dry_run = true
        database_path = ":memory:"

        [[cities]]
        code = "NYC"
        display_name = "New York City"
        kalshi_series = "KXHIGHNY"
        nws_station = "KNYC"
        utc_offset_hours = -5

        [[cities]]
        code = "CHI"
        display_name = "Chicago"
        kalshi_series = "KXHIGHCHI"
        nws_station = "KMDW"
        utc_offset_hours = -6
        "#,
    )
    .unwrap()
}

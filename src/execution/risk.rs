use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, info, warn};
use crate::config::RiskConfig;
use crate::execution::types::Trade;

/// Float slack on money comparisons.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum KillSwitch {
    Normal,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CityExposure {
    pub used: f64,
    pub budget: f64,
}

impl CityExposure {
    pub fn remaining(&self) -> f64 {
        (self.budget - self.used).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RiskRejection {
    #[error("kill switch active")]
    KillSwitchActive,

    #[error("max open positions reached: {open} + {requested} > {max}")]
    MaxOpenPositions { open: usize, requested: usize, max: usize },

    #[error("city {0} budget exhausted")]
    CityBudgetExhausted(String),

    #[error("ticker {0} already has an open position")]
    TickerAlreadyOpen(String),

    #[error("${cost:.2} exceeds remaining {city} budget ${remaining:.2}")]
    ExceedsCityBudget { city: String, cost: f64, remaining: f64 },

    #[error("unknown city {0}")]
    UnknownCity(String),
}

/// Mutable per-day risk ledger. Owned by one `RiskManager`; never shared directly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskState {
    pub trading_day: NaiveDate,
    pub day_start_balance: f64,
    pub daily_loss: f64,
    pub kill_switch: KillSwitch,
    pub open_position_count: usize,
    pub city_exposure: BTreeMap<String, CityExposure>,
    pub open_tickers: HashSet<String>,
    pub wins: u32,
    pub losses: u32,
}

/// Read-only view published to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskStatus {
    pub kill_switch_active: bool,
    pub daily_loss: f64,
    pub open_position_count: usize,
    pub max_open_positions: usize,
    pub city_exposure: BTreeMap<String, CityExposure>,
}

/// Totals for a finished trading day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub start_balance: f64,
    pub realized_pnl: f64,
    pub wins: u32,
    pub losses: u32,
    pub kill_switch_tripped: bool,
}

/// Sole authority on whether an order may be placed.
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    cities: Vec<String>,
    state: RiskState,
}

impl RiskManager {
    pub fn new(config: RiskConfig, cities: Vec<String>, balance: f64, now: DateTime<Utc>) -> Self {
        let state = fresh_state(&config, &cities, now.date_naive(), balance, 0);
        Self { config, cities, state }
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn is_halted(&self) -> bool {
        self.state.kill_switch == KillSwitch::Halted
    }

    pub fn trading_day(&self) -> NaiveDate {
        self.state.trading_day
    }

    /// Starts a new trading day if `now` has crossed UTC midnight. Clears the kill
    /// switch, rebases the day on `balance` and drops same-day exposure. Open
    /// positions carry over. Returns the summary of the day that ended.
    pub fn roll_day(&mut self, now: DateTime<Utc>, balance: f64) -> Option<DailySummary> {
        let today = now.date_naive();
        if today <= self.state.trading_day {
            return None;
        }

        let summary = self.summary();
        info!(
            "📅 New trading day {}: start balance ${:.2} (previous day pnl ${:+.2})",
            today, balance, summary.realized_pnl
        );
        self.state = fresh_state(&self.config, &self.cities, today, balance, self.state.open_position_count);
        Some(summary)
    }

    pub fn summary(&self) -> DailySummary {
        DailySummary {
            date: self.state.trading_day,
            start_balance: self.state.day_start_balance,
            realized_pnl: -self.state.daily_loss,
            wins: self.state.wins,
            losses: self.state.losses,
            kill_switch_tripped: self.is_halted(),
        }
    }

    /// Loss threshold in dollars for the current day.
    pub fn stop_loss_limit(&self) -> f64 {
        self.config.daily_stop_loss_pct * self.state.day_start_balance
    }

    /// Trips the kill switch once the day's loss reaches the limit. Returns true
    /// only on the transition.
    pub fn check_kill_switch(&mut self) -> bool {
        if self.is_halted() {
            return false;
        }
        let limit = self.stop_loss_limit();
        if self.state.daily_loss + EPSILON >= limit {
            self.state.kill_switch = KillSwitch::Halted;
            error!(
                "🔴 KILL SWITCH ACTIVATED: daily loss ${:.2} >= limit ${:.2}; no new orders until {} UTC rollover",
                self.state.daily_loss, limit, self.state.trading_day.succ_opt().unwrap_or(self.state.trading_day)
            );
            return true;
        }
        false
    }

    pub fn remaining_budget(&self, city: &str) -> f64 {
        self.state.city_exposure.get(city).map_or(0.0, |e| e.remaining())
    }

    /// Pre-order gate for one new position per ticker in `city`.
    pub fn can_open(&self, city: &str, tickers: &[&str]) -> Result<(), RiskRejection> {
        if self.is_halted() {
            return Err(RiskRejection::KillSwitchActive);
        }
        let requested = tickers.len();
        if self.state.open_position_count + requested > self.config.max_open_positions {
            return Err(RiskRejection::MaxOpenPositions {
                open: self.state.open_position_count,
                requested,
                max: self.config.max_open_positions,
            });
        }
        let exposure = self
            .state
            .city_exposure
            .get(city)
            .ok_or_else(|| RiskRejection::UnknownCity(city.to_string()))?;
        if exposure.used + EPSILON >= exposure.budget {
            return Err(RiskRejection::CityBudgetExhausted(city.to_string()));
        }
        if let Some(t) = tickers.iter().find(|t| self.state.open_tickers.contains(**t)) {
            return Err(RiskRejection::TickerAlreadyOpen(t.to_string()));
        }
        Ok(())
    }

    /// Accounts an order before it is sent; released again if it never reaches the book.
    pub fn reserve(&mut self, city: &str, ticker: &str, cost: f64) -> Result<(), RiskRejection> {
        self.can_open(city, &[ticker])?;
        let exposure = self
            .state
            .city_exposure
            .get_mut(city)
            .ok_or_else(|| RiskRejection::UnknownCity(city.to_string()))?;
        if exposure.used + cost > exposure.budget + EPSILON {
            return Err(RiskRejection::ExceedsCityBudget {
                city: city.to_string(),
                cost,
                remaining: exposure.remaining(),
            });
        }
        exposure.used += cost;
        self.state.open_position_count += 1;
        self.state.open_tickers.insert(ticker.to_string());
        Ok(())
    }

    /// Gives back a position slot. Exposure is only returned for trades opened on
    /// the current trading day; earlier days' exposure was cleared at rollover.
    pub fn release(&mut self, trade: &Trade) {
        self.state.open_position_count = self.state.open_position_count.saturating_sub(1);
        if trade.opened_at.date_naive() != self.state.trading_day {
            return;
        }
        self.state.open_tickers.remove(&trade.ticker);
        if let Some(exposure) = self.state.city_exposure.get_mut(&trade.city) {
            exposure.used = (exposure.used - trade.cost()).max(0.0);
        }
    }

    /// Books a realized pnl and re-checks the kill switch. Returns true if it tripped.
    pub fn record_resolution(&mut self, trade: &Trade, pnl: f64) -> bool {
        self.release(trade);
        self.state.daily_loss -= pnl;
        if pnl > 0.0 {
            self.state.wins += 1;
        } else if pnl < 0.0 {
            self.state.losses += 1;
        }
        self.check_kill_switch()
    }

    /// Rebuilds today's state after a restart from the ledger's held positions and
    /// the pnl already realized today.
    pub fn restore(&mut self, held: &[Trade], day_start_balance: f64, realized_today: &[Trade]) {
        let day = self.state.trading_day;
        self.state = fresh_state(&self.config, &self.cities, day, day_start_balance, held.len());

        for trade in held.iter().filter(|t| t.opened_at.date_naive() == day) {
            self.state.open_tickers.insert(trade.ticker.clone());
            match self.state.city_exposure.get_mut(&trade.city) {
                Some(exposure) => exposure.used += trade.cost(),
                None => warn!("Open trade {} for unconfigured city {}", trade.trade_id, trade.city),
            }
        }
        for trade in realized_today {
            let pnl = trade.pnl.unwrap_or(0.0);
            self.state.daily_loss -= pnl;
            if pnl > 0.0 {
                self.state.wins += 1;
            } else if pnl < 0.0 {
                self.state.losses += 1;
            }
        }

        info!(
            "Risk state restored: {} open positions, daily loss ${:.2}",
            self.state.open_position_count, self.state.daily_loss
        );
        self.check_kill_switch();
    }

    pub fn status(&self) -> RiskStatus {
        RiskStatus {
            kill_switch_active: self.is_halted(),
            daily_loss: self.state.daily_loss,
            open_position_count: self.state.open_position_count,
            max_open_positions: self.config.max_open_positions,
            city_exposure: self.state.city_exposure.clone(),
        }
    }
}

fn fresh_state(
    config: &RiskConfig,
    cities: &[String],
    day: NaiveDate,
    balance: f64,
    open_position_count: usize,
) -> RiskState {
    let budget = config.max_city_exposure_pct * balance;
    RiskState {
        trading_day: day,
        day_start_balance: balance,
        daily_loss: 0.0,
        kill_switch: KillSwitch::Normal,
        open_position_count,
        city_exposure: cities
            .iter()
            .map(|c| (c.clone(), CityExposure { used: 0.0, budget }))
            .collect(),
        open_tickers: HashSet::new(),
        wins: 0,
        losses: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::sample_trade;

    fn manager() -> RiskManager {
        let config = RiskConfig {
            max_city_exposure_pct: 0.03,
            max_open_positions: 10,
            daily_stop_loss_pct: 0.05,
        };
        let now = "2026-10-14T12:00:00Z".parse().unwrap();
        RiskManager::new(config, vec!["NYC".to_string(), "CHI".to_string()], 1000.0, now)
    }

    fn losing_trade(city: &str, ticker: &str, loss: f64) -> (Trade, f64) {
        (sample_trade(city, ticker, 1, 0.30), -loss)
    }

    #[test]
    fn test_kill_switch_trips_at_exact_limit() {
        let mut risk = manager();
        let (t, pnl) = losing_trade("NYC", "B1", 50.0);
        risk.reserve("NYC", "B1", 0.30).unwrap();
        assert!(risk.record_resolution(&t, pnl));
        assert!(risk.is_halted());
        assert_eq!(risk.can_open("CHI", &["B2"]), Err(RiskRejection::KillSwitchActive));
    }

    #[test]
    fn test_kill_switch_holds_one_cent_under() {
        let mut risk = manager();
        let (t, pnl) = losing_trade("NYC", "B1", 49.99);
        assert!(!risk.record_resolution(&t, pnl));
        assert!(!risk.is_halted());
        assert!(risk.can_open("CHI", &["B2"]).is_ok());
    }

    #[test]
    fn test_gains_offset_losses() {
        let mut risk = manager();
        risk.record_resolution(&sample_trade("NYC", "B1", 1, 0.3), 20.0);
        risk.record_resolution(&sample_trade("NYC", "B2", 1, 0.3), -60.0);
        assert!((risk.state().daily_loss - 40.0).abs() < 1e-9);
        assert!(!risk.is_halted());
        assert_eq!((risk.state().wins, risk.state().losses), (1, 1));
    }

    #[test]
    fn test_city_budget_never_exceeded() {
        let mut risk = manager();
        assert!((risk.remaining_budget("NYC") - 30.0).abs() < 1e-9);

        risk.reserve("NYC", "B1", 20.0).unwrap();
        let err = risk.reserve("NYC", "B2", 15.0).unwrap_err();
        assert!(matches!(err, RiskRejection::ExceedsCityBudget { .. }));

        risk.reserve("NYC", "B2", 10.0).unwrap();
        assert_eq!(risk.remaining_budget("NYC"), 0.0);
        assert_eq!(risk.can_open("NYC", &["B3"]), Err(RiskRejection::CityBudgetExhausted("NYC".to_string())));
        assert!(risk.can_open("CHI", &["C1"]).is_ok());

        let exposure = risk.status().city_exposure["NYC"];
        assert!(exposure.used <= exposure.budget + 1e-9);
    }

    #[test]
    fn test_exact_budget_fill_blocks_bracket() {
        let mut risk = manager();
        risk.reserve("NYC", "B1", 30.0).unwrap();
        assert!(risk.remaining_budget("NYC").abs() < 1e-9);

        assert_eq!(
            risk.can_open("NYC", &["B2", "B3"]),
            Err(RiskRejection::CityBudgetExhausted("NYC".to_string()))
        );
        assert_eq!(risk.state().open_position_count, 1);
        assert!(risk.can_open("CHI", &["C1", "C2"]).is_ok());
    }

    #[test]
    fn test_position_cap_counts_bracket_legs() {
        let mut risk = manager();
        for i in 0..9 {
            let city = if i % 2 == 0 { "NYC" } else { "CHI" };
            risk.reserve(city, &format!("T{}", i), 1.0).unwrap();
        }
        assert!(risk.can_open("NYC", &["X1"]).is_ok());
        assert!(matches!(
            risk.can_open("NYC", &["X1", "X2"]),
            Err(RiskRejection::MaxOpenPositions { open: 9, requested: 2, max: 10 })
        ));
    }

    #[test]
    fn test_duplicate_ticker_rejected() {
        let mut risk = manager();
        risk.reserve("NYC", "B1", 5.0).unwrap();
        assert_eq!(risk.reserve("NYC", "B1", 5.0), Err(RiskRejection::TickerAlreadyOpen("B1".to_string())));
    }

    #[test]
    fn test_rollover_clears_halt_and_exposure() {
        let mut risk = manager();
        risk.reserve("NYC", "B1", 10.0).unwrap();
        risk.reserve("CHI", "C1", 0.3).unwrap();
        risk.record_resolution(&sample_trade("CHI", "C1", 1, 0.3), -80.0);
        assert!(risk.is_halted());

        let same_day = "2026-10-14T23:59:00Z".parse().unwrap();
        assert_eq!(risk.roll_day(same_day, 900.0), None);
        assert!(risk.is_halted());

        let next_day = "2026-10-15T00:00:30Z".parse().unwrap();
        let summary = risk.roll_day(next_day, 900.0).unwrap();
        assert!((summary.realized_pnl + 80.0).abs() < 1e-9);
        assert!(summary.kill_switch_tripped);

        assert!(!risk.is_halted());
        assert_eq!(risk.state().day_start_balance, 900.0);
        assert_eq!(risk.state().daily_loss, 0.0);
        assert_eq!(risk.state().open_position_count, 1);
        assert!((risk.remaining_budget("NYC") - 27.0).abs() < 1e-9);
    }

    #[test]
    fn test_release_after_rollover_keeps_new_day_exposure() {
        let mut risk = manager();
        let yesterday = sample_trade("NYC", "B1", 10, 1.0);
        risk.reserve("NYC", "B1", yesterday.cost()).unwrap();
        risk.roll_day("2026-10-15T01:00:00Z".parse().unwrap(), 1000.0);

        risk.reserve("NYC", "B9", 5.0).unwrap();
        risk.record_resolution(&yesterday, 9.0);
        assert_eq!(risk.state().open_position_count, 1);
        assert!((risk.remaining_budget("NYC") - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_restore_rebuilds_from_ledger() {
        let mut risk = manager();
        let held = vec![sample_trade("NYC", "B1", 20, 0.5), sample_trade("CHI", "C1", 10, 0.5)];
        let mut realized = sample_trade("NYC", "B0", 10, 0.5);
        realized.resolve(Some(false), -52.0, "2026-10-14T10:00:00Z".parse().unwrap());

        risk.restore(&held, 1000.0, &[realized]);
        assert_eq!(risk.state().open_position_count, 2);
        assert!((risk.remaining_budget("NYC") - 20.0).abs() < 1e-9);
        assert!(risk.state().open_tickers.contains("C1"));
        assert!(risk.is_halted());
    }
}

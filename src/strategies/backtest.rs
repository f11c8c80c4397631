use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};
use crate::config::{CityConfig, RiskConfig, StrategyConfig};
use crate::data::types::{settlement_high, MarketBin, PercentileForecast};
use crate::execution::persistence::TradeLedger;
use crate::execution::risk::RiskManager;
use crate::execution::types::Trade;
use crate::model::calibration::{CalibrationRecord, CalibrationStore};
use crate::model::distribution::{normal_cdf, DistributionModel, Z90};
use crate::strategies::edge::EdgeEngine;
use crate::strategies::sizing::PositionSizer;
use crate::strategies::types::{Opportunity, StrategyKind};

/// Degrees the simulated market widens the model's sigma by.
const MARKET_SIGMA_WIDENING: f64 = 2.0;
/// Ladder reach either side of the market's centre, °F.
const LADDER_HALF_WIDTH: f64 = 10.0;
const MARKET_MAKER_MARGIN: f64 = 0.01;
const SYNTHETIC_SPREAD: f64 = 0.02;

/// Outcome of one replayed trading day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestDay {
    pub date: NaiveDate,
    pub trades: usize,
    pub wins: usize,
    pub pnl: f64,
    pub end_balance: f64,
    pub kill_switch_tripped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestReport {
    pub initial_balance: f64,
    pub final_balance: f64,
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_pnl: f64,
    pub max_drawdown_pct: f64,
    pub days: Vec<BacktestDay>,
}

impl BacktestReport {
    pub fn win_rate(&self) -> f64 {
        if self.total_trades == 0 {
            return 0.0;
        }
        self.wins as f64 / self.total_trades as f64
    }

    pub fn total_return_pct(&self) -> f64 {
        if self.initial_balance <= 0.0 {
            return 0.0;
        }
        (self.final_balance - self.initial_balance) / self.initial_balance * 100.0
    }
}

/// Priced ladder a market maker quoting a wider Normal around `mu` would show.
///
/// Closed bins cover two whole-degree readings each, with half-degree edges so
/// every settled value falls in exactly one bin.
pub fn synthetic_ladder(city: &str, mu: f64, sigma: f64) -> Vec<MarketBin> {
    let market_sigma = sigma + MARKET_SIGMA_WIDENING;
    let price = |low: f64, high: f64| {
        let p = normal_cdf((high - mu) / market_sigma) - normal_cdf((low - mu) / market_sigma);
        let ask = (p + MARKET_MAKER_MARGIN).clamp(0.03, 0.97);
        (ask, (ask - SYNTHETIC_SPREAD).max(0.0))
    };

    let first = (mu - LADDER_HALF_WIDTH).floor() as i64;
    let last = (mu + LADDER_HALF_WIDTH).ceil() as i64;

    let low_edge = first as f64 - 0.5;
    let (ask, bid) = price(f64::NEG_INFINITY, low_edge);
    let mut ladder = vec![MarketBin::open_low(city, &format!("{}-T{}L", city, first), low_edge, ask, bid)];

    let mut t = first;
    while t < last {
        let (low, high) = (t as f64 - 0.5, t as f64 + 1.5);
        let (ask, bid) = price(low, high);
        ladder.push(MarketBin::closed(city, &format!("{}-B{}", city, t), low, high, ask, bid));
        t += 2;
    }

    let high_edge = t as f64 - 0.5;
    let (ask, bid) = price(high_edge, f64::INFINITY);
    ladder.push(MarketBin::open_high(city, &format!("{}-T{}H", city, t), high_edge, ask, bid));
    ladder
}

/// Replays stored forecast-vs-actual history through the live edge, sizing and
/// risk rules, one trading day at a time.
pub struct Backtester {
    model: DistributionModel,
    edge: EdgeEngine,
    sizer: PositionSizer,
    risk_config: RiskConfig,
}

impl Backtester {
    pub fn new(strategy: StrategyConfig, risk: RiskConfig) -> Self {
        let sizer = PositionSizer::new(strategy.kelly_fraction);
        Self {
            model: DistributionModel::new(),
            edge: EdgeEngine::new(strategy, DistributionModel::new()),
            sizer,
            risk_config: risk,
        }
    }

    /// Pulls the last `lookback_days` settled records per city from the ledger and replays them.
    pub fn run(
        &self,
        ledger: &TradeLedger,
        cities: &[CityConfig],
        calibrations: &CalibrationStore,
        up_to: NaiveDate,
        lookback_days: usize,
        initial_balance: f64,
    ) -> Result<BacktestReport> {
        let mut records = Vec::new();
        for city in cities {
            let history = ledger.calibration_history(&city.code, up_to, lookback_days)?;
            if history.is_empty() {
                warn!("No settled history for {} up to {}", city.code, up_to);
            }
            records.extend(history);
        }

        let report = self.replay(&records, calibrations, initial_balance);
        info!(
            "📊 Backtest: {} days, {} trades, win rate {:.1}%, pnl ${:+.2} ({:+.2}%), max drawdown {:.2}%",
            report.days.len(),
            report.total_trades,
            report.win_rate() * 100.0,
            report.total_pnl,
            report.total_return_pct(),
            report.max_drawdown_pct
        );
        Ok(report)
    }

    /// Records without an actual high are skipped. Each record is fitted with the
    /// city's current calibration.
    pub fn replay(
        &self,
        records: &[CalibrationRecord],
        calibrations: &CalibrationStore,
        initial_balance: f64,
    ) -> BacktestReport {
        let mut by_date: BTreeMap<NaiveDate, Vec<&CalibrationRecord>> = BTreeMap::new();
        for record in records.iter().filter(|r| r.actual_high.is_some()) {
            by_date.entry(record.forecast_date).or_default().push(record);
        }

        let mut balance = initial_balance;
        let mut peak = initial_balance;
        let mut max_drawdown_pct: f64 = 0.0;
        let mut days = Vec::with_capacity(by_date.len());

        for (date, day_records) in by_date {
            let day = self.simulate_day(date, &day_records, calibrations, balance);
            balance = day.end_balance;
            peak = peak.max(balance);
            if peak > 0.0 {
                max_drawdown_pct = max_drawdown_pct.max((peak - balance) / peak * 100.0);
            }
            days.push(day);
        }

        let total_trades: usize = days.iter().map(|d| d.trades).sum();
        let wins: usize = days.iter().map(|d| d.wins).sum();
        BacktestReport {
            initial_balance,
            final_balance: balance,
            total_trades,
            wins,
            losses: total_trades - wins,
            total_pnl: balance - initial_balance,
            max_drawdown_pct,
            days,
        }
    }

    fn simulate_day(
        &self,
        date: NaiveDate,
        records: &[&CalibrationRecord],
        calibrations: &CalibrationStore,
        balance: f64,
    ) -> BacktestDay {
        let at = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
        let cities = records.iter().map(|r| r.city.clone()).collect();
        let mut risk = RiskManager::new(self.risk_config.clone(), cities, balance, at);

        let mut inputs = Vec::with_capacity(records.len());
        let mut actuals: HashMap<&str, f64> = HashMap::new();
        for record in records {
            let Some(actual) = record.actual_high else { continue };
            let forecast = historical_forecast(record, at);
            match self.model.fit(&forecast, &calibrations.get(&record.city)) {
                Ok(dist) => {
                    let ladder = synthetic_ladder(&record.city, dist.mu, dist.sigma);
                    actuals.insert(record.city.as_str(), settlement_high(actual));
                    inputs.push((dist, ladder));
                }
                Err(e) => warn!("Skipping {} on {}: {}", record.city, date, e),
            }
        }

        let opportunities = self.edge.scan(&inputs);
        let mut opened = Vec::new();
        for opp in opportunities.execution_order() {
            match opp {
                Opportunity::Single(s) => {
                    if risk.can_open(&s.city, &[s.bin.ticker.as_str()]).is_err() {
                        continue;
                    }
                    if let Some(size) = self.sizer.size_single(s, balance, risk.remaining_budget(&s.city)) {
                        fill(&mut risk, Trade::open(s, &size, StrategyKind::Single, None, date, at), &mut opened);
                    }
                }
                Opportunity::Bracket(b) => {
                    let tickers = [b.leg1.bin.ticker.as_str(), b.leg2.bin.ticker.as_str()];
                    if risk.can_open(&b.city, &tickers).is_err() {
                        continue;
                    }
                    if let Some((size1, size2)) = self.sizer.size_bracket(b, balance, risk.remaining_budget(&b.city)) {
                        let id = Some(b.bracket_id);
                        fill(&mut risk, Trade::open(&b.leg1, &size1, StrategyKind::Bracket, id, date, at), &mut opened);
                        fill(&mut risk, Trade::open(&b.leg2, &size2, StrategyKind::Bracket, id, date, at), &mut opened);
                    }
                }
            }
        }

        let mut day = BacktestDay {
            date,
            trades: 0,
            wins: 0,
            pnl: 0.0,
            end_balance: balance,
            kill_switch_tripped: false,
        };
        for mut trade in opened {
            let Some(&actual) = actuals.get(trade.city.as_str()) else { continue };
            let (won, pnl) = trade.settlement(actual);
            trade.resolve(Some(won), pnl, at);
            day.trades += 1;
            if won {
                day.wins += 1;
            }
            day.pnl += pnl;
            if risk.record_resolution(&trade, pnl) {
                day.kill_switch_tripped = true;
            }
        }
        day.end_balance = balance + day.pnl;

        debug!(
            "Backtest {}: {} trades, {} won, pnl ${:+.2}, balance ${:.2}",
            date, day.trades, day.wins, day.pnl, day.end_balance
        );
        day
    }
}

fn fill(risk: &mut RiskManager, trade: Trade, opened: &mut Vec<Trade>) {
    match risk.reserve(&trade.city, &trade.ticker, trade.cost()) {
        Ok(()) => opened.push(trade),
        Err(e) => debug!("Backtest skipped {} {}: {}", trade.city, trade.ticker, e),
    }
}

/// Rebuilds the percentile forecast a stored raw (μ, σ) pair came from.
fn historical_forecast(record: &CalibrationRecord, issued_at: DateTime<Utc>) -> PercentileForecast {
    PercentileForecast {
        city: record.city.clone(),
        target_date: record.forecast_date,
        p10: record.raw_mu - Z90 * record.raw_sigma,
        p50: record.raw_mu,
        p90: record.raw_mu + Z90 * record.raw_sigma,
        issued_at,
    }
}

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::config::{CityConfig, Config};
use crate::data::kalshi::MarketDataProvider;
use crate::data::types::{settlement_high, MarketBin};
use crate::data::weather::{ActualsProvider, ForecastProvider};
use crate::execution::gateway::{GatewayError, OrderGateway};
use crate::execution::persistence::{EventKind, TradeLedger};
use crate::execution::risk::{RiskManager, RiskStatus};
use crate::execution::types::{OrderAck, OrderRequest, Trade, TradeStatus};
use crate::model::calibration::{CalibrationEngine, CalibrationOutcome, CalibrationStore};
use crate::model::distribution::{CityForecast, DistributionModel};
use crate::monitoring::logger::CsvLogger;
use crate::strategies::edge::EdgeEngine;
use crate::strategies::sizing::PositionSizer;
use crate::strategies::types::{
    BracketOpportunity, Opportunity, OpportunitySet, SingleOpportunity, StrategyKind,
};

/// External systems the orchestrator pulls from and trades through.
pub struct Collaborators {
    pub forecasts: Arc<dyn ForecastProvider>,
    pub markets: Arc<dyn MarketDataProvider>,
    pub actuals: Arc<dyn ActualsProvider>,
    pub gateway: Arc<dyn OrderGateway>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CityDistribution {
    pub mu: f64,
    pub sigma: f64,
    pub bias_correction: f64,
}

/// Published once per cycle, whether or not trading is halted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSnapshot {
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub single_opportunities: Vec<SingleOpportunity>,
    pub bracket_opportunities: Vec<BracketOpportunity>,
    pub city_distributions: BTreeMap<String, CityDistribution>,
    pub balance: f64,
    pub open_position_count: usize,
    pub kill_switch_active: bool,
    pub skipped_cities: BTreeMap<String, String>,
    pub trades_placed: usize,
}

/// How a cancelled trade leaves the book.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CancelExit {
    /// Resting order pulled; nothing was spent.
    QuickExit,
    /// Position sold with an explicit limit fill.
    LimitFill { price: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementReport {
    pub date: NaiveDate,
    pub resolved: usize,
    pub realized_pnl: f64,
    pub unsettled_cities: Vec<String>,
    pub kill_switch_tripped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyCloseReport {
    pub settlement: SettlementReport,
    pub calibration: Vec<CalibrationOutcome>,
}

enum Placement {
    Placed(Trade),
    /// Outcome unknown; exposure stays reserved until the next re-query.
    Pending(Trade),
    NotPlaced,
}

/// Cycle driver: snapshots in, risk-gated orders out.
pub struct ExecutionOrchestrator {
    cities: Vec<CityConfig>,
    forecasts: Arc<dyn ForecastProvider>,
    markets: Arc<dyn MarketDataProvider>,
    actuals: Arc<dyn ActualsProvider>,
    gateway: Arc<dyn OrderGateway>,
    ledger: Arc<TradeLedger>,
    calibrations: Arc<CalibrationStore>,
    calibration_engine: CalibrationEngine,
    model: DistributionModel,
    edge: EdgeEngine,
    sizer: PositionSizer,
    risk: Mutex<RiskManager>,
    journal: Option<CsvLogger>,
    order_timeout: Duration,
    dry_run: bool,
    cycles: AtomicU64,
    snapshots: watch::Sender<Option<Arc<CycleSnapshot>>>,
}

impl ExecutionOrchestrator {
    pub async fn new(
        config: Config,
        collaborators: Collaborators,
        ledger: Arc<TradeLedger>,
        calibrations: Arc<CalibrationStore>,
        journal: Option<CsvLogger>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let balance = collaborators
            .gateway
            .balance()
            .await
            .context("Failed to read starting balance")?;
        let city_codes = config.cities.iter().map(|c| c.code.clone()).collect();
        let model = DistributionModel::new();
        let (snapshots, _) = watch::channel(None);

        Ok(Self {
            risk: Mutex::new(RiskManager::new(config.risk.clone(), city_codes, balance, now)),
            edge: EdgeEngine::new(config.strategy.clone(), model),
            sizer: PositionSizer::new(config.strategy.kelly_fraction),
            calibration_engine: CalibrationEngine::new(
                config.calibration.clone(),
                calibrations.clone(),
                ledger.clone(),
            ),
            order_timeout: Duration::from_secs(config.infrastructure.order_timeout_secs),
            dry_run: config.system.dry_run,
            cities: config.cities,
            forecasts: collaborators.forecasts,
            markets: collaborators.markets,
            actuals: collaborators.actuals,
            gateway: collaborators.gateway,
            ledger,
            calibrations,
            model,
            journal,
            cycles: AtomicU64::new(0),
            snapshots,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<CycleSnapshot>>> {
        self.snapshots.subscribe()
    }

    /// Ledger entries opened on `date`, optionally for one city.
    pub fn trades(&self, date: NaiveDate, city: Option<&str>) -> Result<Vec<Trade>> {
        self.ledger.trades_by_date(date, city)
    }

    pub async fn risk_status(&self) -> RiskStatus {
        self.risk.lock().await.status()
    }

    /// Rebuilds risk state from the ledger after a restart and re-queries any
    /// order whose outcome was never confirmed.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<()> {
        info!("Performing crash recovery...");
        let today = now.date_naive();
        let balance = self.gateway.balance().await.context("Failed to read balance")?;

        let day_start = match self.ledger.day_start_balance(today)? {
            Some(b) => b,
            None => {
                self.ledger.set_day_start_balance(today, balance)?;
                balance
            }
        };
        let held = self.ledger.held_trades()?;
        let realized = self.ledger.trades_resolved_on(today)?;
        for trade in &held {
            info!(
                "Open trade: {} {} x{} @ ${:.2} ({})",
                trade.city, trade.ticker, trade.count, trade.price, trade.status.as_str()
            );
        }

        self.risk.lock().await.restore(&held, day_start, &realized);

        let reconciled = self.reconcile_pending(now).await;
        info!(
            "Crash recovery complete: {} held positions, {} pending orders reconciled",
            held.len(),
            reconciled
        );
        Ok(())
    }

    /// One dispatch cycle. Safe to re-run for the same tick: open tickers are never bought twice.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<Arc<CycleSnapshot>> {
        let cycle_number = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!("🔄 Cycle {} starting at {}", cycle_number, now.to_rfc3339());

        let balance = self.current_balance().await;
        self.begin_day(now, balance).await;
        self.reconcile_pending(now).await;

        let prepared = join_all(self.cities.iter().map(|city| self.prepare_city(city, now))).await;

        let mut inputs: Vec<(CityForecast, Vec<MarketBin>)> = Vec::new();
        let mut city_distributions = BTreeMap::new();
        let mut target_dates = HashMap::new();
        let mut skipped_cities = BTreeMap::new();
        for (city, result) in self.cities.iter().zip(prepared) {
            match result {
                Ok((dist, ladder)) => {
                    city_distributions.insert(
                        city.code.clone(),
                        CityDistribution { mu: dist.mu, sigma: dist.sigma, bias_correction: dist.bias_correction },
                    );
                    target_dates.insert(city.code.clone(), dist.target_date);
                    inputs.push((dist, ladder));
                }
                Err(reason) => {
                    warn!("Skipping {} this cycle: {}", city.code, reason);
                    skipped_cities.insert(city.code.clone(), reason);
                }
            }
        }

        let set = self.edge.scan(&inputs);
        if set.is_empty() {
            debug!("No qualifying opportunities across {} cities", inputs.len());
        }

        // Gate-check-and-increment for the whole iteration happens under this one lock
        let mut risk = self.risk.lock().await;
        let mut trades_placed = 0;
        if risk.is_halted() {
            warn!(
                "Kill switch active: publishing {} opportunities without trading",
                set.singles.len() + set.brackets.len()
            );
        } else if self.dry_run {
            info!("Dry run: not placing orders");
        } else if let Some(balance) = balance {
            trades_placed = self.execute(&mut risk, &set, balance, &target_dates, now).await;
        } else {
            warn!("Balance unavailable: skipping execution this cycle");
        }
        let open_position_count = risk.state().open_position_count;
        let kill_switch_active = risk.is_halted();
        drop(risk);

        let snapshot = Arc::new(CycleSnapshot {
            cycle_number,
            timestamp: now,
            single_opportunities: set.singles,
            bracket_opportunities: set.brackets,
            city_distributions,
            balance: self.current_balance().await.or(balance).unwrap_or(0.0),
            open_position_count,
            kill_switch_active,
            skipped_cities,
            trades_placed,
        });
        self.snapshots.send_replace(Some(snapshot.clone()));

        info!(
            "Cycle {} complete: {} trades placed, {} open positions{}",
            cycle_number,
            trades_placed,
            open_position_count,
            if kill_switch_active { " (HALTED)" } else { "" }
        );
        Ok(snapshot)
    }

    /// Settles yesterday's trades against the observed highs and recalibrates. Idempotent.
    pub async fn daily_close(&self, now: DateTime<Utc>) -> Result<DailyCloseReport> {
        let date = now
            .date_naive()
            .pred_opt()
            .ok_or_else(|| anyhow!("no day before {}", now))?;
        info!("📊 Daily close for {}", date);

        let fetched = join_all(self.cities.iter().map(|city| async move {
            (city.code.clone(), self.actuals.actual_high(city, date).await)
        }))
        .await;

        let mut actuals = HashMap::new();
        for (code, result) in fetched {
            match result {
                Ok(high) => {
                    actuals.insert(code, settlement_high(high));
                }
                Err(e) => warn!("{}", e),
            }
        }

        // Calibration never waits on the risk lock an in-flight cycle may hold
        let calibration = self.calibration_engine.run(date, &self.cities, &actuals, now);

        let balance = self.current_balance().await;
        self.begin_day(now, balance).await;
        let settlement = self.settle(date, &actuals, now).await?;
        Ok(DailyCloseReport { settlement, calibration })
    }

    /// Resolves open trades for `date`. YES settles iff the actual high falls in the bin.
    pub async fn settle(
        &self,
        date: NaiveDate,
        actuals: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<SettlementReport> {
        let open = self.ledger.open_trades_for_target(date)?;
        let mut report = SettlementReport {
            date,
            resolved: 0,
            realized_pnl: 0.0,
            unsettled_cities: Vec::new(),
            kill_switch_tripped: false,
        };

        let mut risk = self.risk.lock().await;
        for mut trade in open {
            let Some(&actual) = actuals.get(&trade.city) else {
                if !report.unsettled_cities.contains(&trade.city) {
                    warn!("{}: no actual high for {}, leaving trades open", trade.city, date);
                    report.unsettled_cities.push(trade.city.clone());
                }
                continue;
            };

            let actual = settlement_high(actual);
            let (won, pnl) = trade.settlement(actual);
            trade.resolve(Some(won), pnl, now);
            if let Err(e) = self.ledger.update_trade(&trade) {
                error!("Failed to record settlement of {}: {:#}", trade.trade_id, e);
                continue;
            }
            if won {
                if let Err(e) = self.gateway.credit_settlement(trade.count as f64).await {
                    warn!("Settlement credit for {} failed: {}", trade.ticker, e);
                }
            }
            info!(
                "{} {} settled {} at {:.1}°F: pnl ${:+.2}",
                trade.city,
                trade.ticker,
                if won { "YES" } else { "NO" },
                actual,
                pnl
            );
            self.journal_trade(&trade, now);

            report.resolved += 1;
            report.realized_pnl += pnl;
            if risk.record_resolution(&trade, pnl) {
                report.kill_switch_tripped = true;
                self.record_kill_switch(&risk, now);
            }
        }
        Ok(report)
    }

    /// Cancels a trade's order and resolves it: pnl 0 on a quick exit, or per the limit fill.
    pub async fn cancel_trade(&self, trade_id: Uuid, exit: CancelExit, now: DateTime<Utc>) -> Result<Trade> {
        let mut trade = self
            .ledger
            .get_trade(trade_id)?
            .ok_or_else(|| anyhow!("trade {} not found", trade_id))?;
        if trade.status != TradeStatus::Open {
            bail!("trade {} is {}, not open", trade_id, trade.status.as_str());
        }

        let pnl = match exit {
            CancelExit::QuickExit => {
                let order_id = trade
                    .order_id
                    .clone()
                    .ok_or_else(|| anyhow!("trade {} has no order id", trade_id))?;
                timeout(self.order_timeout, self.gateway.cancel_order(&order_id))
                    .await
                    .map_err(|_| anyhow!("cancel of order {} timed out", order_id))?
                    .with_context(|| format!("Failed to cancel order {}", order_id))?;
                0.0
            }
            CancelExit::LimitFill { price } => {
                if !(0.0..=1.0).contains(&price) {
                    bail!("limit fill price {} outside [0, 1]", price);
                }
                if let Err(e) = self.gateway.credit_settlement(price * trade.count as f64).await {
                    warn!("Exit proceeds for {} not credited: {}", trade.ticker, e);
                }
                (price - trade.price) * trade.count as f64
            }
        };

        trade.resolve(None, pnl, now);
        self.ledger.update_trade(&trade)?;
        {
            let mut risk = self.risk.lock().await;
            if risk.record_resolution(&trade, pnl) {
                self.record_kill_switch(&risk, now);
            }
        }
        self.journal_trade(&trade, now);
        info!("Trade {} ({}) cancelled: {:?}, pnl ${:+.2}", trade.trade_id, trade.ticker, exit, pnl);
        Ok(trade)
    }

    /// Re-queries orders left unreconciled. Found ⇒ open, absent ⇒ voided and exposure released.
    pub async fn reconcile_pending(&self, now: DateTime<Utc>) -> usize {
        let pending = match self.ledger.unreconciled_trades() {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to load unreconciled trades: {:#}", e);
                return 0;
            }
        };
        if pending.is_empty() {
            return 0;
        }

        let mut risk = self.risk.lock().await;
        let mut settled = 0;
        for mut trade in pending {
            match self.query_order(&trade.client_order_id).await {
                Ok(Some(ack)) if ack.state.is_live() => {
                    trade.order_id = Some(ack.order_id);
                    trade.status = TradeStatus::Open;
                    if let Err(e) = self.ledger.update_trade(&trade) {
                        error!("Failed to record reconciled trade {}: {:#}", trade.trade_id, e);
                    }
                    info!("✅ Reconciled {} {}: order is live", trade.city, trade.ticker);
                    self.journal_trade(&trade, now);
                }
                Ok(_) => {
                    info!("Reconciled {} {}: order never reached the book", trade.city, trade.ticker);
                    self.void(&mut risk, &mut trade);
                }
                Err(e) => {
                    warn!("{} {} still unreconciled: {}", trade.city, trade.ticker, e);
                    continue;
                }
            }
            settled += 1;
            self.check_bracket_integrity(&trade, now);
        }
        settled
    }

    async fn current_balance(&self) -> Option<f64> {
        match self.gateway.balance().await {
            Ok(b) => Some(b),
            Err(e) => {
                warn!("Balance query failed: {}", e);
                None
            }
        }
    }

    /// Rolls the risk day at UTC midnight and re-checks the kill switch.
    async fn begin_day(&self, now: DateTime<Utc>, balance: Option<f64>) {
        let mut risk = self.risk.lock().await;
        if let Some(balance) = balance {
            if let Some(summary) = risk.roll_day(now, balance) {
                if let Err(e) = self.ledger.record_daily_pnl(&summary, balance) {
                    error!("Failed to record daily pnl for {}: {:#}", summary.date, e);
                }
                if let Err(e) = self.ledger.set_day_start_balance(risk.trading_day(), balance) {
                    error!("Failed to record day start balance: {:#}", e);
                }
            }
        }
        if risk.check_kill_switch() {
            self.record_kill_switch(&risk, now);
        }
    }

    async fn prepare_city(
        &self,
        city: &CityConfig,
        now: DateTime<Utc>,
    ) -> Result<(CityForecast, Vec<MarketBin>), String> {
        let forecast = self.forecasts.fetch(city, now).await.map_err(|e| e.to_string())?;
        let calibration = self.calibrations.get(&city.code);
        let dist = self.model.fit(&forecast, &calibration).map_err(|e| e.to_string())?;

        if let Err(e) = self
            .ledger
            .record_forecast(&city.code, dist.target_date, dist.raw_mu, dist.raw_sigma, now)
        {
            warn!("Failed to record forecast history for {}: {:#}", city.code, e);
        }

        let ladder = self
            .markets
            .fetch_ladder(city, dist.target_date)
            .await
            .map_err(|e| e.to_string())?;
        Ok((dist, ladder))
    }

    async fn execute(
        &self,
        risk: &mut RiskManager,
        set: &OpportunitySet,
        balance: f64,
        target_dates: &HashMap<String, NaiveDate>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut placed = 0;
        for opp in set.execution_order() {
            if risk.is_halted() {
                break;
            }
            let Some(&target_date) = target_dates.get(opp.city()) else {
                continue;
            };
            placed += match opp {
                Opportunity::Single(s) => self.execute_single(risk, s, balance, target_date, now).await,
                Opportunity::Bracket(b) => self.execute_bracket(risk, b, balance, target_date, now).await,
            };
        }
        placed
    }

    async fn execute_single(
        &self,
        risk: &mut RiskManager,
        opp: &SingleOpportunity,
        balance: f64,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> usize {
        if let Err(rejection) = risk.can_open(&opp.city, &[opp.bin.ticker.as_str()]) {
            debug!("{} {} not traded: {}", opp.city, opp.bin.ticker, rejection);
            return 0;
        }
        let Some(size) = self.sizer.size_single(opp, balance, risk.remaining_budget(&opp.city)) else {
            debug!("{} {} sizes to zero contracts", opp.city, opp.bin.ticker);
            return 0;
        };

        let trade = Trade::open(opp, &size, StrategyKind::Single, None, target_date, now);
        match self.place(risk, trade, now).await {
            Placement::Placed(_) => 1,
            Placement::Pending(_) | Placement::NotPlaced => 0,
        }
    }

    async fn execute_bracket(
        &self,
        risk: &mut RiskManager,
        opp: &BracketOpportunity,
        balance: f64,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> usize {
        let tickers = [opp.leg1.bin.ticker.as_str(), opp.leg2.bin.ticker.as_str()];
        if let Err(rejection) = risk.can_open(&opp.city, &tickers) {
            debug!("Bracket {} {}+{} not traded: {}", opp.city, tickers[0], tickers[1], rejection);
            return 0;
        }
        let Some((size1, size2)) = self.sizer.size_bracket(opp, balance, risk.remaining_budget(&opp.city)) else {
            return 0;
        };

        let leg1 = Trade::open(&opp.leg1, &size1, StrategyKind::Bracket, Some(opp.bracket_id), target_date, now);
        let leg2 = Trade::open(&opp.leg2, &size2, StrategyKind::Bracket, Some(opp.bracket_id), target_date, now);

        let first = match self.place(risk, leg1, now).await {
            Placement::Placed(trade) => trade,
            Placement::Pending(trade) => {
                self.report_broken_bracket(
                    &trade,
                    &format!("leg {} unreconciled, leg {} not sent", trade.ticker, tickers[1]),
                    now,
                );
                return 0;
            }
            Placement::NotPlaced => return 0,
        };

        match self.place(risk, leg2, now).await {
            Placement::Placed(_) => {
                info!(
                    "✅ Bracket {} {}+{} placed (EV {:+.3})",
                    opp.city, tickers[0], tickers[1], opp.expected_value
                );
                2
            }
            Placement::Pending(second) => {
                let detail = format!(
                    "bracket {}: leg {} open, leg {} unreconciled",
                    opp.bracket_id, first.ticker, second.ticker
                );
                warn!("⚠️ {} ({})", detail, opp.city);
                self.record_event(EventKind::Unreconciled, Some(opp.city.as_str()), &detail, now);
                1
            }
            Placement::NotPlaced => {
                self.report_broken_bracket(
                    &first,
                    &format!("leg {} open, leg {} failed", first.ticker, tickers[1]),
                    now,
                );
                1
            }
        }
    }

    /// Reserves exposure, journals the trade ahead of the send, places the order and
    /// resolves any ambiguity by re-querying the exchange.
    async fn place(&self, risk: &mut RiskManager, mut trade: Trade, now: DateTime<Utc>) -> Placement {
        if let Err(rejection) = risk.reserve(&trade.city, &trade.ticker, trade.cost()) {
            debug!("{} {} not traded: {}", trade.city, trade.ticker, rejection);
            return Placement::NotPlaced;
        }
        if let Err(e) = self.ledger.insert_trade(&trade) {
            error!("Failed to journal trade {} before placement: {:#}", trade.ticker, e);
            risk.release(&trade);
            return Placement::NotPlaced;
        }

        let request = OrderRequest {
            client_order_id: trade.client_order_id.clone(),
            ticker: trade.ticker.clone(),
            side: trade.side,
            count: trade.count,
            limit_price: trade.price,
        };
        let outcome = match timeout(self.order_timeout, self.gateway.place_order(&request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                client_order_id: request.client_order_id.clone(),
                secs: self.order_timeout.as_secs(),
            }),
        };

        let ack = match outcome {
            Ok(ack) => Some(ack),
            Err(e) if e.is_ambiguous() => {
                self.report_gateway_error(&trade, &e, now);
                match self.query_order(&trade.client_order_id).await {
                    Ok(found) => found,
                    Err(query_error) => {
                        let err = GatewayError::Unreconciled { client_order_id: trade.client_order_id.clone() };
                        error!("⚠️ {} {}: {} ({})", trade.city, trade.ticker, err, query_error);
                        self.record_event(EventKind::Unreconciled, Some(trade.city.as_str()), &format!("{} {}", trade.ticker, err), now);
                        self.journal_trade(&trade, now);
                        return Placement::Pending(trade);
                    }
                }
            }
            Err(e) => {
                self.report_gateway_error(&trade, &e, now);
                None
            }
        };

        match ack {
            Some(ack) if ack.state.is_live() => {
                trade.order_id = Some(ack.order_id);
                trade.status = TradeStatus::Open;
                if let Err(e) = self.ledger.update_trade(&trade) {
                    error!("Failed to record placed trade {}: {:#}", trade.trade_id, e);
                }
                info!(
                    "✅ {} {} x{} @ ${:.2} ({:?}, edge {:+.3}, risk ${:.2})",
                    trade.city, trade.ticker, trade.count, trade.price, ack.state, trade.edge, trade.dollar_risk
                );
                self.journal_trade(&trade, now);
                Placement::Placed(trade)
            }
            _ => {
                self.void(risk, &mut trade);
                Placement::NotPlaced
            }
        }
    }

    async fn query_order(&self, client_order_id: &str) -> Result<Option<OrderAck>, GatewayError> {
        match timeout(self.order_timeout, self.gateway.order_status(client_order_id)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                client_order_id: client_order_id.to_string(),
                secs: self.order_timeout.as_secs(),
            }),
        }
    }

    fn void(&self, risk: &mut RiskManager, trade: &mut Trade) {
        risk.release(trade);
        trade.status = TradeStatus::Voided;
        if let Err(e) = self.ledger.update_trade(trade) {
            error!("Failed to void trade {}: {:#}", trade.trade_id, e);
        }
    }

    /// A reconciled bracket leg whose sibling's state differs leaves the bracket broken.
    fn check_bracket_integrity(&self, trade: &Trade, now: DateTime<Utc>) {
        let Some(bracket_id) = trade.bracket_id else { return };
        let sibling_held = match self.ledger.held_trades() {
            Ok(held) => held
                .iter()
                .any(|t| t.bracket_id == Some(bracket_id) && t.trade_id != trade.trade_id),
            Err(e) => {
                warn!("Failed to check bracket {}: {:#}", bracket_id, e);
                return;
            }
        };
        match (trade.status == TradeStatus::Open, sibling_held) {
            (true, false) => self.report_broken_bracket(trade, &format!("leg {} open without its pair", trade.ticker), now),
            (false, true) => self.report_broken_bracket(trade, &format!("leg {} voided, pair still open", trade.ticker), now),
            _ => {}
        }
    }

    fn report_broken_bracket(&self, trade: &Trade, detail: &str, now: DateTime<Utc>) {
        let bracket = trade.bracket_id.map(|id| id.to_string()).unwrap_or_default();
        error!("🔴 BROKEN BRACKET {} ({}): {}", bracket, trade.city, detail);
        self.record_event(EventKind::BrokenBracket, Some(trade.city.as_str()), &format!("{}: {}", bracket, detail), now);
    }

    fn report_gateway_error(&self, trade: &Trade, err: &GatewayError, now: DateTime<Utc>) {
        error!("Gateway error on {} {}: {}", trade.city, trade.ticker, err);
        self.record_event(EventKind::GatewayError, Some(trade.city.as_str()), &format!("{}: {}", trade.ticker, err), now);
    }

    fn record_kill_switch(&self, risk: &RiskManager, now: DateTime<Utc>) {
        let detail = format!(
            "daily loss ${:.2} reached limit ${:.2}",
            risk.state().daily_loss,
            risk.stop_loss_limit()
        );
        self.record_event(EventKind::KillSwitch, None, &detail, now);
    }

    fn record_event(&self, kind: EventKind, city: Option<&str>, detail: &str, now: DateTime<Utc>) {
        if let Err(e) = self.ledger.log_event(kind, city, detail, now) {
            error!("Failed to persist {} event: {:#}", kind.as_str(), e);
        }
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.log_event(&format!("{} {}", kind.as_str(), detail), now) {
                warn!("CSV journal write failed: {:#}", e);
            }
        }
    }

    fn journal_trade(&self, trade: &Trade, now: DateTime<Utc>) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.log_trade(trade, now) {
                warn!("CSV journal write failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use crate::config::test_config;
    use crate::data::types::{DataUnavailable, PercentileForecast};
    use crate::execution::simulator::PaperGateway;
    use crate::execution::types::sample_trade;

    struct StaticForecasts(HashMap<String, PercentileForecast>);

    #[async_trait]
    impl ForecastProvider for StaticForecasts {
        async fn fetch(&self, city: &CityConfig, _now: DateTime<Utc>) -> Result<PercentileForecast, DataUnavailable> {
            self.0.get(&city.code).cloned().ok_or_else(|| DataUnavailable::Forecast {
                city: city.code.clone(),
                reason: "not in fixture".to_string(),
            })
        }
    }

    struct StaticMarkets(HashMap<String, Vec<MarketBin>>);

    #[async_trait]
    impl MarketDataProvider for StaticMarkets {
        async fn fetch_ladder(&self, city: &CityConfig, _date: NaiveDate) -> Result<Vec<MarketBin>, DataUnavailable> {
            self.0
                .get(&city.code)
                .cloned()
                .ok_or_else(|| DataUnavailable::EmptyLadder { city: city.code.clone() })
        }
    }

    struct StaticActuals(HashMap<String, f64>);

    #[async_trait]
    impl ActualsProvider for StaticActuals {
        async fn actual_high(&self, city: &CityConfig, date: NaiveDate) -> Result<f64, DataUnavailable> {
            self.0.get(&city.code).copied().ok_or_else(|| DataUnavailable::Actual {
                city: city.code.clone(),
                date,
                reason: "not in fixture".to_string(),
            })
        }
    }

    #[derive(Clone, Copy)]
    enum Fault {
        Reject,
        /// Order lands, then the connection drops before the ack.
        AcceptThenDrop,
        /// Request lost and the status endpoint goes down with it.
        LoseRequest,
        Hang,
    }

    /// Paper gateway with one-shot faults keyed by ticker.
    struct ScriptedGateway {
        inner: PaperGateway,
        faults: std::sync::Mutex<HashMap<String, Fault>>,
        status_down: AtomicBool,
    }

    impl ScriptedGateway {
        fn new(fill_rate: f64, faults: &[(&str, Fault)]) -> Arc<Self> {
            let mut paper = test_config().paper_trading;
            paper.fill_rate = fill_rate;
            Arc::new(Self {
                inner: PaperGateway::new(&paper),
                faults: std::sync::Mutex::new(faults.iter().map(|(t, f)| (t.to_string(), *f)).collect()),
                status_down: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl OrderGateway for ScriptedGateway {
        async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, GatewayError> {
            let fault = self.faults.lock().unwrap().remove(&order.ticker);
            match fault {
                Some(Fault::Reject) => Err(GatewayError::Rejected("scripted rejection".to_string())),
                Some(Fault::AcceptThenDrop) => {
                    self.inner.place_order(order).await?;
                    Err(GatewayError::Transport("connection reset after send".to_string()))
                }
                Some(Fault::LoseRequest) => {
                    self.status_down.store(true, Ordering::SeqCst);
                    Err(GatewayError::Transport("connection reset".to_string()))
                }
                Some(Fault::Hang) => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Err(GatewayError::Transport("unreachable".to_string()))
                }
                None => self.inner.place_order(order).await,
            }
        }

        async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
            self.inner.cancel_order(order_id).await
        }

        async fn order_status(&self, client_order_id: &str) -> Result<Option<OrderAck>, GatewayError> {
            if self.status_down.load(Ordering::SeqCst) {
                return Err(GatewayError::Transport("status endpoint down".to_string()));
            }
            self.inner.order_status(client_order_id).await
        }

        async fn balance(&self) -> Result<f64, GatewayError> {
            self.inner.balance().await
        }

        async fn credit_settlement(&self, amount: f64) -> Result<(), GatewayError> {
            self.inner.credit_settlement(amount).await
        }
    }

    fn now() -> DateTime<Utc> {
        "2026-10-14T13:00:00Z".parse().unwrap()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()
    }

    fn nyc_ladder() -> Vec<MarketBin> {
        vec![
            MarketBin::open_low("NYC", "T72", 72.5, 0.06, 0.04),
            MarketBin::closed("NYC", "B73", 72.5, 75.0, 0.30, 0.28),
            MarketBin::closed("NYC", "B75", 75.0, 77.5, 0.30, 0.28),
            MarketBin::closed("NYC", "B78", 77.5, 80.0, 0.10, 0.08),
            MarketBin::open_high("NYC", "T80", 80.0, 0.06, 0.04),
        ]
    }

    struct Harness {
        orch: ExecutionOrchestrator,
        gateway: Arc<ScriptedGateway>,
        ledger: Arc<TradeLedger>,
    }

    async fn harness_with(
        gateway: Arc<ScriptedGateway>,
        ledger: Arc<TradeLedger>,
        nyc_actual: f64,
        tweak: impl FnOnce(&mut Config),
    ) -> Harness {
        let mut config = test_config();
        config.system.dry_run = false;
        tweak(&mut config);

        let forecast = PercentileForecast {
            city: "NYC".to_string(),
            target_date: today(),
            p10: 73.0,
            p50: 75.0,
            p90: 77.0,
            issued_at: "2026-10-14T12:00:00Z".parse().unwrap(),
        };
        let collaborators = Collaborators {
            forecasts: Arc::new(StaticForecasts(HashMap::from([("NYC".to_string(), forecast)]))),
            markets: Arc::new(StaticMarkets(HashMap::from([("NYC".to_string(), nyc_ladder())]))),
            actuals: Arc::new(StaticActuals(HashMap::from([("NYC".to_string(), nyc_actual)]))),
            gateway: gateway.clone(),
        };
        let orch = ExecutionOrchestrator::new(
            config,
            collaborators,
            ledger.clone(),
            Arc::new(CalibrationStore::new()),
            None,
            now(),
        )
        .await
        .unwrap();
        orch.recover(now()).await.unwrap();
        Harness { orch, gateway, ledger }
    }

    async fn harness(faults: &[(&str, Fault)]) -> Harness {
        let ledger = Arc::new(TradeLedger::open(":memory:").unwrap());
        harness_with(ScriptedGateway::new(1.0, faults), ledger, 74.0, |_| {}).await
    }

    fn held_ticker<'a>(held: &'a [Trade], ticker: &str) -> &'a Trade {
        held.iter().find(|t| t.ticker == ticker).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_places_bracket_and_skips_missing_city() {
        let h = harness(&[]).await;
        let rx = h.orch.subscribe();

        let snapshot = h.orch.run_cycle(now()).await.unwrap();
        assert_eq!(snapshot.cycle_number, 1);
        assert!(snapshot.skipped_cities.contains_key("CHI"));
        assert_eq!(snapshot.single_opportunities.len(), 2);
        assert_eq!(snapshot.bracket_opportunities.len(), 1);
        assert!((snapshot.city_distributions["NYC"].mu - 75.0).abs() < 1e-12);
        assert_eq!(snapshot.trades_placed, 2);
        assert_eq!(snapshot.open_position_count, 2);
        assert!(!snapshot.kill_switch_active);
        assert_eq!(rx.borrow().as_ref().unwrap().cycle_number, 1);

        let held = h.ledger.held_trades().unwrap();
        assert_eq!(held.len(), 2);
        let bracket_id = snapshot.bracket_opportunities[0].bracket_id;
        assert!(held.iter().all(|t| t.bracket_id == Some(bracket_id) && t.status == TradeStatus::Open));
        assert_eq!(held_ticker(&held, "B73").count, 50);

        let status = h.orch.risk_status().await;
        let nyc = status.city_exposure["NYC"];
        assert!((nyc.used - 30.0).abs() < 1e-6);
        assert!(nyc.used <= nyc.budget + 1e-9);
        assert!((snapshot.balance - 970.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_duplicate_tick_does_not_double_buy() {
        let h = harness(&[]).await;
        h.orch.run_cycle(now()).await.unwrap();
        let second = h.orch.run_cycle(now()).await.unwrap();

        assert_eq!(second.cycle_number, 2);
        assert_eq!(second.trades_placed, 0);
        assert_eq!(h.ledger.held_trades().unwrap().len(), 2);
        assert_eq!(second.bracket_opportunities.len(), 1);
    }

    #[tokio::test]
    async fn test_halted_publishes_without_trading() {
        let ledger = Arc::new(TradeLedger::open(":memory:").unwrap());
        let mut loss = sample_trade("NYC", "OLD", 100, 0.60);
        loss.resolve(Some(false), -60.0, "2026-10-14T10:00:00Z".parse().unwrap());
        ledger.insert_trade(&loss).unwrap();

        let h = harness_with(ScriptedGateway::new(1.0, &[]), ledger, 74.0, |_| {}).await;
        let snapshot = h.orch.run_cycle(now()).await.unwrap();

        assert!(snapshot.kill_switch_active);
        assert_eq!(snapshot.bracket_opportunities.len(), 1);
        assert_eq!(snapshot.trades_placed, 0);
        assert!(h.ledger.held_trades().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broken_bracket_keeps_first_leg_open() {
        let h = harness(&[("B75", Fault::Reject)]).await;
        h.orch.run_cycle(now()).await.unwrap();

        let held = h.ledger.held_trades().unwrap();
        let leg1 = held_ticker(&held, "B73");
        assert_eq!(leg1.strategy, StrategyKind::Bracket);
        assert!(leg1.bracket_id.is_some());

        // The single on B75 is a separate order and goes through on its own
        let single = held_ticker(&held, "B75");
        assert_eq!(single.strategy, StrategyKind::Single);
        assert_eq!(single.bracket_id, None);

        let kinds: Vec<String> = h.ledger.recent_events(10).unwrap().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&"broken_bracket".to_string()));
        assert!(kinds.contains(&"gateway_error".to_string()));
    }

    #[tokio::test]
    async fn test_ambiguous_failure_resolved_by_requery() {
        let h = harness(&[("B73", Fault::AcceptThenDrop)]).await;
        let snapshot = h.orch.run_cycle(now()).await.unwrap();

        assert_eq!(snapshot.trades_placed, 2);
        let held = h.ledger.held_trades().unwrap();
        assert!(held_ticker(&held, "B73").order_id.is_some());
        assert!(h.ledger.unreconciled_trades().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreconciled_order_settled_next_cycle() {
        let h = harness(&[("B73", Fault::LoseRequest)]).await;
        h.orch.run_cycle(now()).await.unwrap();

        let pending = h.ledger.unreconciled_trades().unwrap();
        assert_eq!(pending.len(), 1);
        let lost = pending[0].clone();
        assert_eq!(lost.ticker, "B73");
        // Exposure stays reserved for the unknown order
        assert_eq!(h.orch.risk_status().await.open_position_count, 2);

        h.gateway.status_down.store(false, Ordering::SeqCst);
        h.orch.run_cycle(now()).await.unwrap();

        assert!(h.ledger.unreconciled_trades().unwrap().is_empty());
        let voided = h.ledger.get_trade(lost.trade_id).unwrap().unwrap();
        assert_eq!(voided.status, TradeStatus::Voided);

        let held = h.ledger.held_trades().unwrap();
        assert_eq!(held.len(), 2);
        assert!(held.iter().all(|t| t.status == TradeStatus::Open));
        let exposure = h.orch.risk_status().await.city_exposure["NYC"];
        assert!(exposure.used <= exposure.budget + 1e-9);
    }

    #[tokio::test]
    async fn test_order_timeout_degrades_to_not_placed() {
        let ledger = Arc::new(TradeLedger::open(":memory:").unwrap());
        let gateway = ScriptedGateway::new(1.0, &[("B73", Fault::Hang)]);
        let h = harness_with(gateway, ledger, 74.0, |c| c.infrastructure.order_timeout_secs = 1).await;
        h.orch.run_cycle(now()).await.unwrap();

        let events = h.ledger.recent_events(10).unwrap();
        assert!(events.iter().any(|e| e.kind == "gateway_error" && e.detail.contains("timed out")));
        assert!(!events.iter().any(|e| e.kind == "broken_bracket"));

        let voided: Vec<Trade> = h
            .orch
            .trades(today(), Some("NYC"))
            .unwrap()
            .into_iter()
            .filter(|t| t.status == TradeStatus::Voided)
            .collect();
        assert_eq!(voided.len(), 1);
        assert_eq!(voided[0].strategy, StrategyKind::Bracket);

        // The first single takes the whole city budget once the leg is released
        let held = h.ledger.held_trades().unwrap();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].strategy, StrategyKind::Single);
        assert!((held[0].cost() - 30.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_daily_close_settles_and_is_idempotent() {
        let h = harness(&[]).await;
        h.orch.run_cycle(now()).await.unwrap();

        let close_time = "2026-10-15T14:00:00Z".parse().unwrap();
        let report = h.orch.daily_close(close_time).await.unwrap();
        assert_eq!(report.settlement.resolved, 2);
        // B73 [72.5, 75] wins at 74°F: +35; B75 loses: -15
        assert!((report.settlement.realized_pnl - 20.0).abs() < 1e-6);
        assert!(h.ledger.held_trades().unwrap().is_empty());
        assert!((h.gateway.balance().await.unwrap() - 1020.0).abs() < 1e-6);

        assert_eq!(h.ledger.daily_pnl(today()).unwrap(), Some((1000.0, 970.0, 0.0)));
        assert!(matches!(report.calibration[0], CalibrationOutcome::InsufficientHistory { samples: 1, .. }));
        assert_eq!(report.calibration[1], CalibrationOutcome::NoActual { city: "CHI".to_string() });

        let again = h.orch.daily_close(close_time).await.unwrap();
        assert_eq!(again.settlement.resolved, 0);
        assert!((h.gateway.balance().await.unwrap() - 1020.0).abs() < 1e-6);

        let status = h.orch.risk_status().await;
        assert_eq!(status.open_position_count, 0);
        assert!(!status.kill_switch_active);
    }

    #[tokio::test]
    async fn test_cancel_trade_quick_exit_and_limit_fill() {
        let ledger = Arc::new(TradeLedger::open(":memory:").unwrap());
        let h = harness_with(ScriptedGateway::new(0.0, &[]), ledger, 74.0, |_| {}).await;
        h.orch.run_cycle(now()).await.unwrap();

        let held = h.ledger.held_trades().unwrap();
        let b73 = held_ticker(&held, "B73").trade_id;
        let b75 = held_ticker(&held, "B75").trade_id;

        let exited = h.orch.cancel_trade(b73, CancelExit::QuickExit, now()).await.unwrap();
        assert_eq!(exited.pnl, Some(0.0));
        assert!(exited.resolved);
        assert!((h.gateway.balance().await.unwrap() - 985.0).abs() < 1e-6);

        let sold = h.orch.cancel_trade(b75, CancelExit::LimitFill { price: 0.40 }, now()).await.unwrap();
        assert!((sold.pnl.unwrap() - 5.0).abs() < 1e-6);

        let status = h.orch.risk_status().await;
        assert_eq!(status.open_position_count, 0);
        assert!(status.city_exposure["NYC"].used.abs() < 1e-6);

        assert!(h.orch.cancel_trade(b73, CancelExit::QuickExit, now()).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_second_leg_is_surfaced() {
        let h = harness(&[("B75", Fault::LoseRequest)]).await;
        let snapshot = h.orch.run_cycle(now()).await.unwrap();
        let bracket_id = snapshot.bracket_opportunities[0].bracket_id.to_string();

        let events = h.ledger.recent_events(10).unwrap();
        assert!(events.iter().any(|e| e.kind == "unreconciled" && e.detail.contains(&bracket_id)));

        let pending = h.ledger.unreconciled_trades().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ticker, "B75");
        assert_eq!(held_ticker(&h.ledger.held_trades().unwrap(), "B73").status, TradeStatus::Open);
    }

    #[tokio::test]
    async fn test_fractional_actual_settles_on_whole_degree() {
        let ledger = Arc::new(TradeLedger::open(":memory:").unwrap());
        // Bounds [74, 75]; the station reads 75.4°F
        let winner = sample_trade("NYC", "B74", 20, 0.30);
        ledger.insert_trade(&winner).unwrap();
        ledger.record_forecast("NYC", today(), 74.0, 2.0, now()).unwrap();

        let h = harness_with(ScriptedGateway::new(1.0, &[]), ledger, 75.4, |_| {}).await;
        let report = h.orch.daily_close("2026-10-15T14:00:00Z".parse().unwrap()).await.unwrap();

        assert_eq!(report.settlement.resolved, 1);
        assert!((report.settlement.realized_pnl - 14.0).abs() < 1e-6);
        let settled = h.ledger.get_trade(winner.trade_id).unwrap().unwrap();
        assert_eq!(settled.resolved_yes, Some(true));

        let history = h.ledger.calibration_history("NYC", today(), 30).unwrap();
        assert_eq!(history[0].actual_high, Some(75.0));
    }

    #[tokio::test]
    async fn test_calibration_lands_while_cycle_holds_risk_lock() {
        let ledger = Arc::new(TradeLedger::open(":memory:").unwrap());
        let yesterday = NaiveDate::from_ymd_opt(2026, 10, 13).unwrap();
        ledger.record_forecast("NYC", yesterday, 73.0, 2.0, now()).unwrap();

        let gateway = ScriptedGateway::new(1.0, &[("B73", Fault::Hang)]);
        let h = harness_with(gateway, ledger, 74.0, |c| {
            c.infrastructure.order_timeout_secs = 2;
            c.calibration.min_records = 1;
        })
        .await;

        let (cycle, bias_during_cycle) = tokio::join!(h.orch.run_cycle(now()), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let close = h.orch.daily_close(now());
            tokio::pin!(close);

            // Settlement still queues behind the placement in flight
            assert!(timeout(Duration::from_millis(500), &mut close).await.is_err());
            let bias = h.orch.calibrations.get("NYC").bias_correction;

            let report = close.await.unwrap();
            assert!(matches!(report.calibration[0], CalibrationOutcome::Updated { samples: 1, .. }));
            bias
        });

        cycle.unwrap();
        assert!((bias_during_cycle - 1.0).abs() < 1e-12);
    }
}

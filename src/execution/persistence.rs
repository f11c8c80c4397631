use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;
use crate::data::types::BinBounds;
use crate::execution::risk::DailySummary;
use crate::execution::types::{Trade, TradeStatus};
use crate::model::calibration::{Calibration, CalibrationRecord};
use crate::strategies::types::{Side, StrategyKind};

/// Operator-facing events kept alongside the trades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    KillSwitch,
    BrokenBracket,
    GatewayError,
    Unreconciled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::KillSwitch => "kill_switch",
            EventKind::BrokenBracket => "broken_bracket",
            EventKind::GatewayError => "gateway_error",
            EventKind::Unreconciled => "unreconciled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub kind: String,
    pub city: Option<String>,
    pub detail: String,
    pub occurred_at: String,
}

/// SQLite trade ledger; also stores calibration state and day bookkeeping.
pub struct TradeLedger {
    conn: Mutex<Connection>,
}

const TRADE_COLUMNS: &str = "trade_id, city, ticker, strategy, bracket_id, side, count, price, model_prob, edge,
     kelly_fraction, dollar_risk, resolved, resolved_yes, pnl, order_id, client_order_id, status,
     bound_low, bound_high, target_date, opened_at, resolved_at";

impl TradeLedger {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open trade ledger {}", db_path))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                city TEXT NOT NULL,
                ticker TEXT NOT NULL,
                strategy TEXT NOT NULL,
                bracket_id TEXT,
                side TEXT NOT NULL,
                count INTEGER NOT NULL,
                price REAL NOT NULL,
                model_prob REAL NOT NULL,
                edge REAL NOT NULL,
                kelly_fraction REAL NOT NULL,
                dollar_risk REAL NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_yes INTEGER,
                pnl REAL,
                order_id TEXT,
                client_order_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                bound_low REAL,
                bound_high REAL,
                target_date TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE TABLE IF NOT EXISTS calibration (
                city TEXT PRIMARY KEY,
                bias_correction REAL NOT NULL,
                sigma_scale REAL NOT NULL,
                last_updated TEXT
            );

            CREATE TABLE IF NOT EXISTS calibration_history (
                city TEXT NOT NULL,
                forecast_date TEXT NOT NULL,
                raw_mu REAL NOT NULL,
                raw_sigma REAL NOT NULL,
                actual_high REAL,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (city, forecast_date)
            );

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                city TEXT,
                detail TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_pnl (
                date TEXT PRIMARY KEY,
                start_balance REAL NOT NULL,
                end_balance REAL NOT NULL,
                realized_pnl REAL NOT NULL,
                wins INTEGER NOT NULL,
                losses INTEGER NOT NULL,
                kill_switch_tripped INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS risk_days (
                date TEXT PRIMARY KEY,
                day_start_balance REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status);
            CREATE INDEX IF NOT EXISTS idx_trades_city_target ON trades(city, target_date);
            CREATE INDEX IF NOT EXISTS idx_trades_opened_at ON trades(opened_at);
            "#,
        )
        .context("Failed to create ledger tables")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("trade ledger lock poisoned"))
    }

    pub fn insert_trade(&self, trade: &Trade) -> Result<()> {
        self.conn()?.execute(
            &format!(
                "INSERT INTO trades ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                TRADE_COLUMNS
            ),
            params![
                trade.trade_id.to_string(),
                trade.city,
                trade.ticker,
                trade.strategy.as_str(),
                trade.bracket_id.map(|id| id.to_string()),
                trade.side.as_str(),
                trade.count,
                trade.price,
                trade.model_prob,
                trade.edge,
                trade.kelly_fraction,
                trade.dollar_risk,
                trade.resolved,
                trade.resolved_yes,
                trade.pnl,
                trade.order_id,
                trade.client_order_id,
                trade.status.as_str(),
                trade.bounds.low,
                trade.bounds.high,
                trade.target_date.to_string(),
                trade.opened_at.to_rfc3339(),
                trade.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )
        .with_context(|| format!("Failed to insert trade {}", trade.trade_id))?;
        Ok(())
    }

    /// Writes the mutable columns: order id, status and resolution.
    pub fn update_trade(&self, trade: &Trade) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE trades
             SET order_id = ?1, status = ?2, resolved = ?3, resolved_yes = ?4, pnl = ?5, resolved_at = ?6
             WHERE trade_id = ?7",
            params![
                trade.order_id,
                trade.status.as_str(),
                trade.resolved,
                trade.resolved_yes,
                trade.pnl,
                trade.resolved_at.map(|t| t.to_rfc3339()),
                trade.trade_id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(anyhow!("trade {} not in ledger", trade.trade_id));
        }
        Ok(())
    }

    pub fn get_trade(&self, trade_id: Uuid) -> Result<Option<Trade>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM trades WHERE trade_id = ?1", TRADE_COLUMNS),
                params![trade_id.to_string()],
                TradeRow::from_row,
            )
            .optional()?;
        row.map(TradeRow::into_trade).transpose()
    }

    /// Trades holding a position: open or awaiting reconciliation.
    pub fn held_trades(&self) -> Result<Vec<Trade>> {
        self.query_trades("WHERE status IN ('open', 'unreconciled') ORDER BY opened_at", params![])
    }

    pub fn unreconciled_trades(&self) -> Result<Vec<Trade>> {
        self.query_trades("WHERE status = 'unreconciled' ORDER BY opened_at", params![])
    }

    /// Open trades settling on `target_date`.
    pub fn open_trades_for_target(&self, target_date: NaiveDate) -> Result<Vec<Trade>> {
        self.query_trades(
            "WHERE status = 'open' AND target_date = ?1 ORDER BY opened_at",
            params![target_date.to_string()],
        )
    }

    pub fn trades_resolved_on(&self, date: NaiveDate) -> Result<Vec<Trade>> {
        self.query_trades(
            "WHERE status = 'resolved' AND substr(resolved_at, 1, 10) = ?1 ORDER BY resolved_at",
            params![date.to_string()],
        )
    }

    /// Ledger entries opened on `date`, optionally for one city.
    pub fn trades_by_date(&self, date: NaiveDate, city: Option<&str>) -> Result<Vec<Trade>> {
        match city {
            Some(city) => self.query_trades(
                "WHERE substr(opened_at, 1, 10) = ?1 AND city = ?2 ORDER BY opened_at",
                params![date.to_string(), city],
            ),
            None => self.query_trades(
                "WHERE substr(opened_at, 1, 10) = ?1 ORDER BY opened_at",
                params![date.to_string()],
            ),
        }
    }

    fn query_trades(&self, clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Trade>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM trades {}", TRADE_COLUMNS, clause))?;
        let rows = stmt
            .query_map(args, TradeRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(TradeRow::into_trade).collect()
    }

    /// Upserts the raw forecast for a city/date, keeping any actual already recorded.
    pub fn record_forecast(
        &self,
        city: &str,
        forecast_date: NaiveDate,
        raw_mu: f64,
        raw_sigma: f64,
        recorded_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO calibration_history (city, forecast_date, raw_mu, raw_sigma, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(city, forecast_date) DO UPDATE SET
                raw_mu = excluded.raw_mu,
                raw_sigma = excluded.raw_sigma,
                recorded_at = excluded.recorded_at",
            params![city, forecast_date.to_string(), raw_mu, raw_sigma, recorded_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Returns false when no forecast was stored for that city/date.
    pub fn record_actual_high(&self, city: &str, forecast_date: NaiveDate, actual_high: f64) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE calibration_history SET actual_high = ?1 WHERE city = ?2 AND forecast_date = ?3",
            params![actual_high, city, forecast_date.to_string()],
        )?;
        Ok(updated > 0)
    }

    /// Most recent `window` records with an actual, on or before `up_to`.
    pub fn calibration_history(&self, city: &str, up_to: NaiveDate, window: usize) -> Result<Vec<CalibrationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT city, forecast_date, raw_mu, raw_sigma, actual_high
             FROM calibration_history
             WHERE city = ?1 AND forecast_date <= ?2 AND actual_high IS NOT NULL
             ORDER BY forecast_date DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![city, up_to.to_string(), window as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(city, date, raw_mu, raw_sigma, actual_high)| {
                Ok(CalibrationRecord {
                    city,
                    forecast_date: parse_date(&date)?,
                    raw_mu,
                    raw_sigma,
                    actual_high,
                })
            })
            .collect()
    }

    pub fn save_calibration(&self, city: &str, calibration: &Calibration) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO calibration (city, bias_correction, sigma_scale, last_updated)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(city) DO UPDATE SET
                bias_correction = excluded.bias_correction,
                sigma_scale = excluded.sigma_scale,
                last_updated = excluded.last_updated",
            params![
                city,
                calibration.bias_correction,
                calibration.sigma_scale,
                calibration.last_updated.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn load_calibrations(&self) -> Result<Vec<(String, Calibration)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT city, bias_correction, sigma_scale, last_updated FROM calibration")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(city, bias_correction, sigma_scale, last_updated)| {
                Ok((
                    city,
                    Calibration {
                        bias_correction,
                        sigma_scale,
                        last_updated: last_updated.as_deref().map(parse_timestamp).transpose()?,
                    },
                ))
            })
            .collect()
    }

    pub fn log_event(&self, kind: EventKind, city: Option<&str>, detail: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO events (kind, city, detail, occurred_at) VALUES (?1, ?2, ?3, ?4)",
            params![kind.as_str(), city, detail, at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT kind, city, detail, occurred_at FROM events ORDER BY id DESC LIMIT ?1",
        )?;
        let events = stmt
            .query_map(params![limit as i64], |row| {
                Ok(EventRecord {
                    kind: row.get(0)?,
                    city: row.get(1)?,
                    detail: row.get(2)?,
                    occurred_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    pub fn record_daily_pnl(&self, summary: &DailySummary, end_balance: f64) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO daily_pnl
             (date, start_balance, end_balance, realized_pnl, wins, losses, kill_switch_tripped)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                summary.date.to_string(),
                summary.start_balance,
                end_balance,
                summary.realized_pnl,
                summary.wins,
                summary.losses,
                summary.kill_switch_tripped,
            ],
        )?;
        Ok(())
    }

    pub fn daily_pnl(&self, date: NaiveDate) -> Result<Option<(f64, f64, f64)>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT start_balance, end_balance, realized_pnl FROM daily_pnl WHERE date = ?1",
                params![date.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }

    /// Records the first balance seen on `date`; later calls keep the original.
    pub fn set_day_start_balance(&self, date: NaiveDate, balance: f64) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO risk_days (date, day_start_balance) VALUES (?1, ?2)",
            params![date.to_string(), balance],
        )?;
        Ok(())
    }

    pub fn day_start_balance(&self, date: NaiveDate) -> Result<Option<f64>> {
        let balance = self
            .conn()?
            .query_row(
                "SELECT day_start_balance FROM risk_days WHERE date = ?1",
                params![date.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance)
    }
}

/// Raw column values, converted to a `Trade` outside the rusqlite row callback.
struct TradeRow {
    trade_id: String,
    city: String,
    ticker: String,
    strategy: String,
    bracket_id: Option<String>,
    side: String,
    count: u32,
    price: f64,
    model_prob: f64,
    edge: f64,
    kelly_fraction: f64,
    dollar_risk: f64,
    resolved: bool,
    resolved_yes: Option<bool>,
    pnl: Option<f64>,
    order_id: Option<String>,
    client_order_id: String,
    status: String,
    bound_low: Option<f64>,
    bound_high: Option<f64>,
    target_date: String,
    opened_at: String,
    resolved_at: Option<String>,
}

impl TradeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            trade_id: row.get(0)?,
            city: row.get(1)?,
            ticker: row.get(2)?,
            strategy: row.get(3)?,
            bracket_id: row.get(4)?,
            side: row.get(5)?,
            count: row.get(6)?,
            price: row.get(7)?,
            model_prob: row.get(8)?,
            edge: row.get(9)?,
            kelly_fraction: row.get(10)?,
            dollar_risk: row.get(11)?,
            resolved: row.get(12)?,
            resolved_yes: row.get(13)?,
            pnl: row.get(14)?,
            order_id: row.get(15)?,
            client_order_id: row.get(16)?,
            status: row.get(17)?,
            bound_low: row.get(18)?,
            bound_high: row.get(19)?,
            target_date: row.get(20)?,
            opened_at: row.get(21)?,
            resolved_at: row.get(22)?,
        })
    }

    fn into_trade(self) -> Result<Trade> {
        Ok(Trade {
            trade_id: Uuid::parse_str(&self.trade_id).context("Bad trade_id in ledger")?,
            strategy: StrategyKind::parse(&self.strategy)
                .ok_or_else(|| anyhow!("Unknown strategy '{}' in ledger", self.strategy))?,
            bracket_id: self
                .bracket_id
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .context("Bad bracket_id in ledger")?,
            side: Side::parse(&self.side).ok_or_else(|| anyhow!("Unknown side '{}' in ledger", self.side))?,
            status: TradeStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("Unknown status '{}' in ledger", self.status))?,
            target_date: parse_date(&self.target_date)?,
            opened_at: parse_timestamp(&self.opened_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_timestamp).transpose()?,
            bounds: BinBounds { low: self.bound_low, high: self.bound_high },
            city: self.city,
            ticker: self.ticker,
            count: self.count,
            price: self.price,
            model_prob: self.model_prob,
            edge: self.edge,
            kelly_fraction: self.kelly_fraction,
            dollar_risk: self.dollar_risk,
            resolved: self.resolved,
            resolved_yes: self.resolved_yes,
            pnl: self.pnl,
            order_id: self.order_id,
            client_order_id: self.client_order_id,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Bad date '{}' in ledger", s))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Bad timestamp '{}' in ledger", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::sample_trade;

    fn ledger() -> TradeLedger {
        TradeLedger::open(":memory:").unwrap()
    }

    #[test]
    fn test_trade_insert_and_resolve() {
        let db = ledger();
        let mut trade = sample_trade("NYC", "KXHIGHNY-26OCT14-B74.5", 20, 0.30);
        trade.bracket_id = Some(Uuid::new_v4());
        trade.strategy = StrategyKind::Bracket;
        db.insert_trade(&trade).unwrap();

        assert_eq!(db.get_trade(trade.trade_id).unwrap(), Some(trade.clone()));
        assert_eq!(db.held_trades().unwrap().len(), 1);

        trade.resolve(Some(true), 14.0, "2026-10-15T14:00:00Z".parse().unwrap());
        db.update_trade(&trade).unwrap();

        assert!(db.held_trades().unwrap().is_empty());
        let resolved = db.trades_resolved_on(NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()).unwrap();
        assert_eq!(resolved, vec![trade]);
    }

    #[test]
    fn test_trades_by_date_and_city() {
        let db = ledger();
        db.insert_trade(&sample_trade("NYC", "N1", 1, 0.3)).unwrap();
        db.insert_trade(&sample_trade("CHI", "C1", 1, 0.3)).unwrap();

        let day = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        assert_eq!(db.trades_by_date(day, None).unwrap().len(), 2);
        assert_eq!(db.trades_by_date(day, Some("CHI")).unwrap()[0].ticker, "C1");
        assert!(db.trades_by_date(day.succ_opt().unwrap(), None).unwrap().is_empty());
        assert_eq!(db.open_trades_for_target(day).unwrap().len(), 2);
    }

    #[test]
    fn test_unreconciled_trades_listed() {
        let db = ledger();
        let mut trade = sample_trade("NYC", "N1", 1, 0.3);
        trade.status = TradeStatus::Unreconciled;
        trade.order_id = None;
        db.insert_trade(&trade).unwrap();

        assert_eq!(db.unreconciled_trades().unwrap().len(), 1);
        assert_eq!(db.held_trades().unwrap().len(), 1);
    }

    #[test]
    fn test_calibration_history_window() {
        let db = ledger();
        let now = "2026-10-14T00:00:00Z".parse().unwrap();
        for day in 1..=5 {
            let date = NaiveDate::from_ymd_opt(2026, 10, day).unwrap();
            db.record_forecast("NYC", date, 70.0, 4.0, now).unwrap();
            if day != 3 {
                assert!(db.record_actual_high("NYC", date, 71.0).unwrap());
            }
        }
        let missing = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        assert!(!db.record_actual_high("NYC", missing, 71.0).unwrap());

        let up_to = NaiveDate::from_ymd_opt(2026, 10, 5).unwrap();
        let records = db.calibration_history("NYC", up_to, 3).unwrap();
        let days: Vec<u32> = records.iter().map(|r| chrono::Datelike::day(&r.forecast_date)).collect();
        assert_eq!(days, vec![5, 4, 2]);

        // A later forecast for the same date keeps the actual
        db.record_forecast("NYC", up_to, 72.0, 3.5, now).unwrap();
        let records = db.calibration_history("NYC", up_to, 1).unwrap();
        assert_eq!(records[0].raw_mu, 72.0);
        assert_eq!(records[0].actual_high, Some(71.0));
    }

    #[test]
    fn test_calibration_round_trip() {
        let db = ledger();
        let c = Calibration {
            bias_correction: -1.25,
            sigma_scale: 1.4,
            last_updated: Some("2026-10-14T14:00:00Z".parse().unwrap()),
        };
        db.save_calibration("NYC", &c).unwrap();
        db.save_calibration("NYC", &c).unwrap();
        assert_eq!(db.load_calibrations().unwrap(), vec![("NYC".to_string(), c)]);
    }

    #[test]
    fn test_events_and_day_bookkeeping() {
        let db = ledger();
        let at = "2026-10-14T15:00:00Z".parse().unwrap();
        db.log_event(EventKind::KillSwitch, None, "daily loss $50.00", at).unwrap();
        db.log_event(EventKind::BrokenBracket, Some("NYC"), "leg2 rejected", at).unwrap();

        let events = db.recent_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "broken_bracket");
        assert_eq!(events[0].city.as_deref(), Some("NYC"));

        let day = NaiveDate::from_ymd_opt(2026, 10, 14).unwrap();
        db.set_day_start_balance(day, 1000.0).unwrap();
        db.set_day_start_balance(day, 900.0).unwrap();
        assert_eq!(db.day_start_balance(day).unwrap(), Some(1000.0));

        let summary = DailySummary {
            date: day,
            start_balance: 1000.0,
            realized_pnl: -12.5,
            wins: 1,
            losses: 2,
            kill_switch_tripped: false,
        };
        db.record_daily_pnl(&summary, 987.5).unwrap();
        assert_eq!(db.daily_pnl(day).unwrap(), Some((1000.0, 987.5, -12.5)));
    }
}

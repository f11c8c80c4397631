use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;
use crate::data::types::BinBounds;
use crate::strategies::sizing::PositionSize;
use crate::strategies::types::{Side, SingleOpportunity, StrategyKind};

/// Limit order sent to the exchange. `client_order_id` is the idempotency key
/// used to re-query an order whose outcome is unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub ticker: String,
    pub side: Side,
    pub count: u32,
    pub limit_price: f64,
}

impl OrderRequest {
    pub fn cost(&self) -> f64 {
        self.limit_price * self.count as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OrderState {
    Filled,
    Resting,
    Canceled,
}

impl OrderState {
    pub fn is_live(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Resting)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub state: OrderState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradeStatus {
    Open,
    /// Placement outcome unknown; exposure reserved until the exchange answers.
    Unreconciled,
    Resolved,
    /// Order never reached the book.
    Voided,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Unreconciled => "unreconciled",
            TradeStatus::Resolved => "resolved",
            TradeStatus::Voided => "voided",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(TradeStatus::Open),
            "unreconciled" => Some(TradeStatus::Unreconciled),
            "resolved" => Some(TradeStatus::Resolved),
            "voided" => Some(TradeStatus::Voided),
            _ => None,
        }
    }

    /// Holds a position slot and city exposure.
    pub fn holds_position(&self) -> bool {
        matches!(self, TradeStatus::Open | TradeStatus::Unreconciled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub trade_id: Uuid,
    pub city: String,
    pub ticker: String,
    pub strategy: StrategyKind,
    pub bracket_id: Option<Uuid>,
    pub side: Side,
    pub count: u32,
    pub price: f64,
    pub model_prob: f64,
    pub edge: f64,
    pub kelly_fraction: f64,
    pub dollar_risk: f64,
    pub resolved: bool,
    pub resolved_yes: Option<bool>,
    pub pnl: Option<f64>,
    pub order_id: Option<String>,
    pub client_order_id: String,
    pub status: TradeStatus,
    pub bounds: BinBounds,
    pub target_date: NaiveDate,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Trade {
    /// New YES position on `opp`, written ahead of the order as unreconciled.
    pub fn open(
        opp: &SingleOpportunity,
        size: &PositionSize,
        strategy: StrategyKind,
        bracket_id: Option<Uuid>,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            trade_id: Uuid::new_v4(),
            city: opp.city.clone(),
            ticker: opp.bin.ticker.clone(),
            strategy,
            bracket_id,
            side: Side::Yes,
            count: size.count,
            price: opp.ask,
            model_prob: opp.model_prob,
            edge: opp.net_edge,
            kelly_fraction: size.applied_fraction,
            dollar_risk: size.dollar_risk,
            resolved: false,
            resolved_yes: None,
            pnl: None,
            order_id: None,
            client_order_id: Uuid::new_v4().to_string(),
            status: TradeStatus::Unreconciled,
            bounds: opp.bin.bounds(),
            target_date,
            opened_at: now,
            resolved_at: None,
        }
    }

    /// Premium paid, which is also the most the position can lose.
    pub fn cost(&self) -> f64 {
        self.price * self.count as f64
    }

    /// (won, pnl) for a YES contract settled at `actual_high`.
    pub fn settlement(&self, actual_high: f64) -> (bool, f64) {
        let won = match self.side {
            Side::Yes => self.bounds.contains(actual_high),
            Side::No => !self.bounds.contains(actual_high),
        };
        let pnl = if won {
            (1.0 - self.price) * self.count as f64
        } else {
            -self.price * self.count as f64
        };
        (won, pnl)
    }

    pub fn resolve(&mut self, resolved_yes: Option<bool>, pnl: f64, at: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_yes = resolved_yes;
        self.pnl = Some(pnl);
        self.status = TradeStatus::Resolved;
        self.resolved_at = Some(at);
    }
}

#[cfg(test)]
pub(crate) fn sample_trade(city: &str, ticker: &str, count: u32, price: f64) -> Trade {
    Trade {
        trade_id: Uuid::new_v4(),
        city: city.to_string(),
        ticker: ticker.to_string(),
        strategy: StrategyKind::Single,
        bracket_id: None,
        side: Side::Yes,
        count,
        price,
        model_prob: 0.6,
        edge: 0.08,
        kelly_fraction: 0.05,
        dollar_risk: price * count as f64,
        resolved: false,
        resolved_yes: None,
        pnl: None,
        order_id: Some(format!("ord-{}", ticker)),
        client_order_id: Uuid::new_v4().to_string(),
        status: TradeStatus::Open,
        bounds: BinBounds { low: Some(74.0), high: Some(75.0) },
        target_date: NaiveDate::from_ymd_opt(2026, 10, 14).unwrap(),
        opened_at: "2026-10-14T12:00:00Z".parse().unwrap(),
        resolved_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settlement_pnl() {
        let trade = sample_trade("NYC", "B74", 10, 0.30);
        let (won, pnl) = trade.settlement(74.0);
        assert!(won);
        assert!((pnl - 7.0).abs() < 1e-9);

        let (won, pnl) = trade.settlement(76.0);
        assert!(!won);
        assert!((pnl + 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_round_trip_and_position_hold() {
        for status in [TradeStatus::Open, TradeStatus::Unreconciled, TradeStatus::Resolved, TradeStatus::Voided] {
            assert_eq!(TradeStatus::parse(status.as_str()), Some(status));
        }
        assert!(TradeStatus::Unreconciled.holds_position());
        assert!(!TradeStatus::Voided.holds_position());
    }
}

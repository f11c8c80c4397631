use serde::Serialize;
use tracing::debug;
use crate::strategies::types::{BracketOpportunity, SingleOpportunity};

/// Contract count and the numbers that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionSize {
    pub full_kelly: f64,
    pub applied_fraction: f64,
    pub dollar_risk: f64,
    pub count: u32,
}

/// Fractional-Kelly sizing capped by the city's remaining budget.
#[derive(Debug, Clone, Copy)]
pub struct PositionSizer {
    kelly_fraction: f64,
}

impl PositionSizer {
    pub fn new(kelly_fraction: f64) -> Self {
        Self { kelly_fraction }
    }

    /// `None` when the position rounds down to zero contracts.
    pub fn size_single(&self, opp: &SingleOpportunity, balance: f64, remaining_budget: f64) -> Option<PositionSize> {
        self.size(opp.model_prob, opp.ask, balance, remaining_budget)
    }

    /// Splits the remaining budget evenly across the legs. Both legs must size to at
    /// least one contract or the bracket is dropped whole.
    pub fn size_bracket(
        &self,
        bracket: &BracketOpportunity,
        balance: f64,
        remaining_budget: f64,
    ) -> Option<(PositionSize, PositionSize)> {
        let per_leg = remaining_budget / 2.0;
        let leg1 = self.size_single(&bracket.leg1, balance, per_leg);
        let leg2 = self.size_single(&bracket.leg2, balance, per_leg);

        match (leg1, leg2) {
            (Some(a), Some(b)) => Some((a, b)),
            _ => {
                debug!(
                    "Bracket {} dropped: a leg sizes to zero contracts on ${:.2}/leg",
                    bracket.bracket_id, per_leg
                );
                None
            }
        }
    }

    fn size(&self, model_prob: f64, ask: f64, balance: f64, remaining_budget: f64) -> Option<PositionSize> {
        let full_kelly = calculate_kelly_fraction(model_prob, ask);
        let applied_fraction = full_kelly * self.kelly_fraction;
        let dollar_risk = (applied_fraction * balance).min(remaining_budget.max(0.0));

        if ask <= 0.0 || dollar_risk <= 0.0 {
            return None;
        }
        // Tolerance keeps an exact quotient such as 30 / 0.5 from flooring to 59
        let count = (dollar_risk / ask + 1e-9).floor();
        if count < 1.0 {
            return None;
        }

        Some(PositionSize {
            full_kelly,
            applied_fraction,
            dollar_risk,
            count: count as u32,
        })
    }
}

/// Full Kelly for a binary contract bought at `price` that pays $1.
/// Formula: f* = (p - price) / (1 - price), floored at zero
pub fn calculate_kelly_fraction(win_prob: f64, price: f64) -> f64 {
    if !(0.0..1.0).contains(&price) {
        return 0.0;
    }
    ((win_prob - price) / (1.0 - price)).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use crate::data::types::MarketBin;

    fn opp(ticker: &str, model_prob: f64, ask: f64) -> SingleOpportunity {
        SingleOpportunity {
            city: "NYC".to_string(),
            bin: MarketBin::closed("NYC", ticker, 74.0, 75.0, ask, ask - 0.02),
            model_prob,
            ask,
            fee_cost: 0.01 / ask,
            net_edge: model_prob - ask - 0.01 / ask,
        }
    }

    fn bracket(leg1: SingleOpportunity, leg2: SingleOpportunity) -> BracketOpportunity {
        BracketOpportunity {
            city: "NYC".to_string(),
            combined_model_prob: leg1.model_prob + leg2.model_prob,
            total_ask: leg1.ask + leg2.ask,
            combined_net_edge: leg1.net_edge + leg2.net_edge,
            expected_value: leg1.model_prob + leg2.model_prob - leg1.ask - leg2.ask,
            bracket_id: Uuid::nil(),
            leg1,
            leg2,
        }
    }

    #[test]
    fn test_kelly_sizing_capped_by_city_budget() {
        // f* = (0.70 - 0.50) / 0.50 = 0.40, quarter Kelly = 0.10
        // min($100, $30 budget) = $30 -> floor(30 / 0.50) = 60
        let sizer = PositionSizer::new(0.25);
        let size = sizer.size_single(&opp("B75", 0.70, 0.50), 1000.0, 30.0).unwrap();

        assert!((size.full_kelly - 0.40).abs() < 1e-12);
        assert!((size.applied_fraction - 0.10).abs() < 1e-12);
        assert!((size.dollar_risk - 30.0).abs() < 1e-9);
        assert_eq!(size.count, 60);
    }

    #[test]
    fn test_kelly_uncapped_when_budget_allows() {
        let sizer = PositionSizer::new(0.25);
        let size = sizer.size_single(&opp("B75", 0.70, 0.50), 100.0, 30.0).unwrap();
        assert!((size.dollar_risk - 10.0).abs() < 1e-9);
        assert_eq!(size.count, 20);
    }

    #[test]
    fn test_small_positions_dropped() {
        let sizer = PositionSizer::new(0.25);
        assert_eq!(sizer.size_single(&opp("B75", 0.70, 0.50), 1000.0, 0.40), None);
        assert_eq!(sizer.size_single(&opp("B75", 0.40, 0.50), 1000.0, 30.0), None);
        assert_eq!(sizer.size_single(&opp("B75", 0.70, 0.50), 1000.0, -5.0), None);
    }

    #[test]
    fn test_negative_kelly_floors_at_zero() {
        assert_eq!(calculate_kelly_fraction(0.30, 0.50), 0.0);
        assert_eq!(calculate_kelly_fraction(0.90, 1.0), 0.0);
        assert!((calculate_kelly_fraction(0.85, 0.65) - 0.5714285714).abs() < 1e-9);
    }

    #[test]
    fn test_bracket_splits_budget_per_leg() {
        let sizer = PositionSizer::new(0.25);
        let b = bracket(opp("B73", 0.45, 0.30), opp("B75", 0.45, 0.30));

        let (l1, l2) = sizer.size_bracket(&b, 1000.0, 30.0).unwrap();
        assert!((l1.dollar_risk - 15.0).abs() < 1e-9);
        assert_eq!(l1.count, 50);
        assert_eq!(l2.count, 50);
    }

    #[test]
    fn test_bracket_dropped_when_one_leg_rounds_to_zero() {
        let sizer = PositionSizer::new(0.25);
        // $0.90 budget -> $0.45 per leg; cheap leg gets 1 contract, dear leg none
        let b = bracket(opp("B73", 0.60, 0.40), opp("B75", 0.70, 0.50));
        assert!(sizer.size_single(&b.leg1, 1000.0, 0.90).is_some());
        assert_eq!(sizer.size_bracket(&b, 1000.0, 0.90), None);
    }
}

use tracing::{debug, info};
use uuid::Uuid;
use crate::config::StrategyConfig;
use crate::data::types::MarketBin;
use crate::model::distribution::{CityForecast, DistributionModel};
use crate::strategies::types::{BracketOpportunity, OpportunitySet, SingleOpportunity};

/// Float slack for threshold comparisons, so an edge that equals the threshold qualifies.
const EDGE_EPSILON: f64 = 1e-9;

/// Prices every bin and adjacent-bin pair against the model.
///
/// Holds no state between cycles; the same inputs always produce the same set.
pub struct EdgeEngine {
    config: StrategyConfig,
    model: DistributionModel,
}

impl EdgeEngine {
    pub fn new(config: StrategyConfig, model: DistributionModel) -> Self {
        Self { config, model }
    }

    /// Scans all cities and sorts the result for presentation.
    pub fn scan(&self, inputs: &[(CityForecast, Vec<MarketBin>)]) -> OpportunitySet {
        let mut set = OpportunitySet::default();
        for (dist, ladder) in inputs {
            let city_set = self.evaluate_city(dist, ladder);
            set.singles.extend(city_set.singles);
            set.brackets.extend(city_set.brackets);
        }

        set.singles.sort_by(|a, b| b.net_edge.total_cmp(&a.net_edge));
        set.brackets.sort_by(|a, b| b.expected_value.total_cmp(&a.expected_value));

        info!(
            "Edge scan: {} single, {} bracket opportunities across {} cities",
            set.singles.len(),
            set.brackets.len(),
            inputs.len()
        );
        set
    }

    /// `ladder` must be sorted ascending (open-low first), as market ingestion delivers it.
    pub fn evaluate_city(&self, dist: &CityForecast, ladder: &[MarketBin]) -> OpportunitySet {
        let priced: Vec<SingleOpportunity> = ladder.iter().map(|bin| self.price_bin(dist, bin)).collect();

        let singles: Vec<SingleOpportunity> = priced
            .iter()
            .filter(|opp| self.single_qualifies(opp))
            .cloned()
            .collect();

        let brackets: Vec<BracketOpportunity> = priced
            .windows(2)
            .filter(|pair| range_contains(&pair[0].bin, &pair[1].bin, dist.mu))
            .filter_map(|pair| self.build_bracket(dist, &pair[0], &pair[1]))
            .collect();

        for opp in &singles {
            debug!(
                "{} {}: p={:.3} ask={:.2} fee={:.3} net_edge={:+.3}",
                opp.city, opp.bin.ticker, opp.model_prob, opp.ask, opp.fee_cost, opp.net_edge
            );
        }
        OpportunitySet { singles, brackets }
    }

    /// net_edge = model_prob − ask − fee_rate / ask
    pub fn price_bin(&self, dist: &CityForecast, bin: &MarketBin) -> SingleOpportunity {
        let model_prob = self.model.bin_probability(dist, bin);
        let fee_cost = if bin.ask > 0.0 { self.config.fee_rate / bin.ask } else { f64::INFINITY };

        SingleOpportunity {
            city: bin.city.clone(),
            bin: bin.clone(),
            model_prob,
            ask: bin.ask,
            fee_cost,
            net_edge: model_prob - bin.ask - fee_cost,
        }
    }

    pub fn single_qualifies(&self, opp: &SingleOpportunity) -> bool {
        opp.net_edge >= self.config.min_edge_threshold - EDGE_EPSILON
            && opp.ask >= self.config.min_ask - EDGE_EPSILON
            && opp.ask <= self.config.max_ask + EDGE_EPSILON
            && opp.bin.spread <= self.config.max_spread + EDGE_EPSILON
    }

    /// Combines two already-priced adjacent legs; `None` if the pair does not qualify.
    pub fn build_bracket(
        &self,
        dist: &CityForecast,
        leg1: &SingleOpportunity,
        leg2: &SingleOpportunity,
    ) -> Option<BracketOpportunity> {
        if leg1.city != leg2.city || !self.single_qualifies(leg1) || !self.single_qualifies(leg2) {
            return None;
        }

        let combined_model_prob = leg1.model_prob + leg2.model_prob;
        let total_ask = leg1.ask + leg2.ask;
        let combined_net_edge = combined_model_prob - total_ask - leg1.fee_cost - leg2.fee_cost;
        let expected_value = combined_model_prob - total_ask;

        if combined_net_edge < 2.0 * self.config.min_edge_threshold - EDGE_EPSILON || expected_value <= 0.0 {
            return None;
        }

        Some(BracketOpportunity {
            city: leg1.city.clone(),
            bracket_id: bracket_id(dist, &leg1.bin.ticker, &leg2.bin.ticker),
            leg1: leg1.clone(),
            leg2: leg2.clone(),
            combined_model_prob,
            total_ask,
            combined_net_edge,
            expected_value,
        })
    }
}

/// Whether the union of two adjacent bins covers `mu`; open ends are unbounded.
fn range_contains(lower: &MarketBin, upper: &MarketBin, mu: f64) -> bool {
    let lo = lower.bounds().low.unwrap_or(f64::NEG_INFINITY);
    let hi = upper.bounds().high.unwrap_or(f64::INFINITY);
    lo <= mu && mu <= hi
}

/// Stable per opportunity: the same city, legs and forecast always map to the same id.
fn bracket_id(dist: &CityForecast, ticker1: &str, ticker2: &str) -> Uuid {
    let key = format!("{}|{}|{}|{}", dist.city, ticker1, ticker2, dist.timestamp.to_rfc3339());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

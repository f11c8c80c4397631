use serde::Serialize;
use uuid::Uuid;
use crate::data::types::MarketBin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "yes",
            Side::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(Side::Yes),
            "no" => Some(Side::No),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyKind {
    Single,
    Bracket,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Single => "single",
            StrategyKind::Bracket => "bracket",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(StrategyKind::Single),
            "bracket" => Some(StrategyKind::Bracket),
            _ => None,
        }
    }
}

/// A bin whose model probability beats its ask after fees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SingleOpportunity {
    pub city: String,
    pub bin: MarketBin,
    pub model_prob: f64,
    pub ask: f64,
    pub fee_cost: f64,
    pub net_edge: f64,
}

/// Two index-adjacent bins of one city, bought together as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BracketOpportunity {
    pub city: String,
    pub leg1: SingleOpportunity,
    pub leg2: SingleOpportunity,
    pub combined_model_prob: f64,
    pub total_ask: f64,
    pub combined_net_edge: f64,
    pub expected_value: f64,
    pub bracket_id: Uuid,
}

/// Everything the edge engine found in one cycle, sorted for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpportunitySet {
    pub singles: Vec<SingleOpportunity>,
    pub brackets: Vec<BracketOpportunity>,
}

/// Borrowed view used to interleave singles and brackets by edge.
#[derive(Debug, Clone, Copy)]
pub enum Opportunity<'a> {
    Single(&'a SingleOpportunity),
    Bracket(&'a BracketOpportunity),
}

impl Opportunity<'_> {
    pub fn city(&self) -> &str {
        match self {
            Opportunity::Single(s) => &s.city,
            Opportunity::Bracket(b) => &b.city,
        }
    }

    pub fn edge(&self) -> f64 {
        match self {
            Opportunity::Single(s) => s.net_edge,
            Opportunity::Bracket(b) => b.combined_net_edge,
        }
    }
}

impl OpportunitySet {
    pub fn is_empty(&self) -> bool {
        self.singles.is_empty() && self.brackets.is_empty()
    }

    /// Singles and brackets merged by descending edge; ties keep singles first.
    pub fn execution_order(&self) -> Vec<Opportunity<'_>> {
        let mut all: Vec<Opportunity<'_>> = self
            .singles
            .iter()
            .map(Opportunity::Single)
            .chain(self.brackets.iter().map(Opportunity::Bracket))
            .collect();
        all.sort_by(|a, b| b.edge().total_cmp(&a.edge()));
        all
    }
}

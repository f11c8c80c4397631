use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Raw percentile forecast for one city's daily high, in °F.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileForecast {
    pub city: String,
    pub target_date: NaiveDate,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub issued_at: DateTime<Utc>,
}

/// One tradeable contract on a city's temperature ladder.
///
/// Boundary bins have exactly one of `is_open_low` / `is_open_high` set and
/// the matching bound unset; interior bins have both bounds and no flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketBin {
    pub city: String,
    pub ticker: String,
    pub temp_low: Option<f64>,
    pub temp_high: Option<f64>,
    pub is_open_low: bool,
    pub is_open_high: bool,
    pub ask: f64,
    pub bid: f64,
    pub spread: f64,
}

impl MarketBin {
    pub fn closed(city: &str, ticker: &str, low: f64, high: f64, ask: f64, bid: f64) -> Self {
        Self::build(city, ticker, Some(low), Some(high), false, false, ask, bid)
    }

    /// "`high`° or below"
    pub fn open_low(city: &str, ticker: &str, high: f64, ask: f64, bid: f64) -> Self {
        Self::build(city, ticker, None, Some(high), true, false, ask, bid)
    }

    /// "`low`° or above"
    pub fn open_high(city: &str, ticker: &str, low: f64, ask: f64, bid: f64) -> Self {
        Self::build(city, ticker, Some(low), None, false, true, ask, bid)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        city: &str,
        ticker: &str,
        temp_low: Option<f64>,
        temp_high: Option<f64>,
        is_open_low: bool,
        is_open_high: bool,
        ask: f64,
        bid: f64,
    ) -> Self {
        Self {
            city: city.to_string(),
            ticker: ticker.to_string(),
            temp_low,
            temp_high,
            is_open_low,
            is_open_high,
            ask,
            bid,
            spread: ask - bid,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        match (self.is_open_low, self.is_open_high) {
            (true, false) => self.temp_low.is_none() && self.temp_high.is_some(),
            (false, true) => self.temp_low.is_some() && self.temp_high.is_none(),
            (false, false) => matches!(
                (self.temp_low, self.temp_high),
                (Some(lo), Some(hi)) if lo <= hi
            ),
            (true, true) => false,
        }
    }

    pub fn bounds(&self) -> BinBounds {
        BinBounds {
            low: if self.is_open_low { None } else { self.temp_low },
            high: if self.is_open_high { None } else { self.temp_high },
        }
    }

    /// Lower edge for ladder ordering; open-low bins sort first.
    pub fn sort_key(&self) -> f64 {
        self.temp_low.unwrap_or(f64::NEG_INFINITY)
    }
}

/// Settlement range of a bin; `None` is an open end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinBounds {
    pub low: Option<f64>,
    pub high: Option<f64>,
}

impl BinBounds {
    pub fn contains(&self, temp: f64) -> bool {
        self.low.map_or(true, |lo| temp >= lo) && self.high.map_or(true, |hi| temp <= hi)
    }
}

/// Contracts settle on the whole-degree reported high, so an observed °F value
/// is rounded before it is matched against bin bounds.
pub fn settlement_high(observed_f: f64) -> f64 {
    observed_f.round()
}

/// Missing or unusable upstream data. The affected city is skipped; values are never fabricated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataUnavailable {
    #[error("no forecast for {city}: {reason}")]
    Forecast { city: String, reason: String },

    #[error("forecast for {city} is stale ({age_hours}h old)")]
    Stale { city: String, age_hours: i64 },

    #[error("no market data for {city}: {reason}")]
    Market { city: String, reason: String },

    #[error("empty bin ladder for {city}")]
    EmptyLadder { city: String },

    #[error("no actual high for {city} on {date}: {reason}")]
    Actual { city: String, date: NaiveDate, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_shapes_are_well_formed() {
        assert!(MarketBin::closed("NYC", "T1", 74.0, 76.0, 0.3, 0.28).is_well_formed());
        assert!(MarketBin::open_low("NYC", "T0", 73.0, 0.1, 0.08).is_well_formed());
        assert!(MarketBin::open_high("NYC", "T9", 77.0, 0.1, 0.08).is_well_formed());

        let mut broken = MarketBin::open_low("NYC", "T0", 73.0, 0.1, 0.08);
        broken.is_open_high = true;
        assert!(!broken.is_well_formed());

        let mut inverted = MarketBin::closed("NYC", "T1", 76.0, 74.0, 0.3, 0.28);
        inverted.temp_low = Some(76.0);
        assert!(!inverted.is_well_formed());
    }

    #[test]
    fn test_fractional_high_lands_in_a_whole_degree_bin() {
        let ladder = [
            MarketBin::closed("NYC", "B73", 73.0, 74.0, 0.3, 0.28),
            MarketBin::closed("NYC", "B75", 75.0, 76.0, 0.3, 0.28),
        ];
        let winners = |observed: f64| -> Vec<&str> {
            ladder
                .iter()
                .filter(|b| b.bounds().contains(settlement_high(observed)))
                .map(|b| b.ticker.as_str())
                .collect()
        };

        // 23.6°C reads as 74.48°F, which sits in the gap between bins
        assert!(ladder.iter().all(|b| !b.bounds().contains(74.48)));
        assert_eq!(winners(74.48), vec!["B73"]);
        assert_eq!(winners(74.6), vec!["B75"]);
        assert_eq!(settlement_high(75.0), 75.0);
    }

    #[test]
    fn test_bounds_contains() {
        let bin = MarketBin::closed("NYC", "T1", 74.0, 76.0, 0.3, 0.28);
        assert!(bin.bounds().contains(74.0));
        assert!(bin.bounds().contains(76.0));
        assert!(!bin.bounds().contains(76.5));

        let top = MarketBin::open_high("NYC", "T9", 77.0, 0.1, 0.08);
        assert!(top.bounds().contains(99.0));
        assert!(!top.bounds().contains(76.0));
    }

    #[test]
    fn test_spread_derived_from_quotes() {
        let bin = MarketBin::closed("NYC", "T1", 74.0, 76.0, 0.30, 0.25);
        assert!((bin.spread - 0.05).abs() < 1e-12);
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, warn};
use crate::config::CityConfig;
use crate::data::types::{DataUnavailable, MarketBin};

/// Current bin ladder for one city and settlement date.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    async fn fetch_ladder(
        &self,
        city: &CityConfig,
        target_date: NaiveDate,
    ) -> Result<Vec<MarketBin>, DataUnavailable>;
}

pub struct KalshiMarketClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    #[serde(default)]
    markets: Vec<KalshiMarket>,
}

#[derive(Debug, Deserialize)]
struct KalshiMarket {
    ticker: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    yes_sub_title: Option<String>,
    #[serde(default)]
    subtitle: Option<String>,
    #[serde(default)]
    floor_strike: Option<f64>,
    #[serde(default)]
    cap_strike: Option<f64>,
    #[serde(default)]
    strike_type: Option<String>,
    #[serde(default)]
    yes_ask: Option<Value>,
    #[serde(default)]
    yes_bid: Option<Value>,
    #[serde(default)]
    yes_ask_dollars: Option<Value>,
    #[serde(default)]
    yes_bid_dollars: Option<Value>,
}

/// Parsed settlement range of a contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TempRange {
    Closed(f64, f64),
    OrBelow(f64),
    OrAbove(f64),
}

impl KalshiMarketClient {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build Kalshi HTTP client")?;
        Ok(Self { client, base_url })
    }

    async fn fetch_event_markets(&self, event_ticker: &str) -> Result<Vec<KalshiMarket>> {
        let url = format!("{}/markets", self.base_url);

        let response: MarketsResponse = self
            .client
            .get(&url)
            .query(&[("event_ticker", event_ticker), ("status", "open")])
            .send()
            .await
            .context("Failed to fetch markets")?
            .error_for_status()
            .context("Markets request rejected")?
            .json()
            .await
            .context("Failed to parse markets response")?;

        Ok(response.markets)
    }
}

#[async_trait]
impl MarketDataProvider for KalshiMarketClient {
    async fn fetch_ladder(
        &self,
        city: &CityConfig,
        target_date: NaiveDate,
    ) -> Result<Vec<MarketBin>, DataUnavailable> {
        let event_ticker = event_ticker_for(&city.kalshi_series, target_date);
        let markets = self
            .fetch_event_markets(&event_ticker)
            .await
            .map_err(|e| DataUnavailable::Market {
                city: city.code.clone(),
                reason: format!("{:#}", e),
            })?;

        let ladder = build_ladder(&city.code, markets);
        if ladder.is_empty() {
            return Err(DataUnavailable::EmptyLadder { city: city.code.clone() });
        }
        debug!("{}: {} bins for {}", city.code, ladder.len(), event_ticker);
        Ok(ladder)
    }
}

/// `KXHIGHNY` + 2026-02-20 → `KXHIGHNY-26FEB20`
pub fn event_ticker_for(series: &str, date: NaiveDate) -> String {
    format!("{}-{}", series, date.format("%y%b%d").to_string().to_uppercase())
}

/// Converts raw markets into a well-formed ladder sorted from the open-low bin upward.
fn build_ladder(city: &str, markets: Vec<KalshiMarket>) -> Vec<MarketBin> {
    let mut ladder: Vec<MarketBin> = markets
        .into_iter()
        .filter(|m| m.status.is_empty() || matches!(m.status.as_str(), "open" | "active"))
        .filter_map(|m| {
            let range = match range_from_market(&m) {
                Some(r) => r,
                None => {
                    warn!("Skipping {}: unparseable temperature range", m.ticker);
                    return None;
                }
            };
            let ask = m.yes_ask_dollars.as_ref().or(m.yes_ask.as_ref()).and_then(parse_price)?;
            let bid = m
                .yes_bid_dollars
                .as_ref()
                .or(m.yes_bid.as_ref())
                .and_then(parse_price)
                .unwrap_or(0.0);

            let bin = match range {
                TempRange::Closed(lo, hi) => MarketBin::closed(city, &m.ticker, lo, hi, ask, bid),
                TempRange::OrBelow(hi) => MarketBin::open_low(city, &m.ticker, hi, ask, bid),
                TempRange::OrAbove(lo) => MarketBin::open_high(city, &m.ticker, lo, ask, bid),
            };
            bin.is_well_formed().then_some(bin)
        })
        .collect();

    ladder.sort_by(|a, b| a.sort_key().total_cmp(&b.sort_key()));
    ladder
}

/// Prefers the structured strike fields; falls back to the subtitle text.
fn range_from_market(m: &KalshiMarket) -> Option<TempRange> {
    if let (Some(strike), Some(kind)) = (m.floor_strike.or(m.cap_strike), m.strike_type.as_deref()) {
        match kind.to_lowercase().as_str() {
            // YES iff temp > strike, i.e. temp >= strike + 1 on integer readings
            "greater" => return Some(TempRange::OrAbove(strike + 1.0)),
            "less" => return Some(TempRange::OrBelow(strike - 1.0)),
            "between" => {
                if let (Some(lo), Some(hi)) = (m.floor_strike, m.cap_strike) {
                    return Some(TempRange::Closed(lo, hi));
                }
            }
            _ => {}
        }
    }

    let subtitle = m.yes_sub_title.as_deref().or(m.subtitle.as_deref())?;
    parse_temp_range(subtitle)
}

#[derive(Clone, Copy)]
enum Shape {
    Closed,
    OrBelow,
    OrAbove,
    Point,
}

fn range_patterns() -> &'static [(Regex, Shape)] {
    static PATTERNS: OnceLock<Vec<(Regex, Shape)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        const NUM: &str = r"(\d+(?:\.\d+)?)";
        const DEG: &str = r"°?\s*";
        [
            (format!(r"{NUM}{DEG}(?:to|-)\s*{NUM}{DEG}"), Shape::Closed),
            (format!(r"{NUM}{DEG}or\s+(?:below|lower)\s*"), Shape::OrBelow),
            (format!(r"{NUM}{DEG}or\s+(?:above|higher)\s*"), Shape::OrAbove),
            (format!(r"(?:below|under)\s+{NUM}{DEG}"), Shape::OrBelow),
            (format!(r"(?:above|over)\s+{NUM}{DEG}"), Shape::OrAbove),
            (format!(r"{NUM}{DEG}"), Shape::Point),
        ]
        .into_iter()
        .filter_map(|(p, shape)| Regex::new(&format!("(?i)^{}$", p)).ok().map(|re| (re, shape)))
        .collect()
    })
}

/// Parses subtitles such as "62° to 63°", "55° or below", "64° or above".
pub fn parse_temp_range(subtitle: &str) -> Option<TempRange> {
    let s = subtitle.trim().replace('\u{02da}', "°");

    for (re, shape) in range_patterns() {
        if let Some(cap) = re.captures(&s) {
            let a = cap.get(1)?.as_str().parse::<f64>().ok()?;
            return Some(match shape {
                Shape::Closed => {
                    let b = cap.get(2)?.as_str().parse::<f64>().ok()?;
                    TempRange::Closed(a, b)
                }
                Shape::OrBelow => TempRange::OrBelow(a),
                Shape::OrAbove => TempRange::OrAbove(a),
                Shape::Point => TempRange::Closed(a - 0.5, a + 0.5),
            });
        }
    }
    None
}

/// Prices arrive as integer cents or decimal dollars, as numbers or strings.
fn parse_price(raw: &Value) -> Option<f64> {
    let v = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    let dollars = if v > 1.0 { v / 100.0 } else { v };
    (dollars.is_finite() && dollars >= 0.0).then_some(dollars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_temp_range() {
        assert_eq!(parse_temp_range("62° to 63°"), Some(TempRange::Closed(62.0, 63.0)));
        assert_eq!(parse_temp_range("55° or below"), Some(TempRange::OrBelow(55.0)));
        assert_eq!(parse_temp_range("64° or higher"), Some(TempRange::OrAbove(64.0)));
        assert_eq!(parse_temp_range("Below 50°"), Some(TempRange::OrBelow(50.0)));
        assert_eq!(parse_temp_range("Over 90"), Some(TempRange::OrAbove(90.0)));
        assert_eq!(parse_temp_range("71°"), Some(TempRange::Closed(70.5, 71.5)));
        assert_eq!(parse_temp_range("sunny"), None);
    }

    #[test]
    fn test_event_ticker_format() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 20).unwrap();
        assert_eq!(event_ticker_for("KXHIGHNY", date), "KXHIGHNY-26FEB20");
    }

    #[test]
    fn test_parse_price_cents_and_dollars() {
        assert_eq!(parse_price(&serde_json::json!(45)), Some(0.45));
        assert_eq!(parse_price(&serde_json::json!("0.3100")), Some(0.31));
        assert_eq!(parse_price(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_build_ladder_sorts_and_filters() {
        let body = r#"{"markets":[
            {"ticker":"KXHIGHNY-26OCT15-B75.5","status":"active","floor_strike":75,"cap_strike":76,
             "strike_type":"between","yes_ask":30,"yes_bid":27},
            {"ticker":"KXHIGHNY-26OCT15-T78","status":"active","floor_strike":78,
             "strike_type":"greater","yes_ask":12,"yes_bid":9},
            {"ticker":"KXHIGHNY-26OCT15-T70","status":"active","cap_strike":70,
             "strike_type":"less","yes_ask":8,"yes_bid":5},
            {"ticker":"KXHIGHNY-26OCT15-B73.5","status":"active","yes_sub_title":"73° to 74°",
             "yes_ask":22,"yes_bid":19},
            {"ticker":"KXHIGHNY-26OCT15-X","status":"settled","yes_sub_title":"80° or above",
             "yes_ask":1,"yes_bid":0},
            {"ticker":"KXHIGHNY-26OCT15-Y","status":"active","yes_sub_title":"??",
             "yes_ask":10,"yes_bid":5}
        ]}"#;
        let response: MarketsResponse = serde_json::from_str(body).unwrap();
        let ladder = build_ladder("NYC", response.markets);

        let tickers: Vec<&str> = ladder.iter().map(|b| b.ticker.as_str()).collect();
        assert_eq!(
            tickers,
            vec![
                "KXHIGHNY-26OCT15-T70",
                "KXHIGHNY-26OCT15-B73.5",
                "KXHIGHNY-26OCT15-B75.5",
                "KXHIGHNY-26OCT15-T78",
            ]
        );
        assert!(ladder[0].is_open_low && ladder[0].temp_high == Some(69.0));
        assert!(ladder[3].is_open_high && ladder[3].temp_low == Some(79.0));
        assert!((ladder[2].ask - 0.30).abs() < 1e-12);
        assert!((ladder[2].spread - 0.03).abs() < 1e-9);
        assert!(ladder.iter().all(|b| b.is_well_formed()));
    }
}

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use crate::execution::types::Trade;

const HEADER: &str =
    "timestamp,trade_id,city,ticker,strategy,bracket_id,side,count,price,model_prob,edge,dollar_risk,status,pnl";

/// Append-only CSV journal of trades and operator events.
pub struct CsvLogger {
    log_path: String,
}

impl CsvLogger {
    pub fn new(log_path: String) -> Result<Self> {
        // Create CSV file with headers if it doesn't exist
        if !std::path::Path::new(&log_path).exists() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&log_path)
                .with_context(|| format!("Failed to create trade journal {}", log_path))?;
            writeln!(file, "{}", HEADER)?;
        }

        Ok(Self { log_path })
    }

    /// One row per trade state change (opened, reconciled, resolved).
    pub fn log_trade(&self, trade: &Trade, at: DateTime<Utc>) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;

        let pnl_str = trade.pnl.map(|p| format!("{:.2}", p)).unwrap_or_default();
        let bracket_str = trade.bracket_id.map(|id| id.to_string()).unwrap_or_default();

        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{:.2},{:.4},{:.4},{:.2},{},{}",
            at.to_rfc3339(),
            trade.trade_id,
            trade.city,
            trade.ticker,
            trade.strategy.as_str(),
            bracket_str,
            trade.side.as_str(),
            trade.count,
            trade.price,
            trade.model_prob,
            trade.edge,
            trade.dollar_risk,
            trade.status.as_str(),
            pnl_str
        )?;

        Ok(())
    }

    pub fn log_event(&self, event: &str, at: DateTime<Utc>) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;

        // Commas would shift the columns
        writeln!(file, "{},EVENT,{},,,,,,,,,,,", at.to_rfc3339(), event.replace(',', ";"))?;

        Ok(())
    }
}

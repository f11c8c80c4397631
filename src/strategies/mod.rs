pub mod backtest;
pub mod edge;
pub mod sizing;
pub mod types;

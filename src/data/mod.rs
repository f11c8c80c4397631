pub mod kalshi;
pub mod types;
pub mod weather;

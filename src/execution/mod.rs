pub mod gateway;
pub mod orchestrator;
pub mod persistence;
pub mod risk;
pub mod scheduler;
pub mod simulator;
pub mod types;

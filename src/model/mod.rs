pub mod calibration;
pub mod distribution;

pub mod config;
pub mod errors;
pub mod metrics;
pub mod retry;
pub mod status;
pub mod telemetry;

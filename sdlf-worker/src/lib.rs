pub mod batch;
pub mod config;
pub mod executor;
pub mod hooks;
pub mod metrics_consts;
pub mod transforms;

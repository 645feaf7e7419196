pub mod config;
pub mod event;
pub mod handlers;
pub mod metrics_consts;
pub mod router;

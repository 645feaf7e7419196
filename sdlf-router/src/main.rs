use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sdlf_core::storage::S3ObjectStore;
use sdlf_core::{run_migrations, Services};
use sdlf_router::config::Config;
use sdlf_router::handlers;
use sdlf_router::router::EventRouter;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    init_tracing(config.log_json);

    let pool = config.pool_config().connect().await?;
    run_migrations(&pool).await?;

    let storage = S3ObjectStore::from_config(&config.s3_config()).await;
    let services = Services::postgres(
        pool,
        Duration::from_secs(config.visibility_timeout_secs),
        Arc::new(storage),
        config.naming(),
        config.buckets(),
        &config.env,
    );

    let app = handlers::add_routes(
        Router::new(),
        Arc::new(EventRouter::new(services)),
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = common_metrics::setup_metrics_routes(app)?;

    info!(bind = %config.bind(), prefix = %config.resource_prefix, "starting sdlf router");
    if let Err(e) = common_metrics::serve(app, &config.bind()).await {
        error!("failed to start sdlf router http server, {}", e);
        return Err(e.into());
    }

    Ok(())
}

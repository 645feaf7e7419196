use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use health::{HealthHandle, HealthRegistry};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sdlf_core::queue::PgQueueService;
use sdlf_core::registry::PgRegistry;
use sdlf_core::run_migrations;
use sdlf_core::workflow::PgWorkflowService;
use sdlf_redrive::config::Config;
use sdlf_redrive::redrive::Redrive;

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

async fn redrive_loop(redrive: Redrive, liveness: HealthHandle, interval_secs: u64) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        if let Err(e) = redrive.run_once().await {
            error!("redrive failed with: {}", e);
        }
        liveness.report_healthy().await;
    }
}

pub fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

pub async fn index() -> &'static str {
    "sdlf redrive"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    init_tracing(config.log_json);
    config.validate()?;

    let pool = config.pool_config().connect().await?;
    run_migrations(&pool).await?;

    let redrive = Redrive::new(
        Arc::new(PgQueueService::new(pool.clone(), config.visibility_timeout())),
        Arc::new(PgWorkflowService::new(pool.clone())),
        Arc::new(PgRegistry::new(pool)),
        config.naming(),
    );

    let liveness = HealthRegistry::new("liveness");
    let redrive_liveness = liveness
        .register(
            "redrive".to_string(),
            Duration::from_secs(config.redrive_interval_secs * 4),
        )
        .await;

    let redrive_task = tokio::spawn(redrive_loop(
        redrive,
        redrive_liveness,
        config.redrive_interval_secs,
    ));

    let app = common_metrics::setup_metrics_routes(app(liveness))?;
    let bind = config.bind();
    info!(bind = %bind, prefix = %config.resource_prefix, "starting sdlf redrive");
    let http_server = tokio::spawn(async move { common_metrics::serve(app, &bind).await });

    tokio::select! {
        res = redrive_task => {
            error!("redrive loop exited");
            if let Err(e) = res {
                error!("redrive failed with: {}", e)
            }
        }
        res = http_server => {
            error!("http server exited");
            if let Err(e) = res {
                error!("server failed with: {}", e)
            }
        }
    }

    info!("exiting");
    Ok(())
}

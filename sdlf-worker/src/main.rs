use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use health::{HealthHandle, HealthRegistry};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sdlf_core::storage::S3ObjectStore;
use sdlf_core::workflow::PgWorkflowService;
use sdlf_core::{run_migrations, Services};
use sdlf_worker::batch::BatchRouter;
use sdlf_worker::config::Config;
use sdlf_worker::executor::WorkflowExecutor;
use sdlf_worker::hooks::StageHooks;
use sdlf_worker::transforms::TransformRegistry;

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

async fn batch_loop(router: BatchRouter, liveness: HealthHandle, interval_secs: u64) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;

        match router.route_all().await {
            Ok(started) if started > 0 => info!(started, "batch sweep started workflow runs"),
            Ok(_) => {}
            Err(e) => error!("batch sweep failed with: {}", e),
        }
        liveness.report_healthy().await;
    }
}

async fn executor_loop(
    executor: WorkflowExecutor,
    liveness: HealthHandle,
    config: Arc<Config>,
) -> Result<()> {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.executor_poll_interval_secs));

    loop {
        interval.tick().await;

        if let Err(e) = executor
            .recover_stalled(config.stall_timeout(), config.max_run_attempts)
            .await
        {
            error!("stalled run sweep failed with: {}", e);
        }
        if let Err(e) = executor.run_once(config.executor_batch_size).await {
            error!("workflow executor failed with: {}", e);
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
    "sdlf worker"
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    init_tracing(config.log_json);
    config.validate()?;

    let pool = config.pool_config().connect().await?;
    run_migrations(&pool).await?;

    let storage = Arc::new(S3ObjectStore::from_config(&config.s3_config()).await);
    let services = Services::postgres(
        pool.clone(),
        config.visibility_timeout(),
        storage.clone(),
        config.naming(),
        config.buckets(),
        &config.env,
    );

    // Refuse to start while a dataset points at a transform this build does not have
    let transforms = TransformRegistry::with_builtins(storage);
    transforms.validate(&services.datasets.list_datasets().await?)?;
    info!(transforms = ?transforms.names(), "transform registry validated");

    let liveness = HealthRegistry::new("liveness");
    let batch_liveness = liveness
        .register(
            "batch_router".to_string(),
            Duration::from_secs(config.batch_poll_interval_secs * 4),
        )
        .await;
    let executor_liveness = liveness
        .register(
            "workflow_executor".to_string(),
            // A heavy run may legitimately poll its job for the whole attempt budget
            Duration::from_secs(
                config.executor_poll_interval_secs * 4
                    + config.job_poll_interval_secs * u64::from(config.job_max_poll_attempts),
            ),
        )
        .await;

    let hooks = StageHooks::new(
        services.clone(),
        Arc::new(transforms),
        config.job_poll_interval(),
        config.job_max_poll_attempts,
    );
    let executor = WorkflowExecutor::new(
        services.clone(),
        Arc::new(PgWorkflowService::new(pool)),
        hooks,
    );

    let batch_task = tokio::spawn(batch_loop(
        BatchRouter::new(services),
        batch_liveness,
        config.batch_poll_interval_secs,
    ));
    let bind = config.bind();
    info!(bind = %bind, prefix = %config.resource_prefix, "starting sdlf worker");
    let executor_task = tokio::spawn(executor_loop(
        executor,
        executor_liveness,
        Arc::new(config),
    ));

    let app = common_metrics::setup_metrics_routes(app(liveness))?;
    let http_server = tokio::spawn(async move { common_metrics::serve(app, &bind).await });

    tokio::select! {
        res = batch_task => {
            error!("batch loop exited");
            if let Err(e) = res {
                error!("batch loop failed with: {}", e)
            }
        }
        res = executor_task => {
            error!("executor loop exited");
            if let Err(e) = res {
                error!("executor loop failed with: {}", e)
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

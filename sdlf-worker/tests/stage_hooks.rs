use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use sdlf_core::registry::{DatasetStore, ExecutionStore};
use sdlf_core::{
    BatchPayload, DatasetConfig, ExecutionStatus, JobDetails, JobStatus, MockBackends,
    PipelineError, PipelineStage, ProcessedKeys, StageMessage, Transform, TransformError,
    TransformOutput, TransformRequest,
};
use sdlf_worker::hooks::StageHooks;
use sdlf_worker::transforms::{TransformRegistry, COPY_TRANSFORM};

const QUEUE_B: &str = "prefix-adtech-insights-queue-b.fifo";

struct FailingTransform;

#[async_trait]
impl Transform for FailingTransform {
    async fn transform_object(
        &self,
        _request: &TransformRequest,
    ) -> Result<TransformOutput, TransformError> {
        Err(TransformError::Failed("bad input".to_string()))
    }
}

/// Hands every request the same list of output keys.
struct FanOutTransform {
    keys: Vec<String>,
}

#[async_trait]
impl Transform for FanOutTransform {
    async fn transform_object(
        &self,
        _request: &TransformRequest,
    ) -> Result<TransformOutput, TransformError> {
        Ok(TransformOutput {
            processed_keys: ProcessedKeys::Keys(self.keys.clone()),
            job_details: None,
        })
    }
}

/// Starts a job writing under `prefix`, then reports the queued statuses one check at a time.
struct JobTransform {
    prefix: String,
    statuses: Mutex<VecDeque<JobStatus>>,
    checks: Mutex<u32>,
}

impl JobTransform {
    fn new(prefix: &str, statuses: &[JobStatus]) -> Self {
        Self {
            prefix: prefix.to_string(),
            statuses: Mutex::new(statuses.iter().copied().collect()),
            checks: Mutex::new(0),
        }
    }

    fn checks(&self) -> u32 {
        *self.checks.lock().unwrap()
    }
}

#[async_trait]
impl Transform for JobTransform {
    async fn transform_object(
        &self,
        _request: &TransformRequest,
    ) -> Result<TransformOutput, TransformError> {
        Ok(TransformOutput {
            processed_keys: ProcessedKeys::Prefix(self.prefix.clone()),
            job_details: Some(JobDetails {
                job_name: "glue-job".to_string(),
                job_run_id: "jr_1".to_string(),
                job_status: JobStatus::Started,
                tables: vec![],
            }),
        })
    }

    async fn check_job_status(
        &self,
        _request: &TransformRequest,
        mut output: TransformOutput,
    ) -> Result<TransformOutput, TransformError> {
        *self.checks.lock().unwrap() += 1;
        let next = self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(JobStatus::Running);
        if let Some(details) = output.job_details.as_mut() {
            details.job_status = next;
        }
        Ok(output)
    }
}

async fn backends() -> MockBackends {
    let backends = MockBackends::new();
    backends
        .registry
        .put_dataset(&dataset(COPY_TRANSFORM, COPY_TRANSFORM))
        .await
        .unwrap();
    backends
}

fn dataset(stage_a: &str, stage_b: &str) -> DatasetConfig {
    DatasetConfig {
        team: "adtech".to_string(),
        dataset: "datasetA".to_string(),
        pipeline: "insights".to_string(),
        min_items: BTreeMap::new(),
        max_items: BTreeMap::new(),
        stage_a_transform: stage_a.to_string(),
        stage_b_transform: stage_b.to_string(),
    }
}

fn payload(stage: PipelineStage, bucket: &str, keys: &[&str]) -> BatchPayload {
    BatchPayload {
        bucket: bucket.to_string(),
        keys_to_process: keys.iter().map(|k| k.to_string()).collect(),
        team: "adtech".to_string(),
        pipeline: "insights".to_string(),
        pipeline_stage: stage,
        dataset: "datasetA".to_string(),
        env: "dev".to_string(),
    }
}

fn hooks(backends: &MockBackends, registry: TransformRegistry, max_poll_attempts: u32) -> StageHooks {
    StageHooks::new(
        backends.services(),
        Arc::new(registry),
        Duration::from_millis(1),
        max_poll_attempts,
    )
}

fn registry_with(backends: &MockBackends, name: &str, transform: Arc<dyn Transform>) -> TransformRegistry {
    let mut registry = TransformRegistry::with_builtins(Arc::new(backends.storage.clone()));
    registry.register(name, transform);
    registry
}

async fn statuses(backends: &MockBackends, id: uuid::Uuid) -> Vec<String> {
    backends
        .registry
        .get_execution(id)
        .await
        .unwrap()
        .unwrap()
        .history
        .iter()
        .map(|event| event.status.to_string())
        .collect()
}

#[tokio::test]
async fn light_stage_clean_run() {
    let backends = backends().await;
    backends
        .storage
        .put("prefix-raw-bucket", "adtech/datasetA/a.json", 10)
        .put("prefix-raw-bucket", "adtech/datasetA/b.json", 20);
    let registry = TransformRegistry::with_builtins(Arc::new(backends.storage.clone()));
    let config = dataset(COPY_TRANSFORM, COPY_TRANSFORM);

    let executions = hooks(&backends, registry, 3)
        .run(
            &config,
            &payload(
                PipelineStage::StageA,
                "prefix-raw-bucket",
                &["adtech/datasetA/a.json", "adtech/datasetA/b.json"],
            ),
        )
        .await
        .unwrap();

    // One execution per key
    assert_eq!(executions.len(), 2);
    for id in &executions {
        assert_eq!(
            statuses(&backends, *id).await,
            vec!["STARTED", "StageA Postupdate Processing", "SUCCEEDED"]
        );
        let execution = backends.registry.get_execution(*id).await.unwrap().unwrap();
        assert_eq!(execution.pipeline_name, "adtech-insights-StageA");
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
    }

    // A record on the way in, and one for the processed object
    let records = backends.registry.object_metadata();
    assert_eq!(records.len(), 4);
    let processed: Vec<_> = records.iter().filter(|r| r.size.is_some()).collect();
    assert_eq!(processed.len(), 2);
    assert_eq!(processed[0].bucket, "prefix-dl-stage");
    assert_eq!(processed[0].key, "pre-stage/adtech/datasetA/a.json");
    assert_eq!(processed[0].size, Some(10));
    assert_eq!(processed[0].peh_id, Some(executions[0]));

    let sent = backends.queues.sent(QUEUE_B);
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.ordering_key == "adtech-datasetA"));
    let next: StageMessage = serde_json::from_str(&sent[1].body).unwrap();
    assert_eq!(next.pipeline_stage, PipelineStage::StageB);
    assert_eq!(next.bucket, "prefix-dl-stage");
    assert_eq!(next.key.as_deref(), Some("pre-stage/adtech/datasetA/b.json"));
    // Names the execution that produced the object
    assert_eq!(next.peh_id, Some(executions[1]));
}

#[tokio::test]
async fn pre_update_hands_on_the_execution_id() {
    let backends = backends().await;
    let registry = TransformRegistry::with_builtins(Arc::new(backends.storage.clone()));
    let message = payload(
        PipelineStage::StageA,
        "prefix-raw-bucket",
        &["adtech/datasetA/a.json"],
    )
    .messages()
    .remove(0);
    assert_eq!(message.peh_id, None);

    let handed_on = hooks(&backends, registry, 3)
        .pre_update(&message)
        .await
        .unwrap();

    let peh_id = handed_on.peh_id.expect("pre-update sets the execution id");
    assert_eq!(handed_on.key, message.key);
    let execution = backends.registry.get_execution(peh_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Started);
    assert_eq!(execution.pipeline_name, "adtech-insights-StageA");

    let records = backends.registry.object_metadata();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].peh_id, Some(peh_id));
    assert_eq!(records[0].size, None);
}

#[tokio::test]
async fn plugin_error_fails_the_execution() {
    let backends = backends().await;
    let registry = registry_with(&backends, "broken", Arc::new(FailingTransform));
    let config = dataset("broken", COPY_TRANSFORM);

    let error = hooks(&backends, registry, 3)
        .run(
            &config,
            &payload(PipelineStage::StageA, "prefix-raw-bucket", &["adtech/datasetA/a.json"]),
        )
        .await
        .unwrap_err();

    assert!(matches!(error, PipelineError::Transform { ref component, .. } if component == "Process"));
    assert_eq!(error.to_string(), "StageA Process Error: bad input");

    let executions = backends.registry.executions();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
    assert_eq!(
        executions[0].comment.as_deref(),
        Some("StageA Process Error: bad input")
    );
    assert_eq!(
        statuses(&backends, executions[0].id).await,
        vec!["STARTED", "FAILED"]
    );
    assert_eq!(backends.queues.send_calls(), 0);
}

#[tokio::test]
async fn missing_output_object_fails_in_post_update() {
    let backends = backends().await;
    let registry = registry_with(
        &backends,
        "ghost",
        Arc::new(FanOutTransform {
            keys: vec!["pre-stage/adtech/datasetA/missing.json".to_string()],
        }),
    );
    let config = dataset("ghost", COPY_TRANSFORM);

    let error = hooks(&backends, registry, 3)
        .run(
            &config,
            &payload(PipelineStage::StageA, "prefix-raw-bucket", &["adtech/datasetA/a.json"]),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, PipelineError::Storage(_)));

    let execution = &backends.registry.executions()[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    let comment = execution.comment.clone().unwrap();
    assert!(comment.starts_with("StageA Postupdate Error: object not found"));
    assert_eq!(backends.queues.send_calls(), 0);
}

#[tokio::test]
async fn next_stage_messages_go_out_in_batches_of_ten() {
    let backends = backends().await;
    let keys: Vec<String> = (0..23)
        .map(|i| format!("pre-stage/adtech/datasetA/part-{i:02}.json"))
        .collect();
    for key in &keys {
        backends.storage.put("prefix-dl-stage", key, 1);
    }
    let registry = registry_with(&backends, "fanout", Arc::new(FanOutTransform { keys }));
    let config = dataset("fanout", COPY_TRANSFORM);

    hooks(&backends, registry, 3)
        .run(
            &config,
            &payload(PipelineStage::StageA, "prefix-raw-bucket", &["adtech/datasetA/big.json"]),
        )
        .await
        .unwrap();

    assert_eq!(backends.queues.sent(QUEUE_B).len(), 23);
    // 10 + 10 + 3
    assert_eq!(backends.queues.send_calls(), 3);
}

#[tokio::test]
async fn heavy_stage_polls_until_the_job_succeeds() {
    let backends = backends().await;
    let prefix = "post-stage/adtech/datasetA/run-1/";
    backends
        .storage
        .put("prefix-dl-analytics", &format!("{prefix}part-0.parquet"), 100)
        .put("prefix-dl-analytics", &format!("{prefix}part-1.parquet"), 200);
    let job = Arc::new(JobTransform::new(
        prefix,
        &[JobStatus::Running, JobStatus::Succeeded],
    ));
    let registry = registry_with(&backends, "glue", job.clone());
    let config = dataset(COPY_TRANSFORM, "glue");

    let executions = hooks(&backends, registry, 5)
        .run(
            &config,
            &payload(
                PipelineStage::StageB,
                "prefix-dl-stage",
                &["pre-stage/adtech/datasetA/a.json", "pre-stage/adtech/datasetA/b.json"],
            ),
        )
        .await
        .unwrap();

    assert_eq!(executions.len(), 1);
    assert_eq!(job.checks(), 2);
    assert_eq!(
        statuses(&backends, executions[0]).await,
        vec!["STARTED", "StageB Postupdate Processing", "SUCCEEDED"]
    );

    let records = backends.registry.object_metadata();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.bucket == "prefix-dl-analytics"));
    assert_eq!(records[1].size, Some(200));

    // Last stage, nothing to hand over
    assert_eq!(backends.queues.send_calls(), 0);
}

#[tokio::test]
async fn failed_job_fails_the_execution() {
    let backends = backends().await;
    let job = Arc::new(JobTransform::new("post-stage/x/", &[JobStatus::Failed]));
    let registry = registry_with(&backends, "glue", job);
    let config = dataset(COPY_TRANSFORM, "glue");

    let error = hooks(&backends, registry, 5)
        .run(&config, &payload(PipelineStage::StageB, "prefix-dl-stage", &["k"]))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Transform {
            source: TransformError::JobFailed { .. },
            ..
        }
    ));
    let execution = &backends.registry.executions()[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.comment.as_deref(),
        Some("StageB CheckJob Error: job glue-job reported FAILED")
    );
}

#[tokio::test]
async fn job_polling_gives_up_after_max_attempts() {
    let backends = backends().await;
    let job = Arc::new(JobTransform::new("post-stage/x/", &[]));
    let registry = registry_with(&backends, "glue", job.clone());
    let config = dataset(COPY_TRANSFORM, "glue");

    let error = hooks(&backends, registry, 2)
        .run(&config, &payload(PipelineStage::StageB, "prefix-dl-stage", &["k"]))
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        PipelineError::Transform {
            source: TransformError::JobTimedOut { attempts: 2, .. },
            ..
        }
    ));
    assert_eq!(job.checks(), 2);
    assert_eq!(
        backends.registry.executions()[0].status,
        ExecutionStatus::Failed
    );
}

#[tokio::test]
async fn unregistered_transform_records_nothing() {
    let backends = backends().await;
    let registry = TransformRegistry::with_builtins(Arc::new(backends.storage.clone()));
    let config = dataset("spark", COPY_TRANSFORM);

    let error = hooks(&backends, registry, 3)
        .run(&config, &payload(PipelineStage::StageA, "prefix-raw-bucket", &["k"]))
        .await
        .unwrap_err();

    assert!(matches!(error, PipelineError::Lookup(_)));
    assert!(backends.registry.executions().is_empty());
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sdlf_core::queue::{OutgoingMessage, MAX_SEND_BATCH};
use sdlf_core::{
    BatchPayload, DatasetConfig, ExecutionTracker, JobStatus, ObjectMetadataRecord,
    PipelineError, PipelineStage, ProcessedKeys, Services, StageMessage, TrackerError, Transform,
    TransformError, TransformOutput, TransformRequest,
};

use crate::metrics_consts::{
    EXECUTIONS_FAILED, EXECUTIONS_SUCCEEDED, JOB_POLLS, NEXT_STAGE_MESSAGES,
};
use crate::transforms::TransformRegistry;

pub const PREUPDATE: &str = "Preupdate";
pub const PROCESS: &str = "Process";
pub const CHECK_JOB: &str = "CheckJob";
pub const POSTUPDATE: &str = "Postupdate";

/// Runs one stage over a batch: execution record, transform, metadata and the handoff to
/// the next stage.
///
/// Light stages run the transform once per key, each key with its own execution. Heavy stages
/// run it once for the whole batch, then poll the job it started until it is terminal.
pub struct StageHooks {
    services: Services,
    transforms: Arc<TransformRegistry>,
    job_poll_interval: Duration,
    max_poll_attempts: u32,
}

impl StageHooks {
    pub fn new(
        services: Services,
        transforms: Arc<TransformRegistry>,
        job_poll_interval: Duration,
        max_poll_attempts: u32,
    ) -> Self {
        Self {
            services,
            transforms,
            job_poll_interval,
            max_poll_attempts,
        }
    }

    /// Returns the ids of the executions recorded for the batch.
    pub async fn run(
        &self,
        config: &DatasetConfig,
        payload: &BatchPayload,
    ) -> Result<Vec<Uuid>, PipelineError> {
        self.execute(config, payload).await.map_err(|f| f.error)
    }

    /// Like `run`, but a failure also names the keys the run did not get to.
    pub async fn execute(
        &self,
        config: &DatasetConfig,
        payload: &BatchPayload,
    ) -> Result<Vec<Uuid>, RunFailure> {
        if payload.pipeline_stage.is_heavy() {
            self.run_heavy(config, payload)
                .await
                .map(|id| vec![id])
                .map_err(|error| RunFailure::whole_batch(error, payload))
        } else {
            self.run_light(config, payload).await
        }
    }

    /// Stops at the first failing key. Keys before it keep their SUCCEEDED executions and
    /// are left out of the failure's unprocessed keys.
    async fn run_light(
        &self,
        config: &DatasetConfig,
        payload: &BatchPayload,
    ) -> Result<Vec<Uuid>, RunFailure> {
        let stage = payload.pipeline_stage;
        let transform = self
            .transforms
            .for_stage(config, stage)
            .map_err(|error| RunFailure::whole_batch(error, payload))?;

        let mut executions = Vec::with_capacity(payload.keys_to_process.len());
        for (index, message) in payload.messages().iter().enumerate() {
            match self.run_key(transform.as_ref(), payload, message).await {
                Ok(peh_id) => executions.push(peh_id),
                Err(error) => {
                    return Err(RunFailure {
                        error,
                        unprocessed: payload.keys_to_process[index..].to_vec(),
                    })
                }
            }
        }
        Ok(executions)
    }

    async fn run_key(
        &self,
        transform: &dyn Transform,
        payload: &BatchPayload,
        message: &StageMessage,
    ) -> Result<Uuid, PipelineError> {
        let stage = payload.pipeline_stage;
        let message = self.pre_update(message).await?;
        let peh_id = message.peh_id.ok_or(TrackerError::NotAttached)?;

        let mut request = self.request(payload);
        request.keys = message.keys().map(str::to_owned).collect();

        let output = match transform.transform_object(&request).await {
            Ok(output) => output,
            Err(e) => {
                let error = transform_error(stage, PROCESS, e);
                return Err(self.failed(peh_id, stage, PROCESS, error).await);
            }
        };

        if let Err(e) = self.post_update(peh_id, payload, &request, &output).await {
            return Err(self.failed(peh_id, stage, POSTUPDATE, e).await);
        }
        Ok(peh_id)
    }

    async fn run_heavy(
        &self,
        config: &DatasetConfig,
        payload: &BatchPayload,
    ) -> Result<Uuid, PipelineError> {
        let stage = payload.pipeline_stage;
        let transform = self.transforms.for_stage(config, stage)?;

        let name = pipeline_name(&payload.team, &payload.pipeline, stage);
        let peh_id = self.services.tracker().start(&name, None).await?;

        let request = self.request(payload);
        let output = match transform.transform_object(&request).await {
            Ok(output) => output,
            Err(e) => {
                let error = transform_error(stage, PROCESS, e);
                return Err(self.failed(peh_id, stage, PROCESS, error).await);
            }
        };

        let output = match self.wait_for_job(transform.as_ref(), &request, output).await {
            Ok(output) => output,
            Err(e) => {
                let error = transform_error(stage, CHECK_JOB, e);
                return Err(self.failed(peh_id, stage, CHECK_JOB, error).await);
            }
        };

        if let Err(e) = self.post_update(peh_id, payload, &request, &output).await {
            return Err(self.failed(peh_id, stage, POSTUPDATE, e).await);
        }
        Ok(peh_id)
    }

    /// Starts the execution, records the object as it entered the stage and returns the
    /// message with the execution id the rest of the stage attaches to.
    pub async fn pre_update(&self, message: &StageMessage) -> Result<StageMessage, PipelineError> {
        let peh_id = self
            .services
            .tracker()
            .start(
                &pipeline_name(&message.team, &message.pipeline, message.pipeline_stage),
                None,
            )
            .await?;

        for key in message.keys() {
            let record = ObjectMetadataRecord {
                bucket: message.bucket.clone(),
                key: key.to_owned(),
                size: None,
                last_modified: None,
                team: message.team.clone(),
                pipeline: message.pipeline.clone(),
                dataset: message.dataset.clone(),
                pipeline_stage: message.pipeline_stage,
                peh_id: Some(peh_id),
                recorded_at: Utc::now(),
            };
            if let Err(e) = self.services.object_metadata.append(&record).await {
                return Err(self
                    .failed(peh_id, message.pipeline_stage, PREUPDATE, e.into())
                    .await);
            }
        }

        debug!(execution_id = %peh_id, bucket = %message.bucket, "pre-update done");
        Ok(StageMessage {
            peh_id: Some(peh_id),
            ..message.clone()
        })
    }

    /// Records every processed object, hands the keys to the next stage and ends the execution.
    async fn post_update(
        &self,
        peh_id: Uuid,
        payload: &BatchPayload,
        request: &TransformRequest,
        output: &TransformOutput,
    ) -> Result<(), PipelineError> {
        let mut tracker = self.attach(peh_id).await?;
        let stage = payload.pipeline_stage;
        let bucket = request.output_bucket.as_str();
        let keys = match &output.processed_keys {
            ProcessedKeys::Keys(keys) => keys.clone(),
            ProcessedKeys::Prefix(prefix) => self.services.storage.list(bucket, prefix).await?,
        };

        for key in &keys {
            let record = ObjectMetadataRecord {
                bucket: bucket.to_owned(),
                key: key.clone(),
                size: Some(self.services.storage.size(bucket, key).await?),
                last_modified: Some(self.services.storage.last_modified(bucket, key).await?),
                team: payload.team.clone(),
                pipeline: payload.pipeline.clone(),
                dataset: payload.dataset.clone(),
                pipeline_stage: stage,
                peh_id: Some(peh_id),
                recorded_at: Utc::now(),
            };
            self.services.object_metadata.append(&record).await?;
        }

        if let Some(next) = stage.next() {
            self.send_to_next_stage(payload, next, bucket, &keys, peh_id)
                .await?;
        }

        tracker.update(stage.as_str(), POSTUPDATE).await?;
        tracker.end_success().await?;

        common_metrics::inc(
            EXECUTIONS_SUCCEEDED,
            &common_metrics::stage_labels(&payload.team, &payload.dataset, stage.as_str()),
            1,
        );
        info!(
            execution_id = %peh_id,
            pipeline = %pipeline_name(&payload.team, &payload.pipeline, stage),
            keys = keys.len(),
            "stage execution succeeded"
        );
        Ok(())
    }

    async fn attach(&self, peh_id: Uuid) -> Result<ExecutionTracker, TrackerError> {
        let mut tracker = self.services.tracker();
        tracker.retrieve(peh_id).await?;
        Ok(tracker)
    }

    async fn send_to_next_stage(
        &self,
        payload: &BatchPayload,
        next: PipelineStage,
        bucket: &str,
        keys: &[String],
        peh_id: Uuid,
    ) -> Result<(), PipelineError> {
        let queue = self
            .services
            .naming
            .queue(&payload.team, &payload.pipeline, next);
        let group = payload.ordering_key();

        for chunk in keys.chunks(MAX_SEND_BATCH) {
            let mut messages = Vec::with_capacity(chunk.len());
            for key in chunk {
                let message = StageMessage {
                    bucket: bucket.to_owned(),
                    key: Some(key.clone()),
                    keys_to_process: vec![],
                    team: payload.team.clone(),
                    dataset: payload.dataset.clone(),
                    pipeline: payload.pipeline.clone(),
                    pipeline_stage: next,
                    env: payload.env.clone(),
                    // Replaced by the next stage's own execution in its pre-update
                    peh_id: Some(peh_id),
                };
                messages.push(OutgoingMessage::new(
                    serde_json::to_string(&message)?,
                    &group,
                ));
            }

            self.services
                .queues
                .send_batch(&queue, messages)
                .await
                .map_err(|e| PipelineError::enqueue(&queue, e))?;
        }

        common_metrics::inc(
            NEXT_STAGE_MESSAGES,
            &[("queue".to_string(), queue.clone())],
            keys.len() as u64,
        );
        debug!(queue = %queue, keys = keys.len(), "handed keys to next stage");
        Ok(())
    }

    /// Polls the transform's job until it reports a terminal status.
    async fn wait_for_job(
        &self,
        transform: &dyn Transform,
        request: &TransformRequest,
        mut output: TransformOutput,
    ) -> Result<TransformOutput, TransformError> {
        let mut attempts = 0;
        loop {
            let Some(details) = &output.job_details else {
                return Ok(output);
            };
            let (status, job_name) = (details.job_status, details.job_name.clone());

            match status {
                JobStatus::Succeeded => return Ok(output),
                JobStatus::Failed => return Err(TransformError::JobFailed { job_name }),
                JobStatus::Started | JobStatus::Running => {}
            }
            if attempts >= self.max_poll_attempts {
                return Err(TransformError::JobTimedOut { job_name, attempts });
            }

            attempts += 1;
            common_metrics::inc(JOB_POLLS, &[("job".to_string(), job_name.clone())], 1);
            debug!(job = %job_name, attempts, status = ?status, "job still running");
            tokio::time::sleep(self.job_poll_interval).await;
            output = transform.check_job_status(request, output).await?;
        }
    }

    /// Marks the execution FAILED with the component and error, and returns the error to raise.
    async fn failed(
        &self,
        peh_id: Uuid,
        stage: PipelineStage,
        component: &str,
        error: PipelineError,
    ) -> PipelineError {
        let comment = match &error {
            PipelineError::Transform { .. } => error.to_string(),
            other => format!("{stage} {component} Error: {other}"),
        };

        let recorded = match self.attach(peh_id).await {
            Ok(mut tracker) => tracker.end_failed(component, &comment).await,
            Err(e) => Err(e),
        };
        if let Err(e) = recorded {
            warn!(execution_id = %peh_id, error = %e, "could not record failure");
        }
        common_metrics::inc(
            EXECUTIONS_FAILED,
            &[
                ("stage".to_string(), stage.to_string()),
                ("component".to_string(), component.to_string()),
            ],
            1,
        );
        warn!(execution_id = %peh_id, %comment, "stage execution failed");
        error
    }

    fn request(&self, payload: &BatchPayload) -> TransformRequest {
        TransformRequest {
            resource_prefix: self.services.naming.prefix().to_owned(),
            bucket: payload.bucket.clone(),
            keys: payload.keys_to_process.clone(),
            team: payload.team.clone(),
            dataset: payload.dataset.clone(),
            stage: payload.pipeline_stage,
            output_bucket: self
                .services
                .buckets
                .output_for(payload.pipeline_stage)
                .to_owned(),
        }
    }
}

/// A failed stage run.
#[derive(Debug)]
pub struct RunFailure {
    pub error: PipelineError,
    /// Keys of the payload without a successful execution, in payload order.
    pub unprocessed: Vec<String>,
}

impl RunFailure {
    fn whole_batch(error: PipelineError, payload: &BatchPayload) -> Self {
        Self {
            error,
            unprocessed: payload.keys_to_process.clone(),
        }
    }
}

/// Execution records are named `team-pipeline-stage`.
fn pipeline_name(team: &str, pipeline: &str, stage: PipelineStage) -> String {
    format!("{team}-{pipeline}-{stage}")
}

fn transform_error(stage: PipelineStage, component: &str, source: TransformError) -> PipelineError {
    PipelineError::Transform {
        stage: stage.to_string(),
        component: component.to_owned(),
        source,
    }
}

use std::collections::HashSet;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sdlf_core::queue::{OutgoingMessage, ReceivedMessage};
use sdlf_core::{
    BatchPayload, DatasetConfig, PipelineError, PipelineStage, Services, StageMessage,
    StageResources,
};

use crate::metrics_consts::{
    BATCHES_STARTED, BATCH_BELOW_THRESHOLD, BATCH_ERRORS, BATCH_KEYS, BATCH_POLLS, BATCH_TIME,
    DLQ_WRITES, DLQ_WRITE_ERRORS,
};

/// Ordering key of every message written to a stage DLQ.
pub const DLQ_ORDERING_KEY: &str = "failed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Not enough distinct messages. Nothing was started or deleted, the pulled messages come
    /// back once their visibility timeout expires.
    BelowThreshold { pulled: usize, min_items: u32 },
    /// One workflow run per source bucket, and the pulled messages deleted.
    Started { runs: Vec<Uuid>, keys: usize },
}

/// What one poll of a stage queue collected.
#[derive(Default)]
struct Pulled {
    /// Every received message, duplicates included, so all of them can be deleted.
    received: Vec<ReceivedMessage>,
    /// Distinct parsable bodies, in receive order.
    messages: Vec<StageMessage>,
}

/// Accumulates stage queue messages into batches and hands them to the stage workflow.
pub struct BatchRouter {
    services: Services,
}

impl BatchRouter {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn route_batch(
        &self,
        team: &str,
        dataset: &str,
        stage: PipelineStage,
    ) -> Result<BatchOutcome, PipelineError> {
        let labels = common_metrics::stage_labels(team, dataset, stage.as_str());
        let _timing = common_metrics::timing_guard(BATCH_TIME, &labels);
        common_metrics::inc(BATCH_POLLS, &labels, 1);

        let result = self.route_batch_inner(team, dataset, stage).await;
        match &result {
            Ok(BatchOutcome::BelowThreshold { .. }) => {
                common_metrics::inc(BATCH_BELOW_THRESHOLD, &labels, 1)
            }
            Ok(BatchOutcome::Started { runs, keys }) => {
                common_metrics::inc(BATCHES_STARTED, &labels, runs.len() as u64);
                common_metrics::inc(BATCH_KEYS, &labels, *keys as u64);
            }
            Err(e) => {
                error!(team, dataset, %stage, error = %e, "batch routing failed");
                common_metrics::inc(BATCH_ERRORS, &labels, 1);
            }
        }
        result
    }

    /// One `route_batch` per configured dataset and stage. A failing dataset is logged and
    /// counted, and does not stop the sweep. Returns the number of runs started.
    pub async fn route_all(&self) -> Result<usize, PipelineError> {
        let datasets = self.services.datasets.list_datasets().await?;
        let mut started = 0;
        for config in &datasets {
            for stage in PipelineStage::ALL {
                if let Ok(BatchOutcome::Started { runs, .. }) =
                    self.route_batch(&config.team, &config.dataset, stage).await
                {
                    started += runs.len();
                }
            }
        }
        Ok(started)
    }

    async fn route_batch_inner(
        &self,
        team: &str,
        dataset: &str,
        stage: PipelineStage,
    ) -> Result<BatchOutcome, PipelineError> {
        let config = self
            .services
            .datasets
            .get_dataset(team, dataset)
            .await?
            .ok_or_else(|| {
                PipelineError::Lookup(format!("no dataset config for {team}-{dataset}"))
            })?;
        let resources = self
            .services
            .naming
            .stage_resources(team, &config.pipeline, stage);
        let min_items = config.min_items(stage);
        let max_items = config.max_items(stage) as usize;

        let pulled = self.pull(&config, &resources, max_items).await?;
        if pulled.messages.is_empty() || pulled.messages.len() < min_items as usize {
            debug!(
                queue = %resources.queue,
                pulled = pulled.messages.len(),
                min_items,
                "not enough messages for a batch"
            );
            return Ok(BatchOutcome::BelowThreshold {
                pulled: pulled.messages.len(),
                min_items,
            });
        }

        let payloads = self.build_payloads(&config, stage, &pulled.messages);
        let keys = payloads.iter().map(|p| p.keys_to_process.len()).sum();

        let mut runs = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.iter().enumerate() {
            let started = match serde_json::to_value(payload) {
                Ok(input) => self
                    .services
                    .workflows
                    .start(&resources.workflow, input)
                    .await
                    .map_err(PipelineError::from),
                Err(e) => Err(e.into()),
            };

            match started {
                Ok(run) => {
                    info!(
                        workflow = %resources.workflow,
                        run_id = %run,
                        keys = payload.keys_to_process.len(),
                        "started stage workflow"
                    );
                    runs.push(run);
                }
                Err(e) => {
                    // Runs already started stay started, only the rest is dead lettered
                    if self
                        .dead_letter(&resources.dead_letter_queue, &payloads[index..])
                        .await
                    {
                        self.delete_all(&resources.queue, &pulled.received).await;
                    }
                    return Err(e);
                }
            }
        }

        self.delete_all(&resources.queue, &pulled.received).await;
        Ok(BatchOutcome::Started { runs, keys })
    }

    /// Reads up to `max_items` distinct bodies from the dataset's group without deleting them.
    async fn pull(
        &self,
        config: &DatasetConfig,
        resources: &StageResources,
        max_items: usize,
    ) -> Result<Pulled, PipelineError> {
        let group = config.name();
        let mut pulled = Pulled::default();
        let mut seen = HashSet::new();

        while pulled.messages.len() < max_items {
            let received = self
                .services
                .queues
                .receive(
                    &resources.queue,
                    Some(&group),
                    max_items - pulled.messages.len(),
                )
                .await?;
            if received.is_empty() {
                break;
            }

            for message in received {
                if seen.insert(message.body.clone()) {
                    match serde_json::from_str::<StageMessage>(&message.body) {
                        Ok(parsed) => pulled.messages.push(parsed),
                        Err(e) => {
                            self.quarantine(resources, &message, e).await;
                            continue;
                        }
                    }
                }
                pulled.received.push(message);
            }
        }

        Ok(pulled)
    }

    /// Moves an unparsable body to the DLQ as is, and out of the stage queue.
    async fn quarantine(
        &self,
        resources: &StageResources,
        message: &ReceivedMessage,
        error: serde_json::Error,
    ) {
        warn!(queue = %resources.queue, message_id = message.id, %error, "unparsable stage message");
        let outgoing = OutgoingMessage::new(message.body.clone(), DLQ_ORDERING_KEY);
        match self
            .services
            .queues
            .send(&resources.dead_letter_queue, outgoing)
            .await
        {
            Ok(()) => self.delete_all(&resources.queue, std::slice::from_ref(message)).await,
            Err(e) => {
                error!(queue = %resources.dead_letter_queue, error = %e, "failed to quarantine message")
            }
        }
    }

    /// One payload per source bucket, keys deduplicated and in receive order.
    fn build_payloads(
        &self,
        config: &DatasetConfig,
        stage: PipelineStage,
        messages: &[StageMessage],
    ) -> Vec<BatchPayload> {
        let mut payloads: Vec<BatchPayload> = Vec::new();
        let mut seen = HashSet::new();

        for message in messages {
            for key in message.keys() {
                if !seen.insert((message.bucket.as_str(), key)) {
                    continue;
                }
                let position = match payloads.iter().position(|p| p.bucket == message.bucket) {
                    Some(position) => position,
                    None => {
                        payloads.push(BatchPayload {
                            bucket: message.bucket.clone(),
                            keys_to_process: vec![],
                            team: config.team.clone(),
                            pipeline: config.pipeline.clone(),
                            pipeline_stage: stage,
                            dataset: config.dataset.clone(),
                            env: self.services.env.clone(),
                        });
                        payloads.len() - 1
                    }
                };
                payloads[position].keys_to_process.push(key.to_owned());
            }
        }

        payloads
    }

    /// Best effort. Returns whether every payload reached the DLQ.
    async fn dead_letter(&self, dlq: &str, payloads: &[BatchPayload]) -> bool {
        let mut written = true;
        for payload in payloads {
            let result = match serde_json::to_string(payload) {
                Ok(body) => self
                    .services
                    .queues
                    .send(dlq, OutgoingMessage::new(body, DLQ_ORDERING_KEY))
                    .await
                    .map_err(PipelineError::from),
                Err(e) => Err(e.into()),
            };

            let labels = [("queue".to_string(), dlq.to_string())];
            match result {
                Ok(()) => {
                    warn!(queue = dlq, keys = payload.keys_to_process.len(), "batch written to DLQ");
                    common_metrics::inc(DLQ_WRITES, &labels, 1);
                }
                Err(e) => {
                    error!(queue = dlq, error = %e, "failed to write batch to DLQ");
                    common_metrics::inc(DLQ_WRITE_ERRORS, &labels, 1);
                    written = false;
                }
            }
        }
        written
    }

    async fn delete_all(&self, queue: &str, messages: &[ReceivedMessage]) {
        for message in messages {
            if let Err(e) = self
                .services
                .queues
                .delete(queue, &message.receipt_handle)
                .await
            {
                // The message comes back after its visibility timeout and is batched again
                warn!(queue, message_id = message.id, error = %e, "failed to delete message");
            }
        }
    }
}

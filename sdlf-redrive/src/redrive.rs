use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use sdlf_core::queue::{OutgoingMessage, QueueService};
use sdlf_core::registry::DatasetStore;
use sdlf_core::workflow::WorkflowService;
use sdlf_core::{
    ordering_key, BatchPayload, MockBackends, PipelineError, PipelineStage, ResourceNaming,
};

use crate::metrics_consts::{
    DISCARDED, DLQ_DEPTH, REDRIVEN, REDRIVE_ERRORS, RUN_ENDS, RUN_STARTS, RUN_TIME,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedriveOutcome {
    /// Nothing visible in the DLQ.
    Empty,
    /// Light stage: the body is back on the stage queue.
    Requeued { queue: String },
    /// Heavy stage: the batch was started again as a workflow run.
    Restarted { workflow: String, run_id: Uuid },
    /// The body could not be routed anywhere and was deleted from the DLQ.
    Discarded { message_id: i64, reason: String },
}

impl RedriveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedriveOutcome::Empty => "empty",
            RedriveOutcome::Requeued { .. } => "requeued",
            RedriveOutcome::Restarted { .. } => "restarted",
            RedriveOutcome::Discarded { .. } => "discarded",
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RedriveReport {
    pub redriven: u64,
    pub empty: u64,
    pub discarded: u64,
    pub failed: u64,
}

/// The fields a light stage body needs to find its ordering key again.
#[derive(Deserialize)]
struct Group {
    team: String,
    dataset: String,
}

enum Target {
    Workflow(BatchPayload),
    Queue(Group),
}

/// Moves messages out of the stage DLQs and back into their pipeline, one per DLQ and run.
pub struct Redrive {
    queues: Arc<dyn QueueService>,
    workflows: Arc<dyn WorkflowService>,
    datasets: Arc<dyn DatasetStore>,
    naming: ResourceNaming,
}

impl Redrive {
    pub fn new(
        queues: Arc<dyn QueueService>,
        workflows: Arc<dyn WorkflowService>,
        datasets: Arc<dyn DatasetStore>,
        naming: ResourceNaming,
    ) -> Self {
        Self {
            queues,
            workflows,
            datasets,
            naming,
        }
    }

    /// Wired to the in-memory backends.
    pub fn from_mocks(backends: &MockBackends) -> Self {
        Self::new(
            Arc::new(backends.queues.clone()),
            Arc::new(backends.workflows.clone()),
            Arc::new(backends.registry.clone()),
            backends.naming.clone(),
        )
    }

    pub async fn redrive_once(
        &self,
        team: &str,
        pipeline: &str,
        stage: PipelineStage,
    ) -> Result<RedriveOutcome, PipelineError> {
        let dlq = self.naming.dead_letter_queue(team, pipeline, stage);
        let Some(message) = self.queues.receive(&dlq, None, 1).await?.into_iter().next() else {
            debug!(queue = %dlq, "DLQ is empty");
            return Ok(RedriveOutcome::Empty);
        };

        let target = match parse_target(stage, &message.body) {
            Ok(target) => target,
            Err(reason) => {
                // Left in place it would be received first on every later call
                self.queues.delete(&dlq, &message.receipt_handle).await?;
                error!(
                    queue = %dlq,
                    message_id = message.id,
                    body = %message.body,
                    %reason,
                    "discarded unroutable DLQ message"
                );
                common_metrics::inc(
                    DISCARDED,
                    &[("queue".to_string(), dlq.clone())],
                    1,
                );
                return Ok(RedriveOutcome::Discarded {
                    message_id: message.id,
                    reason,
                });
            }
        };

        // A failure below leaves the message in the DLQ, visible again after its timeout
        let outcome = match target {
            Target::Workflow(payload) => {
                let workflow = self.naming.workflow(team, pipeline, stage);
                let run_id = self
                    .workflows
                    .start(&workflow, serde_json::to_value(&payload)?)
                    .await?;
                RedriveOutcome::Restarted { workflow, run_id }
            }
            Target::Queue(group) => {
                let queue = self.naming.queue(team, pipeline, stage);
                self.queues
                    .send(
                        &queue,
                        OutgoingMessage::new(
                            message.body.clone(),
                            &ordering_key(&group.team, &group.dataset),
                        ),
                    )
                    .await
                    .map_err(|e| PipelineError::enqueue(&queue, e))?;
                RedriveOutcome::Requeued { queue }
            }
        };

        self.queues.delete(&dlq, &message.receipt_handle).await?;
        info!(queue = %dlq, message_id = message.id, outcome = ?outcome, "redrove DLQ message");
        Ok(outcome)
    }

    /// Redrives one message per stage of every configured (team, pipeline). Discarded
    /// messages do not count, so a stage keeps going until something is redriven or its DLQ
    /// is empty.
    pub async fn run_once(&self) -> Result<RedriveReport, PipelineError> {
        info!("Running redrive loop");
        let _loop_start = common_metrics::timing_guard(RUN_TIME, &[]);
        common_metrics::inc(RUN_STARTS, &[], 1);

        let pipelines: BTreeSet<(String, String)> = self
            .datasets
            .list_datasets()
            .await?
            .into_iter()
            .map(|config| (config.team, config.pipeline))
            .collect();

        let mut report = RedriveReport::default();
        for (team, pipeline) in &pipelines {
            for stage in PipelineStage::ALL {
                let labels = vec![
                    ("team".to_string(), team.clone()),
                    ("pipeline".to_string(), pipeline.clone()),
                    ("stage".to_string(), stage.to_string()),
                ];

                let dlq = self.naming.dead_letter_queue(team, pipeline, stage);
                match self.queues.depth(&dlq).await {
                    Ok(depth) => common_metrics::gauge(DLQ_DEPTH, &labels, depth as f64),
                    Err(e) => warn!(queue = %dlq, error = %e, "could not read DLQ depth"),
                }

                loop {
                    match self.redrive_once(team, pipeline, stage).await {
                        Ok(RedriveOutcome::Discarded { .. }) => {
                            report.discarded += 1;
                            continue;
                        }
                        Ok(RedriveOutcome::Empty) => report.empty += 1,
                        Ok(_) => {
                            report.redriven += 1;
                            common_metrics::inc(REDRIVEN, &labels, 1);
                        }
                        Err(e) => {
                            error!(queue = %dlq, error = %e, "redrive failed");
                            report.failed += 1;
                            common_metrics::inc(REDRIVE_ERRORS, &labels, 1);
                        }
                    }
                    break;
                }
            }
        }

        common_metrics::inc(RUN_ENDS, &[], 1);
        info!(
            redriven = report.redriven,
            discarded = report.discarded,
            failed = report.failed,
            "Redrive loop complete"
        );
        Ok(report)
    }
}

fn parse_target(stage: PipelineStage, body: &str) -> Result<Target, String> {
    if stage.is_heavy() {
        serde_json::from_str(body)
            .map(Target::Workflow)
            .map_err(|e| format!("not a batch payload: {e}"))
    } else {
        serde_json::from_str(body)
            .map(Target::Queue)
            .map_err(|e| format!("no team and dataset to group by: {e}"))
    }
}

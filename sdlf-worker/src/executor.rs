use std::sync::Arc;

use chrono::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use sdlf_core::queue::OutgoingMessage;
use sdlf_core::workflow::{RunState, WorkflowRun, WorkflowRunSource};
use sdlf_core::{BatchPayload, PipelineError, Services};

use crate::batch::DLQ_ORDERING_KEY;
use crate::hooks::{RunFailure, StageHooks};
use crate::metrics_consts::{
    DLQ_WRITES, DLQ_WRITE_ERRORS, RUNS_CLAIMED, RUNS_RESET, RUNS_STALLED, RUN_FINISH_ERRORS,
    RUN_TIME,
};

// The executor reports its own metrics, this is mostly for tests
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecutorReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StalledReport {
    pub reset: u64,
    pub failed: usize,
}

/// Executes the stage workflow runs started by the batch router.
pub struct WorkflowExecutor {
    services: Services,
    runs: Arc<dyn WorkflowRunSource>,
    hooks: StageHooks,
}

impl WorkflowExecutor {
    pub fn new(services: Services, runs: Arc<dyn WorkflowRunSource>, hooks: StageHooks) -> Self {
        Self {
            services,
            runs,
            hooks,
        }
    }

    /// Claims up to `max` pending runs and executes them one after the other. A failed run
    /// has the keys it did not process written to the stage DLQ, where the redrive loop picks
    /// them up.
    pub async fn run_once(&self, max: usize) -> Result<ExecutorReport, PipelineError> {
        let _timing = common_metrics::timing_guard(RUN_TIME, &[]);
        let claimed = self.runs.claim(max).await?;
        common_metrics::inc(RUNS_CLAIMED, &[], claimed.len() as u64);

        let mut report = ExecutorReport {
            claimed: claimed.len(),
            ..Default::default()
        };

        for run in claimed {
            let payload: BatchPayload = match serde_json::from_value(run.input.clone()) {
                Ok(payload) => payload,
                Err(e) => {
                    // Names no stage, so there is no DLQ to send it to
                    error!(run_id = %run.id, error = %e, "run input is not a batch, dropping it");
                    self.finish(&run, RunState::Failed).await;
                    report.failed += 1;
                    continue;
                }
            };

            match self.execute(&payload).await {
                Ok(executions) => {
                    info!(
                        run_id = %run.id,
                        workflow = %run.workflow_name,
                        executions = executions.len(),
                        "workflow run succeeded"
                    );
                    self.finish(&run, RunState::Succeeded).await;
                    report.succeeded += 1;
                }
                Err(failure) => {
                    error!(
                        run_id = %run.id,
                        workflow = %run.workflow_name,
                        error = %failure.error,
                        unprocessed = failure.unprocessed.len(),
                        "workflow run failed"
                    );
                    let remaining = BatchPayload {
                        keys_to_process: failure.unprocessed,
                        ..payload
                    };
                    self.dead_letter(run.id, &remaining).await;
                    self.finish(&run, RunState::Failed).await;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Returns runs whose worker went away to the queue, or fails them into the stage DLQ
    /// once they used up their attempts.
    pub async fn recover_stalled(
        &self,
        timeout: Duration,
        max_attempts: i32,
    ) -> Result<StalledReport, PipelineError> {
        let stalled = self.runs.fail_stalled(timeout, max_attempts).await?;
        common_metrics::inc(RUNS_STALLED, &[], stalled.len() as u64);
        for run in &stalled {
            warn!(run_id = %run.id, attempts = run.attempt, "stalled run out of attempts");
            match serde_json::from_value::<BatchPayload>(run.input.clone()) {
                Ok(payload) => self.dead_letter(run.id, &payload).await,
                Err(e) => warn!(run_id = %run.id, error = %e, "run input is not a batch, dropping it"),
            }
        }

        let reset = self.runs.reset_stalled(timeout, max_attempts).await?;
        common_metrics::inc(RUNS_RESET, &[], reset);
        if reset > 0 {
            warn!("Reset {} stalled runs", reset);
        }

        Ok(StalledReport {
            reset,
            failed: stalled.len(),
        })
    }

    async fn execute(&self, payload: &BatchPayload) -> Result<Vec<Uuid>, RunFailure> {
        let config = match self
            .services
            .datasets
            .get_dataset(&payload.team, &payload.dataset)
            .await
        {
            Ok(Some(config)) => config,
            Ok(None) => {
                return Err(RunFailure {
                    error: PipelineError::Lookup(format!(
                        "no dataset config for {}",
                        payload.ordering_key()
                    )),
                    unprocessed: payload.keys_to_process.clone(),
                })
            }
            Err(e) => {
                return Err(RunFailure {
                    error: e.into(),
                    unprocessed: payload.keys_to_process.clone(),
                })
            }
        };

        self.hooks.execute(&config, payload).await
    }

    // A failed finish leaves the run running, the stall sweep picks it up later
    async fn finish(&self, run: &WorkflowRun, state: RunState) {
        if let Err(e) = self.runs.finish(run.id, state).await {
            error!(run_id = %run.id, state = %state, error = %e, "could not finish workflow run");
            common_metrics::inc(RUN_FINISH_ERRORS, &[], 1);
        }
    }

    /// Best effort, a failed write is logged and counted.
    async fn dead_letter(&self, run_id: Uuid, payload: &BatchPayload) {
        let dlq = self.services.naming.dead_letter_queue(
            &payload.team,
            &payload.pipeline,
            payload.pipeline_stage,
        );
        let labels = [("queue".to_string(), dlq.clone())];
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "could not serialize run input");
                common_metrics::inc(DLQ_WRITE_ERRORS, &labels, 1);
                return;
            }
        };

        match self
            .services
            .queues
            .send(&dlq, OutgoingMessage::new(body, DLQ_ORDERING_KEY))
            .await
        {
            Ok(()) => {
                warn!(run_id = %run_id, queue = %dlq, keys = payload.keys_to_process.len(), "run input written to DLQ");
                common_metrics::inc(DLQ_WRITES, &labels, 1);
            }
            Err(e) => {
                error!(run_id = %run_id, queue = %dlq, error = %e, "failed to write run input to DLQ");
                common_metrics::inc(DLQ_WRITE_ERRORS, &labels, 1);
            }
        }
    }
}

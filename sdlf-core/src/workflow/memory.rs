use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::{RunState, WorkflowRun, WorkflowRunSource, WorkflowService};
use crate::error::WorkflowError;

#[derive(Default)]
struct State {
    runs: Vec<WorkflowRun>,
    rejecting: bool,
    clock_offset: Duration,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    fn stalled(&mut self, timeout: Duration) -> impl Iterator<Item = &mut WorkflowRun> + '_ {
        let deadline = self.now() - timeout;
        self.runs.iter_mut().filter(move |run| {
            run.state == RunState::Running && run.started_at.map_or(true, |at| at <= deadline)
        })
    }
}

/// In-memory workflow service. Records every start, and can be switched to reject starts.
#[derive(Clone, Default)]
pub struct MockWorkflowService {
    state: Arc<Mutex<State>>,
}

impl MockWorkflowService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Moves the clock used for claim times and stall checks forward.
    pub fn advance(&self, by: Duration) {
        self.lock().clock_offset += by;
    }

    pub fn reject_starts(&self) {
        self.lock().rejecting = true;
    }

    /// Every run started so far, in start order.
    pub fn runs(&self) -> Vec<WorkflowRun> {
        self.lock().runs.clone()
    }

    pub fn run(&self, id: Uuid) -> Option<WorkflowRun> {
        self.lock().runs.iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl WorkflowService for MockWorkflowService {
    async fn start(&self, workflow_name: &str, input: Value) -> Result<Uuid, WorkflowError> {
        let mut state = self.lock();
        if state.rejecting {
            return Err(WorkflowError::StartRejected(workflow_name.to_owned()));
        }
        let id = Uuid::now_v7();
        let now = state.now();
        state.runs.push(WorkflowRun {
            id,
            workflow_name: workflow_name.to_owned(),
            input,
            state: RunState::Pending,
            attempt: 0,
            created_at: now,
            started_at: None,
        });
        Ok(id)
    }
}

#[async_trait]
impl WorkflowRunSource for MockWorkflowService {
    async fn claim(&self, max: usize) -> Result<Vec<WorkflowRun>, WorkflowError> {
        let mut state = self.lock();
        let now = state.now();
        let mut claimed = Vec::new();
        for run in state
            .runs
            .iter_mut()
            .filter(|r| r.state == RunState::Pending)
            .take(max)
        {
            run.state = RunState::Running;
            run.attempt += 1;
            run.started_at = Some(now);
            claimed.push(run.clone());
        }
        Ok(claimed)
    }

    async fn finish(&self, id: Uuid, new_state: RunState) -> Result<(), WorkflowError> {
        let mut state = self.lock();
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(WorkflowError::RunNotFound(id))?;
        run.state = new_state;
        Ok(())
    }

    async fn reset_stalled(
        &self,
        timeout: Duration,
        max_attempts: i32,
    ) -> Result<u64, WorkflowError> {
        let mut state = self.lock();
        let mut reset = 0;
        for run in state.stalled(timeout).filter(|r| r.attempt < max_attempts) {
            run.state = RunState::Pending;
            run.started_at = None;
            reset += 1;
        }
        Ok(reset)
    }

    async fn fail_stalled(
        &self,
        timeout: Duration,
        max_attempts: i32,
    ) -> Result<Vec<WorkflowRun>, WorkflowError> {
        let mut state = self.lock();
        let mut failed = Vec::new();
        for run in state.stalled(timeout).filter(|r| r.attempt >= max_attempts) {
            run.state = RunState::Failed;
            failed.push(run.clone());
        }
        Ok(failed)
    }
}

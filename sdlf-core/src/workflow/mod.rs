//! Stage workflow executions.
//!
//! Starting is fire-and-forget: the caller gets a run id back and never waits for the run.
//! Runs are picked up by the stage worker through `WorkflowRunSource`.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkflowError;

mod memory;
mod pg;

pub use memory::MockWorkflowService;
pub use pg::PgWorkflowService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunState::Pending),
            "running" => Ok(RunState::Running),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            invalid => Err(format!("{invalid} is not a valid run state")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_name: String,
    pub input: Value,
    pub state: RunState,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    /// Set when the run was last claimed.
    pub started_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait WorkflowService: Send + Sync {
    async fn start(&self, workflow_name: &str, input: Value) -> Result<Uuid, WorkflowError>;
}

/// Consumer side of the workflow service, used by the stage worker.
#[async_trait]
pub trait WorkflowRunSource: Send + Sync {
    /// Moves up to `max` pending runs to running and returns them, oldest first.
    async fn claim(&self, max: usize) -> Result<Vec<WorkflowRun>, WorkflowError>;

    async fn finish(&self, id: Uuid, state: RunState) -> Result<(), WorkflowError>;

    /// Runs left running for longer than `timeout` lost their worker. Those claimed fewer
    /// than `max_attempts` times go back to pending; the number reset is returned.
    async fn reset_stalled(&self, timeout: Duration, max_attempts: i32)
        -> Result<u64, WorkflowError>;

    /// Stalled runs already claimed `max_attempts` times are failed and returned, so their
    /// input can be dead-lettered.
    async fn fail_stalled(
        &self,
        timeout: Duration,
        max_attempts: i32,
    ) -> Result<Vec<WorkflowRun>, WorkflowError>;
}

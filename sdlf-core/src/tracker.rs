use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StoreError, TrackerError};
use crate::registry::ExecutionStore;
use crate::types::{Execution, ExecutionStatus, ExecutionTransition};

/// Lifecycle record of one stage run (pipeline execution history).
///
/// A tracker is attached to at most one execution, through `start` or `retrieve`. Every
/// mutation goes through a conditional write, so a terminal record is never changed, even
/// when another process finished it first.
pub struct ExecutionTracker {
    store: Arc<dyn ExecutionStore>,
    current: Option<Execution>,
}

impl ExecutionTracker {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            current: None,
        }
    }

    /// Creates a STARTED record and attaches to it.
    pub async fn start(
        &mut self,
        pipeline_name: &str,
        comment: Option<&str>,
    ) -> Result<Uuid, TrackerError> {
        let now = Utc::now();
        let transition = ExecutionTransition {
            status: ExecutionStatus::Started,
            component: None,
            comment: comment.map(str::to_owned),
            at: now,
        };
        let execution = Execution {
            id: Uuid::now_v7(),
            pipeline_name: pipeline_name.to_owned(),
            status: ExecutionStatus::Started,
            comment: transition.comment.clone(),
            started_at: now,
            ended_at: None,
            history: vec![transition.event()],
        };

        self.store.create_execution(&execution).await?;
        info!(execution_id = %execution.id, pipeline_name, "execution started");

        let id = execution.id;
        self.current = Some(execution);
        Ok(id)
    }

    /// Attaches to an existing record, terminal or not.
    pub async fn retrieve(&mut self, id: Uuid) -> Result<&Execution, TrackerError> {
        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(TrackerError::NotFound(id))?;
        debug!(execution_id = %id, status = %execution.status, "execution retrieved");
        Ok(self.current.insert(execution))
    }

    pub async fn update(&mut self, status_label: &str, component: &str) -> Result<(), TrackerError> {
        self.apply(
            ExecutionStatus::processing(status_label, component),
            Some(component),
            None,
        )
        .await
    }

    pub async fn end_success(&mut self) -> Result<(), TrackerError> {
        self.apply(ExecutionStatus::Succeeded, None, None).await
    }

    pub async fn end_failed(&mut self, component: &str, comment: &str) -> Result<(), TrackerError> {
        self.apply(ExecutionStatus::Failed, Some(component), Some(comment))
            .await
    }

    async fn apply(
        &mut self,
        status: ExecutionStatus,
        component: Option<&str>,
        comment: Option<&str>,
    ) -> Result<(), TrackerError> {
        let current = self.current.as_ref().ok_or(TrackerError::NotAttached)?;
        let id = current.id;
        if current.status.is_terminal() {
            return Err(TrackerError::Terminal {
                id,
                status: current.status.to_string(),
            });
        }

        let transition = ExecutionTransition {
            status,
            component: component.map(str::to_owned),
            comment: comment.map(str::to_owned),
            at: Utc::now(),
        };

        match self.store.transition_execution(id, &transition).await {
            Ok(updated) => {
                debug!(execution_id = %id, status = %updated.status, "execution updated");
                self.current = Some(updated);
                Ok(())
            }
            Err(StoreError::ConditionFailed(_)) => {
                let status = match self.store.get_execution(id).await? {
                    Some(stored) => {
                        let status = stored.status.to_string();
                        self.current = Some(stored);
                        status
                    }
                    None => return Err(TrackerError::NotFound(id)),
                };
                warn!(execution_id = %id, status = %status, "execution finished elsewhere");
                Err(TrackerError::Terminal { id, status })
            }
            Err(StoreError::NotFound(_)) => Err(TrackerError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}

use thiserror::Error;
use uuid::Uuid;

/// Errors from the object storage collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("{operation} on {bucket} failed: {message}")]
    OperationFailed {
        operation: &'static str,
        bucket: String,
        message: String,
    },
}

/// Errors about the queue itself: postgres/network errors, malformed requests.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("{command} on queue {queue} failed with: {error}")]
    QueryError {
        command: &'static str,
        queue: String,
        error: sqlx::Error,
    },
    #[error("batch of {0} messages exceeds the send limit of {max}", max = crate::queue::MAX_SEND_BATCH)]
    BatchTooLarge(usize),
    #[error("queue {0} is unavailable")]
    Unavailable(String),
}

/// Errors from the key-value registry. Expected races are reported through
/// `InsertOutcome`/`DeleteOutcome`, never through this type.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("could not (de)serialize jsonb field: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("record {0} not found")]
    NotFound(String),
    #[error("conditional write on {0} failed")]
    ConditionFailed(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{command} on workflow runs failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("workflow {0} could not be started")]
    StartRejected(String),
    #[error("workflow run {0} not found")]
    RunNotFound(Uuid),
}

/// Errors from the execution tracker state machine.
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("no execution attached, call start or retrieve first")]
    NotAttached,
    #[error("execution {0} not found")]
    NotFound(Uuid),
    #[error("execution {id} is already {status}")]
    Terminal { id: Uuid, status: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by a transform plugin, or by the hooks polling its job.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("{0}")]
    Failed(String),
    #[error("job {job_name} reported FAILED")]
    JobFailed { job_name: String },
    #[error("job {job_name} still running after {attempts} status checks")]
    JobTimedOut { job_name: String, attempts: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Top level error of the routing and stage components. Everything here propagates to the
/// invoking runtime after state (execution record, DLQ) has been recorded.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("event matches no known shape: {0}")]
    Validation(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("{stage} {component} Error: {source}")]
    Transform {
        stage: String,
        component: String,
        #[source]
        source: TransformError,
    },
    #[error("send to {queue} failed: {source}")]
    Enqueue {
        queue: String,
        #[source]
        source: QueueError,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("could not (de)serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    pub fn enqueue(queue: &str, source: QueueError) -> Self {
        PipelineError::Enqueue {
            queue: queue.to_owned(),
            source,
        }
    }

    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation",
            PipelineError::Lookup(_) => "lookup",
            PipelineError::Transform { .. } => "transform",
            PipelineError::Enqueue { .. } => "enqueue",
            PipelineError::Queue(_) => "queue",
            PipelineError::Store(_) => "store",
            PipelineError::Tracker(_) => "tracker",
            PipelineError::Workflow(_) => "workflow",
            PipelineError::Storage(_) => "storage",
            PipelineError::Serialization(_) => "serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_error_message_names_stage_and_component() {
        let error = PipelineError::Transform {
            stage: "StageA".to_string(),
            component: "Process".to_string(),
            source: TransformError::Failed("bad input".to_string()),
        };
        assert_eq!(error.to_string(), "StageA Process Error: bad input");
        assert_eq!(error.kind(), "transform");
    }

    #[test]
    fn batch_too_large_mentions_limit() {
        assert_eq!(
            QueueError::BatchTooLarge(11).to_string(),
            "batch of 11 messages exceeds the send limit of 10"
        );
    }
}

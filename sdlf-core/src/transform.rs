//! Per-dataset transform plugins.

use async_trait::async_trait;

use crate::error::TransformError;
use crate::types::{JobDetails, PipelineStage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub resource_prefix: String,
    pub bucket: String,
    pub keys: Vec<String>,
    pub team: String,
    pub dataset: String,
    pub stage: PipelineStage,
    /// Bucket the processed objects are expected to land in.
    pub output_bucket: String,
}

/// Where a transform put its output: explicit keys, or every object under a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessedKeys {
    Keys(Vec<String>),
    Prefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub processed_keys: ProcessedKeys,
    /// Set by heavy transforms that hand the work to an asynchronous job.
    pub job_details: Option<JobDetails>,
}

#[async_trait]
pub trait Transform: Send + Sync {
    async fn transform_object(
        &self,
        request: &TransformRequest,
    ) -> Result<TransformOutput, TransformError>;

    /// Polled by heavy stages until the job reaches a terminal status. Synchronous
    /// transforms have nothing to poll.
    async fn check_job_status(
        &self,
        _request: &TransformRequest,
        output: TransformOutput,
    ) -> Result<TransformOutput, TransformError> {
        Ok(output)
    }
}

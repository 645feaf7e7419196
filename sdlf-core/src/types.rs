use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MIN_ITEMS: u32 = 1;
pub const DEFAULT_MAX_ITEMS: u32 = 100;

/// A step of a dataset pipeline. StageA is the light, synchronous transform; StageB the
/// heavy transform that runs as an asynchronous job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PipelineStage {
    StageA,
    StageB,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 2] = [PipelineStage::StageA, PipelineStage::StageB];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::StageA => "StageA",
            PipelineStage::StageB => "StageB",
        }
    }

    /// Lowercase letter used in resource names (`queue-a`, `sm-b`, ...).
    pub fn letter(&self) -> char {
        match self {
            PipelineStage::StageA => 'a',
            PipelineStage::StageB => 'b',
        }
    }

    pub fn next(&self) -> Option<PipelineStage> {
        match self {
            PipelineStage::StageA => Some(PipelineStage::StageB),
            PipelineStage::StageB => None,
        }
    }

    pub fn is_heavy(&self) -> bool {
        matches!(self, PipelineStage::StageB)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', '-'], "").as_str() {
            "stagea" | "a" => Ok(PipelineStage::StageA),
            "stageb" | "b" => Ok(PipelineStage::StageB),
            _ => Err(format!("{s} is not a valid pipeline stage")),
        }
    }
}

/// The data lake zone an object lives in, derived from its bucket name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketStage {
    Raw,
    Stage,
    Analytics,
}

impl BucketStage {
    /// Last `-` separated segment of the bucket name, falling back to `Raw`.
    pub fn from_bucket_name(bucket: &str) -> Self {
        match bucket.rsplit('-').next() {
            Some("stage") => BucketStage::Stage,
            Some("analytics") => BucketStage::Analytics,
            _ => BucketStage::Raw,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketStage::Raw => "raw",
            BucketStage::Stage => "stage",
            BucketStage::Analytics => "analytics",
        }
    }
}

impl FromStr for BucketStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(BucketStage::Raw),
            "stage" => Ok(BucketStage::Stage),
            "analytics" => Ok(BucketStage::Analytics),
            invalid => Err(format!("{invalid} is not a valid bucket stage")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub bucket: String,
    pub key: String,
    pub stage: BucketStage,
    pub last_modified: DateTime<Utc>,
    pub team: Option<String>,
    pub dataset: Option<String>,
}

impl CatalogEntry {
    pub fn object_id(bucket: &str, key: &str) -> String {
        format!("store://{bucket}/{key}")
    }
}

/// Message carried on a stage queue. Producers set either `key` or `keys_to_process`;
/// the batch router accepts both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageMessage {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys_to_process: Vec<String>,
    pub team: String,
    pub dataset: String,
    pub pipeline: String,
    pub pipeline_stage: PipelineStage,
    pub env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peh_id: Option<Uuid>,
}

impl StageMessage {
    pub fn ordering_key(&self) -> String {
        ordering_key(&self.team, &self.dataset)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.key
            .iter()
            .chain(self.keys_to_process.iter())
            .map(String::as_str)
    }
}

/// Input of one stage workflow execution, and the body the batch router writes to a DLQ.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub bucket: String,
    pub keys_to_process: Vec<String>,
    pub team: String,
    pub pipeline: String,
    pub pipeline_stage: PipelineStage,
    pub dataset: String,
    pub env: String,
}

impl BatchPayload {
    pub fn ordering_key(&self) -> String {
        ordering_key(&self.team, &self.dataset)
    }

    /// One single-key message per key, as handed to the light stage per-object hooks.
    pub fn messages(&self) -> Vec<StageMessage> {
        self.keys_to_process
            .iter()
            .map(|key| StageMessage {
                bucket: self.bucket.clone(),
                key: Some(key.clone()),
                keys_to_process: vec![],
                team: self.team.clone(),
                dataset: self.dataset.clone(),
                pipeline: self.pipeline.clone(),
                pipeline_stage: self.pipeline_stage,
                env: self.env.clone(),
                peh_id: None,
            })
            .collect()
    }
}

/// Every message of one dataset shares this group, pinning it to FIFO order.
pub fn ordering_key(team: &str, dataset: &str) -> String {
    format!("{team}-{dataset}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetConfig {
    pub team: String,
    pub dataset: String,
    pub pipeline: String,
    #[serde(default)]
    pub min_items: BTreeMap<PipelineStage, u32>,
    #[serde(default)]
    pub max_items: BTreeMap<PipelineStage, u32>,
    pub stage_a_transform: String,
    pub stage_b_transform: String,
}

impl DatasetConfig {
    pub fn name(&self) -> String {
        ordering_key(&self.team, &self.dataset)
    }

    pub fn min_items(&self, stage: PipelineStage) -> u32 {
        self.min_items
            .get(&stage)
            .copied()
            .unwrap_or(DEFAULT_MIN_ITEMS)
    }

    pub fn max_items(&self, stage: PipelineStage) -> u32 {
        self.max_items
            .get(&stage)
            .copied()
            .unwrap_or(DEFAULT_MAX_ITEMS)
    }

    pub fn transform_name(&self, stage: PipelineStage) -> &str {
        match stage {
            PipelineStage::StageA => &self.stage_a_transform,
            PipelineStage::StageB => &self.stage_b_transform,
        }
    }
}

/// Maps a cross-account ingestion bucket to the dataset it feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerConfig {
    pub bucket: String,
    pub team: String,
    pub dataset: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExecutionStatus {
    Started,
    /// "<stage> <component> Processing"
    Processing(String),
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn processing(status_label: &str, component: &str) -> Self {
        ExecutionStatus::Processing(format!("{status_label} {component} Processing"))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded | ExecutionStatus::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Started => f.write_str("STARTED"),
            ExecutionStatus::Processing(label) => f.write_str(label),
            ExecutionStatus::Succeeded => f.write_str("SUCCEEDED"),
            ExecutionStatus::Failed => f.write_str("FAILED"),
        }
    }
}

impl From<String> for ExecutionStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "STARTED" => ExecutionStatus::Started,
            "SUCCEEDED" => ExecutionStatus::Succeeded,
            "FAILED" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Processing(value),
        }
    }
}

impl From<ExecutionStatus> for String {
    fn from(value: ExecutionStatus) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub status: ExecutionStatus,
    pub component: Option<String>,
    pub at: DateTime<Utc>,
}

/// Pipeline execution history record for one stage run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub pipeline_name: String,
    pub status: ExecutionStatus,
    pub comment: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub history: Vec<ExecutionEvent>,
}

/// A status change applied to an execution by the tracker.
#[derive(Debug, Clone)]
pub struct ExecutionTransition {
    pub status: ExecutionStatus,
    pub component: Option<String>,
    pub comment: Option<String>,
    pub at: DateTime<Utc>,
}

impl ExecutionTransition {
    pub fn event(&self) -> ExecutionEvent {
        ExecutionEvent {
            status: self.status.clone(),
            component: self.component.clone(),
            at: self.at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Started,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetails {
    pub job_name: String,
    pub job_run_id: String,
    pub job_status: JobStatus,
    #[serde(default)]
    pub tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadataRecord {
    pub bucket: String,
    pub key: String,
    pub size: Option<i64>,
    pub last_modified: Option<DateTime<Utc>>,
    pub team: String,
    pub pipeline: String,
    pub dataset: String,
    pub pipeline_stage: PipelineStage,
    pub peh_id: Option<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

/// Result of a conditional insert. `AlreadyExists` is an expected race, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// Result of a delete-if-exists. `NotFound` is an expected race, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

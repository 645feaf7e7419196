// Same pattern as the job queue crates: modules stay private where possible and the public
// surface is re-exported here, so internals can move without breaking the services.

// Types
mod types;
pub use types::ordering_key;
pub use types::BatchPayload;
pub use types::BucketStage;
pub use types::CatalogEntry;
pub use types::CustomerConfig;
pub use types::DatasetConfig;
pub use types::DeleteOutcome;
pub use types::Execution;
pub use types::ExecutionEvent;
pub use types::ExecutionStatus;
pub use types::ExecutionTransition;
pub use types::InsertOutcome;
pub use types::JobDetails;
pub use types::JobStatus;
pub use types::ObjectMetadataRecord;
pub use types::PipelineStage;
pub use types::StageMessage;
pub use types::DEFAULT_MAX_ITEMS;
pub use types::DEFAULT_MIN_ITEMS;

// Errors
mod error;
pub use error::PipelineError;
pub use error::QueueError;
pub use error::StorageError;
pub use error::StoreError;
pub use error::TrackerError;
pub use error::TransformError;
pub use error::WorkflowError;

// Config
mod config;
pub use config::run_migrations;
pub use config::PoolConfig;
pub use config::S3Config;
pub use config::StageBuckets;

// Naming convention for stage queues, DLQs and workflows
mod naming;
pub use naming::ResourceNaming;
pub use naming::StageResource;
pub use naming::StageResources;

// Collaborators. Public modules, since the mocks are part of the surface.
pub mod queue;
pub mod registry;
pub mod storage;
pub mod workflow;

mod tracker;
pub use tracker::ExecutionTracker;

mod transform;
pub use transform::ProcessedKeys;
pub use transform::Transform;
pub use transform::TransformOutput;
pub use transform::TransformRequest;

mod services;
pub use services::MockBackends;
pub use services::Services;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use crate::config::StageBuckets;
use crate::naming::ResourceNaming;
use crate::queue::{MockQueueService, PgQueueService, QueueService};
use crate::registry::{
    CatalogStore, DatasetStore, ExecutionStore, MemoryRegistry, ObjectMetadataStore, PgRegistry,
};
use crate::storage::{MockObjectStore, ObjectStore};
use crate::tracker::ExecutionTracker;
use crate::workflow::{MockWorkflowService, PgWorkflowService, WorkflowService};

/// Every collaborator a pipeline component talks to. Built once per process and shared.
#[derive(Clone)]
pub struct Services {
    pub catalog: Arc<dyn CatalogStore>,
    pub datasets: Arc<dyn DatasetStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub object_metadata: Arc<dyn ObjectMetadataStore>,
    pub queues: Arc<dyn QueueService>,
    pub workflows: Arc<dyn WorkflowService>,
    pub storage: Arc<dyn ObjectStore>,
    pub naming: ResourceNaming,
    pub buckets: StageBuckets,
    pub env: String,
}

impl Services {
    /// Registry, queues and workflow runs in postgres, objects in `storage`.
    pub fn postgres(
        pool: PgPool,
        visibility_timeout: Duration,
        storage: Arc<dyn ObjectStore>,
        naming: ResourceNaming,
        buckets: StageBuckets,
        env: &str,
    ) -> Self {
        let registry = Arc::new(PgRegistry::new(pool.clone()));
        Self {
            catalog: registry.clone(),
            datasets: registry.clone(),
            executions: registry.clone(),
            object_metadata: registry,
            queues: Arc::new(PgQueueService::new(pool.clone(), visibility_timeout)),
            workflows: Arc::new(PgWorkflowService::new(pool)),
            storage,
            naming,
            buckets,
            env: env.to_owned(),
        }
    }

    pub fn tracker(&self) -> ExecutionTracker {
        ExecutionTracker::new(self.executions.clone())
    }
}

/// In-memory backends wired into a `Services`, with handles kept for inspection.
#[derive(Clone)]
pub struct MockBackends {
    pub registry: MemoryRegistry,
    pub queues: MockQueueService,
    pub workflows: MockWorkflowService,
    pub storage: MockObjectStore,
    pub naming: ResourceNaming,
    pub buckets: StageBuckets,
    pub env: String,
}

impl Default for MockBackends {
    fn default() -> Self {
        Self {
            registry: MemoryRegistry::new(),
            queues: MockQueueService::default(),
            workflows: MockWorkflowService::new(),
            storage: MockObjectStore::new(),
            naming: ResourceNaming::new("prefix"),
            buckets: StageBuckets {
                raw: "prefix-raw-bucket".to_string(),
                stage: "prefix-dl-stage".to_string(),
                analytics: "prefix-dl-analytics".to_string(),
            },
            env: "dev".to_string(),
        }
    }
}

impl MockBackends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.queues = MockQueueService::new(visibility_timeout);
        self
    }

    pub fn services(&self) -> Services {
        let registry = Arc::new(self.registry.clone());
        Services {
            catalog: registry.clone(),
            datasets: registry.clone(),
            executions: registry.clone(),
            object_metadata: registry,
            queues: Arc::new(self.queues.clone()),
            workflows: Arc::new(self.workflows.clone()),
            storage: Arc::new(self.storage.clone()),
            naming: self.naming.clone(),
            buckets: self.buckets.clone(),
            env: self.env.clone(),
        }
    }
}

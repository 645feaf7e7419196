//! Key-value registry: metadata catalog, dataset and customer configuration, execution
//! records and per-object processing history.
//!
//! Writes that can race are conditional. Losing such a race is reported as an outcome, not
//! as an error.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    CatalogEntry, CustomerConfig, DatasetConfig, DeleteOutcome, Execution, ExecutionTransition,
    InsertOutcome, ObjectMetadataRecord,
};

mod memory;
mod pg;

pub use memory::MemoryRegistry;
pub use pg::PgRegistry;

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn insert_if_absent(&self, entry: &CatalogEntry) -> Result<InsertOutcome, StoreError>;

    async fn delete_if_exists(&self, id: &str) -> Result<DeleteOutcome, StoreError>;

    async fn get_entry(&self, id: &str) -> Result<Option<CatalogEntry>, StoreError>;
}

#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn get_dataset(&self, team: &str, dataset: &str)
        -> Result<Option<DatasetConfig>, StoreError>;

    async fn list_datasets(&self) -> Result<Vec<DatasetConfig>, StoreError>;

    /// Every customer config registered for `bucket`. Callers decide what duplicates mean.
    async fn customer_configs_for_bucket(
        &self,
        bucket: &str,
    ) -> Result<Vec<CustomerConfig>, StoreError>;

    async fn put_dataset(&self, config: &DatasetConfig) -> Result<(), StoreError>;

    async fn put_customer_config(&self, config: &CustomerConfig) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Fails with `ConditionFailed` when the id is already taken.
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Applies `transition` only if the record is not terminal. Fails with `NotFound` for an
    /// unknown id and `ConditionFailed` for a terminal record.
    async fn transition_execution(
        &self,
        id: Uuid,
        transition: &ExecutionTransition,
    ) -> Result<Execution, StoreError>;
}

#[async_trait]
pub trait ObjectMetadataStore: Send + Sync {
    async fn append(&self, record: &ObjectMetadataRecord) -> Result<(), StoreError>;

    /// Records for one object across all stages, oldest first.
    async fn history(&self, bucket: &str, key: &str)
        -> Result<Vec<ObjectMetadataRecord>, StoreError>;
}

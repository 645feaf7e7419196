use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use uuid::Uuid;

use super::{CatalogStore, DatasetStore, ExecutionStore, ObjectMetadataStore};
use crate::error::StoreError;
use crate::types::{
    CatalogEntry, CustomerConfig, DatasetConfig, DeleteOutcome, Execution, ExecutionTransition,
    InsertOutcome, ObjectMetadataRecord,
};

#[derive(Default)]
struct State {
    catalog: BTreeMap<String, CatalogEntry>,
    datasets: BTreeMap<String, DatasetConfig>,
    customer_configs: Vec<CustomerConfig>,
    executions: BTreeMap<Uuid, Execution>,
    object_metadata: Vec<ObjectMetadataRecord>,
}

/// In-memory registry implementing every store, for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<State>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn catalog_entries(&self) -> Vec<CatalogEntry> {
        self.lock().catalog.values().cloned().collect()
    }

    pub fn executions(&self) -> Vec<Execution> {
        let mut executions: Vec<_> = self.lock().executions.values().cloned().collect();
        executions.sort_by_key(|e| e.started_at);
        executions
    }

    pub fn object_metadata(&self) -> Vec<ObjectMetadataRecord> {
        self.lock().object_metadata.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryRegistry {
    async fn insert_if_absent(&self, entry: &CatalogEntry) -> Result<InsertOutcome, StoreError> {
        let mut state = self.lock();
        if state.catalog.contains_key(&entry.id) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        state.catalog.insert(entry.id.clone(), entry.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn delete_if_exists(&self, id: &str) -> Result<DeleteOutcome, StoreError> {
        match self.lock().catalog.remove(id) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn get_entry(&self, id: &str) -> Result<Option<CatalogEntry>, StoreError> {
        Ok(self.lock().catalog.get(id).cloned())
    }
}

#[async_trait]
impl DatasetStore for MemoryRegistry {
    async fn get_dataset(
        &self,
        team: &str,
        dataset: &str,
    ) -> Result<Option<DatasetConfig>, StoreError> {
        let name = crate::types::ordering_key(team, dataset);
        Ok(self.lock().datasets.get(&name).cloned())
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetConfig>, StoreError> {
        Ok(self.lock().datasets.values().cloned().collect())
    }

    async fn customer_configs_for_bucket(
        &self,
        bucket: &str,
    ) -> Result<Vec<CustomerConfig>, StoreError> {
        Ok(self
            .lock()
            .customer_configs
            .iter()
            .filter(|c| c.bucket == bucket)
            .cloned()
            .collect())
    }

    async fn put_dataset(&self, config: &DatasetConfig) -> Result<(), StoreError> {
        self.lock().datasets.insert(config.name(), config.clone());
        Ok(())
    }

    async fn put_customer_config(&self, config: &CustomerConfig) -> Result<(), StoreError> {
        self.lock().customer_configs.push(config.clone());
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryRegistry {
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.executions.contains_key(&execution.id) {
            return Err(StoreError::ConditionFailed(execution.id.to_string()));
        }
        state.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.lock().executions.get(&id).cloned())
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        transition: &ExecutionTransition,
    ) -> Result<Execution, StoreError> {
        let mut state = self.lock();
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if execution.status.is_terminal() {
            return Err(StoreError::ConditionFailed(id.to_string()));
        }

        execution.status = transition.status.clone();
        if transition.comment.is_some() {
            execution.comment = transition.comment.clone();
        }
        if transition.status.is_terminal() {
            execution.ended_at = Some(transition.at);
        }
        execution.history.push(transition.event());
        Ok(execution.clone())
    }
}

#[async_trait]
impl ObjectMetadataStore for MemoryRegistry {
    async fn append(&self, record: &ObjectMetadataRecord) -> Result<(), StoreError> {
        self.lock().object_metadata.push(record.clone());
        Ok(())
    }

    async fn history(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<ObjectMetadataRecord>, StoreError> {
        Ok(self
            .lock()
            .object_metadata
            .iter()
            .filter(|r| r.bucket == bucket && r.key == key)
            .cloned()
            .collect())
    }
}

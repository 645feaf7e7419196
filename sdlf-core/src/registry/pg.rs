use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use super::{CatalogStore, DatasetStore, ExecutionStore, ObjectMetadataStore};
use crate::error::StoreError;
use crate::types::{
    BucketStage, CatalogEntry, CustomerConfig, DatasetConfig, DeleteOutcome, Execution,
    ExecutionEvent, ExecutionStatus, ExecutionTransition, InsertOutcome, ObjectMetadataRecord,
    PipelineStage,
};

fn query_error(command: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |error| StoreError::QueryError { command, error }
}

#[derive(sqlx::FromRow)]
struct CatalogRow {
    id: String,
    bucket: String,
    key: String,
    stage: String,
    last_modified: DateTime<Utc>,
    team: Option<String>,
    dataset: Option<String>,
}

impl TryFrom<CatalogRow> for CatalogEntry {
    type Error = StoreError;

    fn try_from(row: CatalogRow) -> Result<Self, Self::Error> {
        Ok(CatalogEntry {
            stage: row.stage.parse::<BucketStage>().map_err(StoreError::InvalidValue)?,
            id: row.id,
            bucket: row.bucket,
            key: row.key,
            last_modified: row.last_modified,
            team: row.team,
            dataset: row.dataset,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DatasetRow {
    team: String,
    dataset: String,
    pipeline: String,
    min_items: Json<BTreeMap<PipelineStage, u32>>,
    max_items: Json<BTreeMap<PipelineStage, u32>>,
    stage_a_transform: String,
    stage_b_transform: String,
}

impl From<DatasetRow> for DatasetConfig {
    fn from(row: DatasetRow) -> Self {
        DatasetConfig {
            team: row.team,
            dataset: row.dataset,
            pipeline: row.pipeline,
            min_items: row.min_items.0,
            max_items: row.max_items.0,
            stage_a_transform: row.stage_a_transform,
            stage_b_transform: row.stage_b_transform,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: Uuid,
    pipeline_name: String,
    status: String,
    comment: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    history: Json<Vec<ExecutionEvent>>,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        Execution {
            id: row.id,
            pipeline_name: row.pipeline_name,
            status: ExecutionStatus::from(row.status),
            comment: row.comment,
            started_at: row.started_at,
            ended_at: row.ended_at,
            history: row.history.0,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ObjectMetadataRow {
    bucket: String,
    key: String,
    size: Option<i64>,
    last_modified: Option<DateTime<Utc>>,
    team: String,
    pipeline: String,
    dataset: String,
    pipeline_stage: String,
    peh_id: Option<Uuid>,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<ObjectMetadataRow> for ObjectMetadataRecord {
    type Error = StoreError;

    fn try_from(row: ObjectMetadataRow) -> Result<Self, Self::Error> {
        Ok(ObjectMetadataRecord {
            pipeline_stage: row
                .pipeline_stage
                .parse::<PipelineStage>()
                .map_err(StoreError::InvalidValue)?,
            bucket: row.bucket,
            key: row.key,
            size: row.size,
            last_modified: row.last_modified,
            team: row.team,
            pipeline: row.pipeline,
            dataset: row.dataset,
            peh_id: row.peh_id,
            recorded_at: row.recorded_at,
        })
    }
}

const EXECUTION_COLUMNS: &str = "id, pipeline_name, status, comment, started_at, ended_at, history";

/// Every registry store backed by one postgres pool.
#[derive(Clone)]
pub struct PgRegistry {
    pool: PgPool,
}

impl PgRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogStore for PgRegistry {
    async fn insert_if_absent(&self, entry: &CatalogEntry) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO sdlf_catalog (id, bucket, key, stage, last_modified, team, dataset)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.bucket)
        .bind(&entry.key)
        .bind(entry.stage.as_str())
        .bind(entry.last_modified)
        .bind(&entry.team)
        .bind(&entry.dataset)
        .execute(&self.pool)
        .await
        .map_err(query_error("insert_catalog_entry"))?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn delete_if_exists(&self, id: &str) -> Result<DeleteOutcome, StoreError> {
        let result = sqlx::query("DELETE FROM sdlf_catalog WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_error("delete_catalog_entry"))?;

        if result.rows_affected() == 0 {
            Ok(DeleteOutcome::NotFound)
        } else {
            Ok(DeleteOutcome::Deleted)
        }
    }

    async fn get_entry(&self, id: &str) -> Result<Option<CatalogEntry>, StoreError> {
        let row: Option<CatalogRow> = sqlx::query_as(
            "SELECT id, bucket, key, stage, last_modified, team, dataset FROM sdlf_catalog WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("get_catalog_entry"))?;

        row.map(CatalogEntry::try_from).transpose()
    }
}

#[async_trait]
impl DatasetStore for PgRegistry {
    async fn get_dataset(
        &self,
        team: &str,
        dataset: &str,
    ) -> Result<Option<DatasetConfig>, StoreError> {
        let row: Option<DatasetRow> = sqlx::query_as(
            r#"
SELECT team, dataset, pipeline, min_items, max_items, stage_a_transform, stage_b_transform
FROM sdlf_datasets
WHERE name = $1
            "#,
        )
        .bind(crate::types::ordering_key(team, dataset))
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("get_dataset"))?;

        Ok(row.map(Into::into))
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetConfig>, StoreError> {
        let rows: Vec<DatasetRow> = sqlx::query_as(
            r#"
SELECT team, dataset, pipeline, min_items, max_items, stage_a_transform, stage_b_transform
FROM sdlf_datasets
ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("list_datasets"))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn customer_configs_for_bucket(
        &self,
        bucket: &str,
    ) -> Result<Vec<CustomerConfig>, StoreError> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT bucket, team, dataset FROM sdlf_customer_configs WHERE bucket = $1 ORDER BY id",
        )
        .bind(bucket)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("customer_configs_for_bucket"))?;

        Ok(rows
            .into_iter()
            .map(|(bucket, team, dataset)| CustomerConfig {
                bucket,
                team,
                dataset,
            })
            .collect())
    }

    async fn put_dataset(&self, config: &DatasetConfig) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO sdlf_datasets
    (name, team, dataset, pipeline, min_items, max_items, stage_a_transform, stage_b_transform)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (name) DO UPDATE SET
    pipeline = EXCLUDED.pipeline,
    min_items = EXCLUDED.min_items,
    max_items = EXCLUDED.max_items,
    stage_a_transform = EXCLUDED.stage_a_transform,
    stage_b_transform = EXCLUDED.stage_b_transform
            "#,
        )
        .bind(config.name())
        .bind(&config.team)
        .bind(&config.dataset)
        .bind(&config.pipeline)
        .bind(Json(&config.min_items))
        .bind(Json(&config.max_items))
        .bind(&config.stage_a_transform)
        .bind(&config.stage_b_transform)
        .execute(&self.pool)
        .await
        .map_err(query_error("put_dataset"))?;

        Ok(())
    }

    async fn put_customer_config(&self, config: &CustomerConfig) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO sdlf_customer_configs (bucket, team, dataset) VALUES ($1, $2, $3)")
            .bind(&config.bucket)
            .bind(&config.team)
            .bind(&config.dataset)
            .execute(&self.pool)
            .await
            .map_err(query_error("put_customer_config"))?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PgRegistry {
    async fn create_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
INSERT INTO sdlf_executions (id, pipeline_name, status, comment, started_at, ended_at, history)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(execution.id)
        .bind(&execution.pipeline_name)
        .bind(execution.status.to_string())
        .bind(&execution.comment)
        .bind(execution.started_at)
        .bind(execution.ended_at)
        .bind(Json(&execution.history))
        .execute(&self.pool)
        .await
        .map_err(query_error("create_execution"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed(execution.id.to_string()));
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM sdlf_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("get_execution"))?;

        Ok(row.map(Into::into))
    }

    async fn transition_execution(
        &self,
        id: Uuid,
        transition: &ExecutionTransition,
    ) -> Result<Execution, StoreError> {
        let ended_at = transition.status.is_terminal().then_some(transition.at);
        let row: Option<ExecutionRow> = sqlx::query_as(&format!(
            r#"
UPDATE sdlf_executions
SET
    status = $2,
    comment = COALESCE($3, comment),
    ended_at = COALESCE($4, ended_at),
    history = history || $5
WHERE id = $1 AND status NOT IN ('SUCCEEDED', 'FAILED')
RETURNING {EXECUTION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(transition.status.to_string())
        .bind(&transition.comment)
        .bind(ended_at)
        .bind(Json(vec![transition.event()]))
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error("transition_execution"))?;

        match row {
            Some(row) => Ok(row.into()),
            None => match self.get_execution(id).await? {
                Some(_) => Err(StoreError::ConditionFailed(id.to_string())),
                None => Err(StoreError::NotFound(id.to_string())),
            },
        }
    }
}

#[async_trait]
impl ObjectMetadataStore for PgRegistry {
    async fn append(&self, record: &ObjectMetadataRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO sdlf_object_metadata
    (bucket, key, size, last_modified, team, pipeline, dataset, pipeline_stage, peh_id, recorded_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&record.bucket)
        .bind(&record.key)
        .bind(record.size)
        .bind(record.last_modified)
        .bind(&record.team)
        .bind(&record.pipeline)
        .bind(&record.dataset)
        .bind(record.pipeline_stage.as_str())
        .bind(record.peh_id)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(query_error("append_object_metadata"))?;

        Ok(())
    }

    async fn history(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Vec<ObjectMetadataRecord>, StoreError> {
        let rows: Vec<ObjectMetadataRow> = sqlx::query_as(
            r#"
SELECT bucket, key, size, last_modified, team, pipeline, dataset, pipeline_stage, peh_id, recorded_at
FROM sdlf_object_metadata
WHERE bucket = $1 AND key = $2
ORDER BY id
            "#,
        )
        .bind(bucket)
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error("object_metadata_history"))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

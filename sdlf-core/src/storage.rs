//! Object storage collaborator.
//!
//! Trait-based so the hooks and transforms can run against S3 in production and against
//! `MockObjectStore` in tests. The mock is always compiled, no feature flag needed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::S3Config;
use crate::error::StorageError;
use crate::types::DeleteOutcome;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn size(&self, bucket: &str, key: &str) -> Result<i64, StorageError>;

    async fn last_modified(&self, bucket: &str, key: &str) -> Result<DateTime<Utc>, StorageError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<DeleteOutcome, StorageError>;

    /// All keys under `prefix`, in lexicographic order.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
    ) -> Result<(), StorageError>;
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Uses the default AWS credential chain unless explicit credentials are configured.
    pub async fn from_config(config: &S3Config) -> Self {
        let region = Region::new(config.region.clone());
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config)
            .region(region)
            .force_path_style(true); // MinIO/localstack compatibility

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "env");
            builder = builder.credentials_provider(credentials);
        }

        info!(region = %config.region, endpoint = ?config.endpoint, "S3 client initialized");

        Self::new(Client::from_conf(builder.build()))
    }

    async fn head(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<aws_sdk_s3::operation::head_object::HeadObjectOutput, StorageError> {
        self.client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if matches!(e.as_service_error(), Some(service) if service.is_not_found()) {
                    StorageError::NotFound {
                        bucket: bucket.to_owned(),
                        key: key.to_owned(),
                    }
                } else {
                    operation_failed("head_object", bucket, e)
                }
            })
    }
}

fn operation_failed(
    operation: &'static str,
    bucket: &str,
    error: impl std::fmt::Display,
) -> StorageError {
    StorageError::OperationFailed {
        operation,
        bucket: bucket.to_owned(),
        message: error.to_string(),
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn size(&self, bucket: &str, key: &str) -> Result<i64, StorageError> {
        let head = self.head(bucket, key).await?;
        head.content_length.ok_or_else(|| {
            operation_failed("head_object", bucket, format!("no content length for {key}"))
        })
    }

    async fn last_modified(&self, bucket: &str, key: &str) -> Result<DateTime<Utc>, StorageError> {
        let head = self.head(bucket, key).await?;
        head.last_modified
            .and_then(|at| DateTime::from_timestamp(at.secs(), at.subsec_nanos()))
            .ok_or_else(|| {
                operation_failed("head_object", bucket, format!("no last modified for {key}"))
            })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<DeleteOutcome, StorageError> {
        match self.head(bucket, key).await {
            Err(StorageError::NotFound { .. }) => return Ok(DeleteOutcome::NotFound),
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| operation_failed("delete_object", bucket, e))?;

        Ok(DeleteOutcome::Deleted)
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut cmd = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token {
                cmd = cmd.continuation_token(token);
            }
            let output = cmd
                .send()
                .await
                .map_err(|e| operation_failed("list_objects_v2", bucket, e))?;

            if let Some(contents) = output.contents {
                keys.extend(contents.into_iter().filter_map(|o| o.key));
            }
            match output.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
    ) -> Result<(), StorageError> {
        self.client
            .copy_object()
            .copy_source(format!("{source_bucket}/{source_key}"))
            .bucket(target_bucket)
            .key(target_key)
            .send()
            .await
            .map_err(|e| operation_failed("copy_object", target_bucket, e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockObject {
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

/// In-memory object store for tests.
#[derive(Clone, Default)]
pub struct MockObjectStore {
    objects: Arc<Mutex<BTreeMap<(String, String), MockObject>>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, size: i64) -> Self {
        self.lock().insert(
            (bucket.to_owned(), key.to_owned()),
            MockObject {
                size,
                last_modified: Utc::now(),
            },
        );
        self.clone()
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.lock()
            .contains_key(&(bucket.to_owned(), key.to_owned()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), MockObject>> {
        match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get(&self, bucket: &str, key: &str) -> Result<MockObject, StorageError> {
        self.lock()
            .get(&(bucket.to_owned(), key.to_owned()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
            })
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn size(&self, bucket: &str, key: &str) -> Result<i64, StorageError> {
        Ok(self.get(bucket, key)?.size)
    }

    async fn last_modified(&self, bucket: &str, key: &str) -> Result<DateTime<Utc>, StorageError> {
        Ok(self.get(bucket, key)?.last_modified)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<DeleteOutcome, StorageError> {
        match self.lock().remove(&(bucket.to_owned(), key.to_owned())) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .lock()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn copy(
        &self,
        source_bucket: &str,
        source_key: &str,
        target_bucket: &str,
        target_key: &str,
    ) -> Result<(), StorageError> {
        let object = self.get(source_bucket, source_key)?;
        self.lock().insert(
            (target_bucket.to_owned(), target_key.to_owned()),
            MockObject {
                size: object.size,
                last_modified: Utc::now(),
            },
        );
        Ok(())
    }
}

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use sdlf_core::queue::OutgoingMessage;
use sdlf_core::{
    ordering_key, BucketStage, CatalogEntry, DatasetConfig, DeleteOutcome, InsertOutcome,
    PipelineError, PipelineStage, Services, StageMessage,
};

use crate::event::{normalize, NormalizedEvent, Operation};
use crate::metrics_consts::{EVENTS_ROUTED, EVENT_ERRORS, ROUTE_TIME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Catalog entry removed, or already gone.
    Deleted(DeleteOutcome),
    /// Object cataloged and announced on the stage A queue.
    Enqueued { queue: String, ordering_key: String },
    /// Catalog entry already present, so this delivery is a duplicate.
    Duplicate,
    /// Object outside the raw zone: cataloged only, its stage hooks do the handoff.
    Cataloged,
}

impl RouteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteOutcome::Deleted(_) => "deleted",
            RouteOutcome::Enqueued { .. } => "enqueued",
            RouteOutcome::Duplicate => "duplicate",
            RouteOutcome::Cataloged => "cataloged",
        }
    }
}

/// Keeps the metadata catalog in sync with storage and feeds new raw objects into their
/// dataset's pipeline.
pub struct EventRouter {
    services: Services,
}

impl EventRouter {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    pub async fn route(&self, raw: &Value) -> Result<RouteOutcome, PipelineError> {
        let _timing = common_metrics::timing_guard(ROUTE_TIME, &[]);
        let result = self.route_inner(raw).await;

        match &result {
            Ok(outcome) => common_metrics::inc(
                EVENTS_ROUTED,
                &[("outcome".to_string(), outcome.as_str().to_string())],
                1,
            ),
            Err(e) => {
                warn!(error = %e, "failed to route event");
                common_metrics::inc(
                    EVENT_ERRORS,
                    &[("kind".to_string(), e.kind().to_string())],
                    1,
                )
            }
        }
        result
    }

    /// Resolves a dataset's stage resources by parameter path, the way a deployment
    /// publishes them.
    pub async fn parameters(
        &self,
        team: &str,
        dataset: &str,
    ) -> Result<BTreeMap<String, String>, PipelineError> {
        let config = self
            .services
            .datasets
            .get_dataset(team, dataset)
            .await?
            .ok_or_else(|| {
                PipelineError::Lookup(format!("no dataset config for {}", ordering_key(team, dataset)))
            })?;

        Ok(self
            .services
            .naming
            .parameters(&config.team, &config.dataset, &config.pipeline))
    }

    async fn route_inner(&self, raw: &Value) -> Result<RouteOutcome, PipelineError> {
        let event = normalize(raw, Utc::now())?;
        let id = CatalogEntry::object_id(&event.bucket, &event.key);
        debug!(object_id = %id, operation = event.operation.as_str(), "routing event");

        if event.operation == Operation::Deleted {
            let outcome = self.services.catalog.delete_if_exists(&id).await?;
            if outcome == DeleteOutcome::NotFound {
                debug!(object_id = %id, "deleted object was not cataloged");
            }
            return Ok(RouteOutcome::Deleted(outcome));
        }

        let stage = BucketStage::from_bucket_name(&event.bucket);
        if stage != BucketStage::Raw {
            let (team, dataset) = key_identity(&event.key, stage);
            let entry = catalog_entry(&event, id, stage, team, dataset);
            return match self.services.catalog.insert_if_absent(&entry).await? {
                InsertOutcome::Inserted => Ok(RouteOutcome::Cataloged),
                InsertOutcome::AlreadyExists => Ok(RouteOutcome::Duplicate),
            };
        }

        // Resolve before writing, so an unroutable object is not left cataloged
        let config = self.resolve_dataset(&event.bucket, &event.key).await?;
        let entry = catalog_entry(
            &event,
            id.clone(),
            stage,
            Some(config.team.clone()),
            Some(config.dataset.clone()),
        );
        if self.services.catalog.insert_if_absent(&entry).await? == InsertOutcome::AlreadyExists {
            debug!(object_id = %id, "duplicate delivery");
            return Ok(RouteOutcome::Duplicate);
        }

        let message = StageMessage {
            bucket: event.bucket.clone(),
            key: Some(event.key.clone()),
            keys_to_process: vec![],
            team: config.team.clone(),
            dataset: config.dataset.clone(),
            pipeline: config.pipeline.clone(),
            pipeline_stage: PipelineStage::StageA,
            env: self.services.env.clone(),
            peh_id: None,
        };
        let queue =
            self.services
                .naming
                .queue(&config.team, &config.pipeline, PipelineStage::StageA);
        let group = message.ordering_key();
        let body = serde_json::to_string(&message)?;

        if let Err(e) = self
            .services
            .queues
            .send(&queue, OutgoingMessage::new(body, &group))
            .await
        {
            // Un-catalog so a redelivery of this event is not mistaken for a duplicate
            if let Err(cleanup) = self.services.catalog.delete_if_exists(&id).await {
                warn!(object_id = %id, error = %cleanup, "failed to roll back catalog entry");
            }
            return Err(PipelineError::enqueue(&queue, e));
        }

        info!(object_id = %id, queue = %queue, ordering_key = %group, "object enqueued");
        Ok(RouteOutcome::Enqueued {
            queue,
            ordering_key: group,
        })
    }

    /// Team and dataset are the first two key segments. Objects dropped in a customer bucket
    /// are resolved through the customer config registered for that bucket instead.
    async fn resolve_dataset(&self, bucket: &str, key: &str) -> Result<DatasetConfig, PipelineError> {
        if let Some((team, dataset)) = leading_segments(key) {
            if let Some(config) = self.services.datasets.get_dataset(team, dataset).await? {
                return Ok(config);
            }
        }

        let customer_configs = self.services.datasets.customer_configs_for_bucket(bucket).await?;
        let customer = match customer_configs.as_slice() {
            [] => {
                return Err(PipelineError::Lookup(format!(
                    "no dataset for {key} and no customer config for bucket {bucket}"
                )))
            }
            [single] => single,
            _ => {
                return Err(PipelineError::Lookup(format!(
                    "{} customer configs registered for bucket {bucket}",
                    customer_configs.len()
                )))
            }
        };

        self.services
            .datasets
            .get_dataset(&customer.team, &customer.dataset)
            .await?
            .ok_or_else(|| {
                PipelineError::Lookup(format!(
                    "customer config for {bucket} points to unknown dataset {}",
                    ordering_key(&customer.team, &customer.dataset)
                ))
            })
    }
}

fn leading_segments(key: &str) -> Option<(&str, &str)> {
    let mut segments = key.split('/');
    match (segments.next(), segments.next()) {
        (Some(team), Some(dataset)) if !team.is_empty() && !dataset.is_empty() => {
            Some((team, dataset))
        }
        _ => None,
    }
}

/// Stage and analytics keys carry a `pre-stage/` or `post-stage/` zone segment first.
fn key_identity(key: &str, stage: BucketStage) -> (Option<String>, Option<String>) {
    let key = match stage {
        BucketStage::Raw => key,
        _ => key.split_once('/').map_or("", |(_, rest)| rest),
    };
    match leading_segments(key) {
        Some((team, dataset)) => (Some(team.to_owned()), Some(dataset.to_owned())),
        None => (None, None),
    }
}

fn catalog_entry(
    event: &NormalizedEvent,
    id: String,
    stage: BucketStage,
    team: Option<String>,
    dataset: Option<String>,
) -> CatalogEntry {
    CatalogEntry {
        id,
        bucket: event.bucket.clone(),
        key: event.key.clone(),
        stage,
        last_modified: event.last_modified,
        team,
        dataset,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_from_keys() {
        assert_eq!(
            leading_segments("adtech/datasetA/file1.json"),
            Some(("adtech", "datasetA"))
        );
        assert_eq!(leading_segments("file1.json"), None);
        assert_eq!(leading_segments("/datasetA/file1.json"), None);
        assert_eq!(
            key_identity("pre-stage/adtech/datasetA/f.json", BucketStage::Stage),
            (Some("adtech".to_string()), Some("datasetA".to_string()))
        );
        assert_eq!(key_identity("loose.json", BucketStage::Analytics), (None, None));
    }
}

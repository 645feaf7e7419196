use std::collections::BTreeMap;

use serde_json::{json, Value};

use sdlf_core::registry::{CatalogStore, DatasetStore};
use sdlf_core::{
    CatalogEntry, CustomerConfig, DatasetConfig, DeleteOutcome, MockBackends, PipelineError,
    PipelineStage, StageMessage,
};
use sdlf_router::router::{EventRouter, RouteOutcome};

const QUEUE_A: &str = "prefix-adtech-insights-queue-a.fifo";

async fn backends() -> MockBackends {
    let backends = MockBackends::new();
    backends
        .registry
        .put_dataset(&DatasetConfig {
            team: "adtech".to_string(),
            dataset: "datasetA".to_string(),
            pipeline: "insights".to_string(),
            min_items: BTreeMap::new(),
            max_items: BTreeMap::new(),
            stage_a_transform: "copy".to_string(),
            stage_b_transform: "copy".to_string(),
        })
        .await
        .unwrap();
    backends
}

fn native(detail_type: &str, bucket: &str, key: &str) -> Value {
    json!({
        "detail-type": detail_type,
        "detail": {"bucket": {"name": bucket}, "object": {"key": key}}
    })
}

#[tokio::test]
async fn object_created_is_enqueued_for_stage_a() {
    let backends = backends().await;
    let router = EventRouter::new(backends.services());

    let outcome = router
        .route(&native(
            "Object Created",
            "prefix-raw-bucket",
            "adtech/datasetA/file1.json",
        ))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RouteOutcome::Enqueued {
            queue: QUEUE_A.to_string(),
            ordering_key: "adtech-datasetA".to_string()
        }
    );

    let sent = backends.queues.sent(QUEUE_A);
    assert_eq!(sent.len(), 1);
    assert_eq!(backends.queues.send_calls(), 1);
    assert_eq!(sent[0].ordering_key, "adtech-datasetA");

    let message: StageMessage = serde_json::from_str(&sent[0].body).unwrap();
    assert_eq!(message.key.as_deref(), Some("adtech/datasetA/file1.json"));
    assert_eq!(message.pipeline, "insights");
    assert_eq!(message.pipeline_stage, PipelineStage::StageA);
    assert_eq!(message.env, "dev");

    let entry = backends
        .registry
        .get_entry("store://prefix-raw-bucket/adtech/datasetA/file1.json")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.team.as_deref(), Some("adtech"));
}

#[tokio::test]
async fn duplicate_delivery_is_not_enqueued_twice() {
    let backends = backends().await;
    let router = EventRouter::new(backends.services());
    let event = native("Object Created", "prefix-raw-bucket", "adtech/datasetA/f.json");

    router.route(&event).await.unwrap();
    assert_eq!(router.route(&event).await.unwrap(), RouteOutcome::Duplicate);
    assert_eq!(backends.queues.sent(QUEUE_A).len(), 1);
}

#[tokio::test]
async fn delete_then_recreate_leaves_one_entry() {
    let backends = backends().await;
    let router = EventRouter::new(backends.services());
    let key = "adtech/datasetA/f.json";

    router
        .route(&native("Object Created", "prefix-raw-bucket", key))
        .await
        .unwrap();
    assert_eq!(
        router
            .route(&native("Object Deleted", "prefix-raw-bucket", key))
            .await
            .unwrap(),
        RouteOutcome::Deleted(DeleteOutcome::Deleted)
    );
    assert_eq!(
        router
            .route(&native("Object Deleted", "prefix-raw-bucket", key))
            .await
            .unwrap(),
        RouteOutcome::Deleted(DeleteOutcome::NotFound)
    );
    router
        .route(&native("Object Created", "prefix-raw-bucket", key))
        .await
        .unwrap();

    assert_eq!(backends.registry.catalog_entries().len(), 1);
    // Deletions never enqueue
    assert_eq!(backends.queues.sent(QUEUE_A).len(), 2);
}

#[tokio::test]
async fn trail_event_is_routed_like_native() {
    let backends = backends().await;
    let router = EventRouter::new(backends.services());
    let trail = json!({
        "detail-type": "AWS API Call via CloudTrail",
        "detail": {
            "eventName": "CompleteMultipartUpload",
            "eventTime": "2024-06-01T10:00:00Z",
            "requestParameters": {"bucketName": "prefix-raw-bucket", "key": "adtech/datasetA/f.json"}
        }
    });

    let outcome = router.route(&trail).await.unwrap();
    assert!(matches!(outcome, RouteOutcome::Enqueued { .. }));

    // The same change in the native shape is a duplicate of it
    let native = native("Object Created", "prefix-raw-bucket", "adtech/datasetA/f.json");
    assert_eq!(router.route(&native).await.unwrap(), RouteOutcome::Duplicate);
}

#[tokio::test]
async fn customer_bucket_resolves_through_customer_config() {
    let backends = backends().await;
    backends
        .registry
        .put_customer_config(&CustomerConfig {
            bucket: "acme-drop".to_string(),
            team: "adtech".to_string(),
            dataset: "datasetA".to_string(),
        })
        .await
        .unwrap();
    let router = EventRouter::new(backends.services());

    let outcome = router
        .route(&native("Object Created", "acme-drop", "exports/2024/f.csv"))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Enqueued { ref queue, .. } if queue == QUEUE_A));

    let message: StageMessage =
        serde_json::from_str(&backends.queues.sent(QUEUE_A)[0].body).unwrap();
    assert_eq!(message.bucket, "acme-drop");
    assert_eq!(message.dataset, "datasetA");
}

#[tokio::test]
async fn duplicate_customer_configs_are_a_lookup_error() {
    let backends = backends().await;
    for _ in 0..2 {
        backends
            .registry
            .put_customer_config(&CustomerConfig {
                bucket: "acme-drop".to_string(),
                team: "adtech".to_string(),
                dataset: "datasetA".to_string(),
            })
            .await
            .unwrap();
    }
    let router = EventRouter::new(backends.services());

    let result = router
        .route(&native("Object Created", "acme-drop", "f.csv"))
        .await;
    assert!(matches!(result, Err(PipelineError::Lookup(_))));
    assert!(backends.registry.catalog_entries().is_empty());
    assert_eq!(backends.queues.send_calls(), 0);
}

#[tokio::test]
async fn unknown_dataset_is_a_lookup_error() {
    let backends = backends().await;
    let router = EventRouter::new(backends.services());

    let result = router
        .route(&native("Object Created", "prefix-raw-bucket", "adtech/datasetZ/f.json"))
        .await;
    assert!(matches!(result, Err(PipelineError::Lookup(_))));
}

#[tokio::test]
async fn enqueue_failure_propagates_and_uncatalogs() {
    let backends = backends().await;
    backends.queues.make_unavailable(QUEUE_A);
    let router = EventRouter::new(backends.services());

    let result = router
        .route(&native("Object Created", "prefix-raw-bucket", "adtech/datasetA/f.json"))
        .await;
    assert!(matches!(result, Err(PipelineError::Enqueue { ref queue, .. }) if queue == QUEUE_A));
    assert!(backends.registry.catalog_entries().is_empty());
}

#[tokio::test]
async fn stage_bucket_objects_are_cataloged_only() {
    let backends = backends().await;
    let router = EventRouter::new(backends.services());

    let outcome = router
        .route(&native(
            "Object Created",
            "prefix-dl-stage",
            "pre-stage/adtech/datasetA/f.json",
        ))
        .await
        .unwrap();
    assert_eq!(outcome, RouteOutcome::Cataloged);
    assert_eq!(backends.queues.send_calls(), 0);

    let entry = backends
        .registry
        .get_entry(&CatalogEntry::object_id(
            "prefix-dl-stage",
            "pre-stage/adtech/datasetA/f.json",
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.stage, sdlf_core::BucketStage::Stage);
    assert_eq!(entry.dataset.as_deref(), Some("datasetA"));
}

#[tokio::test]
async fn malformed_event_is_a_validation_error() {
    let backends = backends().await;
    let router = EventRouter::new(backends.services());

    let result = router.route(&json!({"detail-type": "Object Created"})).await;
    assert!(matches!(result, Err(PipelineError::Validation(_))));
    assert_eq!(backends.queues.send_calls(), 0);
}

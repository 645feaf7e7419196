use std::collections::BTreeMap;

use sdlf_core::queue::{OutgoingMessage, QueueService};
use sdlf_core::registry::DatasetStore;
use sdlf_core::{BatchPayload, DatasetConfig, MockBackends, PipelineError, PipelineStage};
use sdlf_redrive::redrive::{Redrive, RedriveOutcome, RedriveReport};

const QUEUE_A: &str = "prefix-adtech-insights-queue-a.fifo";
const DLQ_A: &str = "prefix-adtech-insights-dlq-a.fifo";
const DLQ_B: &str = "prefix-adtech-insights-dlq-b.fifo";

fn payload(stage: PipelineStage) -> BatchPayload {
    BatchPayload {
        bucket: "prefix-raw-bucket".to_string(),
        keys_to_process: vec![
            "adtech/datasetA/a.json".to_string(),
            "adtech/datasetA/b.json".to_string(),
        ],
        team: "adtech".to_string(),
        pipeline: "insights".to_string(),
        pipeline_stage: stage,
        dataset: "datasetA".to_string(),
        env: "dev".to_string(),
    }
}

async fn dead_letter(backends: &MockBackends, dlq: &str, body: String) {
    backends
        .queues
        .send(dlq, OutgoingMessage::new(body, "failed"))
        .await
        .unwrap();
}

#[tokio::test]
async fn empty_dlq_is_a_no_op() {
    let backends = MockBackends::new();
    let redrive = Redrive::from_mocks(&backends);

    let outcome = redrive
        .redrive_once("adtech", "insights", PipelineStage::StageA)
        .await
        .unwrap();

    assert_eq!(outcome, RedriveOutcome::Empty);
    assert_eq!(backends.queues.receive_calls(), 1);
    assert_eq!(backends.queues.send_calls(), 0);
    assert_eq!(backends.queues.delete_calls(), 0);
    assert!(backends.workflows.runs().is_empty());
}

#[tokio::test]
async fn light_stage_message_goes_back_to_the_stage_queue() {
    let backends = MockBackends::new();
    let body = serde_json::to_string(&payload(PipelineStage::StageA)).unwrap();
    dead_letter(&backends, DLQ_A, body.clone()).await;
    let redrive = Redrive::from_mocks(&backends);

    let outcome = redrive
        .redrive_once("adtech", "insights", PipelineStage::StageA)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RedriveOutcome::Requeued {
            queue: QUEUE_A.to_string()
        }
    );
    let requeued = backends.queues.sent(QUEUE_A);
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].body, body);
    assert_eq!(requeued[0].ordering_key, "adtech-datasetA");

    assert_eq!(backends.queues.delete_calls(), 1);
    assert!(backends.queues.bodies(DLQ_A).is_empty());
    assert!(backends.workflows.runs().is_empty());
}

#[tokio::test]
async fn heavy_stage_batch_is_restarted() {
    let backends = MockBackends::new();
    let batch = payload(PipelineStage::StageB);
    dead_letter(&backends, DLQ_B, serde_json::to_string(&batch).unwrap()).await;
    let redrive = Redrive::from_mocks(&backends);

    let outcome = redrive
        .redrive_once("adtech", "insights", PipelineStage::StageB)
        .await
        .unwrap();

    let RedriveOutcome::Restarted { workflow, run_id } = outcome else {
        panic!("expected a restarted run, got {outcome:?}");
    };
    assert_eq!(workflow, "prefix-adtech-insights-sm-b");
    let run = backends.workflows.run(run_id).unwrap();
    let restarted: BatchPayload = serde_json::from_value(run.input).unwrap();
    assert_eq!(restarted, batch);

    assert_eq!(backends.queues.delete_calls(), 1);
    assert!(backends.queues.bodies(DLQ_B).is_empty());
}

#[tokio::test]
async fn one_message_per_call() {
    let backends = MockBackends::new();
    for _ in 0..2 {
        let body = serde_json::to_string(&payload(PipelineStage::StageA)).unwrap();
        dead_letter(&backends, DLQ_A, body).await;
    }
    let redrive = Redrive::from_mocks(&backends);

    redrive
        .redrive_once("adtech", "insights", PipelineStage::StageA)
        .await
        .unwrap();
    assert_eq!(backends.queues.bodies(DLQ_A).len(), 1);
    assert_eq!(backends.queues.sent(QUEUE_A).len(), 1);
}

#[tokio::test]
async fn rejected_restart_keeps_the_message() {
    let backends = MockBackends::new();
    dead_letter(
        &backends,
        DLQ_B,
        serde_json::to_string(&payload(PipelineStage::StageB)).unwrap(),
    )
    .await;
    backends.workflows.reject_starts();
    let redrive = Redrive::from_mocks(&backends);

    let result = redrive
        .redrive_once("adtech", "insights", PipelineStage::StageB)
        .await;

    assert!(matches!(result, Err(PipelineError::Workflow(_))));
    assert_eq!(backends.queues.delete_calls(), 0);
    assert_eq!(backends.queues.bodies(DLQ_B).len(), 1);
}

#[tokio::test]
async fn unroutable_light_body_does_not_block_the_dlq() {
    let backends = MockBackends::new();
    dead_letter(&backends, DLQ_A, "not json".to_string()).await;
    let body = serde_json::to_string(&payload(PipelineStage::StageA)).unwrap();
    dead_letter(&backends, DLQ_A, body.clone()).await;
    let redrive = Redrive::from_mocks(&backends);

    let outcome = redrive
        .redrive_once("adtech", "insights", PipelineStage::StageA)
        .await
        .unwrap();
    assert!(matches!(outcome, RedriveOutcome::Discarded { .. }));
    assert_eq!(backends.queues.bodies(DLQ_A), vec![body.clone()]);
    assert!(backends.queues.sent(QUEUE_A).is_empty());

    // The next call gets to the batch behind it
    let outcome = redrive
        .redrive_once("adtech", "insights", PipelineStage::StageA)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RedriveOutcome::Requeued {
            queue: QUEUE_A.to_string()
        }
    );
    assert_eq!(backends.queues.sent(QUEUE_A)[0].body, body);
    assert!(backends.queues.bodies(DLQ_A).is_empty());
}

#[tokio::test]
async fn unparsable_heavy_body_is_discarded() {
    let backends = MockBackends::new();
    dead_letter(&backends, DLQ_B, r#"{"team": "adtech"}"#.to_string()).await;
    let redrive = Redrive::from_mocks(&backends);

    let outcome = redrive
        .redrive_once("adtech", "insights", PipelineStage::StageB)
        .await
        .unwrap();

    let RedriveOutcome::Discarded { reason, .. } = outcome else {
        panic!("expected a discarded message, got {outcome:?}");
    };
    assert!(reason.contains("not a batch payload"));
    assert!(backends.queues.bodies(DLQ_B).is_empty());
    assert!(backends.workflows.runs().is_empty());
}

#[tokio::test]
async fn sweep_covers_every_pipeline_stage_once() {
    let backends = MockBackends::new();
    for dataset in ["datasetA", "datasetB"] {
        backends
            .registry
            .put_dataset(&DatasetConfig {
                team: "adtech".to_string(),
                dataset: dataset.to_string(),
                pipeline: "insights".to_string(),
                min_items: BTreeMap::new(),
                max_items: BTreeMap::new(),
                stage_a_transform: "copy".to_string(),
                stage_b_transform: "copy".to_string(),
            })
            .await
            .unwrap();
    }
    dead_letter(
        &backends,
        DLQ_B,
        serde_json::to_string(&payload(PipelineStage::StageB)).unwrap(),
    )
    .await;

    let report = Redrive::from_mocks(&backends).run_once().await.unwrap();

    // Both datasets share one pipeline, so its two DLQs are read once each
    assert_eq!(
        report,
        RedriveReport {
            redriven: 1,
            empty: 1,
            discarded: 0,
            failed: 0
        }
    );
    assert_eq!(backends.queues.receive_calls(), 2);
    assert_eq!(backends.workflows.runs().len(), 1);
}

#[tokio::test]
async fn sweep_moves_past_unroutable_messages() {
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
    dead_letter(&backends, DLQ_A, "not json".to_string()).await;
    dead_letter(&backends, DLQ_A, r#"{"dataset": "datasetA"}"#.to_string()).await;
    let body = serde_json::to_string(&payload(PipelineStage::StageA)).unwrap();
    dead_letter(&backends, DLQ_A, body).await;

    let report = Redrive::from_mocks(&backends).run_once().await.unwrap();

    assert_eq!(
        report,
        RedriveReport {
            redriven: 1,
            empty: 1,
            discarded: 2,
            failed: 0
        }
    );
    assert_eq!(backends.queues.sent(QUEUE_A).len(), 1);
    assert!(backends.queues.bodies(DLQ_A).is_empty());
}

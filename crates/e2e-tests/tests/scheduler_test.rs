//! End-to-end scheduling tests: batching, retries, escalation and the
//! single in-flight cycle guarantee, against real stores.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use e2e_tests::{
    file_upsert, folder_upsert, wait_for_metrics, FlakyEngine, RecordingIngester, TestHarness,
};
use explorer_indexing::QueueReader;
use explorer_scheduler::{
    CountingHandler, FailureEscalation, IngestionConfig, IngestionPipeline, IngestionScheduler,
    SchedulerState,
};

const WAIT: Duration = Duration::from_secs(10);

fn quiet_config() -> IngestionConfig {
    IngestionConfig::default().with_max_idle_delay(Duration::from_secs(3600))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_batch_triggers_second_cycle() {
    let harness = TestHarness::new().await;
    harness
        .publish_table(vec![file_upsert("1", 1), file_upsert("2", 1), file_upsert("3", 1)])
        .await;

    let reader = harness.polling_reader();
    let pipeline = IngestionPipeline::new(reader.clone(), harness.ingester());
    let config = quiet_config().with_batch_size(2).with_max_attempt(3);
    let scheduler = IngestionScheduler::new(pipeline, config);

    // Start sees the backlog and wakes the scheduler
    scheduler.start().await.unwrap();
    let metrics = wait_for_metrics(&scheduler, WAIT, |m| m.ingest.succeeded == 3).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let metrics_after = scheduler.metrics().await.unwrap();
    scheduler.stop().await.unwrap();

    assert_eq!(metrics.ingest.succeeded, 3);
    assert_eq!(metrics_after.ingest.cycles, 2);
    assert_eq!(metrics_after.ingest.pending, 0);
    assert_eq!(reader.pending_count().await.unwrap(), 0);
    assert_eq!(harness.index_count("drive").await, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_triggers_never_overlap() {
    let harness = TestHarness::new().await;
    let recorder = Arc::new(RecordingIngester::new(harness.ingester(), Duration::from_millis(30)));
    let pipeline = IngestionPipeline::new(harness.stream_reader("worker-1"), recorder.clone());
    let scheduler = Arc::new(IngestionScheduler::new(pipeline, quiet_config()));
    scheduler.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let scheduler = scheduler.clone();
        handles.push(tokio::spawn(async move {
            scheduler.execute(i % 2 == 0).await.unwrap()
        }));
        harness.publish_stream(vec![file_upsert(&i.to_string(), 1)]).await;
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }
    let metrics = wait_for_metrics(&scheduler, WAIT, |m| m.ingest.succeeded == 8).await;
    scheduler.stop().await.unwrap();

    assert_eq!(recorder.max_active(), 1);
    assert_eq!(metrics.ingest.succeeded, 8);
    assert_eq!(harness.index_count("drive").await, 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_permanent_failure_escalates_once() {
    let harness = TestHarness::new().await;
    let counter = Arc::new(CountingHandler::new());
    let recorder = Arc::new(RecordingIngester::new(harness.ingester(), Duration::ZERO));
    let reader = harness.stream_reader("worker-1");
    let pipeline = IngestionPipeline::new(reader.clone(), recorder.clone())
        .with_escalation(FailureEscalation::new().with_handler(counter.clone()));
    let scheduler = IngestionScheduler::new(pipeline, quiet_config().with_max_attempt(3));

    // Parent never exists, so materialization fails every time
    harness
        .publish_stream(vec![folder_upsert("orphan", Some("missing"))])
        .await;
    scheduler.start().await.unwrap();
    let metrics = wait_for_metrics(&scheduler, WAIT, |m| m.ingest.dropped == 1).await;

    assert_eq!(metrics.ingest.dropped, 1);
    assert_eq!(metrics.ingest.failed, 3);
    assert_eq!(recorder.calls(), 3);
    assert_eq!(counter.total(), 1);
    assert_eq!(counter.count_for("drive", "folder"), 1);

    // Dropped events are gone from the queue
    scheduler.execute(true).await.unwrap();
    scheduler.stop().await.unwrap();
    assert_eq!(recorder.calls(), 3);
    assert_eq!(counter.total(), 1);
    assert_eq!(reader.pending_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_transient_failure_is_retried() {
    let harness = TestHarness::new().await;
    let engine = Arc::new(FlakyEngine::new(Arc::new(harness.engine.clone()), 1));
    let reader = harness.polling_reader();
    let pipeline = IngestionPipeline::new(reader.clone(), harness.ingester_with_engine(engine));
    let scheduler = IngestionScheduler::new(pipeline, quiet_config());

    harness.publish_table(vec![file_upsert("1", 1)]).await;
    let first = scheduler.trigger().await.unwrap();
    assert_eq!(first.ingest.failed, 1);
    assert_eq!(first.ingest.pending, 1);
    assert!(harness.resource_document("1", "drive", "file").await.is_none());

    let second = scheduler.trigger().await.unwrap();
    assert_eq!(second.ingest.succeeded, 1);
    assert_eq!(second.ingest.pending, 0);
    assert_eq!(second.read.requeued, 1);
    assert_eq!(second.read.acknowledged, 1);
    assert!(harness.resource_document("1", "drive", "file").await.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lifecycle_transitions() {
    let harness = TestHarness::new().await;
    let reader: Arc<dyn QueueReader> = harness.stream_reader("worker-1");
    let pipeline = IngestionPipeline::new(reader, harness.ingester());
    let scheduler = IngestionScheduler::new(pipeline, quiet_config());

    assert_eq!(scheduler.status().await.unwrap().state, SchedulerState::Idle);
    scheduler.start().await.unwrap();
    assert!(scheduler.status().await.unwrap().running);
    scheduler.stop().await.unwrap();
    assert_eq!(scheduler.status().await.unwrap().state, SchedulerState::Stopped);

    // Stopped schedulers ignore unforced executes
    assert!(!scheduler.execute(false).await.unwrap());
    assert!(scheduler.execute(true).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreadable_queue_row_is_escalated_not_ingested() {
    let harness = TestHarness::new().await;
    let garbled = harness.table.enqueue(&file_upsert("garbled", 1)).await.unwrap();
    sqlx::query("UPDATE explorer_queue SET payload = '\"not an object\"' WHERE id = ?1")
        .bind(garbled)
        .execute(harness.table.pool())
        .await
        .unwrap();
    harness.publish_table(vec![file_upsert("fine", 1)]).await;

    let counter = Arc::new(CountingHandler::new());
    let recorder = Arc::new(RecordingIngester::new(harness.ingester(), Duration::ZERO));
    let reader = harness.polling_reader();
    let pipeline = IngestionPipeline::new(reader.clone(), recorder.clone())
        .with_escalation(FailureEscalation::new().with_handler(counter.clone()));
    let scheduler = IngestionScheduler::new(pipeline, quiet_config().with_max_attempt(2));

    let first = scheduler.trigger().await.unwrap();
    assert_eq!(first.ingest.succeeded, 1);
    assert_eq!(first.ingest.failed, 1);
    let second = scheduler.trigger().await.unwrap();
    assert_eq!(second.ingest.dropped, 1);

    assert_eq!(recorder.calls(), 1);
    assert_eq!(counter.total(), 1);
    assert!(harness.resource_document("garbled", "drive", "file").await.is_none());
    assert!(harness.resource_document("fine", "drive", "file").await.is_some());

    let causes = harness.table.causes_for(garbled).await.unwrap();
    assert_eq!(causes.len(), 2);
    assert_eq!(causes[1].cause, "Payload is not a JSON object");
    assert!(causes[1].dropped);
    assert_eq!(reader.pending_count().await.unwrap(), 0);
}

//! End-to-end ingestion tests: queue -> relational store -> search index.
//!
//! Each test publishes producer events, drives cycles through the
//! ingestion scheduler and inspects the stored rows and documents.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use e2e_tests::{file_delete, file_upsert, folder_upsert, TestHarness};
use explorer_indexing::QueueReader;
use explorer_scheduler::{IngestionConfig, IngestionPipeline, IngestionScheduler};
use explorer_types::ROOT_FOLDER_ID;

fn scheduler(harness: &TestHarness, reader: Arc<dyn QueueReader>) -> IngestionScheduler {
    let pipeline = IngestionPipeline::new(reader, harness.ingester());
    IngestionScheduler::new(pipeline, IngestionConfig::default())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redelivered_upsert_leaves_one_document() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.stream_reader("worker-1"));

    harness.publish_stream(vec![file_upsert("1", 1)]).await;
    scheduler.trigger().await.unwrap();
    harness.publish_stream(vec![file_upsert("1", 1)]).await;
    let metrics = scheduler.trigger().await.unwrap();

    assert_eq!(metrics.ingest.succeeded, 2);
    assert_eq!(metrics.ingest.failed, 0);
    assert_eq!(harness.index_count("drive").await, 1);

    let document = harness.resource_document("1", "drive", "file").await.unwrap();
    assert_eq!(document.version, 1);
    assert_eq!(document.source["title"], json!("1 v1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_order_versions_keep_highest() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.polling_reader());

    for version in [3, 1, 2] {
        harness.publish_table(vec![file_upsert("1", version)]).await;
        scheduler.trigger().await.unwrap();
    }

    let document = harness.resource_document("1", "drive", "file").await.unwrap();
    assert_eq!(document.version, 3);
    assert_eq!(document.source["title"], json!("1 v3"));
    assert_eq!(harness.index_count("drive").await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_versions_in_one_batch_keep_highest() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.stream_reader("worker-1"));

    harness
        .publish_stream(vec![file_upsert("1", 3), file_upsert("1", 1), file_upsert("1", 2)])
        .await;
    let metrics = scheduler.trigger().await.unwrap();
    assert_eq!(metrics.ingest.fetched, 3);

    let document = harness.resource_document("1", "drive", "file").await.unwrap();
    assert_eq!(document.version, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repeated_delete_is_idempotent() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.stream_reader("worker-1"));

    harness.publish_stream(vec![file_upsert("1", 1)]).await;
    scheduler.trigger().await.unwrap();
    assert_eq!(harness.index_count("drive").await, 1);

    harness.publish_stream(vec![file_delete("1", 2)]).await;
    scheduler.trigger().await.unwrap();
    harness.publish_stream(vec![file_delete("1", 2)]).await;
    let metrics = scheduler.trigger().await.unwrap();

    assert_eq!(metrics.ingest.failed, 0);
    assert_eq!(metrics.ingest.succeeded, 3);
    assert_eq!(harness.index_count("drive").await, 0);
    assert!(harness.resource_document("1", "drive", "file").await.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_upsert_behind_delete_is_ignored() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.stream_reader("worker-1"));

    harness.publish_stream(vec![file_upsert("1", 1)]).await;
    scheduler.trigger().await.unwrap();

    // The late upsert lands in the same batch, behind the delete
    harness
        .publish_stream(vec![file_delete("1", 2), file_upsert("1", 1)])
        .await;
    let metrics = scheduler.trigger().await.unwrap();

    assert_eq!(metrics.ingest.failed, 0);
    assert_eq!(metrics.ingest.succeeded, 3);
    assert_eq!(harness.index_count("drive").await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_folder_chain_resolves_ancestors() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.stream_reader("worker-1"));

    // A -> B -> C -> root
    harness
        .publish_stream(vec![
            folder_upsert("C", None),
            folder_upsert("B", Some("C")),
            folder_upsert("A", Some("B")),
        ])
        .await;
    let metrics = scheduler.trigger().await.unwrap();
    assert_eq!(metrics.ingest.failed, 0);

    let (b, _) = harness.folder_path("B").await.unwrap();
    let (c, _) = harness.folder_path("C").await.unwrap();
    let (a, ancestors) = harness.folder_path("A").await.unwrap();
    assert_eq!(ancestors, vec![b, c, ROOT_FOLDER_ID]);

    let document = harness.folder_document("A").await.unwrap();
    assert_eq!(document.id, a.to_string());
    assert_eq!(document.source["ancestors"], json!([ROOT_FOLDER_ID, c, b]));
    assert_eq!(document.source["parentId"], json!(b));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_in_folder_is_visible_to_creator() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.polling_reader());

    harness.publish_table(vec![folder_upsert("home", None)]).await;
    scheduler.trigger().await.unwrap();
    harness
        .publish_table(vec![file_upsert("doc", 1)
            .with_field("creatorId", json!("alice"))
            .with_field("links", json!([{"folderId": "home", "userId": "alice"}]))])
        .await;
    scheduler.trigger().await.unwrap();

    let (home, _) = harness.folder_path("home").await.unwrap();
    let document = harness.resource_document("doc", "drive", "file").await.unwrap();
    assert_eq!(document.source["folderIds"], json!([home]));
    assert_eq!(document.visible_by(), vec!["creator:alice".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_upsert_cannot_restore_revoked_rights() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.polling_reader());

    harness
        .publish_table(vec![file_upsert("1", 3)
            .with_field("creatorId", json!("bob"))
            .with_field("rights", json!(["user:new:read"]))])
        .await;
    scheduler.trigger().await.unwrap();
    harness
        .publish_table(vec![file_upsert("1", 1)
            .with_field("creatorId", json!("mallory"))
            .with_field("rights", json!(["user:revoked:read"]))])
        .await;
    let metrics = scheduler.trigger().await.unwrap();
    assert_eq!(metrics.ingest.failed, 0);

    let document = harness.resource_document("1", "drive", "file").await.unwrap();
    assert_eq!(document.version, 3);
    assert_eq!(document.source["title"], json!("1 v3"));
    assert_eq!(document.source["creatorId"], json!("bob"));
    assert_eq!(
        document.visible_by(),
        vec!["creator:bob".to_string(), "user:new".to_string()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deleted_sub_resource_is_not_restored_by_older_version() {
    let harness = TestHarness::new().await;
    let scheduler = scheduler(&harness, harness.stream_reader("worker-1"));
    let with_sub = |version: i64, sub: serde_json::Value| {
        file_upsert("1", version).with_field("subResources", json!([sub]))
    };

    harness
        .publish_stream(vec![with_sub(1, json!({"id": "s", "version": 5, "body": "v5"}))])
        .await;
    scheduler.trigger().await.unwrap();
    harness
        .publish_stream(vec![with_sub(2, json!({"id": "s", "version": 6, "deleted": true}))])
        .await;
    scheduler.trigger().await.unwrap();
    let document = harness.resource_document("1", "drive", "file").await.unwrap();
    assert!(document.live_sub_resources().is_empty());

    // Late redelivery of the first revision
    harness
        .publish_stream(vec![with_sub(1, json!({"id": "s", "version": 5, "body": "v5"}))])
        .await;
    let metrics = scheduler.trigger().await.unwrap();
    assert_eq!(metrics.ingest.failed, 0);

    let document = harness.resource_document("1", "drive", "file").await.unwrap();
    assert_eq!(document.version, 2);
    assert!(document.live_sub_resources().is_empty());
}

//! Producers: put new events on a queue.
//!
//! Priority is always derived from the action and the `forSearch` flag.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use explorer_relational::QueueTable;
use explorer_storage::{primary_stream, StorageError, StreamStore};
use explorer_types::{NewEvent, QueueToken, QueuedEvent};

use crate::error::IndexingError;

/// Something that accepts producer events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: NewEvent) -> Result<QueueToken, IndexingError>;
}

/// Appends events to the priority stream matching their priority.
pub struct StreamPublisher {
    store: Arc<StreamStore>,
}

impl StreamPublisher {
    pub fn new(store: Arc<StreamStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventPublisher for StreamPublisher {
    async fn publish(&self, event: NewEvent) -> Result<QueueToken, IndexingError> {
        let queued = QueuedEvent::from_new(event, QueueToken::Derived, Utc::now());
        let stream = primary_stream(queued.priority.as_str())
            .ok_or_else(|| StorageError::UnknownStream(queued.priority.as_str().to_string()))?;
        let payload = queued.to_bytes()?;

        let store = self.store.clone();
        let seq = tokio::task::spawn_blocking(move || store.append(stream, &payload)).await??;

        debug!(resource_id = %queued.resource_id, stream, seq, "Published event");
        Ok(QueueToken::Stream {
            stream: stream.to_string(),
            seq,
        })
    }
}

#[async_trait]
impl EventPublisher for QueueTable {
    async fn publish(&self, event: NewEvent) -> Result<QueueToken, IndexingError> {
        Ok(QueueToken::Row(self.enqueue(&event).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use explorer_relational::connect_in_memory;
    use explorer_types::IngestAction;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stream_publisher_routes_by_priority() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(StreamStore::open(temp_dir.path()).unwrap());
        let publisher = StreamPublisher::new(store.clone());

        let token = publisher
            .publish(NewEvent::new("1", "drive", "file", IngestAction::Audience, 1))
            .await
            .unwrap();
        assert!(matches!(token, QueueToken::Stream { ref stream, .. } if stream == "low"));

        publisher
            .publish(NewEvent::new("2", "drive", "file", IngestAction::Delete, 1).for_search(true))
            .await
            .unwrap();
        assert_eq!(store.stream_len("high").unwrap(), 1);
        assert_eq!(store.stream_len("low").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_table_publisher() {
        let table = QueueTable::new(connect_in_memory().await.unwrap());
        let token = table
            .publish(NewEvent::new("1", "drive", "file", IngestAction::Upsert, 1))
            .await
            .unwrap();
        assert!(matches!(token, QueueToken::Row(_)));
        assert_eq!(table.pending_count(0, 1).await.unwrap(), 1);
    }
}

//! Queue records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An entry in a durable work queue.
///
/// Queues are ordered by `created_at`. A failed item keeps its position and
/// only its `retry_count` changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem<T> {
    pub id: String,
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl<T> QueueItem<T> {
    pub fn new(value: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            value,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }
}

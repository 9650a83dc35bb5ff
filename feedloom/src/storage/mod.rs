//! Post dedup store and outbox storage backends.
//!
//! Both stores come in an ephemeral in-memory flavor and an embedded SQL
//! flavor. The SQL flavor is the durability boundary of the pipeline: dedup
//! rows and uncommitted outbox items survive process restarts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Error, Message, Stream};

pub mod memory;
pub mod sqlite;

/// Key under which processed post ids are recorded: one dedup scope per
/// `(source id, receiver type)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// Source id part of the key
    pub source_id: String,
    /// Receiver type (or alias) part of the key
    pub receiver_type: String,
}

impl DedupKey {
    /// Builds the dedup key for one source/stream pair.
    pub fn new(source_id: &str, receiver_type: &str) -> Self {
        DedupKey {
            source_id: source_id.to_string(),
            receiver_type: receiver_type.to_string(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.source_id, self.receiver_type)
    }
}

/// Remembers which post ids have been processed per dedup key. The recorded
/// set only ever grows during a run; callers must not rely on row counts
/// since backends tolerate duplicate rows.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// True iff at least one post id has ever been recorded for `key`.
    async fn has_any(&self, key: &DedupKey) -> Result<bool, Error>;

    /// True iff `post_id` has been recorded for `key`.
    async fn is_processed(&self, key: &DedupKey, post_id: &str) -> Result<bool, Error>;

    /// Records `post_ids` for `key`. Idempotent: duplicates in the input or
    /// against existing rows are silently absorbed.
    async fn mark_processed(&self, key: &DedupKey, post_ids: &[String]) -> Result<(), Error>;
}

/// Durable unit of delivery work: the messages of one materialization burst
/// bound to one stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutboxItem {
    /// Fresh UUID assigned at materialization
    pub id: String,
    /// Id of the source the messages came from
    pub source_id: String,
    /// Stream the messages are owed to
    pub stream: Stream,
    /// Messages to deliver, oldest first
    pub messages: Vec<Message>,
}

impl OutboxItem {
    /// Wraps `messages` into a new item with a fresh id.
    pub fn new(source_id: &str, stream: Stream, messages: Vec<Message>) -> Self {
        OutboxItem {
            id: Uuid::new_v4().simple().to_string(),
            source_id: source_id.to_string(),
            stream,
            messages,
        }
    }
}

/// Backing store for the messages outbox. All timestamps are wall-clock
/// unix seconds supplied by the caller so the claim state survives restarts.
#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// Appends `item` to the queue with `now` as its created-at timestamp.
    async fn put(&self, item: &OutboxItem, now: i64) -> Result<(), Error>;

    /// Claims and returns the oldest unclaimed item, marking it in progress
    /// at `now`. Returns `None` when every item is claimed or the queue is
    /// empty.
    async fn get(&self, now: i64) -> Result<Option<OutboxItem>, Error>;

    /// Returns the item with the oldest claim older than `delta` seconds,
    /// without re-claiming it. Returns `None` when no claim is that stale.
    async fn get_dead_letter(&self, now: i64, delta: i64) -> Result<Option<OutboxItem>, Error>;

    /// Removes the item permanently. Unknown ids are a no-op.
    async fn commit(&self, id: &str) -> Result<(), Error>;
}

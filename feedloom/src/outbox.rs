//! Durable message outbox with dead-letter recovery.
//!
//! An [OutboxItem] is "owed" to its receiver from `put` until `commit`.
//! Consumers claim items through `get`; a claim that is not committed within
//! the dead-letter threshold becomes visible again through
//! `get_dead_letter`, so crashed or hung senders never lose messages.
//! Duplicate delivery is explicitly permitted.

use chrono::Utc;
use std::time::Duration;
use tokio::time::sleep;

use crate::storage::{OutboxItem, OutboxStorage};
use crate::Error;

/// Seconds after which an uncommitted claim becomes dead-letter eligible.
pub const DEAD_LETTER_DELTA_SECS: i64 = 60 * 10;

const GET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEAD_LETTER_POLL_INTERVAL: Duration = Duration::from_secs(10);

type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Blocking facade over an [OutboxStorage] backend. Injects wall-clock time
/// so claim ages survive restarts, and polls when the queue has nothing to
/// hand out.
pub struct MessagesOutbox {
    storage: Box<dyn OutboxStorage>,
    dead_letter_delta: i64,
    clock: Clock,
}

impl MessagesOutbox {
    /// Wraps a storage backend with the default wall clock.
    /// ```
    /// # use feedloom::outbox::MessagesOutbox;
    /// # use feedloom::storage::memory::MemoryOutboxStorage;
    /// # tokio_test::block_on(async {
    /// let outbox = MessagesOutbox::new(Box::new(MemoryOutboxStorage::new()));
    /// outbox.commit("unknown").await.unwrap();
    /// # })
    /// ```
    pub fn new(storage: Box<dyn OutboxStorage>) -> Self {
        MessagesOutbox {
            storage,
            dead_letter_delta: DEAD_LETTER_DELTA_SECS,
            clock: Box::new(unix_now),
        }
    }

    /// Wraps a storage backend with a caller-supplied clock. Used by tests
    /// to advance time past the dead-letter threshold.
    pub fn with_clock(storage: Box<dyn OutboxStorage>, clock: Clock) -> Self {
        MessagesOutbox {
            storage,
            dead_letter_delta: DEAD_LETTER_DELTA_SECS,
            clock,
        }
    }

    /// Appends an item to the queue.
    pub async fn put(&self, item: &OutboxItem) -> Result<(), Error> {
        self.storage.put(item, (self.clock)()).await
    }

    /// Claims the next unclaimed item, waiting until one exists.
    pub async fn get(&self) -> Result<OutboxItem, Error> {
        loop {
            if let Some(item) = self.storage.get((self.clock)()).await? {
                return Ok(item);
            }
            sleep(GET_POLL_INTERVAL).await;
        }
    }

    /// Returns the next item whose claim went stale, waiting until one
    /// exists.
    pub async fn get_dead_letter(&self) -> Result<OutboxItem, Error> {
        loop {
            if let Some(item) = self
                .storage
                .get_dead_letter((self.clock)(), self.dead_letter_delta)
                .await?
            {
                return Ok(item);
            }
            sleep(DEAD_LETTER_POLL_INTERVAL).await;
        }
    }

    /// Removes an item permanently. Idempotent; unknown ids are a no-op.
    pub async fn commit(&self, id: &str) -> Result<(), Error> {
        self.storage.commit(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryOutboxStorage;
    use crate::Stream;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;
    use tokio::time::timeout;

    fn stream() -> Stream {
        Stream {
            receiver_type: "console_printer".into(),
            receiver_options: serde_yaml::Value::Null,
            message_template: "${title}".into(),
            modifiers: Vec::new(),
            squash: false,
            intervals: Vec::new(),
        }
    }

    fn item() -> OutboxItem {
        OutboxItem::new("src", stream(), Vec::new())
    }

    fn sut_with_clock() -> (MessagesOutbox, Arc<AtomicI64>) {
        let clock = Arc::new(AtomicI64::new(1_000));
        let handle = Arc::clone(&clock);
        let outbox = MessagesOutbox::with_clock(
            Box::new(MemoryOutboxStorage::new()),
            Box::new(move || handle.load(Ordering::SeqCst)),
        );
        (outbox, clock)
    }

    #[tokio::test]
    async fn can_put_and_get_item() {
        let (sut, _) = sut_with_clock();
        let item = item();
        sut.put(&item).await.unwrap();

        let result = sut.get().await.unwrap();
        assert_eq!(result, item);
    }

    #[tokio::test]
    async fn get_waits_forever_if_queue_is_empty() {
        let (sut, _) = sut_with_clock();
        let result = timeout(Duration::from_millis(300), sut.get()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn get_waits_for_item_until_it_appears() {
        let (sut, _) = sut_with_clock();
        let sut = Arc::new(sut);
        let item = item();

        let waiter = Arc::clone(&sut);
        let task = tokio::spawn(async move { waiter.get().await });
        sleep(Duration::from_millis(50)).await;

        sut.put(&item).await.unwrap();
        let result = task.await.unwrap().unwrap();
        assert_eq!(result, item);
    }

    #[tokio::test]
    async fn claimed_item_is_invisible_to_get() {
        let (sut, _) = sut_with_clock();
        sut.put(&item()).await.unwrap();

        let _ = sut.get().await.unwrap();
        let second = timeout(Duration::from_millis(300), sut.get()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn item_disappears_after_commit() {
        let (sut, _) = sut_with_clock();
        let item = item();
        sut.put(&item).await.unwrap();
        let claimed = sut.get().await.unwrap();
        sut.commit(&claimed.id).await.unwrap();

        let result = timeout(Duration::from_millis(300), sut.get()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn commit_is_idempotent() {
        let (sut, _) = sut_with_clock();
        let item = item();
        sut.put(&item).await.unwrap();
        sut.commit(&item.id).await.unwrap();
        sut.commit(&item.id).await.unwrap();
        sut.commit("unknown").await.unwrap();
    }

    #[tokio::test]
    async fn stale_claim_becomes_dead_letter() {
        let (sut, clock) = sut_with_clock();
        let item = item();
        sut.put(&item).await.unwrap();
        let claimed = sut.get().await.unwrap();

        clock.fetch_add(DEAD_LETTER_DELTA_SECS + 1, Ordering::SeqCst);

        let dead = sut.get_dead_letter().await.unwrap();
        assert_eq!(dead.id, claimed.id);

        sut.commit(&dead.id).await.unwrap();
        let after = timeout(Duration::from_millis(300), sut.get()).await;
        assert!(after.is_err());
    }

    #[tokio::test]
    async fn fresh_claim_is_not_dead_letter_yet() {
        let (sut, clock) = sut_with_clock();
        sut.put(&item()).await.unwrap();
        let _ = sut.get().await.unwrap();

        clock.fetch_add(DEAD_LETTER_DELTA_SECS - 1, Ordering::SeqCst);

        let result = timeout(Duration::from_millis(300), sut.get_dead_letter()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fifo_within_unclaimed_items() {
        let (sut, _) = sut_with_clock();
        let first = item();
        let second = item();
        sut.put(&first).await.unwrap();
        sut.put(&second).await.unwrap();

        let a = sut.get().await.unwrap();
        let b = sut.get().await.unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
    }
}

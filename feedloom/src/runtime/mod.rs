//! Pipeline orchestrator.
//!
//! Five task groups exchange work over bounded channels:
//! enqueuer → fetch pool → parser → materializer → sender, with a second
//! sender draining dead letters. The outbox between materializer and sender
//! is the durability boundary; everything upstream of it may be repeated
//! freely after a crash.

use flume::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

mod logic;
pub use logic::prepare_message_batches;

use crate::config::{Configuration, HandlerRegistry, StorageKind};
use crate::limiter::DomainRateLimiter;
use crate::metrics::{create_metrics, FetchStatus, Metrics};
use crate::outbox::MessagesOutbox;
use crate::storage::memory::{MemoryOutboxStorage, MemoryPostStore};
use crate::storage::sqlite::{open_database, SqliteOutboxStorage, SqlitePostStore};
use crate::storage::{OutboxItem, OutboxStorage, PostStore};
use crate::{Error, Post, Source, Stream};

/// Capacity of the channels between pipeline stages.
const QUEUE_CAPACITY: usize = 1024;

/// Interval between metrics file rewrites.
const METRICS_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Backoff after a storage read error before the stage retries.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

struct TextUnit {
    text: String,
    source: Source,
}

struct PostsUnit {
    posts: Vec<Post>,
    source: Source,
    stream: Stream,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Fresh,
    DeadLetter,
}

/// A configured pipeline, ready to run.
pub struct Runtime {
    configuration: Configuration,
    registry: Arc<HandlerRegistry>,
    post_store: Arc<dyn PostStore>,
    outbox: Arc<MessagesOutbox>,
    metrics: Arc<dyn Metrics>,
    limiter: Arc<DomainRateLimiter>,
    timeout: Option<Duration>,
}

impl Runtime {
    /// Wires storage backends, metrics and the rate limiter from the
    /// configuration. The registry must already be initialized against the
    /// same configuration.
    pub fn new(configuration: Configuration, registry: HandlerRegistry) -> Result<Self, Error> {
        let settings = &configuration.app_settings;

        let needs_sql = settings.post_storage == StorageKind::Sql
            || settings.outbox_storage == StorageKind::Sql;
        let connection = if needs_sql {
            let path = settings.sql_db_path.as_ref().ok_or_else(|| {
                Error::ConfigFailedValidation(
                    "sql_db_path is required when a sql storage backend is selected".into(),
                )
            })?;
            Some(open_database(path)?)
        } else {
            None
        };

        let post_store: Arc<dyn PostStore> = match settings.post_storage {
            StorageKind::Memory => Arc::new(MemoryPostStore::new()),
            StorageKind::Sql => {
                let conn = connection.clone().ok_or(Error::ConfigFailedValidation(
                    "sql connection unavailable".into(),
                ))?;
                Arc::new(SqlitePostStore::new(conn))
            }
        };
        let outbox_storage: Box<dyn OutboxStorage> = match settings.outbox_storage {
            StorageKind::Memory => Box::new(MemoryOutboxStorage::new()),
            StorageKind::Sql => {
                let conn = connection.ok_or(Error::ConfigFailedValidation(
                    "sql connection unavailable".into(),
                ))?;
                Box::new(SqliteOutboxStorage::new(conn))
            }
        };

        let metrics = create_metrics(settings)?;

        Ok(Runtime {
            configuration,
            registry: Arc::new(registry),
            post_store,
            outbox: Arc::new(MessagesOutbox::new(outbox_storage)),
            metrics,
            limiter: Arc::new(DomainRateLimiter::new()),
            timeout: None,
        })
    }

    /// Limits how long [Runtime::run] keeps the pipeline alive. Mainly a
    /// test hook; production runs until a shutdown signal arrives.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Runs the pipeline until a shutdown signal (or the configured
    /// timeout). In-flight outbox items roll over to the next run's
    /// dead-letter pathway; the on-disk outbox state is the authority.
    pub async fn run(&self) -> Result<(), Error> {
        let settings = &self.configuration.app_settings;
        let mut handles: JoinSet<Result<(), Error>> = JoinSet::new();

        // Dropping the sender wakes every worker holding a receiver clone.
        let (ks_tx, ks_rx) = bounded::<()>(1);
        let mut ks_tx = Some(ks_tx);

        let (src_tx, src_rx) = bounded::<Source>(QUEUE_CAPACITY);
        let (text_tx, text_rx) = bounded::<TextUnit>(QUEUE_CAPACITY);
        let (post_tx, post_rx) = bounded::<PostsUnit>(QUEUE_CAPACITY);

        let _ = handles.spawn(enqueue_sources(
            self.configuration.sources.clone(),
            src_tx,
            settings.poll_interval,
            ks_rx.clone(),
        ));

        for job_id in 1..=settings.fetch_workers {
            let _ = handles.spawn(fetch_worker(
                job_id,
                src_rx.clone(),
                text_tx.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.limiter),
                Arc::clone(&self.metrics),
                settings.host_min_spacing,
                ks_rx.clone(),
            ));
        }
        drop(src_rx);
        drop(text_tx);

        let _ = handles.spawn(parse_worker(
            text_rx,
            post_tx,
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            ks_rx.clone(),
        ));

        let _ = handles.spawn(prepare_worker(
            post_rx,
            Arc::clone(&self.post_store),
            Arc::clone(&self.outbox),
            Arc::clone(&self.metrics),
            ks_rx.clone(),
        ));

        for delivery in [Delivery::Fresh, Delivery::DeadLetter] {
            let _ = handles.spawn(send_worker(
                delivery,
                Arc::clone(&self.outbox),
                Arc::clone(&self.registry),
                Arc::clone(&self.metrics),
                ks_rx.clone(),
            ));
        }

        let _ = handles.spawn(metrics_flush_worker(
            Arc::clone(&self.metrics),
            ks_rx.clone(),
        ));
        drop(ks_rx);

        info!(
            sources = self.configuration.sources.len(),
            fetch_workers = settings.fetch_workers,
            "pipeline started"
        );

        let shutdown_timer = sleep(
            self.timeout
                .unwrap_or(Duration::from_secs(60 * 60 * 24 * 365)),
        );
        tokio::pin!(shutdown_timer);

        loop {
            tokio::select! {
                res = handles.join_next() => {
                    match res {
                        Some(Ok(Ok(()))) => {}
                        Some(Ok(Err(e))) => return Err(e),
                        Some(Err(e)) => {
                            return Err(Error::ExecutionError(format!("{e}")));
                        }
                        None => break,
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal, initiating graceful shutdown");
                    let _ = ks_tx.take();
                }
                _ = &mut shutdown_timer, if ks_tx.is_some() => {
                    debug!("runtime timeout reached, shutting down");
                    let _ = ks_tx.take();
                }
            }
        }

        info!("pipeline finished");
        Ok(())
    }
}

/// Pushes every source into the fetch queue, then sleeps out the poll
/// period. Sources are re-pushed even if earlier ticks are still in
/// flight; downstream stages tolerate repeated work.
async fn enqueue_sources(
    sources: Vec<Source>,
    src_tx: Sender<Source>,
    period: Duration,
    shutdown: Receiver<()>,
) -> Result<(), Error> {
    loop {
        for source in &sources {
            if src_tx.send_async(source.clone()).await.is_err() {
                debug!("source queue closed, stopping enqueuer");
                return Ok(());
            }
        }
        info!(count = sources.len(), period = ?period, "enqueued sources");
        tokio::select! {
            _ = shutdown.recv_async() => return Ok(()),
            _ = sleep(period) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_worker(
    job_id: usize,
    src_rx: Receiver<Source>,
    text_tx: Sender<TextUnit>,
    registry: Arc<HandlerRegistry>,
    limiter: Arc<DomainRateLimiter>,
    metrics: Arc<dyn Metrics>,
    min_spacing: Duration,
    shutdown: Receiver<()>,
) -> Result<(), Error> {
    loop {
        let source = tokio::select! {
            _ = shutdown.recv_async() => return Ok(()),
            received = src_rx.recv_async() => match received {
                Ok(source) => source,
                Err(_) => return Ok(()),
            },
        };

        debug!(worker = job_id, source = source.id, "fetching source");
        match logic::fetch_source_text(&registry, &limiter, &source, min_spacing).await {
            Ok(Some(text)) if !text.is_empty() => {
                metrics.inc_sources_fetched(&source.id, FetchStatus::Ok);
                if text_tx.send_async(TextUnit { text, source }).await.is_err() {
                    return Ok(());
                }
            }
            Ok(_) => {
                warn!(source = source.id, "can't fetch text for source");
                metrics.inc_sources_fetched(&source.id, FetchStatus::Failed);
            }
            Err(e) => {
                warn!(source = source.id, error = format!("{e}"), "fetch failed");
                metrics.inc_sources_fetched(&source.id, FetchStatus::Failed);
            }
        }
    }
}

async fn parse_worker(
    text_rx: Receiver<TextUnit>,
    post_tx: Sender<PostsUnit>,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<dyn Metrics>,
    shutdown: Receiver<()>,
) -> Result<(), Error> {
    loop {
        let unit = tokio::select! {
            _ = shutdown.recv_async() => return Ok(()),
            received = text_rx.recv_async() => match received {
                Ok(unit) => unit,
                Err(_) => return Ok(()),
            },
        };

        debug!(source = unit.source.id, "parsing text");
        let posts = match logic::parse_posts(&registry, &unit.source, &unit.text).await {
            Ok(posts) => posts,
            Err(e) => {
                warn!(
                    source = unit.source.id,
                    error = format!("{e}"),
                    "parse failed, dropping tick"
                );
                continue;
            }
        };
        if !posts.is_empty() {
            metrics.inc_posts_parsed(&unit.source.id);
        }

        for (stream, posts) in logic::fan_out_to_streams(&registry, &unit.source, &posts).await {
            let posts_unit = PostsUnit {
                posts,
                source: unit.source.clone(),
                stream,
            };
            if post_tx.send_async(posts_unit).await.is_err() {
                return Ok(());
            }
        }
    }
}

async fn prepare_worker(
    post_rx: Receiver<PostsUnit>,
    post_store: Arc<dyn PostStore>,
    outbox: Arc<MessagesOutbox>,
    metrics: Arc<dyn Metrics>,
    shutdown: Receiver<()>,
) -> Result<(), Error> {
    loop {
        let unit = tokio::select! {
            _ = shutdown.recv_async() => return Ok(()),
            received = post_rx.recv_async() => match received {
                Ok(unit) => unit,
                Err(_) => return Ok(()),
            },
        };

        let batches = match logic::prepare_message_batches(
            post_store.as_ref(),
            &unit.source,
            &unit.stream,
            &unit.posts,
        )
        .await
        {
            Ok(batches) => batches,
            Err(e) => {
                // The tick is dropped; outbox state stays authoritative and
                // the work is re-attempted on the next tick.
                error!(
                    source = unit.source.id,
                    error = format!("{e}"),
                    "materialization failed, dropping tick"
                );
                continue;
            }
        };

        for batch in batches {
            metrics.inc_messages_prepared(
                &unit.source.id,
                &unit.stream.receiver_type,
                batch.len() as u64,
            );
            let item = OutboxItem::new(&unit.source.id, unit.stream.clone(), batch);
            if let Err(e) = outbox.put(&item).await {
                error!(
                    source = unit.source.id,
                    error = format!("{e}"),
                    "failed to enqueue outbox item"
                );
            }
        }
    }
}

async fn send_worker(
    delivery: Delivery,
    outbox: Arc<MessagesOutbox>,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<dyn Metrics>,
    shutdown: Receiver<()>,
) -> Result<(), Error> {
    loop {
        let item = tokio::select! {
            _ = shutdown.recv_async() => return Ok(()),
            claimed = async {
                match delivery {
                    Delivery::Fresh => outbox.get().await,
                    Delivery::DeadLetter => outbox.get_dead_letter().await,
                }
            } => match claimed {
                Ok(item) => item,
                Err(e) => {
                    error!(error = format!("{e}"), "outbox read failed");
                    sleep(STORE_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        match logic::send_outbox_item(&registry, &item).await {
            Ok(()) => {
                if let Err(e) = outbox.commit(&item.id).await {
                    error!(id = item.id, error = format!("{e}"), "commit failed");
                    continue;
                }
                metrics.inc_messages_sent(
                    &item.source_id,
                    &item.stream.receiver_type,
                    item.messages.len() as u64,
                );
                debug!(id = item.id, messages = item.messages.len(), "item delivered");
            }
            Err(e) => {
                // No commit: the item becomes dead-letter eligible and will
                // be retried.
                warn!(
                    id = item.id,
                    receiver = item.stream.receiver_type,
                    error = format!("{e}"),
                    "send failed, leaving item for dead-letter retry"
                );
            }
        }
    }
}

async fn metrics_flush_worker(
    metrics: Arc<dyn Metrics>,
    shutdown: Receiver<()>,
) -> Result<(), Error> {
    loop {
        tokio::select! {
            _ = shutdown.recv_async() => return Ok(()),
            _ = sleep(METRICS_FLUSH_INTERVAL) => {
                if let Err(e) = metrics.write_to_file() {
                    warn!(error = format!("{e}"), "metrics flush failed");
                }
            }
        }
    }
}

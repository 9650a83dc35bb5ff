//! Metrics sinks.
//!
//! The runtime reports pipeline counters through the [Metrics] trait. The
//! default sink discards everything; the `prom_file` sink keeps prometheus
//! counters and atomically rewrites a text file for node-exporter style
//! scraping.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{AppSettings, MetricsClient};
use crate::Error;

/// Outcome label of a source fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchStatus {
    /// Fetch produced text
    Ok,
    /// Fetch failed or produced nothing
    Failed,
}

impl FetchStatus {
    /// Label value recorded with the counter.
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Ok => "ok",
            FetchStatus::Failed => "failed",
        }
    }
}

/// Sink for pipeline counters. Implementations must be cheap and
/// non-blocking; they are called from the hot path of every stage.
pub trait Metrics: Send + Sync {
    /// Counts one fetch attempt per source and status.
    fn inc_sources_fetched(&self, source_id: &str, status: FetchStatus);

    /// Counts one parser tick that produced posts.
    fn inc_posts_parsed(&self, source_id: &str);

    /// Counts messages materialized for a stream.
    fn inc_messages_prepared(&self, source_id: &str, receiver_id: &str, messages_count: u64);

    /// Counts messages delivered and committed.
    fn inc_messages_sent(&self, source_id: &str, receiver_id: &str, messages_count: u64);

    /// Flushes the current counter values to the export target, if any.
    fn write_to_file(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Discards all counters. Used when no metrics client is configured.
#[derive(Debug, Default)]
pub struct NullMetrics;

impl NullMetrics {
    /// Creates a no-op sink.
    pub fn new() -> Self {
        Self
    }
}

impl Metrics for NullMetrics {
    fn inc_sources_fetched(&self, _source_id: &str, _status: FetchStatus) {}

    fn inc_posts_parsed(&self, _source_id: &str) {}

    fn inc_messages_prepared(&self, _source_id: &str, _receiver_id: &str, _messages_count: u64) {}

    fn inc_messages_sent(&self, _source_id: &str, _receiver_id: &str, _messages_count: u64) {}
}

/// Prometheus counters exported through atomic rewrites of a text file.
pub struct PromFileMetrics {
    registry: Registry,
    sources_fetched: IntCounterVec,
    posts_parsed: IntCounterVec,
    messages_prepared: IntCounterVec,
    messages_sent: IntCounterVec,
    uptime: IntGauge,
    started: Instant,
    path: PathBuf,
}

impl PromFileMetrics {
    /// Creates the counter family and binds it to `path`.
    pub fn new(path: &Path) -> Result<Self, Error> {
        let registry = Registry::new();

        let sources_fetched = IntCounterVec::new(
            Opts::new("sources_fetched_total", "Number of sources fetched"),
            &["source_id", "status"],
        )
        .map_err(|e| Error::ExecutionError(format!("{e}")))?;
        let posts_parsed = IntCounterVec::new(
            Opts::new("posts_parsed_total", "Number of posts parsed"),
            &["source_id"],
        )
        .map_err(|e| Error::ExecutionError(format!("{e}")))?;
        let messages_prepared = IntCounterVec::new(
            Opts::new("messages_prepared_total", "Number of messages prepared"),
            &["source_id", "receiver_id"],
        )
        .map_err(|e| Error::ExecutionError(format!("{e}")))?;
        let messages_sent = IntCounterVec::new(
            Opts::new("messages_sent_total", "Number of messages sent"),
            &["source_id", "receiver_id"],
        )
        .map_err(|e| Error::ExecutionError(format!("{e}")))?;
        let uptime = IntGauge::new("process_uptime_seconds", "Process uptime in seconds")
            .map_err(|e| Error::ExecutionError(format!("{e}")))?;

        for collector in [
            &sources_fetched,
            &posts_parsed,
            &messages_prepared,
            &messages_sent,
        ] {
            registry
                .register(Box::new(collector.clone()))
                .map_err(|e| Error::ExecutionError(format!("{e}")))?;
        }
        registry
            .register(Box::new(uptime.clone()))
            .map_err(|e| Error::ExecutionError(format!("{e}")))?;

        Ok(PromFileMetrics {
            registry,
            sources_fetched,
            posts_parsed,
            messages_prepared,
            messages_sent,
            uptime,
            started: Instant::now(),
            path: path.to_path_buf(),
        })
    }
}

impl Metrics for PromFileMetrics {
    fn inc_sources_fetched(&self, source_id: &str, status: FetchStatus) {
        self.sources_fetched
            .with_label_values(&[source_id, status.as_str()])
            .inc();
    }

    fn inc_posts_parsed(&self, source_id: &str) {
        self.posts_parsed.with_label_values(&[source_id]).inc();
    }

    fn inc_messages_prepared(&self, source_id: &str, receiver_id: &str, messages_count: u64) {
        self.messages_prepared
            .with_label_values(&[source_id, receiver_id])
            .inc_by(messages_count);
    }

    fn inc_messages_sent(&self, source_id: &str, receiver_id: &str, messages_count: u64) {
        self.messages_sent
            .with_label_values(&[source_id, receiver_id])
            .inc_by(messages_count);
    }

    fn write_to_file(&self) -> Result<(), Error> {
        self.uptime.set(self.started.elapsed().as_secs() as i64);

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::ExecutionError(format!("{e}")))?;

        // Rewrite atomically so scrapers never observe a torn file.
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &buffer)
            .map_err(|e| Error::ExecutionError(format!("{}: {e}", tmp_path.display())))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::ExecutionError(format!("{}: {e}", self.path.display())))?;
        debug!(path = %self.path.display(), "metrics written");
        Ok(())
    }
}

/// Builds the metrics sink selected by the application settings.
pub fn create_metrics(settings: &AppSettings) -> Result<Arc<dyn Metrics>, Error> {
    match settings.metrics_client {
        MetricsClient::None => Ok(Arc::new(NullMetrics::new())),
        MetricsClient::PromFile => {
            let path = settings.metrics_file.as_ref().ok_or_else(|| {
                Error::ConfigFailedValidation(
                    "metrics_file is required when metrics_client is prom_file".into(),
                )
            })?;
            Ok(Arc::new(PromFileMetrics::new(path)?))
        }
    }
}

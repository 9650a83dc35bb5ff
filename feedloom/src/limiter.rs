//! Per-host fetch pacing.
//!
//! Callers take a lease for the host of the url they are about to fetch.
//! Leases for the same host are strictly serialized and spaced at least
//! `min_spacing` apart; leases for different hosts do not block each other.
//! Dropping a lease without calling [Lease::release] (cancellation) leaves
//! the host's last-call timestamp untouched.

use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::utils::http::domain_from_url;
use crate::Error;

type HostSlot = Arc<AsyncMutex<Option<Instant>>>;

/// Serializes and paces fetches per host.
#[derive(Default)]
pub struct DomainRateLimiter {
    hosts: Mutex<FxHashMap<String, HostSlot>>,
}

impl DomainRateLimiter {
    /// Creates a limiter with no recorded hosts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lease for the host of `url`, waiting until the previous
    /// lease holder released at least `min_spacing` ago. Urls that do not
    /// parse share a single slot keyed by the raw string.
    pub async fn lease(&self, url: &str, min_spacing: Duration) -> Result<Lease, Error> {
        let host = domain_from_url(url).unwrap_or_else(|| url.to_string());
        let slot = {
            let mut hosts = self.hosts.lock().map_err(|_| Error::UnableToSecureLock)?;
            Arc::clone(hosts.entry(host.clone()).or_default())
        };

        let guard = slot.lock_owned().await;
        if let Some(last_call) = *guard {
            let elapsed = last_call.elapsed();
            if elapsed < min_spacing {
                trace!(host = host, wait = ?(min_spacing - elapsed), "pacing fetch");
                sleep(min_spacing - elapsed).await;
            }
        }
        Ok(Lease { guard })
    }
}

/// Exclusive access to one host, held for the duration of a fetch.
pub struct Lease {
    guard: OwnedMutexGuard<Option<Instant>>,
}

impl Lease {
    /// Records the host's last-call timestamp and releases the lease. Call
    /// this after the fetch finishes, whatever its outcome.
    pub fn release(mut self) {
        *self.guard = Some(Instant::now());
    }
}

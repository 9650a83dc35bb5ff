//! HTTP text fetcher.
//!
//! # Configuration
//!
//! ```yaml
//! fetcher_type: fetch_text
//! fetcher_options:
//!   url: "https://blog.rust-lang.org/feed.xml"
//!   encoding: "utf-8"        # optional charset fallback
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_yaml::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::config::{ConfigSpec, HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};
use crate::utils::http::DEFAULT_UA;
use crate::{Error, Fetcher};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_secs(3);
const FETCH_RETRIES: u32 = 2;

#[derive(Deserialize)]
struct FetchTextOptions {
    url: String,
    #[serde(default)]
    encoding: String,
}

/// Fetches a url as text, retrying transient failures in-call. Persistent
/// failure yields `Ok(None)` so the pipeline drops the tick instead of
/// escalating.
pub struct FetchText {
    client: Client,
}

impl FetchText {
    /// Builds the shared HTTP client.
    pub fn new() -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(DEFAULT_UA)
            .build()
            .map_err(|e| Error::ExecutionError(format!("Failed to build HTTP client: {e}")))?;
        Ok(FetchText { client })
    }

    async fn try_fetch(&self, options: &FetchTextOptions) -> Result<String, Error> {
        let response = self
            .client
            .get(&options.url)
            .send()
            .await
            .map_err(|e| Error::Fetch(format!("{}: {e}", options.url)))?
            .error_for_status()
            .map_err(|e| Error::Fetch(format!("{}: {e}", options.url)))?;

        let text = if options.encoding.is_empty() {
            response.text().await
        } else {
            response.text_with_charset(&options.encoding).await
        };
        text.map_err(|e| Error::Fetch(format!("{}: {e}", options.url)))
    }
}

#[async_trait]
impl Fetcher for FetchText {
    async fn fetch(&self, options: &Value) -> Result<Option<String>, Error> {
        let options: FetchTextOptions = serde_yaml::from_value(options.clone())?;
        let mut retries_left = FETCH_RETRIES;

        loop {
            match self.try_fetch(&options).await {
                Ok(text) => return Ok(Some(text)),
                Err(e) if retries_left > 0 => {
                    warn!(
                        url = options.url,
                        error = format!("{e}"),
                        retries_left = retries_left,
                        "fetch failed, retrying"
                    );
                    retries_left -= 1;
                    sleep(RETRY_BACKOFF).await;
                }
                Err(e) => {
                    warn!(url = options.url, error = format!("{e}"), "fetch failed");
                    return Ok(None);
                }
            }
        }
    }
}

/// Registers the `fetch_text` fetcher.
pub(super) fn register_fetch_text(registry: &mut HandlerRegistry) -> Result<(), Error> {
    let config = "type: object
required:
  - url
properties:
  url:
    type: string
  encoding:
    type: string";
    let conf_spec = ConfigSpec::from_schema(config)?;

    registry.register(
        HandlerKind::Fetcher,
        "fetch_text",
        HandlerSpec {
            ctor: Box::new(|_| Ok(HandlerUnit::Fetcher(Arc::new(FetchText::new()?)))),
            init_options: None,
            call_options: Some(conf_spec),
        },
    )
}

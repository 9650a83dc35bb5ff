//! Fetcher handlers.

use crate::config::HandlerRegistry;
use crate::Error;

pub mod http;

pub(crate) fn register_builtins(registry: &mut HandlerRegistry) -> Result<(), Error> {
    http::register_fetch_text(registry)?;
    Ok(())
}

//! Parser handlers.

use crate::config::HandlerRegistry;
use crate::Error;

pub mod json;
pub mod rss;

pub(crate) fn register_builtins(registry: &mut HandlerRegistry) -> Result<(), Error> {
    rss::register_rss(registry)?;
    json::register_json(registry)?;
    Ok(())
}

//! Modifier handlers.

use crate::config::HandlerRegistry;
use crate::Error;

pub mod comparison;
pub mod replace;

pub(crate) fn register_builtins(registry: &mut HandlerRegistry) -> Result<(), Error> {
    comparison::register_compare_and_filter(registry)?;
    replace::register_replace_text(registry)?;
    Ok(())
}

//! Receiver handlers.

use crate::config::HandlerRegistry;
use crate::Error;

pub mod console;
pub mod telegram;

/// Delimiter between messages fused into one delivery.
pub(crate) const MESSAGE_DELIMITER: &str = "\n-----\n";

pub(crate) fn register_builtins(registry: &mut HandlerRegistry) -> Result<(), Error> {
    console::register_console_printer(registry)?;
    telegram::register_telegram_bot(registry)?;
    Ok(())
}

//! Console receiver, mostly useful for local runs and debugging.

use async_trait::async_trait;
use serde_yaml::Value;
use std::sync::Arc;

use super::MESSAGE_DELIMITER;
use crate::config::{HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};
use crate::utils::text::render_template;
use crate::{Error, Message, Receiver};

/// Renders every message of a batch and prints them to stdout.
pub struct ConsolePrinter;

#[async_trait]
impl Receiver for ConsolePrinter {
    async fn send(&self, messages: &[Message], _options: &Value) -> Result<(), Error> {
        if messages.is_empty() {
            return Ok(());
        }
        let parts: Vec<String> = messages
            .iter()
            .map(|message| render_template(&message.template, &message.template_kwargs))
            .collect();
        println!("{}", parts.join(MESSAGE_DELIMITER));
        Ok(())
    }
}

/// Registers the `console_printer` receiver.
pub(super) fn register_console_printer(registry: &mut HandlerRegistry) -> Result<(), Error> {
    registry.register(
        HandlerKind::Receiver,
        "console_printer",
        HandlerSpec {
            ctor: Box::new(|_| Ok(HandlerUnit::Receiver(Arc::new(ConsolePrinter)))),
            init_options: None,
            call_options: None,
        },
    )
}

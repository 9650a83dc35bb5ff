//! Telegram bot receiver.
//!
//! Bots are declared as subhandler aliases so the token lives in
//! `init_options` while streams only carry the chat binding:
//!
//! ```yaml
//! handlers:
//!   receivers:
//!     my-bot:
//!       type: telegram_bot
//!       init_options:
//!         name: my-bot
//!         token: ENV:TG_BOT_TOKEN
//! sources:
//!   rust-blog:
//!     streams:
//!       - receiver_type: my-bot
//!         receiver_options:
//!           chat_id: "-1001234567890"
//!           disable_link_preview: true
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use super::MESSAGE_DELIMITER;
use crate::config::{ConfigSpec, HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};
use crate::utils::text::{html_escape, render_template};
use crate::{Error, FieldValue, Message, Receiver};

const MAX_MESSAGE_LENGTH: usize = 4096;
// Telegram allows 20 messages per minute per group.
const PAUSE_BETWEEN_SENDS: Duration = Duration::from_secs(3);
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct TelegramBotInitOptions {
    name: String,
    token: String,
}

#[derive(Deserialize)]
struct TelegramBotOptions {
    chat_id: String,
    #[serde(default)]
    message_thread_id: Option<String>,
    #[serde(default)]
    disable_link_preview: bool,
}

/// Sends message batches through the Telegram Bot API. One instance per
/// configured alias; the alias carries the bot token.
pub struct TelegramBot {
    name: String,
    token: String,
    client: Client,
}

impl TelegramBot {
    /// Builds a bot bound to the alias' token.
    pub fn new(options: TelegramBotInitOptions) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| Error::ExecutionError(format!("Failed to build HTTP client: {e}")))?;
        Ok(TelegramBot {
            name: options.name,
            token: options.token,
            client,
        })
    }

    async fn send_text(&self, text: String, options: &TelegramBotOptions) -> Result<(), Error> {
        let thread_id = match &options.message_thread_id {
            Some(raw) => Some(raw.parse::<i64>().map_err(|_| {
                Error::Send(format!("invalid message_thread_id: {raw}"))
            })?),
            None => None,
        };

        let mut body = serde_json::json!({
            "chat_id": options.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": options.disable_link_preview,
        });
        if let Some(thread_id) = thread_id {
            body["message_thread_id"] = serde_json::json!(thread_id);
        }

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Send(format!("{e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let details = response.text().await.unwrap_or_default();
            return Err(Error::Send(format!(
                "telegram returned {status}: {details}"
            )));
        }

        info!(bot = self.name, chat_id = options.chat_id, "sent message");
        sleep(PAUSE_BETWEEN_SENDS).await;
        Ok(())
    }
}

#[async_trait]
impl Receiver for TelegramBot {
    async fn send(&self, messages: &[Message], options: &Value) -> Result<(), Error> {
        if messages.is_empty() {
            return Ok(());
        }
        let options: TelegramBotOptions = serde_yaml::from_value(options.clone())?;

        let parts: Vec<String> = messages
            .iter()
            .map(|message| {
                render_template(&message.template, &escape_kwargs(&message.template_kwargs))
                    .trim()
                    .to_string()
            })
            .collect();
        let text = fuse_and_truncate(parts);

        self.send_text(text, &options).await
    }
}

fn escape_kwargs(kwargs: &BTreeMap<String, FieldValue>) -> BTreeMap<String, FieldValue> {
    kwargs
        .iter()
        .map(|(key, value)| {
            let escaped = match value {
                FieldValue::Str(s) => FieldValue::Str(html_escape(s)),
                other => other.clone(),
            };
            (key.clone(), escaped)
        })
        .collect()
}

/// Joins rendered messages with the batch delimiter and trims the result to
/// the API limit, dropping whole parts from the tail and marking the cut.
fn fuse_and_truncate(rendered: Vec<String>) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(rendered.len() * 2);
    for text in rendered {
        parts.push(text);
        parts.push(MESSAGE_DELIMITER.to_string());
    }
    let _ = parts.pop();

    let mut added_truncated_marker = false;
    while parts.iter().map(String::len).sum::<usize>() > MAX_MESSAGE_LENGTH {
        if !added_truncated_marker {
            parts.push("\nTruncated...".to_string());
            added_truncated_marker = true;
        }
        if parts.len() >= 2 {
            let _ = parts.remove(parts.len() - 2);
        } else {
            break;
        }
    }

    parts.concat()
}

/// Registers the `telegram_bot` receiver.
pub(super) fn register_telegram_bot(registry: &mut HandlerRegistry) -> Result<(), Error> {
    let init_config = "type: object
required:
  - name
  - token
properties:
  name:
    type: string
  token:
    type: string";
    let call_config = "type: object
required:
  - chat_id
properties:
  chat_id:
    type: string
  message_thread_id:
    type: string
  disable_link_preview:
    type: boolean";

    registry.register(
        HandlerKind::Receiver,
        "telegram_bot",
        HandlerSpec {
            ctor: Box::new(|init| {
                let init = init.ok_or_else(|| {
                    Error::ConfigFailedValidation(
                        "telegram_bot requires init_options with a bot token".into(),
                    )
                })?;
                let options: TelegramBotInitOptions = serde_yaml::from_value(init)?;
                Ok(HandlerUnit::Receiver(Arc::new(TelegramBot::new(options)?)))
            }),
            init_options: Some(ConfigSpec::from_schema(init_config)?),
            call_options: Some(ConfigSpec::from_schema(call_config)?),
        },
    )
}

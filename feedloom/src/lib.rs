//! Feed ingestion and fan-out pipeline written in Rust
//!
//! Provides a library for periodically pulling content from heterogeneous
//! web sources (RSS/Atom feeds, JSON endpoints), turning every new post into
//! messages and delivering them at-least-once to subscriber channels, with
//! cross-restart deduplication and a durable outbox.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Contains configuration loading and the handler registry
pub mod config;
/// Per-host fetch pacing
pub mod limiter;
/// Metrics sinks
pub mod metrics;
/// Built-in fetcher, parser, modifier and receiver handlers
pub mod modules;
/// Durable message outbox with dead-letter recovery
pub mod outbox;
/// Post dedup store and outbox storage backends
pub mod storage;
/// Small text and http helpers shared by handlers
pub mod utils;

pub use runtime::{prepare_message_batches, Runtime};
mod runtime;

/// A single scalar value carried in a post's field map and in message
/// template kwargs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    /// String field
    Str(String),
    /// Integer field
    Int(i64),
    /// Floating point field
    Float(f64),
    /// Boolean field
    Bool(bool),
}

impl FieldValue {
    /// Returns the contained string, if this is a string field.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as an integer when it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

/// A parsed feed item. Parsers produce posts, modifiers filter or rewrite
/// them, and the materializer freezes the survivors into [Message]s.
///
/// `post_id` must be stable across fetches of the same logical item; parsers
/// that want to re-notify on content change fold a content digest into it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Post {
    /// Stable identifier of the item within its feed
    pub post_id: String,
    /// Tags inherited from the source configuration
    pub source_tags: Vec<String>,
    /// Parser-specific scalar fields, consumed only through [Post::template_kwargs]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Post {
    /// The full placeholder map available to message templates: every parser
    /// field plus `post_id`, the joined `source_tags` and derived
    /// `source_hash_tags`.
    pub fn template_kwargs(&self) -> BTreeMap<String, FieldValue> {
        let mut kwargs = self.fields.clone();
        let _ = kwargs.insert(
            "post_id".to_string(),
            FieldValue::Str(self.post_id.clone()),
        );
        let _ = kwargs.insert(
            "source_tags".to_string(),
            FieldValue::Str(self.source_tags.join("; ")),
        );
        let _ = kwargs.insert(
            "source_hash_tags".to_string(),
            FieldValue::Str(utils::text::make_hash_tags(&self.source_tags).join(" ")),
        );
        kwargs
    }
}

/// A rendering-ready delivery unit. The receiver is responsible for turning
/// `template` plus `template_kwargs` into the final text; the core never
/// validates placeholders.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Identifier of the post this message was materialized from
    pub post_id: String,
    /// Template text with `${field}` placeholders
    pub template: String,
    /// Placeholder values captured from the post
    pub template_kwargs: BTreeMap<String, FieldValue>,
}

/// A `{type, options}` pair binding a registered modifier to a stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ModifierConfig {
    /// Registered modifier name
    #[serde(rename = "type")]
    pub modifier_type: String,
    /// Options payload validated against the modifier's schema
    #[serde(default)]
    pub options: Value,
}

/// One delivery binding of a source: a receiver, a message template and an
/// ordered modifier chain.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    /// Registered receiver name (or subhandler alias)
    pub receiver_type: String,
    /// Options payload handed to the receiver on every send
    #[serde(default)]
    pub receiver_options: Value,
    /// Template text; resolved from a template id at configuration load
    pub message_template: String,
    /// Modifier chain applied in order before deduplication
    #[serde(default)]
    pub modifiers: Vec<ModifierConfig>,
    /// Fuse all new posts of a tick into one outbox item instead of one per post
    #[serde(default)]
    pub squash: bool,
    /// Informative schedule hints, not interpreted by the pipeline
    #[serde(default)]
    pub intervals: Vec<String>,
}

/// Immutable configuration of one input feed and its delivery streams.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Source {
    /// Unique source id
    pub id: String,
    /// Registered fetcher name
    pub fetcher_type: String,
    /// Options payload handed to the fetcher
    #[serde(default)]
    pub fetcher_options: Value,
    /// Registered parser name
    pub parser_type: String,
    /// Options payload handed to the parser
    #[serde(default)]
    pub parser_options: Value,
    /// Tags attached to every post produced by this source
    #[serde(default)]
    pub tags: Vec<String>,
    /// Ordered delivery bindings
    pub streams: Vec<Stream>,
}

/// Fetcher handlers pull raw text from an input. `Ok(None)` means the fetch
/// failed after the handler's own bounded retries; the pipeline drops the
/// tick without escalating.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the raw payload described by the validated options mapping.
    async fn fetch(&self, options: &Value) -> Result<Option<String>, Error>;
}

/// Parser handlers turn fetched text into posts. Empty input yields an empty
/// list, not an error.
#[async_trait]
pub trait Parser: Send + Sync {
    /// Parse `text` into zero or more posts.
    async fn parse(&self, text: &str, options: &Value) -> Result<Vec<Post>, Error>;
}

/// Modifier handlers filter or transform a post list. Modifiers are pure:
/// they consume the list and return a new one.
#[async_trait]
pub trait Modifier: Send + Sync {
    /// Apply the modifier to `posts`.
    async fn apply(&self, posts: Vec<Post>, options: &Value) -> Result<Vec<Post>, Error>;
}

/// Receiver handlers deliver a batch of messages to a channel. An error
/// leaves the outbox item uncommitted so the dead-letter consumer retries it.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Deliver `messages` using the validated per-stream options.
    async fn send(&self, messages: &[Message], options: &Value) -> Result<(), Error>;
}

/// Enum to capture errors occurring through the pipeline.
///
/// Uses `thiserror` for ergonomic error handling with proper
/// `std::error::Error` implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// Yaml parsing errors found within the declarative configuration
    #[error("Unable to serialize YAML object")]
    UnableToSerializeYamlObject(
        #[from]
        #[source]
        serde_yaml::Error,
    ),

    /// JSON serialization is used when validating option payloads against
    /// jsonschema and when persisting outbox items
    #[error("Unable to serialize JSON object")]
    UnableToSerializeJsonObject(
        #[from]
        #[source]
        serde_json::Error,
    ),

    /// The jsonschema snippet a handler registered with is itself invalid
    #[error("Invalid validation schema: {0}")]
    InvalidValidationSchema(String),

    /// Configuration provided to a handler or the runtime is invalid
    #[error("Configuration validation failed: {0}")]
    ConfigFailedValidation(String),

    /// Configuration files could not be read, merged or interpolated
    #[error("Unable to load configuration: {0}")]
    LoadConfiguration(String),

    /// A handler of the same kind has already been registered under this name
    #[error("Duplicate registered name: {0}")]
    DuplicateRegisteredName(String),

    /// The configuration references a handler that is not registered
    #[error("Handler {name} of kind {kind} is not registered")]
    HandlerNotFound {
        /// Handler kind as configured
        kind: String,
        /// Handler name as configured
        name: String,
    },

    /// Binding configured handlers failed; the message names the offending
    /// source / stream index / modifier index
    #[error("Unable to init handlers: {0}")]
    InitHandlers(String),

    /// Fetcher failure surfaced to the pipeline
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Parser failure; the tick is dropped
    #[error("Parse error: {0}")]
    Parse(String),

    /// Modifier failure; the tick is dropped for the affected stream
    #[error("Modifier error: {0}")]
    Modifier(String),

    /// Receiver failure; the outbox item stays uncommitted
    #[error("Send error: {0}")]
    Send(String),

    /// Dedup or outbox storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error bubbled up from the embedded database
    #[error("Database error")]
    Database(
        #[from]
        #[source]
        rusqlite::Error,
    ),

    /// Unable to secure an internal mutex lock
    #[error("Internal server error: unable to secure lock")]
    UnableToSecureLock,

    /// Error with the processing pipeline due to a failure of internal
    /// libraries or spawned tasks
    #[error("Execution error: {0}")]
    ExecutionError(String),
}

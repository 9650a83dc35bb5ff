//! Explicit handler registry.
//!
//! Handler modules register their constructors and option schemas into a
//! [HandlerRegistry] value at program start; [HandlerRegistry::init] then
//! binds every handler the configuration references and validates all option
//! payloads up front, so configuration errors surface before the pipeline
//! starts. Tests instantiate their own registry.

use rustc_hash::FxHashMap;
use serde_yaml::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::{ConfigSpec, Configuration};
use crate::{Error, Fetcher, Modifier, Parser, Receiver};

/// Handler kinds a configuration can reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// [crate::Fetcher] trait enum variant
    Fetcher,
    /// [crate::Parser] trait enum variant
    Parser,
    /// [crate::Modifier] trait enum variant
    Modifier,
    /// [crate::Receiver] trait enum variant
    Receiver,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            HandlerKind::Fetcher => "fetchers",
            HandlerKind::Parser => "parsers",
            HandlerKind::Modifier => "modifiers",
            HandlerKind::Receiver => "receivers",
        };
        write!(f, "{msg}")
    }
}

impl FromStr for HandlerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fetchers" => Ok(HandlerKind::Fetcher),
            "parsers" => Ok(HandlerKind::Parser),
            "modifiers" => Ok(HandlerKind::Modifier),
            "receivers" => Ok(HandlerKind::Receiver),
            other => Err(Error::LoadConfiguration(format!(
                "unknown handler kind: {other}"
            ))),
        }
    }
}

/// A constructed handler instance, one variant per trait.
pub enum HandlerUnit {
    /// [crate::Fetcher] instance
    Fetcher(Arc<dyn Fetcher>),
    /// [crate::Parser] instance
    Parser(Arc<dyn Parser>),
    /// [crate::Modifier] instance
    Modifier(Arc<dyn Modifier>),
    /// [crate::Receiver] instance
    Receiver(Arc<dyn Receiver>),
}

impl HandlerUnit {
    fn kind(&self) -> HandlerKind {
        match self {
            HandlerUnit::Fetcher(_) => HandlerKind::Fetcher,
            HandlerUnit::Parser(_) => HandlerKind::Parser,
            HandlerUnit::Modifier(_) => HandlerKind::Modifier,
            HandlerUnit::Receiver(_) => HandlerKind::Receiver,
        }
    }
}

/// Constructor invoked once per referenced handler name. Receives the
/// validated `init_options` payload when the configuration provides one.
pub type HandlerCtor = Box<dyn Fn(Option<Value>) -> Result<HandlerUnit, Error> + Send + Sync>;

/// Registration record for one handler.
pub struct HandlerSpec {
    /// Constructor producing the handler instance
    pub ctor: HandlerCtor,
    /// Schema for constructor options; `None` for handlers without
    /// constructor state
    pub init_options: Option<ConfigSpec>,
    /// Schema for per-call options; `None` when the handler takes none
    pub call_options: Option<ConfigSpec>,
}

struct BoundHandler {
    unit: HandlerUnit,
    call_options: Option<ConfigSpec>,
}

/// Static catalogue of runnable units plus the instances bound to the
/// current configuration.
#[derive(Default)]
pub struct HandlerRegistry {
    catalogue: FxHashMap<HandlerKind, FxHashMap<String, HandlerSpec>>,
    bound: FxHashMap<HandlerKind, FxHashMap<String, BoundHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under `name`. Fails if a handler of the same
    /// kind is already registered under that name.
    pub fn register(
        &mut self,
        kind: HandlerKind,
        name: &str,
        spec: HandlerSpec,
    ) -> Result<(), Error> {
        let entries = self.catalogue.entry(kind).or_default();
        if entries.contains_key(name) {
            return Err(Error::DuplicateRegisteredName(name.to_string()));
        }
        let _ = entries.insert(name.to_string(), spec);
        debug!(name = name, kind = %kind, "handler registered");
        Ok(())
    }

    /// Binds every handler the configuration references, instantiating each
    /// once and validating all option payloads. Any failure names the
    /// offending source / stream index / modifier index.
    pub fn init(&mut self, configuration: &Configuration) -> Result<(), Error> {
        let mut used: Vec<(HandlerKind, String)> = Vec::new();
        let mut to_validate: Vec<(Value, HandlerKind, String, String)> = Vec::new();

        for source in &configuration.sources {
            push_used(&mut used, HandlerKind::Fetcher, &source.fetcher_type);
            to_validate.push((
                source.fetcher_options.clone(),
                HandlerKind::Fetcher,
                source.fetcher_type.clone(),
                format!("error while parsing fetcher options for {}", source.id),
            ));
            push_used(&mut used, HandlerKind::Parser, &source.parser_type);
            to_validate.push((
                source.parser_options.clone(),
                HandlerKind::Parser,
                source.parser_type.clone(),
                format!("error while parsing parser options for {}", source.id),
            ));
            for (si, stream) in source.streams.iter().enumerate() {
                push_used(&mut used, HandlerKind::Receiver, &stream.receiver_type);
                to_validate.push((
                    stream.receiver_options.clone(),
                    HandlerKind::Receiver,
                    stream.receiver_type.clone(),
                    format!(
                        "error while parsing receiver options for {}, stream index {si}",
                        source.id
                    ),
                ));
                for (mi, modifier) in stream.modifiers.iter().enumerate() {
                    push_used(&mut used, HandlerKind::Modifier, &modifier.modifier_type);
                    to_validate.push((
                        modifier.options.clone(),
                        HandlerKind::Modifier,
                        modifier.modifier_type.clone(),
                        format!(
                            "error while parsing modifier options for {}, stream index {si}, modifier index {mi}",
                            source.id
                        ),
                    ));
                }
            }
        }

        for (kind, name) in &used {
            let (spec, init_options) = match configuration.subhandler(*kind, name) {
                Some(sub) => {
                    let spec = self.spec(*kind, &sub.underlying_type).ok_or_else(|| {
                        Error::InitHandlers(format!(
                            "handler {} of kind {kind} not found (alias {name})",
                            sub.underlying_type
                        ))
                    })?;
                    if !sub.init_options.is_null() && spec.init_options.is_none() {
                        return Err(Error::InitHandlers(format!(
                            "handler {name} does not have init_options"
                        )));
                    }
                    if let Some(schema) = &spec.init_options {
                        schema.validate_value(&sub.init_options).map_err(|e| {
                            Error::InitHandlers(format!(
                                "error while parsing init_options for {name}: {e}"
                            ))
                        })?;
                    }
                    (spec, Some(sub.init_options.clone()))
                }
                None => {
                    let spec = self.spec(*kind, name).ok_or_else(|| {
                        Error::InitHandlers(format!("handler {name} of kind {kind} not found"))
                    })?;
                    (spec, None)
                }
            };

            let unit = (spec.ctor)(init_options)
                .map_err(|e| Error::InitHandlers(format!("unable to construct {name}: {e}")))?;
            if unit.kind() != *kind {
                return Err(Error::InitHandlers(format!(
                    "handler {name} constructed a {} unit, expected {kind}",
                    unit.kind()
                )));
            }
            let call_options = spec.call_options.clone();
            let _ = self.bound.entry(*kind).or_default().insert(
                name.clone(),
                BoundHandler { unit, call_options },
            );
            debug!(name = name, kind = %kind, "handler bound");
        }

        for (options, kind, name, context) in to_validate {
            let schema = self
                .bound
                .get(&kind)
                .and_then(|entries| entries.get(&name))
                .and_then(|bound| bound.call_options.as_ref());
            if let Some(schema) = schema {
                schema
                    .validate_value(&options)
                    .map_err(|e| Error::InitHandlers(format!("{context}: {e}")))?;
            }
        }

        Ok(())
    }

    fn spec(&self, kind: HandlerKind, name: &str) -> Option<&HandlerSpec> {
        self.catalogue.get(&kind).and_then(|entries| entries.get(name))
    }

    fn bound_unit(&self, kind: HandlerKind, name: &str) -> Result<&HandlerUnit, Error> {
        self.bound
            .get(&kind)
            .and_then(|entries| entries.get(name))
            .map(|bound| &bound.unit)
            .ok_or_else(|| Error::HandlerNotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            })
    }

    /// Resolves a bound fetcher.
    pub fn fetcher(&self, name: &str) -> Result<Arc<dyn Fetcher>, Error> {
        match self.bound_unit(HandlerKind::Fetcher, name)? {
            HandlerUnit::Fetcher(f) => Ok(Arc::clone(f)),
            _ => Err(Error::ExecutionError(format!(
                "handler {name} is not a fetcher"
            ))),
        }
    }

    /// Resolves a bound parser.
    pub fn parser(&self, name: &str) -> Result<Arc<dyn Parser>, Error> {
        match self.bound_unit(HandlerKind::Parser, name)? {
            HandlerUnit::Parser(p) => Ok(Arc::clone(p)),
            _ => Err(Error::ExecutionError(format!(
                "handler {name} is not a parser"
            ))),
        }
    }

    /// Resolves a bound modifier.
    pub fn modifier(&self, name: &str) -> Result<Arc<dyn Modifier>, Error> {
        match self.bound_unit(HandlerKind::Modifier, name)? {
            HandlerUnit::Modifier(m) => Ok(Arc::clone(m)),
            _ => Err(Error::ExecutionError(format!(
                "handler {name} is not a modifier"
            ))),
        }
    }

    /// Resolves a bound receiver.
    pub fn receiver(&self, name: &str) -> Result<Arc<dyn Receiver>, Error> {
        match self.bound_unit(HandlerKind::Receiver, name)? {
            HandlerUnit::Receiver(r) => Ok(Arc::clone(r)),
            _ => Err(Error::ExecutionError(format!(
                "handler {name} is not a receiver"
            ))),
        }
    }
}

fn push_used(used: &mut Vec<(HandlerKind, String)>, kind: HandlerKind, name: &str) {
    if !used.iter().any(|(k, n)| *k == kind && n == name) {
        used.push((kind, name.to_string()));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::load_configuration_from_str;
    use crate::{Message, Post};
    use async_trait::async_trait;

    struct NoopReceiver;

    #[async_trait]
    impl crate::Receiver for NoopReceiver {
        async fn send(&self, _messages: &[Message], _options: &Value) -> Result<(), Error> {
            Ok(())
        }
    }

    struct EmptyParser;

    #[async_trait]
    impl crate::Parser for EmptyParser {
        async fn parse(&self, _text: &str, _options: &Value) -> Result<Vec<Post>, Error> {
            Ok(Vec::new())
        }
    }

    fn receiver_spec() -> HandlerSpec {
        HandlerSpec {
            ctor: Box::new(|_| Ok(HandlerUnit::Receiver(Arc::new(NoopReceiver)))),
            init_options: None,
            call_options: None,
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(HandlerKind::Receiver, "console_printer", receiver_spec())
            .unwrap();
        let result = registry.register(HandlerKind::Receiver, "console_printer", receiver_spec());
        assert!(matches!(result, Err(Error::DuplicateRegisteredName(_))));
    }

    #[test]
    fn same_name_is_allowed_across_kinds() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(HandlerKind::Receiver, "echo", receiver_spec())
            .unwrap();
        registry
            .register(
                HandlerKind::Parser,
                "echo",
                HandlerSpec {
                    ctor: Box::new(|_| Ok(HandlerUnit::Parser(Arc::new(EmptyParser)))),
                    init_options: None,
                    call_options: None,
                },
            )
            .unwrap();
    }

    #[test]
    fn init_fails_on_unknown_handler() {
        let conf = load_configuration_from_str(
            r#"
sources:
  demo:
    fetcher_type: fetch_text
    parser_type: rss
    streams:
      - receiver_type: console_printer
        message_template: "${title}"
"#,
        )
        .unwrap();

        let mut registry = HandlerRegistry::new();
        let result = registry.init(&conf);
        match result {
            Err(Error::InitHandlers(msg)) => assert!(msg.contains("fetch_text")),
            other => panic!("expected InitHandlers error, got {other:?}"),
        }
    }

    #[test]
    fn init_validates_call_options_with_path_context() {
        let conf = load_configuration_from_str(
            r#"
sources:
  demo:
    fetcher_type: fetch_text
    fetcher_options:
      url: 42
    parser_type: rss
    streams:
      - receiver_type: console_printer
        message_template: "${title}"
"#,
        )
        .unwrap();

        let mut registry = HandlerRegistry::new();
        crate::modules::register_builtins(&mut registry).unwrap();
        let result = registry.init(&conf);
        match result {
            Err(Error::InitHandlers(msg)) => {
                assert!(msg.contains("fetcher options for demo"), "got: {msg}");
            }
            other => panic!("expected InitHandlers error, got {other:?}"),
        }
    }

    #[test]
    fn aliases_yield_distinct_instances() {
        let conf = load_configuration_from_str(
            r#"
handlers:
  receivers:
    bot-a:
      type: telegram_bot
      init_options:
        name: bot-a
        token: token-a
    bot-b:
      type: telegram_bot
      init_options:
        name: bot-b
        token: token-b
sources:
  demo:
    fetcher_type: fetch_text
    fetcher_options:
      url: https://example.com/feed.xml
    parser_type: rss
    streams:
      - receiver_type: bot-a
        receiver_options:
          chat_id: "1"
        message_template: "${title}"
      - receiver_type: bot-b
        receiver_options:
          chat_id: "2"
        message_template: "${title}"
"#,
        )
        .unwrap();

        let mut registry = HandlerRegistry::new();
        crate::modules::register_builtins(&mut registry).unwrap();
        registry.init(&conf).unwrap();

        let a = registry.receiver("bot-a").unwrap();
        let b = registry.receiver("bot-b").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn init_options_on_plain_handler_is_an_error() {
        let conf = load_configuration_from_str(
            r#"
handlers:
  receivers:
    fancy-console:
      type: console_printer
      init_options:
        color: red
sources:
  demo:
    fetcher_type: fetch_text
    fetcher_options:
      url: https://example.com/feed.xml
    parser_type: rss
    streams:
      - receiver_type: fancy-console
        message_template: "${title}"
"#,
        )
        .unwrap();

        let mut registry = HandlerRegistry::new();
        crate::modules::register_builtins(&mut registry).unwrap();
        let result = registry.init(&conf);
        match result {
            Err(Error::InitHandlers(msg)) => {
                assert!(msg.contains("does not have init_options"), "got: {msg}")
            }
            other => panic!("expected InitHandlers error, got {other:?}"),
        }
    }
}

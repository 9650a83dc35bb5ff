//! Configuration loading and option-schema validation.
//!
//! Configuration is a directory of yaml files merged in listing order.
//! String values of the form `ENV:NAME` are interpolated from the process
//! environment at load time. Handler option payloads are validated against
//! per-handler jsonschema snippets before the pipeline starts.

use jsonschema::{Draft, JSONSchema};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

use crate::{Error, ModifierConfig, Source, Stream};

mod registry;
pub use registry::{HandlerCtor, HandlerKind, HandlerRegistry, HandlerSpec, HandlerUnit};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60 * 30);
const DEFAULT_HOST_MIN_SPACING: Duration = Duration::from_secs(1);
const DEFAULT_FETCH_WORKERS: usize = 9;

/// Storage backend selector for the dedup store and the outbox.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Ephemeral in-process storage
    #[default]
    Memory,
    /// Embedded SQL database file
    Sql,
}

/// Metrics sink selector.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricsClient {
    /// Discard all counters
    #[default]
    None,
    /// Prometheus text format rewritten atomically to a file
    PromFile,
}

/// Application-level settings consumed at boot.
#[derive(Clone, Debug)]
pub struct AppSettings {
    /// Log level seeded into the tracing subscriber by the CLI
    pub log_level: String,
    /// Error tracking DSN, echoed for diagnostics only
    pub sentry_dsn: Option<String>,
    /// Backend for the post dedup store
    pub post_storage: StorageKind,
    /// Backend for the messages outbox
    pub outbox_storage: StorageKind,
    /// Path of the embedded database file, required for sql backends
    pub sql_db_path: Option<PathBuf>,
    /// Metrics sink selector
    pub metrics_client: MetricsClient,
    /// Path of the metrics text file, required for `prom_file`
    pub metrics_file: Option<PathBuf>,
    /// Period between re-enqueues of the source set
    pub poll_interval: Duration,
    /// Number of parallel fetch workers
    pub fetch_workers: usize,
    /// Minimum spacing between fetches against the same host
    pub host_min_spacing: Duration,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            log_level: "info".to_string(),
            sentry_dsn: None,
            post_storage: StorageKind::Memory,
            outbox_storage: StorageKind::Memory,
            sql_db_path: None,
            metrics_client: MetricsClient::None,
            metrics_file: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fetch_workers: DEFAULT_FETCH_WORKERS,
            host_min_spacing: DEFAULT_HOST_MIN_SPACING,
        }
    }
}

/// A handler alias declared under the `handlers:` configuration key. The
/// registry materializes one instance per alias.
#[derive(Clone, Debug)]
pub struct Subhandler {
    /// Handler kind the alias belongs to
    pub kind: HandlerKind,
    /// Alias name sources refer to
    pub alias: String,
    /// Registered handler the alias resolves to
    pub underlying_type: String,
    /// Constructor options validated against the handler's init schema
    pub init_options: Value,
}

/// Immutable configuration produced at boot and shared with the runtime.
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Application settings
    pub app_settings: AppSettings,
    /// Configured sources, in configuration order
    pub sources: Vec<Source>,
    /// Handler aliases
    pub subhandlers: Vec<Subhandler>,
    /// Echo of the merged, interpolated configuration tree for diagnostics
    pub raw: Value,
}

impl Configuration {
    /// Looks up the subhandler registered under `alias` for `kind`.
    pub fn subhandler(&self, kind: HandlerKind, alias: &str) -> Option<&Subhandler> {
        self.subhandlers
            .iter()
            .find(|s| s.kind == kind && s.alias == alias)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    log_level: Option<String>,
    sentry_dsn: Option<String>,
    post_storage: Option<StorageKind>,
    outbox_storage: Option<StorageKind>,
    sql_db_path: Option<PathBuf>,
    metrics_client: Option<MetricsClient>,
    metrics_file: Option<PathBuf>,
    poll_interval: Option<String>,
    fetch_workers: Option<usize>,
    host_min_spacing: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSubhandler {
    #[serde(rename = "type")]
    handler_type: String,
    #[serde(default)]
    init_options: Value,
}

#[derive(Debug, Deserialize)]
struct RawStream {
    receiver_type: String,
    #[serde(default)]
    receiver_options: Value,
    message_template: Option<String>,
    message_template_id: Option<String>,
    #[serde(default)]
    modifiers: Vec<ModifierConfig>,
    #[serde(default)]
    squash: bool,
    #[serde(default)]
    intervals: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    fetcher_type: String,
    #[serde(default)]
    fetcher_options: Value,
    parser_type: String,
    #[serde(default)]
    parser_options: Value,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    streams: Vec<RawStream>,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    settings: RawSettings,
    #[serde(default)]
    handlers: BTreeMap<String, BTreeMap<String, RawSubhandler>>,
    #[serde(default)]
    templates: BTreeMap<String, String>,
    #[serde(default)]
    sources: Mapping,
}

/// Loads every `*.yaml` / `*.yml` file under `dir`, merges them in sorted
/// listing order (later top-level keys win), interpolates `ENV:` strings and
/// builds the immutable [Configuration].
pub fn load_configuration(dir: &Path) -> Result<Configuration, Error> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| Error::LoadConfiguration(format!("{}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(Error::LoadConfiguration(format!(
            "no configuration files found in {}",
            dir.display()
        )));
    }

    let mut merged = Mapping::new();
    for path in &paths {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::LoadConfiguration(format!("{}: {e}", path.display())))?;
        let part: Value = serde_yaml::from_str(&text)?;
        match part {
            Value::Mapping(mapping) => {
                for (key, value) in mapping {
                    let _ = merged.insert(key, value);
                }
            }
            Value::Null => {}
            _ => {
                return Err(Error::LoadConfiguration(format!(
                    "top level of {} must be a mapping",
                    path.display()
                )))
            }
        }
        trace!(path = %path.display(), "merged configuration file");
    }

    let mut tree = Value::Mapping(merged);
    interpolate_env(&mut tree)?;
    build_configuration(tree)
}

/// Builds a [Configuration] from a single yaml document. Used by tests and
/// anywhere a directory is overkill.
pub fn load_configuration_from_str(content: &str) -> Result<Configuration, Error> {
    let mut tree: Value = serde_yaml::from_str(content)?;
    interpolate_env(&mut tree)?;
    build_configuration(tree)
}

/// Replaces every string of the form `ENV:NAME` with the trimmed value of
/// the `NAME` environment variable.
fn interpolate_env(value: &mut Value) -> Result<(), Error> {
    match value {
        Value::String(s) => {
            if let Some(name) = s.strip_prefix("ENV:") {
                let resolved = env::var(name).map_err(|_| {
                    Error::LoadConfiguration(format!("environment variable {name} is not set"))
                })?;
                *s = resolved.trim().to_string();
            }
        }
        Value::Sequence(seq) => {
            for item in seq {
                interpolate_env(item)?;
            }
        }
        Value::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                interpolate_env(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn build_configuration(raw: Value) -> Result<Configuration, Error> {
    let root: RawConfig = serde_yaml::from_value(raw.clone())?;
    let app_settings = build_settings(root.settings)?;

    let mut subhandlers = Vec::new();
    for (kind_name, aliases) in root.handlers {
        let kind = HandlerKind::from_str(&kind_name).map_err(|_| {
            Error::LoadConfiguration(format!("unknown handler kind: {kind_name}"))
        })?;
        for (alias, sub) in aliases {
            subhandlers.push(Subhandler {
                kind,
                alias,
                underlying_type: sub.handler_type,
                init_options: sub.init_options,
            });
        }
    }

    let mut sources = Vec::new();
    for (key, value) in root.sources {
        let id = match key {
            Value::String(s) => s,
            other => {
                return Err(Error::LoadConfiguration(format!(
                    "source ids must be strings, got {other:?}"
                )))
            }
        };
        let raw_source: RawSource = serde_yaml::from_value(value).map_err(|e| {
            Error::LoadConfiguration(format!("invalid source {id}: {e}"))
        })?;
        sources.push(build_source(id, raw_source, &root.templates)?);
    }

    if sources.is_empty() {
        return Err(Error::LoadConfiguration("no sources configured".into()));
    }

    debug!(
        sources = sources.len(),
        subhandlers = subhandlers.len(),
        "configuration loaded"
    );

    Ok(Configuration {
        app_settings,
        sources,
        subhandlers,
        raw,
    })
}

fn build_settings(raw: RawSettings) -> Result<AppSettings, Error> {
    let defaults = AppSettings::default();
    let settings = AppSettings {
        log_level: raw.log_level.unwrap_or(defaults.log_level),
        sentry_dsn: raw.sentry_dsn,
        post_storage: raw.post_storage.unwrap_or_default(),
        outbox_storage: raw.outbox_storage.unwrap_or_default(),
        sql_db_path: raw.sql_db_path,
        metrics_client: raw.metrics_client.unwrap_or_default(),
        metrics_file: raw.metrics_file,
        poll_interval: parse_settings_duration(
            raw.poll_interval.as_deref(),
            "poll_interval",
            defaults.poll_interval,
        )?,
        fetch_workers: raw.fetch_workers.unwrap_or(defaults.fetch_workers),
        host_min_spacing: parse_settings_duration(
            raw.host_min_spacing.as_deref(),
            "host_min_spacing",
            defaults.host_min_spacing,
        )?,
    };

    let uses_sql = settings.post_storage == StorageKind::Sql
        || settings.outbox_storage == StorageKind::Sql;
    if uses_sql && settings.sql_db_path.is_none() {
        return Err(Error::LoadConfiguration(
            "sql_db_path is required when a sql storage backend is selected".into(),
        ));
    }
    if settings.metrics_client == MetricsClient::PromFile && settings.metrics_file.is_none() {
        return Err(Error::LoadConfiguration(
            "metrics_file is required when metrics_client is prom_file".into(),
        ));
    }
    if settings.fetch_workers == 0 {
        return Err(Error::LoadConfiguration(
            "fetch_workers must be at least 1".into(),
        ));
    }

    Ok(settings)
}

fn parse_settings_duration(
    raw: Option<&str>,
    key: &str,
    default: Duration,
) -> Result<Duration, Error> {
    match raw {
        Some(text) => parse_duration::parse(text)
            .map_err(|e| Error::LoadConfiguration(format!("invalid {key}: {e}"))),
        None => Ok(default),
    }
}

fn build_source(
    id: String,
    raw: RawSource,
    templates: &BTreeMap<String, String>,
) -> Result<Source, Error> {
    let mut streams = Vec::with_capacity(raw.streams.len());
    for stream in raw.streams {
        let message_template = match (stream.message_template, stream.message_template_id) {
            (Some(_), Some(_)) => {
                return Err(Error::LoadConfiguration(format!(
                    "only one of message_template_id or message_template can be set: {id}"
                )))
            }
            (Some(template), None) => template,
            (None, Some(template_id)) => templates.get(&template_id).cloned().ok_or_else(|| {
                Error::LoadConfiguration(format!(
                    "message template {template_id} not found: {id}"
                ))
            })?,
            (None, None) => {
                return Err(Error::LoadConfiguration(format!(
                    "one of message_template_id or message_template must be set: {id}"
                )))
            }
        };
        streams.push(Stream {
            receiver_type: stream.receiver_type,
            receiver_options: stream.receiver_options,
            message_template,
            modifiers: stream.modifiers,
            squash: stream.squash,
            intervals: stream.intervals,
        });
    }

    Ok(Source {
        id,
        fetcher_type: raw.fetcher_type,
        fetcher_options: raw.fetcher_options,
        parser_type: raw.parser_type,
        parser_options: raw.parser_options,
        tags: raw.tags,
        streams,
    })
}

/// Handler option validation snippet.
///
/// Uses `Arc` internally to make cloning cheap without re-parsing the schema.
pub struct ConfigSpec {
    raw_schema: String,
    schema: Arc<JSONSchema>,
}

impl std::fmt::Debug for ConfigSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpec")
            .field("raw_schema", &self.raw_schema)
            .finish()
    }
}

impl Clone for ConfigSpec {
    fn clone(&self) -> Self {
        ConfigSpec {
            raw_schema: self.raw_schema.clone(),
            schema: Arc::clone(&self.schema),
        }
    }
}

impl ConfigSpec {
    /// Creates a validation snippet from the provided schema. The schema is
    /// jsonschema format, in yaml; it is converted to json and compiled with
    /// the jsonschema library.
    ///
    /// ```
    /// # use feedloom::config::ConfigSpec;
    /// let schema = r#"properties:
    ///   url:
    ///     type: string"#;
    ///
    /// let spec = ConfigSpec::from_schema(schema).unwrap();
    /// ```
    pub fn from_schema(conf: &str) -> Result<Self, Error> {
        let v: Value = serde_yaml::from_str(conf)?;
        let intermediate = serde_json::to_string(&v)?;
        let f: serde_json::Value = serde_json::from_str(&intermediate)?;

        let schema: JSONSchema = match JSONSchema::options().with_draft(Draft::Draft7).compile(&f) {
            Ok(js) => js,
            Err(e) => return Err(Error::InvalidValidationSchema(format!("{e}"))),
        };

        trace!("json schema is valid");

        Ok(ConfigSpec {
            raw_schema: conf.into(),
            schema: Arc::new(schema),
        })
    }

    /// Validates a yaml document against the schema.
    pub fn validate(&self, content: &str) -> Result<(), Error> {
        let v: Value = serde_yaml::from_str(content)?;
        self.validate_value(&v)
    }

    /// Validates an already-parsed options payload against the schema. A
    /// null payload is treated as an empty mapping so handlers with
    /// all-default options accept an omitted options key.
    pub fn validate_value(&self, content: &Value) -> Result<(), Error> {
        let normalized = match content {
            Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => {
                let intermediate = serde_json::to_string(other)?;
                serde_json::from_str(&intermediate)?
            }
        };
        let result = self.schema.validate(&normalized);
        if let Err(errors) = result {
            let errs: Vec<String> = errors.into_iter().map(|i| format!("{i}")).collect();
            error!(
                number_of_failures = errs.len(),
                errors = errs.join(" "),
                "validation failed"
            );
            return Err(Error::ConfigFailedValidation(errs.join(" ")));
        };
        Ok(())
    }
}

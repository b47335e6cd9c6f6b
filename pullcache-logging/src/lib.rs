//! # Pullcache Logging
//!
//! Initializes the global `tracing` subscriber for the pullcache binaries.
//!
//! Configuration is read from the environment by [`LogConfig::from_env`]:
//!
//! | variable                 | values                          | default              |
//! |--------------------------|---------------------------------|----------------------|
//! | `PULLCACHE_LOG_LEVEL`    | any `EnvFilter` directive       | `info`               |
//! | `PULLCACHE_LOG_FORMAT`   | `pretty`, `compact`, `json`     | `pretty`             |
//! | `PULLCACHE_LOG_OUTPUT`   | `console`, `file`, `both`       | `console`            |
//! | `PULLCACHE_LOG_FILE`     | path of the rolling log file    | `<tmp>/pullcache.log`|
//! | `PULLCACHE_LOG_FIELDS`   | `key=value,...` span filters    | none                 |
//!
//! `RUST_LOG`, when set, takes precedence over `PULLCACHE_LOG_LEVEL`.
//! Setting `PULLCACHE_LOG_FILE` alone also enables file output next to the
//! console. Console output goes to stderr so stdout stays free for blob data.
//!
//! Field filters keep only events emitted inside a span carrying a matching
//! field, e.g. `PULLCACHE_LOG_FIELDS=repository=alpine` follows one image
//! through the proxy. `key:value` is accepted as well. A value of `*` matches
//! any value.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::subscriber::Interest;
use tracing::{span, Metadata, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

pub const LEVEL_VAR: &str = "PULLCACHE_LOG_LEVEL";
pub const FORMAT_VAR: &str = "PULLCACHE_LOG_FORMAT";
pub const OUTPUT_VAR: &str = "PULLCACHE_LOG_OUTPUT";
pub const FILE_VAR: &str = "PULLCACHE_LOG_FILE";
pub const FIELDS_VAR: &str = "PULLCACHE_LOG_FIELDS";

/// Directives appended to every filter to quiet chatty HTTP internals
const QUIET_DIRECTIVES: &str = "hyper=warn,h2=warn,reqwest=warn";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("unknown log format '{0}' (expected pretty, compact or json)")]
    UnknownFormat(String),

    #[error("unknown log output '{0}' (expected console, file or both)")]
    UnknownOutput(String),

    #[error("failed to initialize tracing: {0}")]
    Init(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "human" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn writes_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" => Ok(LogOutput::Both),
            other => Err(LoggingError::UnknownOutput(other.to_string())),
        }
    }
}

/// A `key=value` span field filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub key: String,
    pub value: String,
}

impl FieldFilter {
    fn matches(&self, fields: &HashMap<String, String>) -> bool {
        fields
            .get(&self.key)
            .is_some_and(|value| self.value == "*" || value.contains(&self.value))
    }
}

/// Parse `key=value,key=value` (`:` also separates key and value); malformed
/// entries are skipped
pub fn parse_field_filters(input: &str) -> Vec<FieldFilter> {
    input
        .split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once(|c: char| c == '=' || c == ':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(FieldFilter {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: PathBuf,
    pub fields: Vec<FieldFilter>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: env::temp_dir().join("pullcache.log"),
            fields: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Build the configuration from `PULLCACHE_LOG_*` variables
    pub fn from_env() -> Result<Self, LoggingError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LoggingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(level) = lookup(LEVEL_VAR).filter(|v| !v.trim().is_empty()) {
            config.level = level;
        }
        if let Some(format) = lookup(FORMAT_VAR) {
            config.format = format.parse()?;
        }
        if let Some(path) = lookup(FILE_VAR).filter(|v| !v.trim().is_empty()) {
            config.file_path = PathBuf::from(path);
            config.output = LogOutput::Both;
        }
        if let Some(output) = lookup(OUTPUT_VAR) {
            config.output = output.parse()?;
        }
        if let Some(fields) = lookup(FIELDS_VAR) {
            config.fields = parse_field_filters(&fields);
        }

        Ok(config)
    }

    fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        let directives = format!("{},{}", self.level, QUIET_DIRECTIVES);
        EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidFilter {
            filter: self.level.clone(),
            reason: e.to_string(),
        })
    }

    fn file_writer(&self) -> (NonBlocking, WorkerGuard) {
        let dir = self
            .file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let file_name = self
            .file_path
            .file_name()
            .unwrap_or_else(|| OsStr::new("pullcache.log"));

        let appender = tracing_appender::rolling::daily(dir, file_name);
        tracing_appender::non_blocking(appender)
    }

    fn make_writer(&self) -> (BoxMakeWriter, Option<WorkerGuard>) {
        match self.output {
            LogOutput::Console => (BoxMakeWriter::new(std::io::stderr), None),
            LogOutput::File => {
                let (file, guard) = self.file_writer();
                (BoxMakeWriter::new(file), Some(guard))
            }
            LogOutput::Both => {
                let (file, guard) = self.file_writer();
                (BoxMakeWriter::new(std::io::stderr.and(file)), Some(guard))
            }
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// The returned guard flushes file output on drop and must be held for the
/// lifetime of the program. Fails if a global subscriber is already set.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>, LoggingError> {
    let filter = config.env_filter()?;
    let field_filter = SpanFieldFilter::new(config.fields.clone());
    let (writer, guard) = config.make_writer();
    let ansi = !config.output.writes_file();

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(field_filter);
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);

    let result = match config.format {
        LogFormat::Json => subscriber.with(layer.json()).try_init(),
        LogFormat::Compact => subscriber.with(layer.compact()).try_init(),
        LogFormat::Pretty => subscriber.with(layer.pretty()).try_init(),
    };
    result.map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(guard)
}

/// [`init`] with the configuration from the environment
pub fn init_from_env() -> Result<Option<WorkerGuard>, LoggingError> {
    init(&LogConfig::from_env()?)
}

/// Debug-level subscriber writing through the test harness capture
pub fn init_for_testing() -> Result<(), LoggingError> {
    tracing_subscriber::registry()
        .with(EnvFilter::new("debug"))
        .with(fmt::layer().with_test_writer())
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

/// Keeps events whose enclosing spans carry every configured field
pub struct SpanFieldFilter {
    filters: Vec<FieldFilter>,
}

impl SpanFieldFilter {
    pub fn new(filters: Vec<FieldFilter>) -> Self {
        Self { filters }
    }
}

impl<S> Layer<S> for SpanFieldFilter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn register_callsite(&self, meta: &'static Metadata<'static>) -> Interest {
        // Event decisions depend on the active span, so they cannot be cached
        if self.filters.is_empty() || meta.is_span() {
            Interest::always()
        } else {
            Interest::sometimes()
        }
    }

    fn enabled(&self, meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() || meta.is_span() {
            return true;
        }

        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut fields = HashMap::new();
        for span in scope {
            if let Some(recorded) = span.extensions().get::<HashMap<String, String>>() {
                for (key, value) in recorded {
                    fields.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        self.filters.iter().all(|filter| filter.matches(&fields))
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if self.filters.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut fields = HashMap::new();
        attrs.record(&mut FieldRecorder(&mut fields));
        span.extensions_mut().insert(fields);
    }
}

struct FieldRecorder<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldRecorder<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

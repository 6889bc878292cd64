use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::AppSettings;
use crate::error::{BootError, Result};

/// HTTP header carrying the per-request log id. Lowercase so it can be used
/// with `HeaderName::from_static`.
pub const LOG_ID_HEADER: &str = "log-id";

/// Settings for the `log` config section.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// When set, also write daily-rolled JSON logs under this directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: None,
        }
    }
}

/// Keeps the non-blocking writer alive. Dropping it flushes and stops the
/// background log thread, so it lives in `Resources` until shutdown.
pub struct LoggerHandle {
    _guard: Option<WorkerGuard>,
}

impl fmt::Debug for LoggerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerHandle")
            .field("file_writer", &self._guard.is_some())
            .finish()
    }
}

/// Install the global tracing subscriber: human-readable stdout output plus
/// an optional JSON file layer. A second call in the same process keeps the
/// first subscriber and still succeeds.
pub fn init(settings: &AppSettings, cfg: &LogConfig) -> Result<LoggerHandle> {
    let filter = EnvFilter::try_new(&cfg.level)
        .map_err(|err| BootError::Logger(format!("bad log level `{}`: {err}", cfg.level)))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .boxed(),
    ];

    let mut guard = None;
    if let Some(dir) = &cfg.dir {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(settings.name.as_str())
            .filename_suffix("log")
            .build(dir)
            .map_err(|err| {
                BootError::Logger(format!("log dir `{}` unusable: {err}", dir.display()))
            })?;
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    if tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("subscriber already installed, keeping the existing one");
    }

    Ok(LoggerHandle { _guard: guard })
}

/// Subsystem a log line originates from. Serialized values are fixed wire
/// names shared with downstream log consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Module {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "RPC")]
    Rpc,
    #[serde(rename = "MySQL")]
    Mysql,
    #[serde(rename = "Redis")]
    Redis,
    #[serde(rename = "RabbitMQ")]
    RabbitMq,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Http => "HTTP",
            Module::Rpc => "RPC",
            Module::Mysql => "MySQL",
            Module::Redis => "Redis",
            Module::RabbitMq => "RabbitMQ",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation id attached to every structured log line. Generated per
/// request (or per job run) and echoed back to HTTP callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(String);

impl LogId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Accept an id supplied by the caller, rejecting empty values.
    pub fn from_header(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One structured access-log record. `log_id` and `module` are always
/// present; everything else is filled in by whoever has it.
#[derive(Debug, Clone, Serialize)]
pub struct LogFields {
    pub log_id: LogId,
    pub module: Module,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<String>,
    /// Elapsed wall time in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl LogFields {
    pub fn new(log_id: LogId, module: Module) -> Self {
        Self {
            log_id,
            module,
            trace_id: None,
            header: None,
            method: None,
            request: None,
            response: None,
            code: None,
            caller_ip: None,
            host_ip: None,
            api: None,
            cost: None,
        }
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn header(mut self, header: impl Into<String>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn request(mut self, request: impl Into<String>) -> Self {
        self.request = Some(request.into());
        self
    }

    pub fn response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn caller_ip(mut self, caller_ip: impl Into<String>) -> Self {
        self.caller_ip = Some(caller_ip.into());
        self
    }

    pub fn host_ip(mut self, host_ip: impl Into<String>) -> Self {
        self.host_ip = Some(host_ip.into());
        self
    }

    pub fn api(mut self, api: impl Into<String>) -> Self {
        self.api = Some(api.into());
        self
    }

    pub fn cost_ms(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn cost_since(self, start: Instant) -> Self {
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        self.cost_ms(elapsed)
    }

    /// Emit the record at info level with every populated field attached.
    pub fn emit(&self, message: &str) {
        tracing::info!(
            log_id = %self.log_id,
            module = self.module.as_str(),
            trace_id = self.trace_id.as_deref(),
            header = self.header.as_deref(),
            method = self.method.as_deref(),
            request = self.request.as_deref(),
            response = self.response.as_deref(),
            code = self.code,
            caller_ip = self.caller_ip.as_deref(),
            host_ip = self.host_ip.as_deref(),
            api = self.api.as_deref(),
            cost = self.cost,
            "{message}"
        );
    }
}

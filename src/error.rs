use thiserror::Error;

/// Fatal startup errors. Every variant terminates the process; nothing here
/// is ever retried or recovered.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Logger setup failed: {0}")]
    Logger(String),

    #[error("Database `{name}` unavailable: {source}")]
    Database {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Cache pool `{name}` misconfigured: {source}")]
    CachePool {
        name: String,
        #[source]
        source: deadpool_redis::CreatePoolError,
    },

    #[error("Cache `{name}` unavailable: {source}")]
    Cache {
        name: String,
        #[source]
        source: redis::RedisError,
    },

    #[error("Trace exporter unavailable: {0}")]
    Tracer(String),

    #[error("Listener bind on {addr} failed: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown job `{0}`")]
    UnknownJob(String),

    #[error("Job `{name}` failed: {source}")]
    Job {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, BootError>;

impl BootError {
    /// Stable machine-readable tag for structured log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            BootError::Config(_) => "CONFIG",
            BootError::Logger(_) => "LOGGER",
            BootError::Database { .. } => "DATABASE",
            BootError::CachePool { .. } | BootError::Cache { .. } => "CACHE",
            BootError::Tracer(_) => "TRACER",
            BootError::Bind { .. } => "BIND",
            BootError::UnknownJob(_) => "UNKNOWN_JOB",
            BootError::Job { .. } => "JOB",
        }
    }
}

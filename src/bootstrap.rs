use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheClient, CachePool, ClientConfig, PoolConfig};
use crate::config::{AppSettings, ConfigDir};
use crate::db::{Database, DbConfig};
use crate::error::Result;
use crate::jobs::JobRegistry;
use crate::logging::{self, LogConfig};
use crate::metrics::{self, Metrics};
use crate::resource::Resources;
use crate::server;
use crate::shutdown::setup_signal_handlers;
use crate::trace::{TraceConfig, TraceExporter, TraceHook};

pub const APP_SECTION: &str = "app";
pub const LOG_SECTION: &str = "log";
pub const DB_SECTION: &str = "test_mysql";
pub const CACHE_SECTION: &str = "default_redis";
pub const TRACE_SECTION: &str = "jaeger";

#[derive(Parser, Debug)]
#[command(name = "gantry", version, about = "Service bootstrap and resource supervisor")]
pub struct Args {
    /// Directory holding one TOML file per config section
    #[arg(long, env = "GANTRY_CONF", default_value = "conf_dev")]
    pub conf: PathBuf,

    /// Run the named job once and exit instead of serving
    #[arg(long, env = "GANTRY_JOB", default_value = "")]
    pub job: String,
}

impl Args {
    pub fn mode(&self) -> Mode {
        Mode::from_job_flag(&self.job)
    }
}

/// What the process does after initialization. Serving and running a job are
/// mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    RunJob(String),
}

impl Mode {
    pub fn from_job_flag(job: &str) -> Self {
        let trimmed = job.trim();
        if trimmed.is_empty() {
            Mode::Serve
        } else {
            Mode::RunJob(trimmed.to_string())
        }
    }
}

/// Bring every resource up, strictly in order, stopping at the first
/// failure. Each step only runs once everything before it succeeded.
pub async fn init(conf: &Path) -> Result<Resources> {
    let profile = ConfigDir::open(conf)?;

    let settings: AppSettings = profile.read_section(APP_SECTION)?;

    let log_cfg: LogConfig = profile.read_section(LOG_SECTION)?;
    let logger = logging::init(&settings, &log_cfg)?;
    info!(
        app = %settings,
        profile = %profile.path().display(),
        version = env!("CARGO_PKG_VERSION"),
        "logger ready"
    );

    if let Err(err) = Metrics::init() {
        warn!(error = %err, "metrics registration failed, continuing without");
    }

    let db_cfg: DbConfig = profile.read_section(DB_SECTION)?;
    let db = Database::connect(DB_SECTION, &db_cfg).await?;
    metrics::set_resource_up("database", true);
    info!(section = DB_SECTION, "database ready");

    // One section, two readers: the pool wants sizing knobs the plain
    // client never looks at.
    let pool_cfg: PoolConfig = profile.read_section(CACHE_SECTION)?;
    let cache_pool = CachePool::connect(CACHE_SECTION, &pool_cfg).await?;
    let client_cfg: ClientConfig = profile.read_section(CACHE_SECTION)?;
    let hook = TraceHook::new("gantry.cache");
    let cache = CacheClient::connect(CACHE_SECTION, &client_cfg, hook).await?;
    metrics::set_resource_up("cache", true);
    info!(section = CACHE_SECTION, "cache pool and client ready");

    let trace_cfg: TraceConfig = profile.read_section(TRACE_SECTION)?;
    let tracer = TraceExporter::init(&settings, &trace_cfg)?;
    metrics::set_resource_up("tracer", tracer.is_active());
    info!(active = tracer.is_active(), "trace exporter ready");

    Ok(Resources {
        settings,
        logger,
        db,
        cache_pool,
        cache,
        tracer,
    })
}

/// Initialize, then either serve until a signal arrives or run one job.
pub async fn run(args: Args) -> Result<()> {
    let mode = args.mode();
    let resources = Arc::new(init(&args.conf).await?);

    match mode {
        Mode::Serve => {
            let shutdown = setup_signal_handlers();
            server::serve(resources.clone(), shutdown).await?;
            resources.tracer.shutdown();
            info!("server stopped");
            Ok(())
        }
        Mode::RunJob(name) => {
            let registry = JobRegistry::builtin();
            let outcome = registry.run(&name, &resources).await;
            resources.tracer.flush();
            resources.tracer.shutdown();
            outcome
        }
    }
}

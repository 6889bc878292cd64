pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod resource;
pub mod server;
pub mod shutdown;
pub mod trace;

use clap::Parser;

/// Parse CLI flags and run the process end to end.
pub async fn run() -> error::Result<()> {
    let args = bootstrap::Args::parse();
    bootstrap::run(args).await
}

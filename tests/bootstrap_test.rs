//! End-to-end checks of the initialization pipeline: strict step order,
//! stop at the first failure, and the serve loop built on top of it.
//!
//! The ordering tests run against throwaway config profiles and need no
//! backing services; the tests at the bottom want the dev MySQL and Redis
//! listening locally.

use gantry::bootstrap;
use gantry::config::ConfigError;
use gantry::error::BootError;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const APP: &str = "name = \"gantry-test\"\nport = 18080\n";
const LOG: &str = "level = \"warn\"\n";
const DB_UNREACHABLE: &str = "host = \"127.0.0.1\"\nport = 1\nuser = \"root\"\ndatabase = \"gantry\"\nacquire_timeout_secs = 1\n";
const DB_DEV: &str = "host = \"127.0.0.1\"\nport = 3306\nuser = \"root\"\npassword = \"root\"\ndatabase = \"gantry\"\n";
const REDIS_DEV: &str = "host = \"127.0.0.1\"\nport = 6379\n";
const TRACE_OFF: &str = "enabled = false\n";

fn profile(sections: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, body) in sections {
        std::fs::write(dir.path().join(format!("{name}.toml")), body).expect("write section");
    }
    dir
}

fn missing_section(err: &BootError) -> Option<&str> {
    match err {
        BootError::Config(ConfigError::SectionMissing { section, .. }) => Some(section.as_str()),
        _ => None,
    }
}

#[tokio::test]
async fn missing_profile_directory_fails_first() {
    let err = bootstrap::init(Path::new("/definitely/not/a/profile"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BootError::Config(ConfigError::ProfileMissing(_))
    ));
    assert_eq!(err.kind(), "CONFIG");
}

#[tokio::test]
async fn app_section_is_required_before_everything_else() {
    let dir = profile(&[]);
    let err = bootstrap::init(dir.path()).await.unwrap_err();
    assert_eq!(missing_section(&err), Some("app"));
}

#[tokio::test]
async fn log_section_comes_after_app() {
    let dir = profile(&[("app", APP)]);
    let err = bootstrap::init(dir.path()).await.unwrap_err();
    assert_eq!(missing_section(&err), Some("log"));
}

#[tokio::test]
async fn database_section_comes_after_logger() {
    let dir = profile(&[("app", APP), ("log", LOG)]);
    let err = bootstrap::init(dir.path()).await.unwrap_err();
    assert_eq!(missing_section(&err), Some("test_mysql"));
}

#[tokio::test]
async fn pipeline_order_wins_over_directory_contents() {
    // Later sections are all present; the first complaint is still the
    // database, because nothing past a failed step ever runs.
    let dir = profile(&[("app", APP), ("log", LOG), ("jaeger", TRACE_OFF)]);
    let err = bootstrap::init(dir.path()).await.unwrap_err();
    assert_eq!(missing_section(&err), Some("test_mysql"));
}

#[tokio::test]
async fn malformed_database_section_reported_before_missing_cache() {
    let dir = profile(&[("app", APP), ("log", LOG), ("test_mysql", "port = \"x\"\n")]);
    let err = bootstrap::init(dir.path()).await.unwrap_err();
    match err {
        BootError::Config(ConfigError::Malformed { section, .. }) => {
            assert_eq!(section, "test_mysql")
        }
        other => panic!("expected a malformed-section error, got {other}"),
    }
}

#[tokio::test]
async fn unreachable_database_stops_the_pipeline_before_cache() {
    let dir = profile(&[
        ("app", APP),
        ("log", LOG),
        ("test_mysql", DB_UNREACHABLE),
        ("default_redis", REDIS_DEV),
        ("jaeger", TRACE_OFF),
    ]);
    let err = bootstrap::init(dir.path()).await.unwrap_err();
    assert_eq!(err.kind(), "DATABASE");
}

#[tokio::test]
#[ignore = "Requires MySQL and Redis running locally"]
async fn full_boot_serve_round_trip_and_shutdown() -> anyhow::Result<()> {
    let dir = profile(&[
        ("app", APP),
        ("log", LOG),
        ("test_mysql", DB_DEV),
        ("default_redis", REDIS_DEV),
        ("jaeger", TRACE_OFF),
    ]);
    let resources = Arc::new(bootstrap::init(dir.path()).await?);

    let (controller, receiver) = gantry::shutdown::ShutdownController::new();
    let server = tokio::spawn(gantry::server::serve(resources.clone(), receiver));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A plain round trip; the correlation id must come back on the response.
    let mut stream = tokio::net::TcpStream::connect("127.0.0.1:18080").await?;
    stream
        .write_all(
            b"GET /livez HTTP/1.1\r\nhost: localhost\r\nlog-id: fromtest1\r\nconnection: close\r\n\r\n",
        )
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.to_ascii_lowercase().contains("log-id: fromtest1"));

    // The sample route drives the instrumented database and cache helpers.
    let mut stream = tokio::net::TcpStream::connect("127.0.0.1:18080").await?;
    stream
        .write_all(b"GET /ping HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("pong"));

    // A connection that never sends anything is cut by the read deadline.
    let mut idle = tokio::net::TcpStream::connect("127.0.0.1:18080").await?;
    let started = Instant::now();
    let mut buf = [0u8; 1];
    match idle.read(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected the idle connection to close, got {n} bytes"),
    }
    assert!(started.elapsed() >= Duration::from_millis(2500));
    assert!(started.elapsed() < Duration::from_secs(10));

    controller.shutdown();
    server.await??;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires MySQL and Redis running locally"]
async fn ping_job_passes_against_live_backends() -> anyhow::Result<()> {
    let dir = profile(&[
        ("app", APP),
        ("log", LOG),
        ("test_mysql", DB_DEV),
        ("default_redis", REDIS_DEV),
        ("jaeger", TRACE_OFF),
    ]);
    let resources = bootstrap::init(dir.path()).await?;

    let registry = gantry::jobs::JobRegistry::builtin();
    registry.run("ping", &resources).await?;

    let unknown = registry.run("no-such-job", &resources).await.unwrap_err();
    assert_eq!(unknown.kind(), "UNKNOWN_JOB");
    Ok(())
}

#[tokio::test]
#[ignore = "Requires MySQL and Redis running locally"]
async fn cleanup_job_runs_against_live_backends() -> anyhow::Result<()> {
    let dir = profile(&[
        ("app", APP),
        ("log", LOG),
        ("test_mysql", DB_DEV),
        ("default_redis", REDIS_DEV),
        ("jaeger", TRACE_OFF),
    ]);
    let resources = bootstrap::init(dir.path()).await?;

    // The job prunes this table; make sure the dev database has it.
    let log_id = gantry::logging::LogId::generate();
    resources
        .db
        .execute(
            &log_id,
            "CREATE TABLE IF NOT EXISTS task_runs (\
             id BIGINT PRIMARY KEY AUTO_INCREMENT, \
             finished_at DATETIME NOT NULL)",
        )
        .await?;

    gantry::jobs::JobRegistry::builtin()
        .run("cleanup", &resources)
        .await?;
    Ok(())
}

#[tokio::test]
#[ignore = "Requires an OTLP collector on 4317 plus MySQL and Redis"]
async fn tracer_probe_reaches_a_live_collector() -> anyhow::Result<()> {
    let dir = profile(&[
        ("app", APP),
        ("log", LOG),
        ("test_mysql", DB_DEV),
        ("default_redis", REDIS_DEV),
        (
            "jaeger",
            "enabled = true\nendpoint = \"http://127.0.0.1:4317\"\n",
        ),
    ]);
    let resources = bootstrap::init(dir.path()).await?;
    assert!(resources.tracer.is_active());
    resources.tracer.shutdown();
    Ok(())
}

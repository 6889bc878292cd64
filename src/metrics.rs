use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge, register_int_gauge_vec,
    CounterVec, HistogramVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;

pub struct Metrics {
    pub http_requests: CounterVec,
    pub http_duration: HistogramVec,
    pub db_queries: CounterVec,
    pub db_duration: HistogramVec,
    pub cache_commands: CounterVec,
    pub cache_duration: HistogramVec,
    pub jobs_run: CounterVec,
    pub open_connections: IntGauge,
    pub resource_up: IntGaugeVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        Ok(Self {
            http_requests: register_counter_vec!(
                prometheus::opts!("gantry_http_requests_total", "Total HTTP requests served"),
                &["method", "path", "status"]
            )?,
            http_duration: {
                let opts = prometheus::HistogramOpts::new(
                    "gantry_http_request_duration_seconds",
                    "Time taken to serve HTTP requests",
                )
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]);
                register_histogram_vec!(opts, &["method", "path"])?
            },
            db_queries: register_counter_vec!(
                prometheus::opts!("gantry_db_queries_total", "Total database queries issued"),
                &["op", "status"]
            )?,
            db_duration: {
                let opts = prometheus::HistogramOpts::new(
                    "gantry_db_query_duration_seconds",
                    "Time taken by database queries",
                )
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]);
                register_histogram_vec!(opts, &["op"])?
            },
            cache_commands: register_counter_vec!(
                prometheus::opts!("gantry_cache_commands_total", "Total cache commands issued"),
                &["command", "status"]
            )?,
            cache_duration: {
                let opts = prometheus::HistogramOpts::new(
                    "gantry_cache_command_duration_seconds",
                    "Time taken by cache commands",
                )
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]);
                register_histogram_vec!(opts, &["command"])?
            },
            jobs_run: register_counter_vec!(
                prometheus::opts!("gantry_jobs_total", "Total one-off job executions"),
                &["job", "status"]
            )?,
            open_connections: register_int_gauge!(prometheus::opts!(
                "gantry_open_connections",
                "Currently open HTTP connections"
            ))?,
            resource_up: register_int_gauge_vec!(
                prometheus::opts!(
                    "gantry_resource_up",
                    "Whether a backing resource finished initialization (1) or not (0)"
                ),
                &["resource"]
            )?,
        })
    }

    /// Register every collector in the default registry. Safe to call more
    /// than once in the same process; later calls keep the first set.
    pub fn init() -> prometheus::Result<()> {
        if METRICS.get().is_some() {
            return Ok(());
        }
        let metrics = Self::new()?;
        let _ = METRICS.set(metrics);
        Ok(())
    }

    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }
}

pub fn record_http_request(method: &str, path: &str, status: u16, seconds: f64) {
    if let Some(metrics) = Metrics::get() {
        metrics
            .http_requests
            .with_label_values(&[method, path, &status.to_string()])
            .inc();
        metrics
            .http_duration
            .with_label_values(&[method, path])
            .observe(seconds);
    }
}

pub fn record_db_query(op: &str, success: bool, seconds: f64) {
    if let Some(metrics) = Metrics::get() {
        let status = if success { "success" } else { "failure" };
        metrics.db_queries.with_label_values(&[op, status]).inc();
        metrics.db_duration.with_label_values(&[op]).observe(seconds);
    }
}

pub fn record_cache_command(command: &str, success: bool, seconds: f64) {
    if let Some(metrics) = Metrics::get() {
        let status = if success { "success" } else { "failure" };
        metrics
            .cache_commands
            .with_label_values(&[command, status])
            .inc();
        metrics
            .cache_duration
            .with_label_values(&[command])
            .observe(seconds);
    }
}

pub fn record_job_run(job: &str, success: bool) {
    if let Some(metrics) = Metrics::get() {
        let status = if success { "success" } else { "failure" };
        metrics.jobs_run.with_label_values(&[job, status]).inc();
    }
}

pub fn update_open_connections(delta: i64) {
    if let Some(metrics) = Metrics::get() {
        metrics.open_connections.add(delta);
    }
}

pub fn set_resource_up(resource: &str, up: bool) {
    if let Some(metrics) = Metrics::get() {
        metrics
            .resource_up
            .with_label_values(&[resource])
            .set(if up { 1 } else { 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        Metrics::init().unwrap();
        Metrics::init().unwrap();
        assert!(Metrics::get().is_some());
    }

    #[test]
    fn recording_without_init_is_a_no_op() {
        // Other tests may have initialized already; either way these must
        // not panic.
        record_http_request("GET", "/ping", 200, 0.001);
        record_db_query("ping", true, 0.002);
        record_cache_command("PING", false, 0.001);
        record_job_run("cleanup", true);
        update_open_connections(1);
        update_open_connections(-1);
        set_resource_up("database", true);
    }
}

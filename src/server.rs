use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::logging::{LogFields, LogId, Module, LOG_ID_HEADER};
use crate::metrics;
use crate::net::{Listener, TimedStream};
use crate::resource::Resources;
use crate::shutdown::ShutdownReceiver;

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Peer address of the connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Local address the connection was accepted on.
#[derive(Debug, Clone, Copy)]
pub struct ServerAddr(pub SocketAddr);

#[derive(Clone)]
pub struct AppState {
    pub resources: Arc<Resources>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: crate::resource::ProbeReport,
}

pub async fn health_check(
    State(state): State<AppState>,
    log_id: Option<Extension<LogId>>,
) -> impl IntoResponse {
    let log_id = log_id.map(|Extension(id)| id).unwrap_or_else(LogId::generate);
    let report = state.resources.probe(&log_id).await;

    let code = if report.ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if report.ok() { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: report,
    };
    (code, Json(body))
}

pub async fn liveness_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "alive",
        "timestamp": chrono::Utc::now()
    }))
}

/// Sample API route: one round trip through the database and the cache,
/// every hop stamped with this request's log id.
pub async fn ping(
    State(state): State<AppState>,
    log_id: Option<Extension<LogId>>,
) -> impl IntoResponse {
    let log_id = log_id.map(|Extension(id)| id).unwrap_or_else(LogId::generate);
    let resources = &state.resources;

    let db_ok = resources
        .db
        .fetch_scalar::<i64>(&log_id, "SELECT 1")
        .await
        .map(|one| one == 1)
        .unwrap_or(false);

    let key = format!("gantry:ping:{}", log_id.as_str());
    let cache_ok = match resources
        .cache
        .set(&log_id, &key, "pong", Some(Duration::from_secs(60)))
        .await
    {
        Ok(()) => {
            let read_back = resources
                .cache
                .get(&log_id, &key)
                .await
                .map(|value| value.as_deref() == Some("pong"))
                .unwrap_or(false);
            let _ = resources.cache.del(&log_id, &key).await;
            read_back
        }
        Err(_) => false,
    };

    if db_ok && cache_ok {
        (StatusCode::OK, Json(serde_json::json!({ "message": "pong" })))
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "message": "degraded",
                "database": db_ok,
                "cache": cache_ok,
            })),
        )
    }
}

pub async fn metrics_handler() -> std::result::Result<impl IntoResponse, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(([(header::CONTENT_TYPE, encoder.format_type().to_owned())], buffer))
}

/// Assigns (or adopts) the request's log id, times the request, emits the
/// access log line and echoes the id back to the caller.
pub async fn correlate(mut req: Request, next: Next) -> Response {
    let start = Instant::now();

    let log_id = req
        .headers()
        .get(LOG_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(LogId::from_header)
        .unwrap_or_else(LogId::generate);
    let trace_id = req
        .headers()
        .get("traceparent")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_traceparent);

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let uri = req.uri().to_string();
    let header_summary = summarize_headers(req.headers());
    let caller_ip = req
        .extensions()
        .get::<ClientAddr>()
        .map(|addr| addr.0.ip().to_string());
    let host_ip = req
        .extensions()
        .get::<ServerAddr>()
        .map(|addr| addr.0.ip().to_string());

    req.extensions_mut().insert(log_id.clone());
    let mut response = next.run(req).await;
    let status = response.status().as_u16();

    if let Ok(value) = HeaderValue::from_str(log_id.as_str()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(LOG_ID_HEADER), value);
    }

    let seconds = start.elapsed().as_secs_f64();
    metrics::record_http_request(&method, &path, status, seconds);

    let mut fields = LogFields::new(log_id, Module::Http)
        .method(method.as_str())
        .api(path.as_str())
        .request(uri)
        .header(header_summary)
        .code(i64::from(status))
        .cost_ms(seconds * 1000.0);
    if let Some(trace_id) = trace_id {
        fields = fields.trace_id(trace_id);
    }
    if let Some(ip) = caller_ip {
        fields = fields.caller_ip(ip);
    }
    if let Some(ip) = host_ip {
        fields = fields.host_ip(ip);
    }
    fields.emit("http request");

    response
}

fn summarize_headers(headers: &HeaderMap) -> String {
    let map: BTreeMap<&str, &str> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect();
    serde_json::to_string(&map).unwrap_or_default()
}

/// Pull the trace id out of a W3C `traceparent` header.
fn parse_traceparent(value: &str) -> Option<String> {
    let mut parts = value.split('-');
    let _version = parts.next()?;
    let trace_id = parts.next()?;
    let _span_id = parts.next()?;

    let well_formed = trace_id.len() == 32
        && trace_id.chars().all(|c| c.is_ascii_hexdigit())
        && trace_id.chars().any(|c| c != '0');
    if well_formed {
        Some(trace_id.to_ascii_lowercase())
    } else {
        None
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/livez", get(liveness_check))
        .route("/metrics", get(metrics_handler))
        .route("/ping", get(ping))
        .layer(middleware::from_fn(correlate))
        .with_state(state)
}

/// Accept loop. Every connection gets 3s idle deadlines in both directions
/// and its own task; on shutdown the loop stops accepting and drains what is
/// in flight, up to a grace period.
pub async fn serve(resources: Arc<Resources>, shutdown: ShutdownReceiver) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], resources.settings.port));
    let listener = Listener::bind(addr).await?;
    info!(addr = %listener.local_addr(), "http server listening");

    let app = create_router(AppState {
        resources: resources.clone(),
    });
    let tracker = TaskTracker::new();
    let mut shutdown_rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let app = app.clone();
                        let local = listener.local_addr();
                        metrics::update_open_connections(1);
                        tracker.spawn(async move {
                            handle_connection(stream, peer, local, app).await;
                            metrics::update_open_connections(-1);
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    info!("draining open connections");
    tracker.close();
    if tokio::time::timeout(DRAIN_GRACE, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            grace_secs = DRAIN_GRACE.as_secs(),
            "drain grace elapsed with connections still open"
        );
    }
    resources.tracer.flush();
    Ok(())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, local: SocketAddr, app: Router) {
    let io = TokioIo::new(Box::pin(TimedStream::new(
        stream,
        READ_TIMEOUT,
        WRITE_TIMEOUT,
    )));

    let service = hyper::service::service_fn(move |mut req: hyper::Request<Incoming>| {
        req.extensions_mut().insert(ClientAddr(peer));
        req.extensions_mut().insert(ServerAddr(local));
        app.clone().oneshot(req)
    });

    if let Err(err) = auto::Builder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
    {
        // Idle sockets tripping the deadline land here as well.
        debug!(peer = %peer, error = %err, "connection closed with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn probe_router() -> Router {
        Router::new()
            .route("/t", get(|| async { "ok" }))
            .layer(middleware::from_fn(correlate))
    }

    #[tokio::test]
    async fn caller_supplied_log_id_is_echoed() {
        let app = probe_router();
        let req = Request::builder()
            .uri("/t")
            .header(LOG_ID_HEADER, "abc123")
            .body(Body::empty())
            .unwrap();

        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get(LOG_ID_HEADER).unwrap(), "abc123");
    }

    #[tokio::test]
    async fn missing_log_id_gets_generated_and_returned() {
        let app = probe_router();
        let req = Request::builder().uri("/t").body(Body::empty()).unwrap();

        let res = app.oneshot(req).await.unwrap();
        let echoed = res
            .headers()
            .get(LOG_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap()
            .to_string();
        assert_eq!(echoed.len(), 32);
        assert!(echoed.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn blank_log_id_header_is_replaced() {
        let app = probe_router();
        let req = Request::builder()
            .uri("/t")
            .header(LOG_ID_HEADER, "  ")
            .body(Body::empty())
            .unwrap();

        let res = app.oneshot(req).await.unwrap();
        let echoed = res
            .headers()
            .get(LOG_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(echoed.len(), 32);
    }

    #[tokio::test]
    async fn handlers_see_the_request_log_id() {
        let app = Router::new()
            .route(
                "/id",
                get(|Extension(id): Extension<LogId>| async move { id.as_str().to_string() }),
            )
            .layer(middleware::from_fn(correlate));
        let req = Request::builder()
            .uri("/id")
            .header(LOG_ID_HEADER, "traceme1")
            .body(Body::empty())
            .unwrap();

        let res = app.oneshot(req).await.unwrap();
        let body = axum::body::to_bytes(res.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"traceme1");
    }

    #[tokio::test]
    async fn concurrent_requests_get_distinct_log_ids() {
        let app = probe_router();
        let req_a = Request::builder().uri("/t").body(Body::empty()).unwrap();
        let req_b = Request::builder().uri("/t").body(Body::empty()).unwrap();

        let (res_a, res_b) = tokio::join!(app.clone().oneshot(req_a), app.oneshot(req_b));
        let id_a = res_a.unwrap().headers().get(LOG_ID_HEADER).cloned().unwrap();
        let id_b = res_b.unwrap().headers().get(LOG_ID_HEADER).cloned().unwrap();
        assert_ne!(id_a, id_b);
    }

    #[tokio::test]
    async fn livez_answers_without_backends() {
        let res = liveness_check().await.into_response();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_text_format() {
        let res = metrics_handler().await.into_response();
        assert_eq!(res.status(), StatusCode::OK);
        let content_type = res.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));
    }

    #[test]
    fn traceparent_extraction_accepts_only_well_formed_ids() {
        let ok = parse_traceparent("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
        assert_eq!(ok.as_deref(), Some("0af7651916cd43dd8448eb211c80319c"));

        assert!(parse_traceparent("00-short-b7ad6b7169203331-01").is_none());
        assert!(parse_traceparent(
            "00-00000000000000000000000000000000-b7ad6b7169203331-01"
        )
        .is_none());
        assert!(parse_traceparent("garbage").is_none());
    }
}

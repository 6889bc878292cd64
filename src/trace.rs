use opentelemetry::global::{self, BoxedSpan};
use opentelemetry::trace::{Span, SpanKind, Status, Tracer, TracerProvider as _};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::config::AppSettings;
use crate::error::{BootError, Result};

/// Settings for the `jaeger` config section. Spans leave the process over
/// OTLP; the section keeps its historical name.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Defaults to the application name when unset.
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_sample_ratio")]
    pub sample_ratio: f64,
    #[serde(default = "default_export_timeout_secs")]
    pub export_timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_endpoint() -> String {
    "http://127.0.0.1:4317".to_string()
}

fn default_sample_ratio() -> f64 {
    1.0
}

fn default_export_timeout_secs() -> u64 {
    3
}

/// Owns the installed tracer provider. Inactive when tracing is disabled in
/// config; every method is safe to call either way.
pub struct TraceExporter {
    provider: Option<SdkTracerProvider>,
}

impl fmt::Debug for TraceExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceExporter")
            .field("active", &self.provider.is_some())
            .finish()
    }
}

impl TraceExporter {
    /// Build the OTLP pipeline, install it globally and prove the collector
    /// accepts spans by flushing one probe span. An unreachable collector is
    /// an error; a disabled section yields an inactive exporter.
    pub fn init(settings: &AppSettings, cfg: &TraceConfig) -> Result<Self> {
        if !cfg.enabled {
            return Ok(Self { provider: None });
        }

        global::set_text_map_propagator(TraceContextPropagator::new());

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&cfg.endpoint)
            .with_timeout(Duration::from_secs(cfg.export_timeout_secs))
            .build()
            .map_err(|err| BootError::Tracer(format!("exporter setup failed: {err}")))?;

        let service_name = cfg
            .service_name
            .clone()
            .unwrap_or_else(|| settings.name.clone());
        let resource = Resource::builder_empty()
            .with_attributes([KeyValue::new("service.name", service_name)])
            .build();

        let provider = SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                cfg.sample_ratio,
            ))))
            .with_resource(resource)
            .build();

        global::set_tracer_provider(provider.clone());

        let tracer = provider.tracer("gantry");
        let mut probe = tracer.start("startup-probe");
        probe.end();
        provider
            .force_flush()
            .map_err(|err| BootError::Tracer(format!("collector rejected probe span: {err}")))?;

        Ok(Self {
            provider: Some(provider),
        })
    }

    pub fn is_active(&self) -> bool {
        self.provider.is_some()
    }

    pub fn flush(&self) {
        if let Some(provider) = &self.provider {
            if let Err(err) = provider.force_flush() {
                tracing::warn!(error = %err, "trace flush failed");
            }
        }
    }

    pub fn shutdown(&self) {
        if let Some(provider) = &self.provider {
            if let Err(err) = provider.shutdown() {
                tracing::warn!(error = %err, "trace exporter shutdown failed");
            }
        }
    }
}

/// Opens client spans around cache commands. The hook is handed to the cache
/// client before the exporter exists, so it looks the tracer up through the
/// global registry on every call; spans become real once the provider is
/// installed and stay no-ops otherwise.
#[derive(Debug, Clone)]
pub struct TraceHook {
    scope: &'static str,
}

impl TraceHook {
    pub fn new(scope: &'static str) -> Self {
        Self { scope }
    }

    pub fn command_span(&self, name: &'static str) -> BoxedSpan {
        let tracer = global::tracer(self.scope);
        let mut span = tracer
            .span_builder(name)
            .with_kind(SpanKind::Client)
            .start(&tracer);
        span.set_attribute(KeyValue::new("db.system", "redis"));
        span.set_attribute(KeyValue::new("db.operation", name));
        span
    }

    pub fn trace_id(&self, span: &BoxedSpan) -> Option<String> {
        let ctx = span.span_context();
        if ctx.is_valid() {
            Some(ctx.trace_id().to_string())
        } else {
            None
        }
    }

    pub fn mark_error(&self, span: &mut BoxedSpan, err: &dyn fmt::Display) {
        span.set_status(Status::error(err.to_string()));
    }

    pub fn finish(&self, mut span: BoxedSpan) {
        span.end();
    }
}

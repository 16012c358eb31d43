//! Logging and OpenTelemetry export
//!
//! Logs are JSON on stdout behind a reloadable filter, so the
//! ClusterPodPlacementConfig `logVerbosity` can change the level of a
//! running operator. Traces and metrics go to an OTLP collector only when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::crd::LogVerbosity;

/// Directives appended to every level so dependencies stay quiet
const DEPENDENCY_DIRECTIVES: &str = "kube=info,tower=warn,hyper=warn,h2=warn,rustls=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize OpenTelemetry tracer
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces and metrics
    pub service_name: String,

    /// OTLP collector, e.g. `http://otel-collector:4317`; None disables export
    pub otlp_endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: crate::OPERATOR_NAME.to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        }
    }
}

/// Handle for changing the log level after startup
#[derive(Clone)]
pub struct LogLevelHandle {
    inner: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    /// Switch the global filter to the given verbosity
    pub fn set_verbosity(&self, verbosity: LogVerbosity) {
        let filter = filter_for(verbosity);
        if let Err(e) = self.inner.modify(|f| *f = filter) {
            tracing::warn!(error = %e, "Failed to change log verbosity");
        }
    }
}

fn filter_for(verbosity: LogVerbosity) -> EnvFilter {
    EnvFilter::new(format!(
        "{},{}",
        verbosity.as_directive(),
        DEPENDENCY_DIRECTIVES
    ))
}

/// Pod identity exported as resource attributes, read from downward API env
const RESOURCE_ENV: &[(&str, &str)] = &[
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Installed telemetry; keep it alive for the process lifetime
pub struct Telemetry {
    log_level: LogLevelHandle,
    export: Option<OtlpExport>,
}

impl Telemetry {
    /// Handle for switching log verbosity at runtime
    pub fn log_level(&self) -> LogLevelHandle {
        self.log_level.clone()
    }

    /// Flush pending spans and metrics; no-op without an OTLP endpoint
    pub fn shutdown(self) {
        if let Some(export) = self.export {
            export.shutdown();
        }
    }
}

/// Providers pushing to the OTLP collector
struct OtlpExport {
    traces: TracerProvider,
    metrics: SdkMeterProvider,
}

impl OtlpExport {
    fn install(endpoint: &str, resource: Resource) -> Result<Self, TelemetryError> {
        let span_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;
        let traces = TracerProvider::builder()
            .with_batch_exporter(span_exporter, runtime::Tokio)
            .with_resource(resource.clone())
            .build();

        let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        let metrics = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(metric_exporter, runtime::Tokio).build())
            .with_resource(resource)
            .build();

        global::set_tracer_provider(traces.clone());
        global::set_meter_provider(metrics.clone());
        Ok(Self { traces, metrics })
    }

    fn shutdown(self) {
        if let Err(e) = self.traces.shutdown() {
            tracing::warn!(error = %e, "Failed to flush traces");
        }
        if let Err(e) = self.metrics.shutdown() {
            tracing::warn!(error = %e, "Failed to flush metrics");
        }
    }
}

/// Install the global subscriber, plus OTLP export when an endpoint is set
///
/// `RUST_LOG` wins over `logVerbosity` until the first config arrives.
pub fn init_telemetry(config: TelemetryConfig) -> Result<Telemetry, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let export = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| OtlpExport::install(endpoint, resource(&config.service_name)))
        .transpose()?;
    let otel_layer = export.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.traces.tracer(config.service_name.clone()))
    });

    let initial = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter_for(LogVerbosity::default()));
    let (filter_layer, handle) = reload::Layer::new(initial);

    let json = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(json)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(Telemetry {
        log_level: LogLevelHandle { inner: handle },
        export,
    })
}

fn resource(service_name: &str) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(
        RESOURCE_ENV
            .iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|v| KeyValue::new(*key, v))),
    );
    Resource::new(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_service_name_is_operator() {
        assert_eq!(TelemetryConfig::default().service_name, crate::OPERATOR_NAME);
    }

    #[test]
    fn verbosity_maps_to_filter_and_keeps_dependencies_quiet() {
        assert!(filter_for(LogVerbosity::Debug).to_string().contains("debug"));
        assert!(filter_for(LogVerbosity::Trace).to_string().contains("trace"));
        assert!(filter_for(LogVerbosity::Normal).to_string().contains("kube=info"));
    }

    #[test]
    fn resource_carries_service_identity() {
        let resource = resource("multiarch-test");
        assert_eq!(
            resource.get(opentelemetry::Key::new(SERVICE_NAME)),
            Some(opentelemetry::Value::from("multiarch-test"))
        );
    }
}

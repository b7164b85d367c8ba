//! Logging and tracing setup
//!
//! Installs a `tracing` subscriber with an `EnvFilter` (INFO unless `RUST_LOG`
//! says otherwise), plain or JSON formatting, and an OpenTelemetry OTLP layer
//! when an exporter endpoint is configured.

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Environment variable enabling OTLP export
pub const OTLP_ENDPOINT_ENV: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// OTLP gRPC endpoint; traces are only logged locally when unset
    pub otlp_endpoint: Option<String>,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "lifecycle-operator".to_string(),
            otlp_endpoint: std::env::var(OTLP_ENDPOINT_ENV)
                .ok()
                .filter(|v| !v.is_empty()),
            json: false,
        }
    }
}

fn init_tracer(config: &TelemetryConfig, endpoint: &str) -> Result<sdktrace::Tracer> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", config.service_name.clone()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::config().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("failed to initialize OTLP tracer: {e}")))
}

/// Install the global subscriber
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let tracer = init_tracer(config, endpoint)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let json_layer = config
        .json
        .then(|| fmt::layer().json().with_current_span(true).with_target(true));
    let text_layer = (!config.json).then(|| fmt::layer().with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::ConfigError(format!("failed to install tracing subscriber: {e}")))?;

    if let Some(endpoint) = &config.otlp_endpoint {
        tracing::info!("OpenTelemetry tracing exporting to {}", endpoint);
    }
    Ok(())
}

/// Flush pending spans before exit
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}

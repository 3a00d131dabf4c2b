//! Logging and distributed tracing bootstrap.
//!
//! Installs a `tracing` subscriber with an `EnvFilter` and either a pretty or
//! JSON formatter. With the `telemetry` feature enabled, spans are also
//! exported over OTLP through OpenTelemetry.

#[cfg(feature = "telemetry")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "telemetry")]
use opentelemetry::KeyValue;
#[cfg(feature = "telemetry")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "telemetry")]
use opentelemetry_sdk::{
    runtime,
    trace::{RandomIdGenerator, Sampler},
    Resource,
};
#[cfg(feature = "telemetry")]
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

use crate::{BackbeatError, BackbeatResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines instead of human-readable text.
    #[serde(default)]
    pub json_logs: bool,

    /// Whether OTLP span export is enabled.
    #[serde(default)]
    pub otlp_enabled: bool,

    /// Service name for tracing.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP endpoint URL (e.g., "http://localhost:4317").
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    /// Sampling ratio (0.0 to 1.0).
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_log_level() -> String {
    "info,backbeat=debug".to_string()
}

fn default_service_name() -> String {
    "backbeat".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            otlp_enabled: false,
            service_name: default_service_name(),
            otlp_endpoint: None,
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

impl TelemetryConfig {
    /// Builds the env filter, preferring `RUST_LOG` over the configured level.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Initialize logging (and OTLP export when enabled) for the process.
///
/// Fails if a global subscriber has already been installed.
pub fn init_telemetry(config: &TelemetryConfig) -> BackbeatResult<()> {
    let (json, pretty) = if config.json_logs {
        (Some(tracing_subscriber::fmt::layer().json().with_target(true)), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer().with_target(true)))
    };

    let registry = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(json)
        .with(pretty);

    #[cfg(feature = "telemetry")]
    let registry = registry.with(otlp_layer(config)?);

    registry
        .try_init()
        .map_err(|e| BackbeatError::Configuration(format!("Failed to install subscriber: {e}")))?;

    tracing::info!(
        service_name = %config.service_name,
        json_logs = config.json_logs,
        otlp_enabled = config.otlp_enabled,
        "Telemetry initialized"
    );

    Ok(())
}

#[cfg(feature = "telemetry")]
fn otlp_layer<S>(
    config: &TelemetryConfig,
) -> BackbeatResult<Option<tracing_opentelemetry::OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>>>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    if !config.otlp_enabled {
        return Ok(None);
    }

    let sampler = if config.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if config.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(config.sampling_ratio)
    };

    let resource = Resource::new(vec![KeyValue::new(
        SERVICE_NAME,
        config.service_name.clone(),
    )]);

    let tracer_provider = if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| BackbeatError::Internal(format!("Failed to create OTLP exporter: {}", e)))?;

        opentelemetry_sdk::trace::TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_sampler(sampler)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build()
    } else {
        opentelemetry_sdk::trace::TracerProvider::builder()
            .with_sampler(sampler)
            .with_id_generator(RandomIdGenerator::default())
            .with_resource(resource)
            .build()
    };

    let tracer = tracer_provider.tracer("backbeat");
    opentelemetry::global::set_tracer_provider(tracer_provider);

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer)))
}

/// Shutdown telemetry, flushing any pending spans.
#[cfg(feature = "telemetry")]
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("Telemetry shutdown complete");
}

/// No spans are buffered without the `telemetry` feature.
#[cfg(not(feature = "telemetry"))]
pub fn shutdown_telemetry() {}

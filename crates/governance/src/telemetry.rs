//! Logging and distributed tracing setup.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use gov_bridge_core::{Error, Result};

const SERVICE_NAME: &str = "gov-bridge";

/// Install the global subscriber: `RUST_LOG` filtering, stdout output
/// (JSON lines when `json` is set), and an OTLP exporter when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is present.
pub fn configure_tracing(json: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,gov_bridge=debug".into()),
    );

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint.clone()),
            )
            .with_trace_config(
                sdktrace::Config::default()
                    .with_resource(Resource::new(vec![KeyValue::new("service.name", SERVICE_NAME)])),
            )
            .install_batch(runtime::Tokio)
            .map_err(|e| Error::internal(format!("Failed to install OTLP pipeline: {}", e)))?;

        let tracer = provider.tracer(SERVICE_NAME);
        global::set_tracer_provider(provider);

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()
            .map_err(|e| Error::internal(format!("Failed to install subscriber: {}", e)))?;

        tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
    } else {
        registry
            .try_init()
            .map_err(|e| Error::internal(format!("Failed to install subscriber: {}", e)))?;
    }

    Ok(())
}

/// Flush pending spans. Call once on shutdown.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}

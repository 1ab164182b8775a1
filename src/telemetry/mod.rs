//! Structured logging and distributed tracing.
//!
//! `tracing` carries every public async operation on the core
//! components; `init_telemetry` wires an `EnvFilter` + `fmt` layer and,
//! only when an OTLP endpoint is configured, an additional OpenTelemetry
//! layer exporting over gRPC. With no endpoint set the crate still logs
//! usefully with zero external dependencies reachable.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, Tracer, TracerProvider};
use opentelemetry_sdk::{trace as sdktrace, Resource};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// `Some` enables the OTLP layer; `None` means console-only.
    pub otlp_endpoint: Option<String>,
    /// 0.0 (never sample) to 1.0 (always sample).
    pub sample_ratio: f64,
    /// An `EnvFilter` directive string, e.g. `"info"` or `"goal_runner=debug"`.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "goal-runner".to_string(),
            otlp_endpoint: None,
            sample_ratio: 1.0,
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.otlp_endpoint = Some(endpoint);
        }
        if let Ok(ratio) = std::env::var("OTEL_TRACES_SAMPLER_ARG") {
            if let Ok(r) = ratio.parse::<f64>() {
                config.sample_ratio = r.clamp(0.0, 1.0);
            }
        }
        if let Ok(level) = std::env::var("RUNNER_LOG").or_else(|_| std::env::var("RUST_LOG")) {
            config.log_level = level;
        }

        config
    }
}

/// Builds the global `tracing` subscriber. Returns the OTLP tracer (if
/// any) so the caller can hold nothing extra — shutdown is global.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = tracing_subscriber::fmt::layer().compact();

    if let Some(endpoint) = &config.otlp_endpoint {
        let tracer = init_otlp_tracer(&config.service_name, endpoint, config.sample_ratio)?;
        let otel_layer = OpenTelemetryLayer::new(tracer);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

        tracing::info!(
            service_name = %config.service_name,
            endpoint = %endpoint,
            sample_ratio = config.sample_ratio,
            "telemetry initialized with OTLP export"
        );
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

        tracing::info!("telemetry initialized (console only, no OTLP endpoint configured)");
    }

    Ok(())
}

fn init_otlp_tracer(service_name: &str, endpoint: &str, sample_ratio: f64) -> anyhow::Result<Tracer> {
    let sampler = if sample_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if sample_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(sample_ratio)
    };

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .build_span_exporter()?,
            Tokio,
        )
        .with_config(
            sdktrace::Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )])),
        )
        .build();

    let tracer = tracer_provider.tracer(service_name.to_string());
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}

/// Flushes and shuts down the tracer provider; a no-op when OTLP was
/// never enabled. Must be called on every CLI exit path.
pub fn shutdown_telemetry() {
    global::shutdown_tracer_provider();
}

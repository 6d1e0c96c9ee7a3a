//! Tracing subscriber initialization, matching the teacher's `telemetry`
//! module and its `telemetry` Cargo feature.

use tracing_subscriber::{prelude::*, EnvFilter, Registry};

#[cfg(feature = "telemetry")]
async fn otel_layer() -> impl tracing_subscriber::Layer<Registry> {
    use opentelemetry::sdk::{trace, Resource};
    use opentelemetry::KeyValue;

    let endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL").unwrap_or_else(|_| "http://localhost:4317".to_string());
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
        .with_trace_config(trace::config().with_resource(Resource::new(vec![KeyValue::new("service.name", "mcrt-controller")])))
        .install_batch(opentelemetry::runtime::Tokio)
        .expect("otlp pipeline install must succeed at startup");

    tracing_opentelemetry::layer().with_tracer(tracer)
}

/// Initializes the global tracing subscriber. Without the `telemetry`
/// feature this is just a compact fmt layer with an env filter; with it,
/// spans are additionally exported via OTLP.
pub async fn init() {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap();
    let fmt_layer = tracing_subscriber::fmt::layer().compact();

    #[cfg(feature = "telemetry")]
    {
        let collector = Registry::default().with(env_filter).with(fmt_layer).with(otel_layer().await);
        tracing::subscriber::set_global_default(collector).unwrap();
    }

    #[cfg(not(feature = "telemetry"))]
    {
        let collector = Registry::default().with(env_filter).with(fmt_layer);
        tracing::subscriber::set_global_default(collector).unwrap();
    }
}

/// Returns the current span's OpenTelemetry trace id as a hex string, or
/// an all-zero id outside the `telemetry` feature.
#[cfg(feature = "telemetry")]
pub fn get_trace_id() -> String {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    tracing::Span::current().context().span().span_context().trace_id().to_string()
}

#[cfg(not(feature = "telemetry"))]
pub fn get_trace_id() -> String {
    "00000000000000000000000000000000".to_string()
}

//! Diagnostics setup.
//!
//! `FOREMAN_LOG` sets the filter (default `warn`); `FOREMAN_LOG_FORMAT=json`
//! switches stderr output to JSON lines. With the `otel` feature, spans and
//! events are also exported over OTLP/HTTP when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub const LOG_ENV: &str = "FOREMAN_LOG";
pub const LOG_FORMAT_ENV: &str = "FOREMAN_LOG_FORMAT";
const SERVICE_NAME: &str = "foreman";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Flushes exporters on drop. Keep it alive for the whole process.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    tracer_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
    #[cfg(feature = "otel")]
    logger_provider: Option<opentelemetry_sdk::logs::SdkLoggerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        {
            if let Some(provider) = self.tracer_provider.take()
                && let Err(e) = provider.shutdown()
            {
                eprintln!("warning: trace exporter shutdown failed: {e}");
            }
            if let Some(provider) = self.logger_provider.take()
                && let Err(e) = provider.shutdown()
            {
                eprintln!("warning: log exporter shutdown failed: {e}");
            }
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn json_output() -> bool {
    std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. Failures are reported and otherwise ignored.
pub fn init() -> TelemetryGuard {
    #[allow(unused_mut)]
    let mut guard = TelemetryGuard::default();
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if json_output() {
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed(),
        );
    }

    #[cfg(feature = "otel")]
    if std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        match otel::layers() {
            Ok((otel_layers, tracer_provider, logger_provider)) => {
                layers.extend(otel_layers);
                guard.tracer_provider = Some(tracer_provider);
                guard.logger_provider = Some(logger_provider);
            }
            Err(e) => eprintln!("warning: OTLP export disabled: {e:#}"),
        }
    }

    if let Err(e) = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter())
        .try_init()
    {
        eprintln!("warning: could not install tracing subscriber: {e}");
    }
    guard
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::Layer;
    use tracing_subscriber::filter::filter_fn;

    use super::{BoxedLayer, SERVICE_NAME};

    /// Exporter internals must not feed back into the log bridge.
    fn is_exporter_target(target: &str) -> bool {
        ["opentelemetry", "reqwest", "hyper", "h2", "tonic"]
            .iter()
            .any(|prefix| target.starts_with(prefix))
    }

    pub(super) fn layers()
    -> anyhow::Result<(Vec<BoxedLayer>, SdkTracerProvider, SdkLoggerProvider)> {
        let resource = Resource::builder().with_service_name(SERVICE_NAME).build();

        let span_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .build()?;
        let tracer_provider = SdkTracerProvider::builder()
            .with_batch_exporter(span_exporter)
            .with_resource(resource.clone())
            .build();

        let log_exporter = opentelemetry_otlp::LogExporter::builder()
            .with_http()
            .build()?;
        let logger_provider = SdkLoggerProvider::builder()
            .with_batch_exporter(log_exporter)
            .with_resource(resource)
            .build();

        let trace_layer = tracing_opentelemetry::layer()
            .with_tracer(tracer_provider.tracer(SERVICE_NAME))
            .boxed();
        let log_layer = OpenTelemetryTracingBridge::new(&logger_provider)
            .with_filter(filter_fn(|meta| !is_exporter_target(meta.target())))
            .boxed();

        Ok((vec![trace_layer, log_layer], tracer_provider, logger_provider))
    }

}

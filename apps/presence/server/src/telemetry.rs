use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_stdout::SpanExporter;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "tripteller-presence";
const FANOUT_BUCKETS: &[f64] = &[0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0];

/// Process-wide logging, tracing and metrics recorder. Dropping it flushes spans.
pub struct Telemetry {
    metrics_handle: PrometheusHandle,
    tracer_provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    pub fn init(otel_stdout: bool) -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .add_global_label("service", SERVICE_NAME)
            .set_buckets_for_metric(
                Matcher::Full("tripteller_presence_fanout_size".into()),
                FANOUT_BUCKETS,
            )
            .context("invalid fan-out histogram buckets")?
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;
        describe_presence_metrics();

        let tracer_provider = otel_stdout.then(stdout_tracer_provider);
        let otel_layer = tracer_provider.as_ref().map(|provider| {
            global::set_tracer_provider(provider.clone());
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .with(otel_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;
        if tracer_provider.is_some() {
            info!("OpenTelemetry stdout span export enabled");
        }

        Ok(Self {
            metrics_handle,
            tracer_provider,
        })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(err) = provider.shutdown() {
                warn!(error = %err, "failed to flush presence spans on shutdown");
            }
        }
    }
}

fn stdout_tracer_provider() -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_attributes(vec![KeyValue::new("service.name", SERVICE_NAME)])
                .build(),
        )
        .build()
}

fn describe_presence_metrics() {
    describe_gauge!("tripteller_presence_sockets_open", "WebSocket connections currently open");
    describe_gauge!("tripteller_presence_subjects_active", "Subjects with a live position");
    describe_gauge!("tripteller_presence_observers_active", "Observers receiving broadcasts");
    describe_counter!(
        "tripteller_presence_samples_accepted_total",
        "Location samples stored and fanned out"
    );
    describe_counter!(
        "tripteller_presence_samples_rejected_total",
        "Location samples refused, labelled by reason"
    );
    describe_counter!(
        "tripteller_presence_observers_evicted_total",
        "Observers dropped for closed or persistently full channels"
    );
    describe_histogram!(
        "tripteller_presence_fanout_size",
        "Observers reached by one location update"
    );
}

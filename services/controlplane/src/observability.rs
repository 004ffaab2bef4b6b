//! Tracing and metrics wiring for the reconciler.
//!
//! # Purpose
//! Installs the `tracing` subscriber (env filter, fmt output and an OTLP span
//! exporter when one can be built) and the Prometheus recorder that backs the
//! `trellis_*` metrics, and serves them on `/metrics`.
//!
//! # Metrics
//! - `trellis_reconcile_total{kind, result}`: finished reconciles per watched kind.
//! - `trellis_reconcile_duration_seconds{kind}`: wall time of one reconcile.
//! - `trellis_derived_writes_total{kind, op}`: writes to derived objects.
//! - `trellis_conflict_retries_total`: retries after a resourceVersion conflict.
//!
//! # Notes
//! Both installs are process-global; repeated calls return the first handle.
use anyhow::Context;
use metrics::Unit;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const RECONCILE_TOTAL: &str = "trellis_reconcile_total";
pub const RECONCILE_DURATION_SECONDS: &str = "trellis_reconcile_duration_seconds";
pub const DERIVED_WRITES_TOTAL: &str = "trellis_derived_writes_total";
pub const CONFLICT_RETRIES_TOTAL: &str = "trellis_conflict_retries_total";

static METRICS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Install tracing for `service_name`, reconciling bindings of `cluster_name`,
/// and return the handle rendering the reconciler metrics.
pub fn init_observability(
    service_name: &str,
    cluster_name: &str,
) -> anyhow::Result<PrometheusHandle> {
    TRACING_INIT.get_or_init(|| {
        global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());
        match build_tracer_provider(service_name, cluster_name) {
            Some(provider) => {
                let tracer = provider.tracer(service_name.to_string());
                let _ = registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init();
            }
            None => {
                let _ = registry.try_init();
            }
        }
    });

    install_metrics_recorder()
}

fn build_tracer_provider(
    service_name: &str,
    cluster_name: &str,
) -> Option<opentelemetry_sdk::trace::SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .ok()?;
    let resource = Resource::builder_empty()
        .with_attributes(resource_attributes(service_name, cluster_name))
        .build();
    Some(
        opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

/// Span resource: the service, the downstream cluster it reconciles and,
/// when running in a pod, the pod's identity from the downward API.
fn resource_attributes(service_name: &str, cluster_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("trellis.cluster.name", cluster_name.to_string()),
    ];
    if let Ok(value) =
        std::env::var("TRELLIS_SERVICE_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"))
    {
        attrs.push(KeyValue::new("service.instance.id", value));
    }
    for (var, key) in [
        ("K8S_NAMESPACE_NAME", "k8s.namespace.name"),
        ("K8S_POD_NAME", "k8s.pod.name"),
    ] {
        if let Ok(value) = std::env::var(var) {
            attrs.push(KeyValue::new(key, value));
        }
    }
    attrs
}

/// Register help text and units for every reconciler metric.
pub fn describe_metrics() {
    metrics::describe_counter!(
        RECONCILE_TOTAL,
        "Finished reconciles of a watched kind, by result."
    );
    metrics::describe_histogram!(
        RECONCILE_DURATION_SECONDS,
        Unit::Seconds,
        "Time spent in one reconcile of a watched kind."
    );
    metrics::describe_counter!(
        DERIVED_WRITES_TOTAL,
        "Creates, updates and deletes of derived RBAC objects and binding status."
    );
    metrics::describe_counter!(
        CONFLICT_RETRIES_TOTAL,
        "Writes retried after a resourceVersion conflict."
    );
}

pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_metrics_on(handle, listener, std::future::pending()).await
}

async fn serve_metrics_on<F>(
    handle: PrometheusHandle,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let mut slot = METRICS_HANDLE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install metrics recorder")?;
    describe_metrics();
    *slot = Some(handle.clone());
    Ok(handle)
}

//! Reconciler service entry point.
//!
//! # Purpose
//! Loads configuration, installs observability, builds the store backend and
//! runs the controllers until ctrl-c.
use anyhow::Context as _;
use controlplane::config::{ReconcilerConfig, StorageBackend};
use controlplane::controller::{Context, run_controllers, run_polling};
use controlplane::handlers::Reconciler;
use controlplane::impersonation::DefaultUserResolver;
use controlplane::observability;
use controlplane::store::{kubernetes::kube_stores, memory::MemoryStore};
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ReconcilerConfig::from_env_or_yaml().context("reconciler config")?;
    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Store backend plus the API client when one is in use.
struct Runtime {
    reconciler: Arc<Reconciler>,
    client: Option<kube::Client>,
}

async fn build_runtime(config: &ReconcilerConfig) -> anyhow::Result<Runtime> {
    let (stores, client) = match config.storage {
        StorageBackend::Memory => (MemoryStore::new().stores(), None),
        StorageBackend::Kubernetes => {
            let client = kube::Client::try_default()
                .await
                .context("build kubernetes client")?;
            (kube_stores(client.clone()), Some(client))
        }
    };
    let reconciler = Reconciler::new(
        stores,
        Arc::new(DefaultUserResolver),
        config.cluster_name.clone(),
        config.conflict_retry,
    );
    Ok(Runtime {
        reconciler: Arc::new(reconciler),
        client,
    })
}

async fn run_with_shutdown<F>(config: ReconcilerConfig, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle =
        observability::init_observability("trellis-controlplane", &config.cluster_name)?;
    let runtime = build_runtime(&config).await?;
    let metrics_task = tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    tracing::info!(
        cluster = %config.cluster_name,
        backend = runtime.reconciler.stores().backend,
        metrics = %config.metrics_bind,
        "reconciler starting"
    );
    tokio::pin!(shutdown);
    match runtime.client {
        Some(client) => {
            let ctx = Arc::new(Context {
                client,
                reconciler: runtime.reconciler,
                resync: config.requeue,
                error_requeue: config.error_requeue,
            });
            tokio::select! {
                _ = run_controllers(ctx, config.concurrency) => {
                    tracing::warn!("controllers stopped");
                }
                _ = &mut shutdown => {}
            }
        }
        None => {
            tokio::select! {
                _ = run_polling(runtime.reconciler, config.requeue, config.error_requeue) => {}
                _ = &mut shutdown => {}
            }
        }
    }

    tracing::info!("reconciler stopping");
    metrics_task.abort();
    let _ = metrics_task.await;
    Ok(())
}

//! Watch loops driving the [`Reconciler`].
//!
//! # Purpose
//! Runs one controller per watched kind (RoleTemplates, CRTBs and PRTBs).
//! Against a real API server this is `kube::runtime::Controller` with a
//! finalizer so removal handlers run before the object disappears. The
//! in-memory backend has no watch events, so [`resync_once`] lists every
//! object and applies the same finalizer protocol by hand.
//!
//! # Key invariants
//! - Every reconcile runs inside a span naming the kind and object.
//! - A successful reconcile is requeued after the resync period; a failed
//!   one after the error delay.
//! - The finalizer is removed only after the removal handler succeeded.
use crate::errors::{ErrorSet, ReconcileError, ReconcileResult};
use crate::handlers::Reconciler;
use crate::observability::{RECONCILE_DURATION_SECONDS, RECONCILE_TOTAL};
use crate::model::{ClusterRoleTemplateBinding, ProjectRoleTemplateBinding, RoleTemplate};
use crate::store::{ClusterStores, DynStore, Selector, StoreResultExt};
use async_trait::async_trait;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::{Action, Config as ControllerConfig, Controller};
use kube::runtime::finalizer::{Error as FinalizerError, Event, finalizer};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info, info_span, warn};

pub const FINALIZER: &str = "trellis.cattle.io/authz-reconciler";

/// A kind the reconciler watches.
#[async_trait]
pub trait Watched:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
    const KIND: &'static str;

    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
    fn store(stores: &ClusterStores) -> &DynStore<Self>;
    async fn apply(reconciler: &Reconciler, object: &Self) -> ReconcileResult<()>;
    async fn cleanup(reconciler: &Reconciler, object: &Self) -> ReconcileResult<()>;
}

#[async_trait]
impl Watched for RoleTemplate {
    const KIND: &'static str = "RoleTemplate";

    fn api(client: Client, _: Option<&str>) -> Api<Self> {
        Api::all(client)
    }

    fn store(stores: &ClusterStores) -> &DynStore<Self> {
        &stores.role_templates
    }

    async fn apply(reconciler: &Reconciler, object: &Self) -> ReconcileResult<()> {
        reconciler.on_change_role_template(object).await
    }

    async fn cleanup(reconciler: &Reconciler, object: &Self) -> ReconcileResult<()> {
        reconciler.on_remove_role_template(object).await
    }
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    }
}

#[async_trait]
impl Watched for ClusterRoleTemplateBinding {
    const KIND: &'static str = "ClusterRoleTemplateBinding";

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn store(stores: &ClusterStores) -> &DynStore<Self> {
        &stores.crtbs
    }

    async fn apply(reconciler: &Reconciler, object: &Self) -> ReconcileResult<()> {
        reconciler.on_change_crtb(object).await
    }

    async fn cleanup(reconciler: &Reconciler, object: &Self) -> ReconcileResult<()> {
        reconciler.on_remove_crtb(object).await
    }
}

#[async_trait]
impl Watched for ProjectRoleTemplateBinding {
    const KIND: &'static str = "ProjectRoleTemplateBinding";

    fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
        namespaced_api(client, namespace)
    }

    fn store(stores: &ClusterStores) -> &DynStore<Self> {
        &stores.prtbs
    }

    async fn apply(reconciler: &Reconciler, object: &Self) -> ReconcileResult<()> {
        reconciler.on_change_prtb(object).await
    }

    async fn cleanup(reconciler: &Reconciler, object: &Self) -> ReconcileResult<()> {
        reconciler.on_remove_prtb(object).await
    }
}

/// Shared state handed to every controller.
pub struct Context {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
    pub resync: Duration,
    pub error_requeue: Duration,
}

type ControllerError = FinalizerError<ReconcileError>;

fn record_outcome(kind: &'static str, started: Instant, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    metrics::counter!(RECONCILE_TOTAL, "kind" => kind, "result" => result).increment(1);
    metrics::histogram!(RECONCILE_DURATION_SECONDS, "kind" => kind)
        .record(started.elapsed().as_secs_f64());
}

fn reconcile_span<K: Watched>(object: &K) -> tracing::Span {
    info_span!(
        "reconcile",
        kind = K::KIND,
        namespace = %object.namespace().unwrap_or_default(),
        name = %object.name_any(),
    )
}

async fn reconcile<K: Watched>(object: Arc<K>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let started = Instant::now();
    let span = reconcile_span(object.as_ref());
    let api = K::api(ctx.client.clone(), object.namespace().as_deref());
    let reconciler = ctx.reconciler.clone();
    let resync = ctx.resync;
    let result = finalizer(&api, FINALIZER, object, |event| async move {
        match event {
            Event::Apply(object) => K::apply(&reconciler, &object)
                .await
                .map(|()| Action::requeue(resync)),
            Event::Cleanup(object) => K::cleanup(&reconciler, &object)
                .await
                .map(|()| Action::await_change()),
        }
    })
    .instrument(span)
    .await;
    record_outcome(K::KIND, started, result.is_ok());
    result
}

fn error_policy<K: Watched>(object: Arc<K>, err: &ControllerError, ctx: Arc<Context>) -> Action {
    warn!(
        kind = K::KIND,
        name = %object.name_any(),
        error = %err,
        "reconcile failed"
    );
    Action::requeue(ctx.error_requeue)
}

async fn drive<K: Watched>(ctx: Arc<Context>, config: ControllerConfig) {
    let api = Api::<K>::all(ctx.client.clone());
    info!(kind = K::KIND, "starting controller");
    Controller::new(api, watcher::Config::default())
        .with_config(config)
        .run(reconcile::<K>, error_policy::<K>, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(kind = K::KIND, object = %object.name, "reconciled"),
                Err(err) => debug!(kind = K::KIND, error = %err, "controller event failed"),
            }
        })
        .await;
}

/// Run all three controllers until their watch streams end.
pub async fn run_controllers(ctx: Arc<Context>, concurrency: u16) {
    let config = ControllerConfig::default().concurrency(concurrency);
    tokio::join!(
        drive::<RoleTemplate>(ctx.clone(), config.clone()),
        drive::<ClusterRoleTemplateBinding>(ctx.clone(), config.clone()),
        drive::<ProjectRoleTemplateBinding>(ctx, config),
    );
}

fn has_finalizer<K: Resource>(object: &K) -> bool {
    object.finalizers().iter().any(|f| f == FINALIZER)
}

/// One pass of the finalizer protocol against a store.
async fn reconcile_stored<K: Watched>(reconciler: &Reconciler, object: K) -> ReconcileResult<()> {
    let store = K::store(reconciler.stores());
    let namespace = object.namespace();
    let name = object.name_any();

    if object.meta().deletion_timestamp.is_some() {
        if !has_finalizer(&object) {
            return Ok(());
        }
        K::cleanup(reconciler, &object).await?;
        // Cleanup may have rewritten status; finalize the latest version.
        let Some(mut latest) = store.get(namespace.as_deref(), &name).await.optional()? else {
            return Ok(());
        };
        latest.finalizers_mut().retain(|f| f != FINALIZER);
        store.update(&latest).await.optional()?;
        return Ok(());
    }

    let object = if has_finalizer(&object) {
        object
    } else {
        let mut object = object;
        object.finalizers_mut().push(FINALIZER.to_string());
        store.update(&object).await?
    };
    K::apply(reconciler, &object).await
}

async fn resync_kind<K: Watched>(reconciler: &Reconciler, errors: &mut ErrorSet) {
    let store = K::store(reconciler.stores());
    let Some(objects) = errors.check(store.list(None, &Selector::everything()).await) else {
        return;
    };
    for object in objects {
        let started = Instant::now();
        let span = reconcile_span(&object);
        let name = object.name_any();
        let result = reconcile_stored(reconciler, object).instrument(span).await;
        record_outcome(K::KIND, started, result.is_ok());
        if let Err(err) = result {
            warn!(kind = K::KIND, name = %name, error = %err, "reconcile failed");
            errors.push(err);
        }
    }
}

/// Reconcile every stored template and binding once, templates first.
pub async fn resync_once(reconciler: &Reconciler) -> ReconcileResult<()> {
    let mut errors = ErrorSet::default();
    resync_kind::<RoleTemplate>(reconciler, &mut errors).await;
    resync_kind::<ClusterRoleTemplateBinding>(reconciler, &mut errors).await;
    resync_kind::<ProjectRoleTemplateBinding>(reconciler, &mut errors).await;
    errors.finish()
}

/// Resync forever; failed passes retry after `error_requeue`.
pub async fn run_polling(reconciler: Arc<Reconciler>, resync: Duration, error_requeue: Duration) {
    info!(backend = reconciler.stores().backend, "starting polling resync");
    loop {
        let delay = match resync_once(&reconciler).await {
            Ok(()) => resync,
            Err(err) => {
                warn!(error = %err, "resync pass failed");
                error_requeue
            }
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impersonation::DefaultUserResolver;
    use crate::model::{ClusterRoleTemplateBindingSpec, RoleTemplateSpec};
    use crate::retry::RetryPolicy;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, PolicyRule};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use trellis_rbac::{CRTB_OWNER_LABEL, RoleContext};

    fn reconciler(memory: &MemoryStore) -> Reconciler {
        Reconciler::new(
            memory.stores(),
            Arc::new(DefaultUserResolver),
            "c1",
            RetryPolicy::default(),
        )
    }

    fn viewer() -> RoleTemplate {
        RoleTemplate {
            metadata: ObjectMeta {
                name: Some("viewer".to_string()),
                ..ObjectMeta::default()
            },
            spec: RoleTemplateSpec {
                context: RoleContext::Cluster,
                rules: vec![PolicyRule {
                    api_groups: Some(vec![String::new()]),
                    resources: Some(vec!["pods".to_string()]),
                    verbs: vec!["get".to_string()],
                    ..PolicyRule::default()
                }],
                ..RoleTemplateSpec::default()
            },
        }
    }

    fn crtb() -> ClusterRoleTemplateBinding {
        ClusterRoleTemplateBinding {
            metadata: ObjectMeta {
                name: Some("crtb-1".to_string()),
                namespace: Some("c1".to_string()),
                ..ObjectMeta::default()
            },
            spec: ClusterRoleTemplateBindingSpec {
                user_name: Some("alice".to_string()),
                cluster_name: "c1".to_string(),
                role_template_name: "viewer".to_string(),
                ..ClusterRoleTemplateBindingSpec::default()
            },
            status: None,
        }
    }

    async fn crbs_for(memory: &MemoryStore, owner: &str) -> Vec<ClusterRoleBinding> {
        memory
            .stores()
            .cluster_role_bindings
            .list(None, &Selector::eq(CRTB_OWNER_LABEL, owner))
            .await
            .expect("list")
    }

    #[tokio::test]
    async fn resync_adds_the_finalizer_and_applies() {
        let memory = MemoryStore::new();
        let stores = memory.stores();
        stores.role_templates.create(&viewer()).await.expect("rt");
        stores.crtbs.create(&crtb()).await.expect("crtb");

        resync_once(&reconciler(&memory)).await.expect("resync");

        let stored = stores.crtbs.get(Some("c1"), "crtb-1").await.expect("crtb");
        assert!(has_finalizer(&stored));
        assert_eq!(crbs_for(&memory, "crtb-1").await.len(), 1);
        let rt = stores.role_templates.get(None, "viewer").await.expect("rt");
        assert!(has_finalizer(&rt));
    }

    #[tokio::test]
    async fn deletion_runs_cleanup_before_finalizing() {
        let memory = MemoryStore::new();
        let stores = memory.stores();
        let reconciler = reconciler(&memory);
        stores.role_templates.create(&viewer()).await.expect("rt");
        stores.crtbs.create(&crtb()).await.expect("crtb");
        resync_once(&reconciler).await.expect("resync");

        stores.crtbs.delete(Some("c1"), "crtb-1").await.expect("delete");
        let pending = stores.crtbs.get(Some("c1"), "crtb-1").await.expect("pending");
        assert!(pending.meta().deletion_timestamp.is_some());

        resync_once(&reconciler).await.expect("resync");
        assert!(crbs_for(&memory, "crtb-1").await.is_empty());
        assert!(
            stores
                .crtbs
                .get(Some("c1"), "crtb-1")
                .await
                .optional()
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn failures_are_joined_and_other_objects_still_reconcile() {
        let memory = MemoryStore::new();
        let stores = memory.stores();
        stores.role_templates.create(&viewer()).await.expect("rt");
        let mut broken = crtb();
        broken.metadata.name = Some("crtb-0".to_string());
        broken.spec.user_name = None;
        stores.crtbs.create(&broken).await.expect("broken");
        stores.crtbs.create(&crtb()).await.expect("crtb");

        let err = resync_once(&reconciler(&memory)).await.expect_err("subject");
        assert!(matches!(err, ReconcileError::Rbac(_)));
        assert_eq!(crbs_for(&memory, "crtb-1").await.len(), 1);
    }

    #[test]
    fn finalizer_detection() {
        let mut object = crtb();
        assert!(!has_finalizer(&object));
        object.finalizers_mut().push(FINALIZER.to_string());
        assert!(has_finalizer(&object));
    }
}

// Derived bindings co-owned by several bindings through one owner label each.
//
// An owner label is added when a binding starts needing the object and
// removed when it stops; the object is deleted once the last owner label is
// gone. Label edits re-read and retry on conflict since several owners
// reconcile concurrently.
use crate::errors::{ErrorSet, ReconcileError};
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::store::{DynStore, Selector, StoreError, StoreResult, StoreResultExt, ignore_not_found};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::{debug, info};
use trellis_rbac::{cluster_role_binding_content_eq, role_binding_content_eq};

pub(crate) trait DerivedBinding: Resource<DynamicType = ()> + Clone + Send + Sync + 'static {
    fn same_content(&self, other: &Self) -> bool;
}

impl DerivedBinding for ClusterRoleBinding {
    fn same_content(&self, other: &Self) -> bool {
        cluster_role_binding_content_eq(self, other)
    }
}

impl DerivedBinding for RoleBinding {
    fn same_content(&self, other: &Self) -> bool {
        role_binding_content_eq(self, other)
    }
}

/// Which part of a sync failed first; handlers map it to a condition reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncPhase {
    List,
    Create,
    Delete,
}

#[derive(Debug)]
pub(crate) struct SyncError {
    pub phase: SyncPhase,
    pub source: ReconcileError,
}

impl SyncError {
    fn new(phase: SyncPhase, source: impl Into<ReconcileError>) -> Self {
        Self {
            phase,
            source: source.into(),
        }
    }
}

/// Tracks the first failing phase while still attempting every item.
#[derive(Default)]
struct PhaseErrors {
    first: Option<SyncPhase>,
    errors: ErrorSet,
}

impl PhaseErrors {
    fn record(&mut self, phase: SyncPhase, result: Result<(), ReconcileError>) {
        if let Err(err) = result {
            self.first.get_or_insert(phase);
            self.errors.push(err);
        }
    }

    fn finish(self) -> Result<(), SyncError> {
        match (self.first, self.errors.finish()) {
            (Some(phase), Err(source)) => Err(SyncError { phase, source }),
            _ => Ok(()),
        }
    }
}

fn has_owner_labels(labels: &BTreeMap<String, String>, is_owner_label: fn(&str) -> bool) -> bool {
    labels.keys().any(|key| is_owner_label(key))
}

/// Converge the set of objects carrying `owner_label` onto `desired`.
///
/// Desired objects are created (or adopted by adding the label). Objects
/// carrying the label that are no longer desired lose it, and are deleted
/// when `is_owner_label` matches none of their remaining labels.
pub(crate) async fn sync_shared<T: DerivedBinding>(
    store: &DynStore<T>,
    retry: RetryPolicy,
    owner_label: &str,
    is_owner_label: fn(&str) -> bool,
    desired: Vec<T>,
) -> Result<(), SyncError> {
    let existing = store
        .list(None, &Selector::exists(owner_label))
        .await
        .map_err(|err| SyncError::new(SyncPhase::List, err))?;

    let mut errors = PhaseErrors::default();
    let mut satisfied = vec![false; desired.len()];
    for object in existing {
        let wanted = desired.iter().position(|want| {
            want.name_any() == object.name_any()
                && want.namespace() == object.namespace()
                && want.same_content(&object)
        });
        match wanted {
            Some(idx) => satisfied[idx] = true,
            None => errors.record(
                SyncPhase::Delete,
                release(store, retry, &object, owner_label, is_owner_label)
                    .await
                    .map_err(Into::into),
            ),
        }
    }

    for (want, done) in desired.iter().zip(satisfied) {
        if done {
            continue;
        }
        errors.record(
            SyncPhase::Create,
            adopt_or_create(store, retry, want, owner_label, is_owner_label).await,
        );
    }
    errors.finish()
}

/// Remove `owner_label` from every object carrying it.
pub(crate) async fn release_all<T: DerivedBinding>(
    store: &DynStore<T>,
    retry: RetryPolicy,
    namespace: Option<&str>,
    owner_label: &str,
    is_owner_label: fn(&str) -> bool,
) -> Result<(), SyncError> {
    let existing = store
        .list(namespace, &Selector::exists(owner_label))
        .await
        .map_err(|err| SyncError::new(SyncPhase::List, err))?;
    let mut errors = PhaseErrors::default();
    for object in existing {
        errors.record(
            SyncPhase::Delete,
            release(store, retry, &object, owner_label, is_owner_label)
                .await
                .map_err(Into::into),
        );
    }
    errors.finish()
}

/// Drop `owner_label` from `object`; delete it if no owner remains.
async fn release<T: DerivedBinding>(
    store: &DynStore<T>,
    retry: RetryPolicy,
    object: &T,
    owner_label: &str,
    is_owner_label: fn(&str) -> bool,
) -> StoreResult<()> {
    let namespace = object.namespace();
    let name = object.name_any();
    retry_on_conflict(retry, || {
        let namespace = namespace.clone();
        let name = name.clone();
        async move {
            let mut current = match store.get(namespace.as_deref(), &name).await.optional() {
                Ok(Some(current)) => current,
                Ok(None) => return Ok(()),
                Err(err) => return Err(err),
            };
            let labels = current.meta_mut().labels.get_or_insert_with(BTreeMap::new);
            if labels.remove(owner_label).is_none() {
                return Ok(());
            }
            if has_owner_labels(labels, is_owner_label) {
                debug!(binding = %name, owner_label, "releasing shared binding");
                return store.update(&current).await.map(|_| ());
            }
            info!(binding = %name, "deleting binding without owners");
            ignore_not_found(store.delete(namespace.as_deref(), &name).await)
        }
    })
    .await
}

/// Make sure `want` exists carrying `owner_label`.
///
/// A live object with the same name and content is adopted by adding the
/// label. One with different content is replaced, keeping its other owners.
async fn adopt_or_create<T: DerivedBinding>(
    store: &DynStore<T>,
    retry: RetryPolicy,
    want: &T,
    owner_label: &str,
    is_owner_label: fn(&str) -> bool,
) -> Result<(), ReconcileError> {
    let namespace = want.namespace();
    let name = want.name_any();
    let outcome = retry_on_conflict(retry, || {
        let namespace = namespace.clone();
        let name = name.clone();
        async move {
            let Some(mut live) = store.get(namespace.as_deref(), &name).await.optional()? else {
                return match store.create(want).await {
                    Err(err) if err.is_already_exists() => Err(StoreError::Conflict {
                        kind: T::kind(&()).into_owned(),
                        name,
                    }),
                    other => other.map(|_| ()),
                };
            };
            if !want.same_content(&live) {
                let mut replacement = want.clone();
                let carried = live.labels().clone();
                let labels = replacement.meta_mut().labels.get_or_insert_with(BTreeMap::new);
                for (key, value) in carried {
                    if is_owner_label(&key) {
                        labels.entry(key).or_insert(value);
                    }
                }
                info!(binding = %name, "replacing binding with stale content");
                ignore_not_found(store.delete(namespace.as_deref(), &name).await)?;
                return store.create(&replacement).await.map(|_| ());
            }
            let labels = live.meta_mut().labels.get_or_insert_with(BTreeMap::new);
            if labels.get(owner_label).map(String::as_str) == Some("true") {
                return Ok(());
            }
            labels.insert(owner_label.to_string(), "true".to_string());
            debug!(binding = %name, owner_label, "adopting existing binding");
            store.update(&live).await.map(|_| ())
        }
    })
    .await;
    outcome.map_err(Into::into)
}

//! Object store abstraction used by every reconciler handler.
//!
//! # Purpose
//! Handlers talk to the API server only through [`ObjectStore`]: typed
//! get/list/create/update/delete with label-selector listing and
//! resourceVersion conflict semantics. Two backends implement it:
//! [`memory::MemoryStore`] for tests and local runs, and [`kubernetes::KubeStore`]
//! against a real cluster.
//!
//! # Error model
//! - `NotFound` is never fatal to a caller; see [`StoreResultExt`].
//! - `AlreadyExists` is returned by `create` when the name is taken.
//! - `Conflict` is returned by `update` on a stale resourceVersion and is
//!   retried by callers that own the object jointly with others.
use crate::model::{ClusterRoleTemplateBinding, ProjectRoleTemplateBinding, RoleTemplate};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleBinding};
use std::sync::Arc;
use thiserror::Error;

pub mod kubernetes;
pub mod memory;
mod selector;

pub use selector::Selector;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("conflict writing {kind} {name}")]
    Conflict { kind: String, name: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub trait StoreResultExt<T> {
    /// `NotFound` becomes `Ok(None)`.
    fn optional(self) -> StoreResult<Option<T>>;
}

impl<T> StoreResultExt<T> for StoreResult<T> {
    fn optional(self) -> StoreResult<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// `NotFound` on delete counts as success.
pub fn ignore_not_found(result: StoreResult<()>) -> StoreResult<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> StoreResult<K>;
    /// Objects in `namespace` (all namespaces when `None`) matching `selector`,
    /// sorted by namespace and name.
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> StoreResult<Vec<K>>;
    async fn create(&self, object: &K) -> StoreResult<K>;
    async fn update(&self, object: &K) -> StoreResult<K>;
    async fn update_status(&self, object: &K) -> StoreResult<K>;
    async fn delete(&self, namespace: Option<&str>, name: &str) -> StoreResult<()>;
}

pub type DynStore<K> = Arc<dyn ObjectStore<K>>;

/// Every collection a reconciler instance reads or writes.
///
/// RBAC objects, namespaces and service accounts live in the downstream
/// cluster; templates and bindings live in the management cluster. A single
/// backend may serve both.
#[derive(Clone)]
pub struct ClusterStores {
    pub cluster_roles: DynStore<ClusterRole>,
    pub cluster_role_bindings: DynStore<ClusterRoleBinding>,
    pub role_bindings: DynStore<RoleBinding>,
    pub namespaces: DynStore<Namespace>,
    pub service_accounts: DynStore<ServiceAccount>,
    pub role_templates: DynStore<RoleTemplate>,
    pub crtbs: DynStore<ClusterRoleTemplateBinding>,
    pub prtbs: DynStore<ProjectRoleTemplateBinding>,
    pub backend: &'static str,
}

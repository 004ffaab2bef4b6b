//! Kubernetes API backend for the object store.
//!
//! # Purpose
//! Adapts `kube::Api<K>` to [`ObjectStore`], translating API status codes
//! into [`StoreError`] variants the handlers understand.
use super::{ClusterStores, ObjectStore, Selector, StoreError, StoreResult};
use crate::observability::DERIVED_WRITES_TOTAL;
use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;

pub struct KubeStore<K> {
    client: Client,
    api_for: fn(Client, Option<&str>) -> Api<K>,
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
{
    pub fn cluster_scoped(client: Client) -> Self {
        Self {
            client,
            api_for: |client, _| Api::all(client),
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api_for: |client, namespace| match namespace {
                Some(namespace) => Api::namespaced(client, namespace),
                None => Api::all(client),
            },
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = ()>,
{
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }

    fn kind() -> String {
        K::kind(&()).into_owned()
    }
}

fn object_name(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.to_string(),
    }
}

/// Map an API error onto the store's error model.
fn map_error(kind: String, name: String, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound { kind, name },
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            StoreError::AlreadyExists { kind, name }
        }
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict { kind, name },
        kube::Error::Api(response) if response.code == 422 => StoreError::Invalid(response.message),
        other => StoreError::Unexpected(
            anyhow::Error::new(other).context(format!("{kind} {name}: api request failed")),
        ),
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> StoreResult<K> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|err| map_error(Self::kind(), object_name(namespace, name), err))
    }

    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> StoreResult<Vec<K>> {
        let mut params = ListParams::default();
        if !selector.is_everything() {
            params = params.labels(&selector.to_string());
        }
        let mut items = self
            .api(namespace)
            .list(&params)
            .await
            .map_err(|err| map_error(Self::kind(), selector.to_string(), err))?
            .items;
        items.sort_by(|a, b| {
            (a.namespace(), a.name_any()).cmp(&(b.namespace(), b.name_any()))
        });
        Ok(items)
    }

    async fn create(&self, object: &K) -> StoreResult<K> {
        let namespace = object.meta().namespace.clone();
        let name = object
            .meta()
            .name
            .clone()
            .or_else(|| object.meta().generate_name.clone())
            .unwrap_or_default();
        let created = self
            .api(namespace.as_deref())
            .create(&PostParams::default(), object)
            .await
            .map_err(|err| map_error(Self::kind(), object_name(namespace.as_deref(), &name), err))?;
        metrics::counter!(DERIVED_WRITES_TOTAL, "kind" => Self::kind(), "op" => "create")
            .increment(1);
        Ok(created)
    }

    async fn update(&self, object: &K) -> StoreResult<K> {
        let namespace = object.meta().namespace.clone();
        let name = object.name_any();
        let updated = self
            .api(namespace.as_deref())
            .replace(&name, &PostParams::default(), object)
            .await
            .map_err(|err| map_error(Self::kind(), object_name(namespace.as_deref(), &name), err))?;
        metrics::counter!(DERIVED_WRITES_TOTAL, "kind" => Self::kind(), "op" => "update")
            .increment(1);
        Ok(updated)
    }

    async fn update_status(&self, object: &K) -> StoreResult<K> {
        let namespace = object.meta().namespace.clone();
        let name = object.name_any();
        let body = serde_json::to_value(object).map_err(|err| StoreError::Unexpected(err.into()))?;
        let patch = serde_json::json!({ "status": body.get("status").cloned() });
        let updated = self
            .api(namespace.as_deref())
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| map_error(Self::kind(), object_name(namespace.as_deref(), &name), err))?;
        metrics::counter!(DERIVED_WRITES_TOTAL, "kind" => Self::kind(), "op" => "update_status")
            .increment(1);
        Ok(updated)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|err| map_error(Self::kind(), object_name(namespace, name), err))?;
        metrics::counter!(DERIVED_WRITES_TOTAL, "kind" => Self::kind(), "op" => "delete")
            .increment(1);
        Ok(())
    }
}

/// Store set backed by one API client.
pub fn kube_stores(client: Client) -> ClusterStores {
    ClusterStores {
        cluster_roles: Arc::new(KubeStore::cluster_scoped(client.clone())),
        cluster_role_bindings: Arc::new(KubeStore::cluster_scoped(client.clone())),
        role_bindings: Arc::new(KubeStore::namespaced(client.clone())),
        namespaces: Arc::new(KubeStore::cluster_scoped(client.clone())),
        service_accounts: Arc::new(KubeStore::namespaced(client.clone())),
        role_templates: Arc::new(KubeStore::cluster_scoped(client.clone())),
        crtbs: Arc::new(KubeStore::namespaced(client.clone())),
        prtbs: Arc::new(KubeStore::namespaced(client)),
        backend: "kubernetes",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} message"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn status_codes_map_to_store_errors() {
        let not_found = map_error("ClusterRole".into(), "viewer".into(), api_error(404, "NotFound"));
        assert!(not_found.is_not_found());
        let exists = map_error("ClusterRole".into(), "viewer".into(), api_error(409, "AlreadyExists"));
        assert!(exists.is_already_exists());
        let conflict = map_error("ClusterRole".into(), "viewer".into(), api_error(409, "Conflict"));
        assert!(conflict.is_conflict());
        let invalid = map_error("ClusterRole".into(), "viewer".into(), api_error(422, "Invalid"));
        assert!(matches!(invalid, StoreError::Invalid(message) if message == "Invalid message"));
        let other = map_error("ClusterRole".into(), "viewer".into(), api_error(500, "InternalError"));
        assert!(matches!(other, StoreError::Unexpected(_)));
    }

    #[test]
    fn object_names_include_namespace() {
        assert_eq!(object_name(Some("ns"), "rb-1"), "ns/rb-1");
        assert_eq!(object_name(None, "crb-1"), "crb-1");
        assert_eq!(object_name(Some(""), "crb-1"), "crb-1");
    }
}

//! In-memory implementation of the object store.
//!
//! # Purpose
//! Emulates the parts of the API server the reconciler depends on so that
//! handlers can be exercised end to end without a cluster:
//! - resourceVersion optimistic concurrency (stale updates fail with `Conflict`)
//! - `generateName`, uid and creationTimestamp assignment
//! - label-selector listing, sorted by namespace and name
//! - finalizers and deletionTimestamp
//! - owner-reference garbage collection (lazy: an object whose owners are all
//!   gone is invisible and is replaced on the next create)
//! - ClusterRole aggregation (rules of an aggregating role are computed from
//!   the roles its selectors match when it is read)
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - Every collection handed out by [`MemoryStore::stores`] shares one state
//!   guarded by a `tokio::sync::RwLock`, so writes are linearizable.
//!
//! # Write accounting
//! Every successful create/update/update_status/delete increments a counter
//! exposed through [`MemoryStore::writes`]; tests assert idempotence with it.
use super::{ClusterStores, ObjectStore, Selector, StoreError, StoreResult};
use crate::observability::DERIVED_WRITES_TOTAL;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: String,
    namespace: String,
    name: String,
}

#[derive(Debug, Default)]
struct State {
    /// Objects as JSON keyed by `(kind, namespace, name)`; ordering gives
    /// sorted lists for free.
    objects: BTreeMap<ObjectKey, Value>,
    live_uids: HashSet<String>,
    next_version: u64,
    writes: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.writes += 1;
        self.next_version.to_string()
    }

    /// False once every owner named in the object's owner references is gone.
    fn is_live(&self, value: &Value) -> bool {
        let owners = value
            .pointer("/metadata/ownerReferences")
            .and_then(Value::as_array);
        match owners {
            Some(owners) if !owners.is_empty() => owners.iter().any(|owner| {
                owner
                    .get("uid")
                    .and_then(Value::as_str)
                    .is_some_and(|uid| self.live_uids.contains(uid))
            }),
            _ => true,
        }
    }

    fn live(&self, key: &ObjectKey) -> Option<&Value> {
        self.objects.get(key).filter(|value| self.is_live(value))
    }

    fn remove(&mut self, key: &ObjectKey) {
        let removed = self.objects.remove(key);
        if let Some(uid) = removed
            .as_ref()
            .and_then(|value| value.pointer("/metadata/uid"))
            .and_then(Value::as_str)
        {
            self.live_uids.remove(uid);
        }
    }

    fn cluster_roles(&self) -> impl Iterator<Item = ClusterRole> + '_ {
        self.objects
            .iter()
            .filter(|(key, value)| key.kind == "ClusterRole" && self.is_live(value))
            .filter_map(|(_, value)| serde_json::from_value(value.clone()).ok())
    }

    /// Union of the rules of every role selected by `role`'s aggregation rule,
    /// following nested aggregating roles. `visiting` guards against cycles.
    fn aggregated_rules(&self, role: &ClusterRole, visiting: &mut BTreeSet<String>) -> Vec<PolicyRule> {
        let Some(aggregation) = &role.aggregation_rule else {
            return role.rules.clone().unwrap_or_default();
        };
        let name = role.metadata.name.clone().unwrap_or_default();
        if !visiting.insert(name.clone()) {
            return Vec::new();
        }
        let selectors = aggregation.cluster_role_selectors.clone().unwrap_or_default();
        let mut rules: Vec<PolicyRule> = Vec::new();
        for candidate in self.cluster_roles() {
            if candidate.metadata.name.as_deref() == Some(name.as_str()) {
                continue;
            }
            let labels = candidate.metadata.labels.clone().unwrap_or_default();
            let selected = selectors.iter().any(|selector| {
                let wanted = selector.match_labels.clone().unwrap_or_default();
                !wanted.is_empty() && wanted.iter().all(|(k, v)| labels.get(k) == Some(v))
            });
            if !selected {
                continue;
            }
            for rule in self.aggregated_rules(&candidate, visiting) {
                if !rules.contains(&rule) {
                    rules.push(rule);
                }
            }
        }
        visiting.remove(&name);
        rules
    }

    fn render(&self, key: &ObjectKey, value: &Value) -> Value {
        if key.kind != "ClusterRole" || value.get("aggregationRule").is_none() {
            return value.clone();
        }
        let Ok(mut role) = serde_json::from_value::<ClusterRole>(value.clone()) else {
            return value.clone();
        };
        role.rules = Some(self.aggregated_rules(&role, &mut BTreeSet::new()));
        serde_json::to_value(&role).unwrap_or_else(|_| value.clone())
    }
}

/// Shared in-memory backend. Cloning shares state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far.
    pub async fn writes(&self) -> u64 {
        self.state.read().await.writes
    }

    pub fn collection<K>(&self) -> Arc<MemoryCollection<K>>
    where
        K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Arc::new(MemoryCollection {
            state: self.state.clone(),
            _kind: PhantomData,
        })
    }

    pub fn stores(&self) -> ClusterStores {
        ClusterStores {
            cluster_roles: self.collection(),
            cluster_role_bindings: self.collection(),
            role_bindings: self.collection(),
            namespaces: self.collection(),
            service_accounts: self.collection(),
            role_templates: self.collection(),
            crtbs: self.collection(),
            prtbs: self.collection(),
            backend: "memory",
        }
    }
}

/// Typed view over the shared state for one object kind.
pub struct MemoryCollection<K> {
    state: Arc<RwLock<State>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> MemoryCollection<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn kind() -> String {
        K::kind(&()).into_owned()
    }

    fn key(namespace: Option<&str>, name: &str) -> ObjectKey {
        ObjectKey {
            kind: Self::kind(),
            namespace: namespace.unwrap_or_default().to_string(),
            name: name.to_string(),
        }
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: Self::kind(),
            name: display_name(key),
        }
    }

    fn encode(object: &K) -> StoreResult<Value> {
        serde_json::to_value(object).map_err(|err| StoreError::Unexpected(err.into()))
    }

    fn decode(value: Value) -> StoreResult<K> {
        serde_json::from_value(value).map_err(|err| StoreError::Unexpected(err.into()))
    }

    fn record(op: &'static str) {
        metrics::counter!(DERIVED_WRITES_TOTAL, "kind" => Self::kind(), "op" => op)
            .increment(1);
    }
}

fn display_name(key: &ObjectKey) -> String {
    if key.namespace.is_empty() {
        key.name.clone()
    } else {
        format!("{}/{}", key.namespace, key.name)
    }
}

fn meta_of(value: &Value) -> ObjectMeta {
    value
        .get("metadata")
        .cloned()
        .and_then(|meta| serde_json::from_value(meta).ok())
        .unwrap_or_default()
}

fn generated_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..5].to_string()
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryCollection<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: Option<&str>, name: &str) -> StoreResult<K> {
        let key = Self::key(namespace, name);
        let state = self.state.read().await;
        let value = state.live(&key).ok_or_else(|| Self::not_found(&key))?;
        Self::decode(state.render(&key, value))
    }

    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> StoreResult<Vec<K>> {
        let kind = Self::kind();
        let state = self.state.read().await;
        state
            .objects
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace == ns))
            .filter(|(_, value)| state.is_live(value))
            .filter(|(_, value)| selector.matches(meta_of(value).labels.as_ref()))
            .map(|(key, value)| Self::decode(state.render(key, value)))
            .collect()
    }

    async fn create(&self, object: &K) -> StoreResult<K> {
        let mut object = object.clone();
        let meta = object.meta_mut();
        let name = match (&meta.name, &meta.generate_name) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(prefix)) if !prefix.is_empty() => format!("{prefix}{}", generated_suffix()),
            _ => {
                return Err(StoreError::Invalid(format!(
                    "{} has neither name nor generateName",
                    Self::kind()
                )));
            }
        };
        let key = Self::key(meta.namespace.as_deref(), &name);

        let mut state = self.state.write().await;
        if state.live(&key).is_some() {
            return Err(StoreError::AlreadyExists {
                kind: Self::kind(),
                name: display_name(&key),
            });
        }
        // Collected by owner GC.
        state.remove(&key);

        let uid = uuid::Uuid::new_v4().to_string();
        meta.name = Some(name);
        meta.uid = Some(uid.clone());
        meta.resource_version = Some(state.bump());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
        let value = Self::encode(&object)?;
        state.live_uids.insert(uid);
        state.objects.insert(key.clone(), value);
        let rendered = state.render(&key, &state.objects[&key]);
        drop(state);
        Self::record("create");
        Self::decode(rendered)
    }

    async fn update(&self, object: &K) -> StoreResult<K> {
        let meta = object.meta();
        let key = Self::key(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default());

        let mut state = self.state.write().await;
        let stored = state.live(&key).ok_or_else(|| Self::not_found(&key))?.clone();
        let stored_meta = meta_of(&stored);
        if meta.resource_version.is_some() && meta.resource_version != stored_meta.resource_version {
            return Err(StoreError::Conflict {
                kind: Self::kind(),
                name: display_name(&key),
            });
        }

        let mut object = object.clone();
        let meta = object.meta_mut();
        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        meta.resource_version = Some(state.bump());
        let finalized = meta.deletion_timestamp.is_some()
            && meta.finalizers.as_ref().is_none_or(|f| f.is_empty());
        let mut value = Self::encode(&object)?;
        // Status is a subresource; plain updates never change it.
        match (stored.get("status"), value.as_object_mut()) {
            (Some(status), Some(fields)) => {
                fields.insert("status".to_string(), status.clone());
            }
            (None, Some(fields)) => {
                fields.remove("status");
            }
            _ => {}
        }

        let result = if finalized {
            state.remove(&key);
            value
        } else {
            state.objects.insert(key.clone(), value);
            state.render(&key, &state.objects[&key])
        };
        drop(state);
        Self::record("update");
        Self::decode(result)
    }

    async fn update_status(&self, object: &K) -> StoreResult<K> {
        let meta = object.meta();
        let key = Self::key(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default());

        let mut state = self.state.write().await;
        let mut stored = state.live(&key).ok_or_else(|| Self::not_found(&key))?.clone();
        let stored_meta = meta_of(&stored);
        if meta.resource_version.is_some() && meta.resource_version != stored_meta.resource_version {
            return Err(StoreError::Conflict {
                kind: Self::kind(),
                name: display_name(&key),
            });
        }

        let status = Self::encode(object)?.get("status").cloned();
        let version = state.bump();
        if let Some(fields) = stored.as_object_mut() {
            match status {
                Some(status) => fields.insert("status".to_string(), status),
                None => fields.remove("status"),
            };
        }
        if let Some(meta) = stored.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".to_string(), Value::String(version));
        }
        state.objects.insert(key.clone(), stored.clone());
        drop(state);
        Self::record("update_status");
        Self::decode(stored)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> StoreResult<()> {
        let key = Self::key(namespace, name);
        let mut state = self.state.write().await;
        let stored = state.live(&key).ok_or_else(|| Self::not_found(&key))?.clone();
        let meta = meta_of(&stored);
        if meta.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if meta.deletion_timestamp.is_none() {
                let version = state.bump();
                let mut stored = stored;
                if let Some(fields) = stored.get_mut("metadata").and_then(Value::as_object_mut) {
                    let now = serde_json::to_value(Time(Utc::now())).unwrap_or(Value::Null);
                    fields.insert("deletionTimestamp".to_string(), now);
                    fields.insert("resourceVersion".to_string(), Value::String(version));
                }
                state.objects.insert(key, stored);
                drop(state);
                Self::record("delete");
            }
            return Ok(());
        }
        state.bump();
        state.remove(&key);
        drop(state);
        Self::record("delete");
        Ok(())
    }
}

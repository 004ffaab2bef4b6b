//! Per-user impersonation identities.
//!
//! # Purpose
//! Every user bound through a CRTB or PRTB gets one ClusterRole allowing
//! impersonation of that user (their groups and identifying extras included),
//! one ServiceAccount and one ClusterRoleBinding linking the two. The
//! ServiceAccount and binding name the ClusterRole as their owner, so deleting
//! the role removes the whole identity.
//!
//! # Concurrency
//! The role is shared by every binding of the user and may be written by
//! several reconciles at once. Updates re-read and retry on conflict; creates
//! treat `AlreadyExists` as success. There is no in-process lock.
//!
//! # Teardown
//! The identity is removed only when no live CRTB or PRTB for the same
//! cluster still names the user. Bindings are found by listing, never by a
//! stored reference count.
use crate::errors::ReconcileResult;
use crate::model::RoleTemplateBinding;
use crate::retry::{RetryPolicy, retry_on_conflict};
use crate::store::{ClusterStores, Selector, StoreResultExt, ignore_not_found};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use trellis_rbac::{IMPERSONATION_LABEL, cluster_role_ref, rules_eq, safe_concat_name};

pub const IMPERSONATION_NAMESPACE: &str = "cattle-impersonation-system";
pub const IMPERSONATION_PREFIX: &str = "cattle-impersonation-";

pub const EXTRA_PRINCIPAL_ID: &str = "principalid";
pub const EXTRA_USERNAME: &str = "username";
const EXTRA_REQUEST_TOKEN_ID: &str = "requesttokenid";
const EXTRA_REQUEST_HOST: &str = "requesthost";
const AUTHENTICATION_GROUP: &str = "authentication.k8s.io";

/// Identity attributes of a user, as the API server sees them on
/// impersonated requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: String,
    pub groups: Vec<String>,
    pub extras: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    /// Sort and dedup so equal users yield equal rules.
    fn normalized(mut self) -> Self {
        self.groups.sort();
        self.groups.dedup();
        for values in self.extras.values_mut() {
            values.sort();
        }
        self
    }
}

#[async_trait]
pub trait UserResolver: Send + Sync {
    async fn resolve(&self, user: &str) -> anyhow::Result<UserInfo>;
}

/// Resolver for users without recorded attributes: the two authenticated
/// groups and a local principal id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUserResolver;

pub const AUTHENTICATED_GROUPS: [&str; 2] = ["system:authenticated", "system:cattle:authenticated"];

#[async_trait]
impl UserResolver for DefaultUserResolver {
    async fn resolve(&self, user: &str) -> anyhow::Result<UserInfo> {
        Ok(UserInfo {
            uid: user.to_string(),
            groups: AUTHENTICATED_GROUPS.iter().map(|g| g.to_string()).collect(),
            extras: BTreeMap::from([(
                EXTRA_PRINCIPAL_ID.to_string(),
                vec![format!("local://{user}")],
            )]),
        })
    }
}

pub fn impersonator_name(user: &str) -> String {
    format!("{IMPERSONATION_PREFIX}{user}")
}

fn impersonate(group: &str, resource: &str, names: Option<Vec<String>>) -> PolicyRule {
    PolicyRule {
        verbs: vec!["impersonate".to_string()],
        api_groups: Some(vec![group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        resource_names: names,
        non_resource_urls: None,
    }
}

/// Rules of a user's impersonation role.
///
/// Request token id and host extras are allowed for any value; ownership of
/// those is checked by the authenticator, and pinning them would rewrite the
/// role on every request.
pub fn rules_for_user(user: &UserInfo) -> Vec<PolicyRule> {
    let mut rules = vec![
        impersonate("", "users", Some(vec![user.uid.clone()])),
        impersonate(
            AUTHENTICATION_GROUP,
            &format!("userextras/{EXTRA_REQUEST_TOKEN_ID}"),
            None,
        ),
        impersonate(
            AUTHENTICATION_GROUP,
            &format!("userextras/{EXTRA_REQUEST_HOST}"),
            None,
        ),
    ];
    if !user.groups.is_empty() {
        rules.push(impersonate("", "groups", Some(user.groups.clone())));
    }
    for key in [EXTRA_PRINCIPAL_ID, EXTRA_USERNAME] {
        if let Some(values) = user.extras.get(key) {
            rules.push(impersonate(
                AUTHENTICATION_GROUP,
                &format!("userextras/{key}"),
                Some(values.clone()),
            ));
        }
    }
    rules
}

fn impersonation_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(IMPERSONATION_LABEL.to_string(), "true".to_string())])
}

fn owned_by(role: &ClusterRole) -> Vec<OwnerReference> {
    vec![OwnerReference {
        api_version: "rbac.authorization.k8s.io/v1".to_string(),
        kind: "ClusterRole".to_string(),
        name: role.name_any(),
        uid: role.uid().unwrap_or_default(),
        ..OwnerReference::default()
    }]
}

/// Binding being removed, excluded from the remaining-bindings query.
#[derive(Debug, Clone, Copy)]
pub struct Removing<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
}

pub struct Impersonator {
    stores: ClusterStores,
    resolver: Arc<dyn UserResolver>,
    retry: RetryPolicy,
    cluster_name: String,
}

impl Impersonator {
    pub fn new(
        stores: ClusterStores,
        resolver: Arc<dyn UserResolver>,
        retry: RetryPolicy,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            resolver,
            retry,
            cluster_name: cluster_name.into(),
        }
    }

    /// Make sure `user`'s impersonation role, service account and binding
    /// exist and the role's rules match the user's current attributes.
    ///
    /// The identity is named after the binding's user, the same key
    /// [`Impersonator::delete_if_unused`] removes, whatever uid the resolver
    /// reports.
    pub async fn ensure(&self, user: &str) -> ReconcileResult<()> {
        let info = self.resolver.resolve(user).await?.normalized();
        let name = impersonator_name(user);
        let rules = rules_for_user(&info);

        let role = self.check_and_update_role(&name, &rules).await?;
        let binding = self
            .stores
            .cluster_role_bindings
            .get(None, &name)
            .await
            .optional()?;
        if role.is_some() && binding.is_some() {
            let account = self
                .stores
                .service_accounts
                .get(Some(IMPERSONATION_NAMESPACE), &name)
                .await
                .optional()?;
            if account.is_some() {
                return Ok(());
            }
        }

        self.ensure_namespace().await?;
        let role = self.create_role(&name, rules).await?;
        let account = self.create_service_account(&name, &role).await?;
        self.create_role_binding(&name, &role, &account).await?;
        info!(user, impersonator = %name, "impersonator ready");
        Ok(())
    }

    /// Re-read and, if needed, rewrite the role's rules. `None` when the role
    /// does not exist yet.
    async fn check_and_update_role(
        &self,
        name: &str,
        rules: &[PolicyRule],
    ) -> ReconcileResult<Option<ClusterRole>> {
        let roles = &self.stores.cluster_roles;
        let role = retry_on_conflict(self.retry, || async move {
            let mut role = match roles.get(None, name).await.optional() {
                Ok(Some(role)) => role,
                other => return other,
            };
            if rules_eq(role.rules.as_deref().unwrap_or_default(), rules) {
                return Ok(Some(role));
            }
            debug!(impersonator = name, "updating impersonation rules");
            role.rules = Some(rules.to_vec());
            roles.update(&role).await.map(Some)
        })
        .await?;
        Ok(role)
    }

    async fn ensure_namespace(&self) -> ReconcileResult<()> {
        let namespaces = &self.stores.namespaces;
        if namespaces
            .get(None, IMPERSONATION_NAMESPACE)
            .await
            .optional()?
            .is_some()
        {
            return Ok(());
        }
        debug!(namespace = IMPERSONATION_NAMESPACE, "creating impersonation namespace");
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(IMPERSONATION_NAMESPACE.to_string()),
                labels: Some(impersonation_labels()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        match namespaces.create(&namespace).await {
            Err(err) if !err.is_already_exists() => Err(err.into()),
            _ => Ok(()),
        }
    }

    async fn create_role(&self, name: &str, rules: Vec<PolicyRule>) -> ReconcileResult<ClusterRole> {
        let roles = &self.stores.cluster_roles;
        if let Some(role) = roles.get(None, name).await.optional()? {
            return Ok(role);
        }
        let role = ClusterRole {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(impersonation_labels()),
                ..ObjectMeta::default()
            },
            rules: Some(rules),
            aggregation_rule: None,
        };
        match roles.create(&role).await {
            Ok(created) => Ok(created),
            Err(err) if err.is_already_exists() => Ok(roles.get(None, name).await?),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_service_account(
        &self,
        name: &str,
        role: &ClusterRole,
    ) -> ReconcileResult<ServiceAccount> {
        let accounts = &self.stores.service_accounts;
        if let Some(account) = accounts
            .get(Some(IMPERSONATION_NAMESPACE), name)
            .await
            .optional()?
        {
            return Ok(account);
        }
        let account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(IMPERSONATION_NAMESPACE.to_string()),
                labels: Some(impersonation_labels()),
                owner_references: Some(owned_by(role)),
                ..ObjectMeta::default()
            },
            ..ServiceAccount::default()
        };
        match accounts.create(&account).await {
            Ok(created) => Ok(created),
            Err(err) if err.is_already_exists() => {
                Ok(accounts.get(Some(IMPERSONATION_NAMESPACE), name).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_role_binding(
        &self,
        name: &str,
        role: &ClusterRole,
        account: &ServiceAccount,
    ) -> ReconcileResult<()> {
        let bindings = &self.stores.cluster_role_bindings;
        if bindings.get(None, name).await.optional()?.is_some() {
            return Ok(());
        }
        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(impersonation_labels()),
                owner_references: Some(owned_by(role)),
                ..ObjectMeta::default()
            },
            role_ref: cluster_role_ref(&role.name_any()),
            subjects: Some(vec![Subject {
                api_group: None,
                kind: "ServiceAccount".to_string(),
                name: account.name_any(),
                namespace: account.namespace(),
            }]),
        };
        match bindings.create(&binding).await {
            Err(err) if !err.is_already_exists() => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Delete `user`'s impersonation role unless another live binding on
    /// this cluster still references the user. Returns whether it was deleted.
    pub async fn delete_if_unused(&self, user: &str, removing: Removing<'_>) -> ReconcileResult<bool> {
        let everything = Selector::everything();
        let crtbs = self.stores.crtbs.list(None, &everything).await?;
        let prtbs = self.stores.prtbs.list(None, &everything).await?;
        let remaining = crtbs.iter().filter(|b| self.references(*b, user, removing)).count()
            + prtbs.iter().filter(|b| self.references(*b, user, removing)).count();
        if remaining > 0 {
            debug!(user, remaining, "impersonator still in use");
            return Ok(false);
        }

        let name = impersonator_name(user);
        debug!(user, impersonator = %name, "deleting impersonator");
        ignore_not_found(self.stores.cluster_roles.delete(None, &name).await)?;
        Ok(true)
    }

    fn references<B: RoleTemplateBinding>(&self, binding: &B, user: &str, removing: Removing<'_>) -> bool {
        if binding.is_deleting() {
            return false;
        }
        if binding.namespace().as_deref().unwrap_or_default() == removing.namespace
            && binding.name_any() == removing.name
        {
            return false;
        }
        let Some(cluster) = binding.target_cluster() else {
            return false;
        };
        let Some(bound_user) = binding.user_name() else {
            return false;
        };
        safe_concat_name(&[&cluster, bound_user]) == safe_concat_name(&[&self.cluster_name, user])
    }
}

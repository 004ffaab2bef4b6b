#![allow(dead_code)]

use controlplane::handlers::Reconciler;
use controlplane::impersonation::DefaultUserResolver;
use controlplane::model::{
    BindingStatus, ClusterRoleTemplateBinding, ClusterRoleTemplateBindingSpec,
    ProjectRoleTemplateBinding, ProjectRoleTemplateBindingSpec, RoleTemplate, RoleTemplateSpec,
};
use controlplane::retry::RetryPolicy;
use controlplane::store::memory::MemoryStore;
use controlplane::store::{ClusterStores, Selector};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, PolicyRule, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use std::collections::BTreeMap;
use std::sync::Arc;
use trellis_rbac::{CRTB_OWNER_LABEL, PROJECT_ID_LABEL, RoleContext, prtb_owner_label};

pub const CLUSTER: &str = "c1";
pub const PROJECT: &str = "p-1";

pub fn rule(verbs: &[&str], group: &str, resource: &str) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..PolicyRule::default()
    }
}

pub fn template(
    name: &str,
    context: RoleContext,
    rules: Vec<PolicyRule>,
    inherits: &[&str],
) -> RoleTemplate {
    RoleTemplate::new(
        name,
        RoleTemplateSpec {
            context,
            rules,
            inherited_template_names: inherits.iter().map(|n| n.to_string()).collect(),
            ..RoleTemplateSpec::default()
        },
    )
}

pub fn crtb(name: &str, user: &str, template: &str) -> ClusterRoleTemplateBinding {
    let mut crtb = ClusterRoleTemplateBinding::new(
        name,
        ClusterRoleTemplateBindingSpec {
            user_name: Some(user.to_string()),
            cluster_name: CLUSTER.to_string(),
            role_template_name: template.to_string(),
            ..ClusterRoleTemplateBindingSpec::default()
        },
    );
    crtb.metadata.namespace = Some(CLUSTER.to_string());
    crtb
}

pub fn prtb(name: &str, user: &str, template: &str) -> ProjectRoleTemplateBinding {
    let mut prtb = ProjectRoleTemplateBinding::new(
        name,
        ProjectRoleTemplateBindingSpec {
            user_name: Some(user.to_string()),
            project_name: format!("{CLUSTER}:{PROJECT}"),
            role_template_name: template.to_string(),
            ..ProjectRoleTemplateBindingSpec::default()
        },
    );
    prtb.metadata.namespace = Some(PROJECT.to_string());
    prtb
}

pub fn project_namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                PROJECT_ID_LABEL.to_string(),
                PROJECT.to_string(),
            )])),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

pub fn remote_condition<'a>(status: &'a BindingStatus, type_: &str) -> &'a Condition {
    status
        .remote_conditions
        .iter()
        .find(|c| c.type_ == type_)
        .unwrap_or_else(|| panic!("missing remote condition {type_}"))
}

/// In-memory store plus a reconciler for cluster `c1`.
pub struct Harness {
    pub memory: MemoryStore,
    pub stores: ClusterStores,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        let memory = MemoryStore::new();
        let stores = memory.stores();
        let reconciler = Reconciler::new(
            stores.clone(),
            Arc::new(DefaultUserResolver),
            CLUSTER,
            RetryPolicy::default(),
        );
        Self {
            memory,
            stores,
            reconciler,
        }
    }

    pub async fn add_template(&self, template: RoleTemplate) -> RoleTemplate {
        let stored = self.stores.role_templates.create(&template).await.expect("create template");
        self.reconciler
            .on_change_role_template(&stored)
            .await
            .expect("materialize template");
        stored
    }

    pub async fn add_namespace(&self, name: &str) {
        self.stores
            .namespaces
            .create(&project_namespace(name))
            .await
            .expect("create namespace");
    }

    pub async fn crtb(&self, name: &str) -> ClusterRoleTemplateBinding {
        self.stores.crtbs.get(Some(CLUSTER), name).await.expect("get crtb")
    }

    pub async fn prtb(&self, name: &str) -> ProjectRoleTemplateBinding {
        self.stores.prtbs.get(Some(PROJECT), name).await.expect("get prtb")
    }

    /// Store the binding and reconcile it once; returns the stored copy.
    pub async fn apply_crtb(&self, binding: ClusterRoleTemplateBinding) -> ClusterRoleTemplateBinding {
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.stores.crtbs.create(&binding).await.expect("create crtb");
        let stored = self.crtb(&name).await;
        self.reconciler.on_change_crtb(&stored).await.expect("reconcile crtb");
        self.crtb(&name).await
    }

    pub async fn apply_prtb(&self, binding: ProjectRoleTemplateBinding) -> ProjectRoleTemplateBinding {
        let name = binding.metadata.name.clone().unwrap_or_default();
        self.stores.prtbs.create(&binding).await.expect("create prtb");
        let stored = self.prtb(&name).await;
        self.reconciler.on_change_prtb(&stored).await.expect("reconcile prtb");
        self.prtb(&name).await
    }

    pub async fn crtb_bindings(&self, owner: &str) -> Vec<ClusterRoleBinding> {
        self.stores
            .cluster_role_bindings
            .list(None, &Selector::eq(CRTB_OWNER_LABEL, owner))
            .await
            .expect("list cluster role bindings")
    }

    pub async fn prtb_role_bindings(&self, owner: &str) -> Vec<RoleBinding> {
        self.stores
            .role_bindings
            .list(None, &Selector::exists(prtb_owner_label(owner)))
            .await
            .expect("list role bindings")
    }

    pub async fn prtb_cluster_role_bindings(&self, owner: &str) -> Vec<ClusterRoleBinding> {
        self.stores
            .cluster_role_bindings
            .list(None, &Selector::exists(prtb_owner_label(owner)))
            .await
            .expect("list cluster role bindings")
    }
}

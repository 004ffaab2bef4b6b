//! Cluster- and project-scoped RoleTemplate bindings.
//!
//! # Purpose
//! CRTBs grant a RoleTemplate to one subject on a whole cluster, PRTBs on a
//! project (`<cluster>:<project>`). Both own a set of derived bindings that is
//! found again only through ownership labels, and both carry a
//! [`BindingStatus`] written by the reconciler.
//!
//! # Key invariants
//! - Exactly one subject field is set; [`RoleTemplateBinding::subject_source`]
//!   exposes all of them so the subject builder can enforce it.
//! - The target cluster of a PRTB is the cluster part of its project name.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use trellis_rbac::{ProjectId, SubjectSource};

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "ClusterRoleTemplateBinding",
    plural = "clusterroletemplatebindings",
    shortname = "crtb",
    namespaced,
    status = "BindingStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleTemplateBindingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_principal_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_principal_name: Option<String>,
    pub cluster_name: String,
    pub role_template_name: String,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "ProjectRoleTemplateBinding",
    plural = "projectroletemplatebindings",
    shortname = "prtb",
    namespaced,
    status = "BindingStatus",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRoleTemplateBindingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_principal_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_principal_name: Option<String>,
    /// `namespace:name` of a service account subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    /// `<cluster>:<project>`.
    pub project_name: String,
    pub role_template_name: String,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingStatus {
    #[serde(default)]
    pub local_conditions: Vec<Condition>,
    #[serde(default)]
    pub remote_conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_local: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Behavior shared by CRTBs and PRTBs.
pub trait RoleTemplateBinding:
    Resource<DynamicType = ()> + Clone + std::fmt::Debug + Send + Sync + 'static
{
    /// Short kind used in logs, metrics and condition reasons (`CRTB`/`PRTB`).
    const SHORT_KIND: &'static str;

    fn subject_source(&self) -> SubjectSource<'_>;
    fn role_template_name(&self) -> &str;
    /// Downstream cluster the binding grants access on, if it can be parsed.
    fn target_cluster(&self) -> Option<String>;
    fn user_name(&self) -> Option<&str>;
    fn status(&self) -> Option<&BindingStatus>;
    fn status_mut(&mut self) -> &mut BindingStatus;

    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl RoleTemplateBinding for ClusterRoleTemplateBinding {
    const SHORT_KIND: &'static str = "CRTB";

    fn subject_source(&self) -> SubjectSource<'_> {
        SubjectSource {
            binding: self.meta().name.as_deref().unwrap_or_default(),
            user_name: non_empty(&self.spec.user_name),
            group_principal_name: non_empty(&self.spec.group_principal_name),
            group_name: non_empty(&self.spec.group_name),
            service_account: None,
        }
    }

    fn role_template_name(&self) -> &str {
        &self.spec.role_template_name
    }

    fn target_cluster(&self) -> Option<String> {
        Some(self.spec.cluster_name.clone()).filter(|c| !c.is_empty())
    }

    fn user_name(&self) -> Option<&str> {
        non_empty(&self.spec.user_name)
    }

    fn status(&self) -> Option<&BindingStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut BindingStatus {
        self.status.get_or_insert_with(BindingStatus::default)
    }
}

impl RoleTemplateBinding for ProjectRoleTemplateBinding {
    const SHORT_KIND: &'static str = "PRTB";

    fn subject_source(&self) -> SubjectSource<'_> {
        SubjectSource {
            binding: self.meta().name.as_deref().unwrap_or_default(),
            user_name: non_empty(&self.spec.user_name),
            group_principal_name: non_empty(&self.spec.group_principal_name),
            group_name: non_empty(&self.spec.group_name),
            service_account: non_empty(&self.spec.service_account),
        }
    }

    fn role_template_name(&self) -> &str {
        &self.spec.role_template_name
    }

    fn target_cluster(&self) -> Option<String> {
        ProjectId::parse(&self.spec.project_name)
            .ok()
            .map(|id| id.cluster)
    }

    fn user_name(&self) -> Option<&str> {
        non_empty(&self.spec.user_name)
    }

    fn status(&self) -> Option<&BindingStatus> {
        self.status.as_ref()
    }

    fn status_mut(&mut self) -> &mut BindingStatus {
        self.status.get_or_insert_with(BindingStatus::default)
    }
}

/// `namespace/name` for log fields.
pub fn binding_key<B: RoleTemplateBinding>(binding: &B) -> String {
    format!(
        "{}/{}",
        binding.namespace().unwrap_or_default(),
        binding.name_any()
    )
}

//! RoleTemplate custom resource.
//!
//! # Purpose
//! A reusable, inheritable set of permission rules with a binding scope.
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use trellis_rbac::RoleContext;

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, Clone, PartialEq, JsonSchema)]
#[kube(
    group = "management.cattle.io",
    version = "v3",
    kind = "RoleTemplate",
    plural = "roletemplates",
    shortname = "rt",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct RoleTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Scope the template is bound at.
    #[serde(default)]
    pub context: RoleContext,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Rules of the externally managed role; never written to the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_rules: Option<Vec<PolicyRule>>,
    /// The backing ClusterRole is managed outside this system; it is only
    /// labeled for aggregation.
    #[serde(default)]
    pub external: bool,
    /// Templates whose effective permissions this template includes.
    #[serde(default, rename = "roleTemplateNames")]
    pub inherited_template_names: Vec<String>,
}

impl RoleTemplate {
    pub fn is_project_context(&self) -> bool {
        self.spec.context == RoleContext::Project
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_uses_wire_field_names() {
        let spec: RoleTemplateSpec = serde_json::from_value(serde_json::json!({
            "context": "project",
            "rules": [{"verbs": ["get"], "apiGroups": [""], "resources": ["pods"]}],
            "external": true,
            "roleTemplateNames": ["base"]
        }))
        .expect("deserialize");
        assert_eq!(spec.context, RoleContext::Project);
        assert_eq!(spec.rules.len(), 1);
        assert!(spec.external);
        assert_eq!(spec.inherited_template_names, vec!["base".to_string()]);
        assert_eq!(spec.external_rules, None);
    }

    #[test]
    fn spec_defaults_to_cluster_context() {
        let spec: RoleTemplateSpec = serde_json::from_value(serde_json::json!({})).expect("deserialize");
        assert_eq!(spec.context, RoleContext::Cluster);
        assert!(spec.rules.is_empty());
        assert!(!spec.external);
    }
}

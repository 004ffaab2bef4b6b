//! Promotion of project-scoped grants on cluster-scoped resources.
//!
//! # Purpose
//! A project-context template is bound through namespace-local RoleBindings,
//! which cannot grant access to cluster-scoped resources. Rules naming the
//! resources in [`PROMOTION_TABLE`] are re-expressed as cluster-scoped
//! "promoted" rules that the project binding reconciler binds cluster-wide.
//!
//! # Key invariants
//! - Each promoted rule names exactly one `(resource, group)` pair.
//! - Verbs and resource names are copied from the source rule, except for
//!   `clusters`, which is always restricted to the local cluster.
//! - Output order follows rule order, then table order, so repeated
//!   extraction yields identical rule lists.
use k8s_openapi::api::rbac::v1::PolicyRule;

/// Name of the management cluster as seen from downstream clusters.
pub const LOCAL_CLUSTER: &str = "local";

/// `(resource, api group)` pairs that are cluster-scoped yet grantable
/// through project-context templates.
pub const PROMOTION_TABLE: &[(&str, &str)] = &[
    ("navlinks", "ui.cattle.io"),
    ("nodes", ""),
    ("persistentvolumes", ""),
    ("persistentvolumes", "core"),
    ("storageclasses", "storage.k8s.io"),
    ("apiservices", "apiregistration.k8s.io"),
    ("clusterrepos", "catalog.cattle.io"),
    ("clusters", "management.cattle.io"),
];

const CLUSTERS_RESOURCE: &str = "clusters";

pub fn extract_promoted_rules(rules: &[PolicyRule]) -> Vec<PolicyRule> {
    let mut promoted = Vec::new();
    for rule in rules {
        for &(resource, group) in PROMOTION_TABLE {
            if !covers(rule.resources.as_deref(), resource)
                || !covers(rule.api_groups.as_deref(), group)
            {
                continue;
            }
            let resource_names = if resource == CLUSTERS_RESOURCE {
                Some(vec![LOCAL_CLUSTER.to_string()])
            } else {
                rule.resource_names.clone().filter(|names| !names.is_empty())
            };
            promoted.push(PolicyRule {
                api_groups: Some(vec![group.to_string()]),
                resources: Some(vec![resource.to_string()]),
                verbs: rule.verbs.clone(),
                resource_names,
                non_resource_urls: None,
            });
        }
    }
    promoted
}

pub(crate) fn covers(values: Option<&[String]>, wanted: &str) -> bool {
    values
        .unwrap_or_default()
        .iter()
        .any(|value| value == "*" || value == wanted)
}

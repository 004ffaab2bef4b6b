// Management-plane rule extraction: keeps only the grants on objects that
// live in the management cluster (bindings, projects, node pools and so on).
use crate::promotion::covers;
use k8s_openapi::api::rbac::v1::PolicyRule;

pub const CLUSTER_MANAGEMENT_RESOURCES: &[(&str, &str)] = &[
    ("clusterscans", "management.cattle.io"),
    ("clusterregistrationtokens", "management.cattle.io"),
    ("clusterroletemplatebindings", "management.cattle.io"),
    ("etcdbackups", "management.cattle.io"),
    ("nodes", "management.cattle.io"),
    ("nodepools", "management.cattle.io"),
    ("projects", "management.cattle.io"),
    ("etcdsnapshots", "rke.cattle.io"),
];

pub const PROJECT_MANAGEMENT_RESOURCES: &[(&str, &str)] = &[
    ("projectroletemplatebindings", "management.cattle.io"),
    ("secrets", ""),
];

/// Reduce `rules` to one rule per management resource they grant.
///
/// Rules restricted by resource names are skipped: they target individual
/// objects, not the management resource as a whole. Wildcards expand to
/// every entry of `table`.
pub fn extract_management_plane_rules(
    rules: &[PolicyRule],
    table: &[(&str, &str)],
) -> Vec<PolicyRule> {
    let mut extracted = Vec::new();
    for rule in rules {
        if rule.resource_names.as_ref().is_some_and(|names| !names.is_empty()) {
            continue;
        }
        for &(resource, group) in table {
            if covers(rule.resources.as_deref(), resource)
                && covers(rule.api_groups.as_deref(), group)
            {
                extracted.push(PolicyRule {
                    api_groups: Some(vec![group.to_string()]),
                    resources: Some(vec![resource.to_string()]),
                    verbs: rule.verbs.clone(),
                    resource_names: None,
                    non_resource_urls: None,
                });
            }
        }
    }
    extracted
}

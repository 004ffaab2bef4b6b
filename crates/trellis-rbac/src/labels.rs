// Label and annotation keys that tie derived objects back to their owners.
use crate::naming::safe_concat_name;

/// Label placed on every derived ClusterRole; its value is the role's own
/// name, and aggregators select on it.
pub const AGGREGATION_LABEL: &str = "management.cattle.io/aggregates";
/// Annotation naming the RoleTemplate that owns a derived ClusterRole.
pub const CLUSTER_ROLE_OWNER_ANNOTATION: &str = "authz.cluster.cattle.io/clusterrole-owner";
/// Single-valued owner label on ClusterRoleBindings derived from a CRTB.
pub const CRTB_OWNER_LABEL: &str = "authz.cluster.cattle.io/crtb-owner";
/// Prefix of the per-owner label keys on bindings derived from PRTBs.
pub const PRTB_OWNER_LABEL_PREFIX: &str = "authz.cluster.cattle.io/prtb-owner";
pub const IMPERSONATION_LABEL: &str = "authz.cluster.cattle.io/impersonator";
/// Label carried by namespaces that belong to a project.
pub const PROJECT_ID_LABEL: &str = "field.cattle.io/projectId";

const LABEL_DOMAIN: &str = "authz.cluster.cattle.io/";

/// Owner label key for objects derived from the PRTB named `prtb_name`.
///
/// One key per owner lets several PRTBs co-own a shared binding.
pub fn prtb_owner_label(prtb_name: &str) -> String {
    format!("{LABEL_DOMAIN}{}", safe_concat_name(&["prtb-owner", prtb_name]))
}

pub fn is_prtb_owner_label(key: &str) -> bool {
    key.strip_prefix(PRTB_OWNER_LABEL_PREFIX)
        .is_some_and(|rest| rest.starts_with('-'))
}

/// Label key recording that the binding `namespace/name` needs a shared
/// membership binding.
pub fn membership_label(namespace: &str, name: &str) -> String {
    safe_concat_name(&[&format!("{namespace}_{name}")])
}

// Builders and content comparison for derived RoleBindings and
// ClusterRoleBindings. RoleRef and subjects are immutable on the server, so
// "content" is exactly those two fields.
use crate::naming::{name_for_cluster_role_binding, name_for_role_binding};
use crate::subject::subjects_eq;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

pub fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

pub fn cluster_role_ref(name: &str) -> RoleRef {
    role_ref("ClusterRole", name)
}

/// ClusterRoleBinding named by the server (`generateName: crb-`), found again
/// only through `labels`.
pub fn build_generated_cluster_role_binding(
    role_name: &str,
    subject: Subject,
    labels: BTreeMap<String, String>,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            generate_name: Some("crb-".to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        role_ref: cluster_role_ref(role_name),
        subjects: Some(vec![subject]),
    }
}

/// ClusterRoleBinding with the deterministic `crb-<hash>` name.
pub fn build_named_cluster_role_binding(
    role_ref: RoleRef,
    subject: Subject,
    labels: BTreeMap<String, String>,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name_for_cluster_role_binding(&role_ref, &subject)),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        role_ref,
        subjects: Some(vec![subject]),
    }
}

/// RoleBinding in `namespace` with the deterministic `rb-<hash>` name.
pub fn build_named_role_binding(
    namespace: &str,
    role_ref: RoleRef,
    subject: Subject,
    labels: BTreeMap<String, String>,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name_for_role_binding(namespace, &role_ref, &subject)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        role_ref,
        subjects: Some(vec![subject]),
    }
}

pub fn cluster_role_binding_content_eq(a: &ClusterRoleBinding, b: &ClusterRoleBinding) -> bool {
    content_eq(&a.role_ref, &a.subjects, &b.role_ref, &b.subjects)
}

pub fn role_binding_content_eq(a: &RoleBinding, b: &RoleBinding) -> bool {
    content_eq(&a.role_ref, &a.subjects, &b.role_ref, &b.subjects)
}

fn content_eq(
    a_ref: &RoleRef,
    a_subjects: &Option<Vec<Subject>>,
    b_ref: &RoleRef,
    b_subjects: &Option<Vec<Subject>>,
) -> bool {
    a_ref == b_ref
        && subjects_eq(
            a_subjects.as_deref().unwrap_or_default(),
            b_subjects.as_deref().unwrap_or_default(),
        )
}

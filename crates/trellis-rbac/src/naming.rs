//! Deterministic names for derived roles and bindings.
//!
//! # Purpose
//! Every object the reconciler writes must be findable again from the inputs
//! that produced it, by any worker, after any restart. This module owns those
//! name functions.
//!
//! # Key invariants
//! - Names never exceed 63 characters; longer inputs are truncated and
//!   suffixed with a short SHA-256 digest of the untruncated name.
//! - Binding hashes are lowercase RFC 4648 base32, so every character is legal
//!   in an object name.
//!
//! # Common pitfalls
//! - The namespace is part of the RoleBinding hash. Two namespaces never share
//!   a RoleBinding name for the same role and subject.
use k8s_openapi::api::rbac::v1::{RoleRef, Subject};
use data_encoding::BASE32_NOPAD;
use sha2::{Digest, Sha256};

const MAX_NAME_LEN: usize = 63;
const AGGREGATOR_SUFFIX: &str = "aggregator";
const PROMOTED_SUFFIX: &str = "promoted";
const CLUSTER_MANAGEMENT_SUFFIX: &str = "cluster-mgmt";
const PROJECT_MANAGEMENT_SUFFIX: &str = "project-mgmt";
const BINDING_HASH_LEN: usize = 10;

/// Join `parts` with `-`, shortening the result when it would not fit in an
/// object name.
///
/// Names of 64 characters or more keep their first 57 characters (56 when the
/// 57th is not a lowercase alphanumeric, so the name never ends in a
/// separator), followed by `-` and the first five hex digits of the SHA-256 of
/// the full joined name.
pub fn safe_concat_name(parts: &[&str]) -> String {
    let full = parts.join("-");
    if full.len() <= MAX_NAME_LEN {
        return full;
    }

    let digest = hex::encode(Sha256::digest(full.as_bytes()));
    let bytes = full.as_bytes();
    let keep = if bytes[56].is_ascii_lowercase() || bytes[56].is_ascii_digit() {
        57
    } else {
        56
    };
    format!(
        "{}-{}",
        String::from_utf8_lossy(&bytes[..keep]),
        &digest[..5]
    )
}

pub fn cluster_role_name_for(name: &str) -> String {
    safe_concat_name(&[name])
}

pub fn aggregated_cluster_role_name_for(name: &str) -> String {
    safe_concat_name(&[name, AGGREGATOR_SUFFIX])
}

pub fn promoted_cluster_role_name_for(name: &str) -> String {
    safe_concat_name(&[name, PROMOTED_SUFFIX])
}

pub fn cluster_management_role_name_for(name: &str) -> String {
    safe_concat_name(&[name, CLUSTER_MANAGEMENT_SUFFIX])
}

pub fn project_management_role_name_for(name: &str) -> String {
    safe_concat_name(&[name, PROJECT_MANAGEMENT_SUFFIX])
}

/// Deterministic name for a RoleBinding of `subject` to `role` in `namespace`.
pub fn name_for_role_binding(namespace: &str, role: &RoleRef, subject: &Subject) -> String {
    let name = format!("rb-{}", binding_hash(namespace, role, subject));
    tracing::debug!(
        namespace,
        role_kind = %role.kind,
        role_name = %role.name,
        subject_kind = %subject.kind,
        subject_name = %subject.name,
        %name,
        "derived role binding name"
    );
    name
}

/// Deterministic name for a ClusterRoleBinding of `subject` to `role`.
pub fn name_for_cluster_role_binding(role: &RoleRef, subject: &Subject) -> String {
    let name = format!("crb-{}", binding_hash("", role, subject));
    tracing::debug!(
        role_kind = %role.kind,
        role_name = %role.name,
        subject_kind = %subject.kind,
        subject_name = %subject.name,
        %name,
        "derived cluster role binding name"
    );
    name
}

/// First ten characters of the lowercase base32 SHA-256 over the concatenated
/// binding identity. Collision odds are 1 in 2^50.
pub fn binding_hash(namespace: &str, role: &RoleRef, subject: &Subject) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(role.kind.as_bytes());
    hasher.update(role.name.as_bytes());
    hasher.update(subject.kind.as_bytes());
    hasher.update(subject.name.as_bytes());
    let digest = hasher.finalize();
    let mut encoded = BASE32_NOPAD.encode(&digest);
    encoded.truncate(BINDING_HASH_LEN);
    encoded.to_ascii_lowercase()
}

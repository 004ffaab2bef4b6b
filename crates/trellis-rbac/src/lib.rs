//! Trellis RBAC primitives shared by the reconciler service and its tests.
//!
//! # Purpose
//! Centralizes the pure parts of role-template reconciliation: deterministic
//! names, aggregation labels, promotion and management-plane rule extraction,
//! subject construction, and the rule evaluator used to decide which
//! namespace-access grants a template implies.
//!
//! # How it fits
//! The control-plane service reads RoleTemplates and bindings from the
//! cluster, asks this crate what the derived ClusterRoles and bindings must
//! look like, and then diffs that desired state against the live objects.
//! Nothing here performs I/O.
//!
//! # Key invariants
//! - Every derived name goes through [`safe_concat_name`] so it stays within
//!   the 63 character object-name limit.
//! - Inheritance is expressed only as aggregation label selectors; this crate
//!   never walks a template graph.
//! - Binding names derived from `(namespace, roleRef, subject)` are stable
//!   across processes and releases.
//!
//! # Examples
//! ```rust
//! use trellis_rbac::{aggregated_cluster_role_name_for, safe_concat_name};
//!
//! assert_eq!(aggregated_cluster_role_name_for("viewer"), "viewer-aggregator");
//! assert_eq!(safe_concat_name(&["c1", "clustermember"]), "c1-clustermember");
//! ```
//!
//! # Common pitfalls
//! - Comparing bindings field by field instead of with the content helpers
//!   misses the empty-vs-absent normalization the API server applies.
//! - Selecting inherited base roles instead of inherited aggregators breaks
//!   transitive inheritance beyond one level.

mod bindings;
mod context;
mod errors;
mod labels;
mod management;
mod matcher;
mod naming;
mod project;
mod promotion;
mod roles;
mod subject;

pub use bindings::{
    RBAC_API_GROUP, build_generated_cluster_role_binding, build_named_cluster_role_binding,
    build_named_role_binding, cluster_role_binding_content_eq, cluster_role_ref, role_binding_content_eq,
    role_ref,
};
pub use context::RoleContext;
pub use errors::{RbacError, RbacResult};
pub use labels::{
    AGGREGATION_LABEL, CLUSTER_ROLE_OWNER_ANNOTATION, CRTB_OWNER_LABEL, IMPERSONATION_LABEL,
    PRTB_OWNER_LABEL_PREFIX, PROJECT_ID_LABEL, is_prtb_owner_label,
    membership_label, prtb_owner_label,
};
pub use management::{
    CLUSTER_MANAGEMENT_RESOURCES, PROJECT_MANAGEMENT_RESOURCES, extract_management_plane_rules,
};
pub use matcher::{RuleQuery, rule_allows, rules_allow};
pub use naming::{
    aggregated_cluster_role_name_for, binding_hash, cluster_management_role_name_for,
    cluster_role_name_for, name_for_cluster_role_binding, name_for_role_binding,
    project_management_role_name_for, promoted_cluster_role_name_for, safe_concat_name,
};
pub use project::ProjectId;
pub use promotion::{LOCAL_CLUSTER, PROMOTION_TABLE, extract_promoted_rules};
pub use roles::{
    build_aggregating_cluster_role, build_cluster_role, converge_cluster_role, rules_eq,
};
pub use subject::{SubjectSource, build_subject, subjects_eq};

// Cluster and project membership bindings.
//
// Every binding makes its subject a member (or owner) of the target cluster,
// and project bindings also of the project. Membership objects are shared by
// all bindings of the same subject; each binding adds its own membership
// label and the object goes away with the last label.
use super::StepError;
use super::shared::{SyncError, release_all, sync_shared};
use crate::model::RoleTemplateBinding;
use crate::retry::RetryPolicy;
use crate::status::reasons;
use crate::store::DynStore;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleBinding, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use trellis_rbac::{
    RuleQuery, aggregated_cluster_role_name_for, build_named_cluster_role_binding, cluster_role_ref,
    membership_label, name_for_role_binding, role_ref, rules_allow, safe_concat_name,
};

const MANAGEMENT_GROUP: &str = "management.cattle.io";

/// Membership objects are owned by any label they carry.
fn any_label(_: &str) -> bool {
    true
}

pub(crate) fn label_for<B: RoleTemplateBinding>(binding: &B) -> String {
    membership_label(&binding.namespace().unwrap_or_default(), &binding.name_any())
}

pub(crate) fn cluster_membership_role(cluster: &str, owner: bool) -> String {
    safe_concat_name(&[cluster, if owner { "clusterowner" } else { "clustermember" }])
}

pub(crate) fn project_membership_role(project: &str, owner: bool) -> String {
    safe_concat_name(&[project, if owner { "projectowner" } else { "projectmember" }])
}

fn owns(rules: &[PolicyRule], resource: &str) -> bool {
    rules_allow(rules, &RuleQuery::new("own", MANAGEMENT_GROUP, resource))
}

fn membership_failure(err: SyncError) -> StepError {
    StepError::new(reasons::FAILED_TO_CREATE_OR_UPDATE_MEMBERSHIP_BINDING, err.source)
}

/// Effective rules of the template's aggregator, used for owner checks.
pub(crate) async fn aggregated_rules(
    roles: &DynStore<ClusterRole>,
    role_template: &str,
) -> Result<Vec<PolicyRule>, StepError> {
    let role = roles
        .get(None, &aggregated_cluster_role_name_for(role_template))
        .await
        .map_err(|err| StepError::new(reasons::FAILED_TO_GET_CLUSTER_ROLE, err))?;
    Ok(role.rules.unwrap_or_default())
}

/// Input for one membership sync.
pub(crate) struct Membership<'a> {
    pub label: &'a str,
    pub subject: &'a Subject,
    pub cluster: &'a str,
    /// Aggregated template rules; `None` when ownership cannot apply.
    pub rules: Option<&'a [PolicyRule]>,
}

pub(crate) async fn sync_cluster_membership(
    store: &DynStore<ClusterRoleBinding>,
    retry: RetryPolicy,
    membership: &Membership<'_>,
) -> Result<(), StepError> {
    let owner = membership.rules.is_some_and(|rules| owns(rules, "clusters"));
    let desired = build_named_cluster_role_binding(
        cluster_role_ref(&cluster_membership_role(membership.cluster, owner)),
        membership.subject.clone(),
        BTreeMap::from([(membership.label.to_string(), "true".to_string())]),
    );
    sync_shared(store, retry, membership.label, any_label, vec![desired])
        .await
        .map_err(membership_failure)
}

/// Project membership lives in the cluster's namespace on the management side.
pub(crate) async fn sync_project_membership(
    store: &DynStore<RoleBinding>,
    retry: RetryPolicy,
    membership: &Membership<'_>,
    project: &str,
) -> Result<(), StepError> {
    let owner = membership.rules.is_some_and(|rules| owns(rules, "projects"));
    let role = role_ref("Role", &project_membership_role(project, owner));
    let desired = RoleBinding {
        metadata: ObjectMeta {
            name: Some(name_for_role_binding(project, &role, membership.subject)),
            namespace: Some(membership.cluster.to_string()),
            labels: Some(BTreeMap::from([(
                membership.label.to_string(),
                "true".to_string(),
            )])),
            ..ObjectMeta::default()
        },
        role_ref: role,
        subjects: Some(vec![membership.subject.clone()]),
    };
    sync_shared(store, retry, membership.label, any_label, vec![desired])
        .await
        .map_err(membership_failure)
}

pub(crate) async fn release_cluster_membership(
    store: &DynStore<ClusterRoleBinding>,
    retry: RetryPolicy,
    label: &str,
) -> Result<(), StepError> {
    release_all(store, retry, None, label, any_label)
        .await
        .map_err(membership_failure)
}

pub(crate) async fn release_project_membership(
    store: &DynStore<RoleBinding>,
    retry: RetryPolicy,
    cluster: &str,
    label: &str,
) -> Result<(), StepError> {
    release_all(store, retry, Some(cluster), label, any_label)
        .await
        .map_err(membership_failure)
}

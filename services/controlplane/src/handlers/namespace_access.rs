// Cluster-wide namespace access a project binding implies.
//
// Project members need cluster-scoped grants on namespaces: creating them,
// editing the project's own namespaces, or at least reading them. Which grant
// applies is decided from the effective rules of the template's aggregator.
use crate::errors::ReconcileResult;
use crate::store::{DynStore, Selector, StoreResultExt, ignore_not_found};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::info;
use trellis_rbac::{RuleQuery, rules_allow, rules_eq, safe_concat_name};

pub const CREATE_NS_ROLE: &str = "create-ns";

const MANAGEMENT_GROUP: &str = "management.cattle.io";

pub fn readonly_role_name(project: &str) -> String {
    safe_concat_name(&[project, "namespaces-readonly"])
}

pub fn edit_role_name(project: &str) -> String {
    safe_concat_name(&[project, "namespaces-edit"])
}

pub fn psa_role_name(project: &str) -> String {
    safe_concat_name(&[project, "namespaces-psa"])
}

pub(crate) fn allows_create_namespaces(rules: &[PolicyRule]) -> bool {
    rules_allow(rules, &RuleQuery::new("create", "", "namespaces"))
}

pub(crate) fn allows_update_psa(rules: &[PolicyRule], project: &str) -> bool {
    rules_allow(
        rules,
        &RuleQuery::new("updatepsa", MANAGEMENT_GROUP, "projects").named(project),
    )
}

/// ClusterRoles a binding with `rules` must be bound to for `project`.
///
/// Namespace creation grants `create-ns` plus the project's edit role. PSA
/// updates grant the project's PSA role. Without either, the binding gets the
/// project's read-only role.
pub fn namespace_access_role_names(project: &str, rules: &[PolicyRule]) -> Vec<String> {
    let mut roles = Vec::new();
    if allows_create_namespaces(rules) {
        roles.push(CREATE_NS_ROLE.to_string());
        roles.push(edit_role_name(project));
    }
    if allows_update_psa(rules, project) {
        roles.push(psa_role_name(project));
    }
    if roles.is_empty() {
        roles.push(readonly_role_name(project));
    }
    roles
}

fn psa_rules(project: &str) -> Vec<PolicyRule> {
    vec![PolicyRule {
        api_groups: Some(vec![MANAGEMENT_GROUP.to_string()]),
        resources: Some(vec!["projects".to_string()]),
        verbs: vec!["updatepsa".to_string()],
        resource_names: Some(vec![project.to_string()]),
        non_resource_urls: None,
    }]
}

/// Create `<project>-namespaces-psa` if missing, restore its rules if edited.
pub(crate) async fn ensure_psa_role(
    store: &DynStore<ClusterRole>,
    project: &str,
) -> ReconcileResult<()> {
    let name = psa_role_name(project);
    let rules = psa_rules(project);
    match store.get(None, &name).await.optional()? {
        None => {
            let role = ClusterRole {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    ..ObjectMeta::default()
                },
                rules: Some(rules),
                aggregation_rule: None,
            };
            info!(role = %name, "creating psa role");
            match store.create(&role).await {
                Err(err) if err.is_already_exists() => Ok(()),
                other => other.map(|_| ()).map_err(Into::into),
            }
        }
        Some(mut live) => {
            if rules_eq(live.rules.as_deref().unwrap_or_default(), &rules) {
                return Ok(());
            }
            info!(role = %live.name_any(), "restoring psa role rules");
            live.rules = Some(rules);
            store.update(&live).await?;
            Ok(())
        }
    }
}

/// Delete `<project>-namespaces-psa` once no ClusterRoleBinding refers to it.
/// Returns whether the role was deleted.
pub(crate) async fn delete_psa_role_if_unused(
    roles: &DynStore<ClusterRole>,
    bindings: &DynStore<ClusterRoleBinding>,
    project: &str,
) -> ReconcileResult<bool> {
    let name = psa_role_name(project);
    let in_use = bindings
        .list(None, &Selector::everything())
        .await?
        .iter()
        .any(|binding| binding.role_ref.kind == "ClusterRole" && binding.role_ref.name == name);
    if in_use {
        return Ok(false);
    }
    info!(role = %name, "deleting unused psa role");
    ignore_not_found(roles.delete(None, &name).await)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn rule(verbs: &[&str], group: &str, resource: &str, names: &[&str]) -> PolicyRule {
        PolicyRule {
            api_groups: Some(vec![group.to_string()]),
            resources: Some(vec![resource.to_string()]),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            resource_names: (!names.is_empty()).then(|| names.iter().map(|n| n.to_string()).collect()),
            non_resource_urls: None,
        }
    }

    #[test]
    fn create_namespaces_grants_create_and_edit() {
        let rules = vec![rule(&["create"], "", "namespaces", &[])];
        assert_eq!(
            namespace_access_role_names("p-1", &rules),
            vec!["create-ns".to_string(), "p-1-namespaces-edit".to_string()]
        );
    }

    #[test]
    fn psa_only_grants_just_the_psa_role() {
        let rules = vec![rule(&["updatepsa"], MANAGEMENT_GROUP, "projects", &["p-1"])];
        assert_eq!(
            namespace_access_role_names("p-1", &rules),
            vec!["p-1-namespaces-psa".to_string()]
        );
    }

    #[test]
    fn psa_for_another_project_does_not_count() {
        let rules = vec![rule(&["updatepsa"], MANAGEMENT_GROUP, "projects", &["p-2"])];
        assert_eq!(
            namespace_access_role_names("p-1", &rules),
            vec!["p-1-namespaces-readonly".to_string()]
        );
    }

    #[test]
    fn wildcard_grants_everything() {
        let rules = vec![rule(&["*"], "*", "*", &[])];
        assert_eq!(
            namespace_access_role_names("p-1", &rules),
            vec![
                "create-ns".to_string(),
                "p-1-namespaces-edit".to_string(),
                "p-1-namespaces-psa".to_string()
            ]
        );
    }

    #[test]
    fn no_rules_fall_back_to_readonly() {
        assert_eq!(
            namespace_access_role_names("p-1", &[]),
            vec!["p-1-namespaces-readonly".to_string()]
        );
    }

    #[tokio::test]
    async fn psa_role_is_created_and_restored() {
        let memory = MemoryStore::new();
        let store: DynStore<ClusterRole> = memory.collection();

        ensure_psa_role(&store, "p-1").await.expect("create");
        let mut live = store.get(None, "p-1-namespaces-psa").await.expect("get");
        assert_eq!(live.rules, Some(psa_rules("p-1")));

        live.rules = Some(Vec::new());
        store.update(&live).await.expect("tamper");
        ensure_psa_role(&store, "p-1").await.expect("restore");
        let live = store.get(None, "p-1-namespaces-psa").await.expect("get");
        assert_eq!(live.rules, Some(psa_rules("p-1")));

        let writes = memory.writes().await;
        ensure_psa_role(&store, "p-1").await.expect("noop");
        assert_eq!(memory.writes().await, writes);
    }

    #[tokio::test]
    async fn psa_role_is_kept_while_bound() {
        let memory = MemoryStore::new();
        let roles: DynStore<ClusterRole> = memory.collection();
        let bindings: DynStore<ClusterRoleBinding> = memory.collection();
        ensure_psa_role(&roles, "p-1").await.expect("create");
        let binding = trellis_rbac::build_named_cluster_role_binding(
            trellis_rbac::cluster_role_ref("p-1-namespaces-psa"),
            k8s_openapi::api::rbac::v1::Subject {
                api_group: Some(trellis_rbac::RBAC_API_GROUP.to_string()),
                kind: "User".to_string(),
                name: "alice".to_string(),
                namespace: None,
            },
            std::collections::BTreeMap::new(),
        );
        let binding = bindings.create(&binding).await.expect("bind");

        assert!(!delete_psa_role_if_unused(&roles, &bindings, "p-1").await.expect("check"));
        assert!(roles.get(None, "p-1-namespaces-psa").await.is_ok());

        bindings.delete(None, &binding.name_any()).await.expect("unbind");
        assert!(delete_psa_role_if_unused(&roles, &bindings, "p-1").await.expect("delete"));
        assert!(roles.get(None, "p-1-namespaces-psa").await.optional().expect("get").is_none());
        // Already gone.
        assert!(delete_psa_role_if_unused(&roles, &bindings, "p-1").await.expect("again"));
    }
}

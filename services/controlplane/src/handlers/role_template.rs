// RoleTemplate materialization into derived ClusterRoles.
//
// Role families share one shape: an optional rules role under a name
// transform plus its aggregator, which selects the same-transform aggregator
// of every inherited template. The base family always exists; the promoted
// and management-plane families exist only while they carry rules or an
// inherited template exposes one.
use super::Reconciler;
use crate::errors::{ErrorSet, ReconcileResult};
use crate::model::RoleTemplate;
use crate::store::{Selector, StoreResultExt, ignore_not_found};
use k8s_openapi::api::rbac::v1::{ClusterRole, PolicyRule};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};
use trellis_rbac::{
    AGGREGATION_LABEL, CLUSTER_MANAGEMENT_RESOURCES, CLUSTER_ROLE_OWNER_ANNOTATION,
    PROJECT_MANAGEMENT_RESOURCES, aggregated_cluster_role_name_for, build_aggregating_cluster_role,
    build_cluster_role, cluster_management_role_name_for, cluster_role_name_for,
    converge_cluster_role, extract_management_plane_rules, extract_promoted_rules,
    project_management_role_name_for, promoted_cluster_role_name_for,
};

fn owned_by(role: &ClusterRole, template: &str) -> bool {
    role.annotations().get(CLUSTER_ROLE_OWNER_ANNOTATION).map(String::as_str) == Some(template)
}

impl Reconciler {
    /// Create or update every ClusterRole `rt` materializes into and delete
    /// the optional ones it no longer needs.
    pub async fn on_change_role_template(&self, rt: &RoleTemplate) -> ReconcileResult<()> {
        let name = rt.name_any();
        let mut errors = ErrorSet::default();
        let effective = self.effective_rules(rt).await?;

        // Promoted roles only make sense for project templates; a template
        // that moved to cluster context loses them here.
        let (promoted, inherit_promoted) = if rt.is_project_context() {
            (extract_promoted_rules(&effective), true)
        } else {
            (Vec::new(), false)
        };
        errors.check(
            self.sync_role_family(rt, promoted, inherit_promoted, promoted_cluster_role_name_for)
                .await,
        );

        if !rt.spec.external {
            let base = build_cluster_role(&cluster_role_name_for(&name), &name, rt.spec.rules.clone());
            errors.check(self.ensure_cluster_role(&base).await);
        }
        let aggregator = build_aggregating_cluster_role(
            &name,
            &rt.spec.inherited_template_names,
            cluster_role_name_for,
        );
        errors.check(self.ensure_cluster_role(&aggregator).await);
        if rt.spec.external {
            errors.check(self.label_external_role(&name).await);
        }

        let cluster_mgmt = if rt.is_project_context() {
            Vec::new()
        } else {
            extract_management_plane_rules(&effective, CLUSTER_MANAGEMENT_RESOURCES)
        };
        let project_mgmt = extract_management_plane_rules(&effective, PROJECT_MANAGEMENT_RESOURCES);
        errors.check(
            self.sync_role_family(rt, cluster_mgmt, true, cluster_management_role_name_for)
                .await,
        );
        errors.check(
            self.sync_role_family(rt, project_mgmt, true, project_management_role_name_for)
                .await,
        );

        errors.finish()
    }

    /// Delete every ClusterRole owned by `rt` and unlabel its external role.
    pub async fn on_remove_role_template(&self, rt: &RoleTemplate) -> ReconcileResult<()> {
        let name = rt.name_any();
        let roles = &self.stores.cluster_roles;
        let mut errors = ErrorSet::default();

        let labeled = roles.list(None, &Selector::exists(AGGREGATION_LABEL)).await?;
        for role in labeled.iter().filter(|role| owned_by(role, &name)) {
            info!(role = %role.name_any(), template = %name, "deleting derived cluster role");
            errors.check(ignore_not_found(roles.delete(None, &role.name_any()).await));
        }

        if rt.spec.external {
            if let Some(mut role) = errors.check(roles.get(None, &name).await.optional()).flatten() {
                if role.labels().get(AGGREGATION_LABEL) == Some(&name) {
                    role.labels_mut().remove(AGGREGATION_LABEL);
                    debug!(role = %name, "removing aggregation label from external role");
                    errors.check(roles.update(&role).await);
                }
            }
        }
        errors.finish()
    }

    /// Rules used for promotion and management-plane extraction.
    async fn effective_rules(&self, rt: &RoleTemplate) -> ReconcileResult<Vec<PolicyRule>> {
        if let Some(rules) = &rt.spec.external_rules {
            return Ok(rules.clone());
        }
        if !rt.spec.external {
            return Ok(rt.spec.rules.clone());
        }
        let external = self
            .stores
            .cluster_roles
            .get(None, &rt.name_any())
            .await
            .optional()?;
        Ok(external.and_then(|role| role.rules).unwrap_or_default())
    }

    /// Ensure or retire one role family of `rt` under `name_for`.
    ///
    /// With `inherit` set, the family is kept alive by an inherited template
    /// that already exposes its own aggregator under the same transform.
    async fn sync_role_family(
        &self,
        rt: &RoleTemplate,
        rules: Vec<PolicyRule>,
        inherit: bool,
        name_for: fn(&str) -> String,
    ) -> ReconcileResult<()> {
        let name = rt.name_any();
        let role_name = name_for(&name);
        let needed = !rules.is_empty() || (inherit && self.inherited_family_exists(rt, name_for).await?);

        if !needed {
            self.delete_owned_role(&role_name, &name).await?;
            return self
                .delete_owned_role(&aggregated_cluster_role_name_for(&role_name), &name)
                .await;
        }
        if rules.is_empty() {
            self.delete_owned_role(&role_name, &name).await?;
        } else {
            self.ensure_cluster_role(&build_cluster_role(&role_name, &name, rules))
                .await?;
        }
        let aggregator =
            build_aggregating_cluster_role(&name, &rt.spec.inherited_template_names, name_for);
        self.ensure_cluster_role(&aggregator).await
    }

    async fn inherited_family_exists(
        &self,
        rt: &RoleTemplate,
        name_for: fn(&str) -> String,
    ) -> ReconcileResult<bool> {
        for inherited in &rt.spec.inherited_template_names {
            let aggregator = aggregated_cluster_role_name_for(&name_for(inherited));
            if self
                .stores
                .cluster_roles
                .get(None, &aggregator)
                .await
                .optional()?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create-if-absent, update-if-different. Roles are never recreated.
    async fn ensure_cluster_role(&self, wanted: &ClusterRole) -> ReconcileResult<()> {
        let roles = &self.stores.cluster_roles;
        let name = wanted.name_any();
        match roles.get(None, &name).await.optional()? {
            None => {
                info!(role = %name, "creating cluster role");
                match roles.create(wanted).await {
                    Err(err) if !err.is_already_exists() => Err(err.into()),
                    _ => Ok(()),
                }
            }
            Some(mut live) => {
                if converge_cluster_role(&mut live, wanted) {
                    info!(role = %name, "updating cluster role");
                    roles.update(&live).await?;
                }
                Ok(())
            }
        }
    }

    async fn delete_owned_role(&self, role_name: &str, template: &str) -> ReconcileResult<()> {
        let roles = &self.stores.cluster_roles;
        let Some(role) = roles.get(None, role_name).await.optional()? else {
            return Ok(());
        };
        if !owned_by(&role, template) {
            return Ok(());
        }
        info!(role = role_name, template, "deleting stale cluster role");
        ignore_not_found(roles.delete(None, role_name).await)?;
        Ok(())
    }

    /// Point the external role's aggregation label at the template. A missing
    /// external role is left for a later reconcile.
    async fn label_external_role(&self, name: &str) -> ReconcileResult<()> {
        let roles = &self.stores.cluster_roles;
        let Some(mut role) = roles.get(None, name).await.optional()? else {
            debug!(role = name, "external role not found");
            return Ok(());
        };
        if role.labels().get(AGGREGATION_LABEL).map(String::as_str) == Some(name) {
            return Ok(());
        }
        role.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(AGGREGATION_LABEL.to_string(), name.to_string());
        info!(role = name, "labeling external role for aggregation");
        roles.update(&role).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impersonation::DefaultUserResolver;
    use crate::model::RoleTemplateSpec;
    use crate::retry::RetryPolicy;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;
    use trellis_rbac::RoleContext;

    fn rule(verbs: &[&str], group: &str, resource: &str) -> PolicyRule {
        PolicyRule {
            api_groups: Some(vec![group.to_string()]),
            resources: Some(vec![resource.to_string()]),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..PolicyRule::default()
        }
    }

    fn template(name: &str, context: RoleContext, rules: Vec<PolicyRule>, inherits: &[&str]) -> RoleTemplate {
        RoleTemplate::new(
            name,
            RoleTemplateSpec {
                context,
                rules,
                inherited_template_names: inherits.iter().map(|n| n.to_string()).collect(),
                ..RoleTemplateSpec::default()
            },
        )
    }

    fn reconciler(memory: &MemoryStore) -> Reconciler {
        Reconciler::new(
            memory.stores(),
            Arc::new(DefaultUserResolver),
            "c1",
            RetryPolicy::default(),
        )
    }

    async fn role_names(memory: &MemoryStore) -> Vec<String> {
        memory
            .stores()
            .cluster_roles
            .list(None, &Selector::everything())
            .await
            .expect("list")
            .iter()
            .map(|r| r.name_any())
            .collect()
    }

    #[tokio::test]
    async fn cluster_template_gets_base_and_aggregator() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let viewer = template("viewer", RoleContext::Cluster, vec![rule(&["get"], "", "pods")], &[]);

        r.on_change_role_template(&viewer).await.expect("reconcile");
        assert_eq!(role_names(&memory).await, vec!["viewer", "viewer-aggregator"]);

        let aggregator = memory
            .stores()
            .cluster_roles
            .get(None, "viewer-aggregator")
            .await
            .expect("aggregator");
        assert_eq!(aggregator.rules, Some(vec![rule(&["get"], "", "pods")]));
    }

    #[tokio::test]
    async fn second_reconcile_writes_nothing() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let rt = template(
            "member",
            RoleContext::Project,
            vec![rule(&["get"], "", "persistentvolumes"), rule(&["*"], "", "secrets")],
            &[],
        );
        r.on_change_role_template(&rt).await.expect("first");
        let writes = memory.writes().await;
        r.on_change_role_template(&rt).await.expect("second");
        assert_eq!(memory.writes().await, writes);
    }

    #[tokio::test]
    async fn project_template_gets_promoted_roles() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let rt = template("pv-reader", RoleContext::Project, vec![rule(&["get"], "", "persistentvolumes")], &[]);

        r.on_change_role_template(&rt).await.expect("reconcile");
        let names = role_names(&memory).await;
        assert!(names.contains(&"pv-reader-promoted".to_string()));
        assert!(names.contains(&"pv-reader-promoted-aggregator".to_string()));
    }

    #[tokio::test]
    async fn inherited_promotion_creates_only_the_aggregator() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let base = template("b", RoleContext::Project, vec![rule(&["get"], "", "nodes")], &[]);
        let child = template("a", RoleContext::Project, vec![rule(&["get"], "", "pods")], &["b"]);

        r.on_change_role_template(&base).await.expect("base");
        r.on_change_role_template(&child).await.expect("child");

        let names = role_names(&memory).await;
        assert!(!names.contains(&"a-promoted".to_string()));
        let aggregator = memory
            .stores()
            .cluster_roles
            .get(None, "a-promoted-aggregator")
            .await
            .expect("aggregator");
        let selectors = aggregator
            .aggregation_rule
            .and_then(|rule| rule.cluster_role_selectors)
            .unwrap_or_default();
        let selected: Vec<String> = selectors
            .iter()
            .filter_map(|s| s.match_labels.as_ref()?.get(AGGREGATION_LABEL).cloned())
            .collect();
        assert_eq!(selected, vec!["a-promoted", "b-promoted-aggregator"]);
    }

    #[tokio::test]
    async fn dropping_promoted_rules_deletes_promoted_roles() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let mut rt = template("p", RoleContext::Project, vec![rule(&["get"], "", "nodes")], &[]);
        r.on_change_role_template(&rt).await.expect("first");
        rt.spec.rules = vec![rule(&["get"], "", "pods")];
        r.on_change_role_template(&rt).await.expect("second");

        let names = role_names(&memory).await;
        assert!(!names.iter().any(|n| n.contains("promoted")));
    }

    #[tokio::test]
    async fn management_roles_follow_context() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let owner = template("owner", RoleContext::Cluster, vec![rule(&["*"], "*", "*")], &[]);
        r.on_change_role_template(&owner).await.expect("cluster");
        let names = role_names(&memory).await;
        for expected in [
            "owner-cluster-mgmt",
            "owner-cluster-mgmt-aggregator",
            "owner-project-mgmt",
            "owner-project-mgmt-aggregator",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }

        let member = template("pm", RoleContext::Project, vec![rule(&["get"], "", "secrets")], &[]);
        r.on_change_role_template(&member).await.expect("project");
        let names = role_names(&memory).await;
        assert!(names.contains(&"pm-project-mgmt".to_string()));
        assert!(!names.contains(&"pm-cluster-mgmt".to_string()));
    }

    #[tokio::test]
    async fn external_template_labels_the_external_role() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let roles = memory.stores().cluster_roles;
        roles
            .create(&ClusterRole {
                metadata: ObjectMeta {
                    name: Some("ext".to_string()),
                    ..ObjectMeta::default()
                },
                rules: Some(vec![rule(&["list"], "", "nodes")]),
                aggregation_rule: None,
            })
            .await
            .expect("external role");
        let mut rt = template("ext", RoleContext::Project, Vec::new(), &[]);
        rt.spec.external = true;

        r.on_change_role_template(&rt).await.expect("reconcile");
        let external = roles.get(None, "ext").await.expect("external");
        assert_eq!(external.labels().get(AGGREGATION_LABEL).map(String::as_str), Some("ext"));
        assert!(owned_by(&roles.get(None, "ext-aggregator").await.expect("aggregator"), "ext"));
        // Promotion reads the external role's rules.
        assert!(roles.get(None, "ext-promoted").await.is_ok());

        r.on_remove_role_template(&rt).await.expect("remove");
        let external = roles.get(None, "ext").await.expect("external kept");
        assert!(!external.labels().contains_key(AGGREGATION_LABEL));
        assert_eq!(role_names(&memory).await, vec!["ext"]);
    }

    #[tokio::test]
    async fn external_template_without_its_role_is_a_noop() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let mut rt = template("gone", RoleContext::Cluster, Vec::new(), &[]);
        rt.spec.external = true;
        r.on_change_role_template(&rt).await.expect("reconcile");
        assert_eq!(role_names(&memory).await, vec!["gone-aggregator"]);
    }

    #[tokio::test]
    async fn removal_keeps_roles_owned_by_others() {
        let memory = MemoryStore::new();
        let r = reconciler(&memory);
        let viewer = template("viewer", RoleContext::Cluster, vec![rule(&["get"], "", "pods")], &[]);
        let editor = template("editor", RoleContext::Cluster, vec![rule(&["update"], "", "pods")], &["viewer"]);
        r.on_change_role_template(&viewer).await.expect("viewer");
        r.on_change_role_template(&editor).await.expect("editor");

        r.on_remove_role_template(&editor).await.expect("remove");
        assert_eq!(role_names(&memory).await, vec!["viewer", "viewer-aggregator"]);
    }
}

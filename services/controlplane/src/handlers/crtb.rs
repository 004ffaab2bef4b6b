// ClusterRoleTemplateBinding reconciliation.
//
// A CRTB owns exactly one server-named ClusterRoleBinding, found through the
// CRTB owner label. Extra or stale ones are deleted; a missing one is created.
use super::membership::{self, Membership};
use super::{Reconciler, StepError, outcome};
use crate::errors::{ErrorSet, ReconcileResult};
use crate::model::{ClusterRoleTemplateBinding, RoleTemplateBinding, binding_key};
use crate::status::conditions::*;
use crate::status::{StatusReport, Step, reasons};
use crate::store::{Selector, ignore_not_found};
use k8s_openapi::api::rbac::v1::Subject;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};
use trellis_rbac::{
    CRTB_OWNER_LABEL, aggregated_cluster_role_name_for, build_generated_cluster_role_binding,
    build_subject, cluster_role_binding_content_eq,
};

impl Reconciler {
    pub async fn on_change_crtb(&self, crtb: &ClusterRoleTemplateBinding) -> ReconcileResult<()> {
        if !self.manages(crtb) {
            debug!(crtb = %binding_key(crtb), "binding targets another cluster");
            return Ok(());
        }
        let mut report = StatusReport::default();
        let mut errors = ErrorSet::default();

        let subject = match build_subject(&crtb.subject_source()) {
            Ok(subject) => subject,
            Err(err) => {
                report.local(Step::failed(RECONCILE_SUBJECT, reasons::CRTB_HAS_NO_SUBJECT, &err));
                report.remote(Step::failed(
                    RECONCILE_CLUSTER_ROLE_BINDINGS,
                    reasons::FAILURE_TO_BUILD_CLUSTER_ROLE_BINDING,
                    &err,
                ));
                errors.push(err);
                errors.check(self.write_status(&self.stores.crtbs, crtb, &report).await);
                return errors.finish();
            }
        };
        report.local(Step::ok(RECONCILE_SUBJECT, reasons::SUBJECT_EXISTS));

        let result = self.sync_crtb_membership(crtb, &subject).await;
        report.local(outcome(
            RECONCILE_MEMBERSHIP_BINDINGS,
            reasons::MEMBERSHIP_BINDING_EXISTS,
            result,
            &mut errors,
        ));

        let result = self.sync_crtb_binding(crtb, &subject).await;
        report.remote(outcome(
            RECONCILE_CLUSTER_ROLE_BINDINGS,
            reasons::CLUSTER_ROLE_BINDING_EXISTS,
            result,
            &mut errors,
        ));

        if let Some(result) = self.sync_impersonator(&subject).await {
            report.remote(outcome(
                RECONCILE_IMPERSONATOR,
                reasons::IMPERSONATOR_EXISTS,
                result,
                &mut errors,
            ));
        }

        errors.check(self.write_status(&self.stores.crtbs, crtb, &report).await);
        errors.finish()
    }

    pub async fn on_remove_crtb(&self, crtb: &ClusterRoleTemplateBinding) -> ReconcileResult<()> {
        if !self.manages(crtb) {
            return Ok(());
        }
        let mut report = StatusReport::default();
        let mut errors = ErrorSet::default();

        let result = self.delete_crtb_bindings(crtb).await;
        report.remote(outcome(
            DELETE_CLUSTER_ROLE_BINDINGS,
            reasons::CLUSTER_ROLE_BINDINGS_DELETED,
            result,
            &mut errors,
        ));

        let label = membership::label_for(crtb);
        let result =
            membership::release_cluster_membership(&self.stores.cluster_role_bindings, self.retry, &label)
                .await;
        report.local(outcome(
            RECONCILE_MEMBERSHIP_BINDINGS,
            reasons::MEMBERSHIP_BINDING_EXISTS,
            result,
            &mut errors,
        ));

        errors.check(self.release_impersonator(crtb).await);
        errors.check(self.write_status(&self.stores.crtbs, crtb, &report).await);
        errors.finish()
    }

    async fn sync_crtb_membership(
        &self,
        crtb: &ClusterRoleTemplateBinding,
        subject: &Subject,
    ) -> Result<(), StepError> {
        let rules =
            membership::aggregated_rules(&self.stores.cluster_roles, crtb.role_template_name()).await?;
        let label = membership::label_for(crtb);
        let membership = Membership {
            label: &label,
            subject,
            cluster: &self.cluster_name,
            rules: Some(&rules),
        };
        membership::sync_cluster_membership(&self.stores.cluster_role_bindings, self.retry, &membership)
            .await
    }

    /// Keep exactly one content-correct ClusterRoleBinding for `crtb`.
    async fn sync_crtb_binding(
        &self,
        crtb: &ClusterRoleTemplateBinding,
        subject: &Subject,
    ) -> Result<(), StepError> {
        let template = self
            .stores
            .role_templates
            .get(None, crtb.role_template_name())
            .await
            .map_err(|err| StepError::new(reasons::FAILURE_TO_BUILD_CLUSTER_ROLE_BINDING, err))?;
        let role = if template.spec.external {
            template.name_any()
        } else {
            aggregated_cluster_role_name_for(&template.name_any())
        };
        let owner = crtb.name_any();
        let desired = build_generated_cluster_role_binding(
            &role,
            subject.clone(),
            BTreeMap::from([(CRTB_OWNER_LABEL.to_string(), owner.clone())]),
        );

        let bindings = &self.stores.cluster_role_bindings;
        let existing = bindings
            .list(None, &Selector::eq(CRTB_OWNER_LABEL, &owner))
            .await
            .map_err(|err| StepError::new(reasons::FAILURE_TO_LIST_CLUSTER_ROLE_BINDINGS, err))?;

        let mut kept = false;
        let mut errors = ErrorSet::default();
        for binding in existing {
            if !kept && cluster_role_binding_content_eq(&binding, &desired) {
                kept = true;
                continue;
            }
            info!(crtb = %binding_key(crtb), binding = %binding.name_any(), "deleting stale cluster role binding");
            errors.check(ignore_not_found(bindings.delete(None, &binding.name_any()).await));
        }
        if let Err(err) = errors.finish() {
            return Err(StepError::new(reasons::FAILURE_TO_DELETE_CLUSTER_ROLE_BINDING, err));
        }
        if kept {
            return Ok(());
        }

        info!(crtb = %binding_key(crtb), role = %role, "creating cluster role binding");
        bindings
            .create(&desired)
            .await
            .map_err(|err| StepError::new(reasons::FAILURE_TO_CREATE_CLUSTER_ROLE_BINDING, err))?;
        Ok(())
    }

    async fn delete_crtb_bindings(&self, crtb: &ClusterRoleTemplateBinding) -> Result<(), StepError> {
        let bindings = &self.stores.cluster_role_bindings;
        let existing = bindings
            .list(None, &Selector::eq(CRTB_OWNER_LABEL, &crtb.name_any()))
            .await
            .map_err(|err| StepError::new(reasons::FAILURE_TO_LIST_CLUSTER_ROLE_BINDINGS, err))?;
        let mut errors = ErrorSet::default();
        for binding in existing {
            debug!(binding = %binding.name_any(), "deleting cluster role binding");
            errors.check(ignore_not_found(bindings.delete(None, &binding.name_any()).await));
        }
        errors
            .finish()
            .map_err(|err| StepError::new(reasons::FAILURE_TO_DELETE_CLUSTER_ROLE_BINDING, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impersonation::{DefaultUserResolver, impersonator_name};
    use crate::model::{ClusterRoleTemplateBindingSpec, RoleTemplate, RoleTemplateSpec};
    use crate::retry::RetryPolicy;
    use crate::status::SUMMARY_ERROR;
    use crate::store::memory::MemoryStore;
    use k8s_openapi::api::rbac::v1::PolicyRule;
    use std::sync::Arc;

    fn crtb(name: &str, user: Option<&str>, template: &str) -> ClusterRoleTemplateBinding {
        let mut crtb = ClusterRoleTemplateBinding::new(
            name,
            ClusterRoleTemplateBindingSpec {
                user_name: user.map(str::to_string),
                cluster_name: "c1".to_string(),
                role_template_name: template.to_string(),
                ..ClusterRoleTemplateBindingSpec::default()
            },
        );
        crtb.metadata.namespace = Some("c1".to_string());
        crtb
    }

    async fn setup() -> (MemoryStore, Reconciler) {
        let memory = MemoryStore::new();
        let r = Reconciler::new(memory.stores(), Arc::new(DefaultUserResolver), "c1", RetryPolicy::default());
        let viewer = RoleTemplate::new(
            "viewer",
            RoleTemplateSpec {
                rules: vec![PolicyRule {
                    api_groups: Some(vec![String::new()]),
                    resources: Some(vec!["pods".to_string()]),
                    verbs: vec!["get".to_string()],
                    ..PolicyRule::default()
                }],
                ..RoleTemplateSpec::default()
            },
        );
        memory.stores().role_templates.create(&viewer).await.expect("template");
        r.on_change_role_template(&viewer).await.expect("materialize");
        (memory, r)
    }

    async fn stored(memory: &MemoryStore, binding: &ClusterRoleTemplateBinding) -> ClusterRoleTemplateBinding {
        memory
            .stores()
            .crtbs
            .get(Some("c1"), &binding.name_any())
            .await
            .expect("crtb")
    }

    #[tokio::test]
    async fn missing_subject_is_reported() {
        let (memory, r) = setup().await;
        let binding = crtb("crtb-1", None, "viewer");
        memory.stores().crtbs.create(&binding).await.expect("create");

        assert!(r.on_change_crtb(&binding).await.is_err());
        let status = stored(&memory, &binding).await.status.expect("status");
        assert_eq!(status.summary.as_deref(), Some(SUMMARY_ERROR));
        assert_eq!(status.local_conditions[0].reason, reasons::CRTB_HAS_NO_SUBJECT);
        assert_eq!(
            status.remote_conditions[0].reason,
            reasons::FAILURE_TO_BUILD_CLUSTER_ROLE_BINDING
        );
    }

    #[tokio::test]
    async fn duplicate_bindings_are_collapsed() {
        let (memory, r) = setup().await;
        let binding = crtb("crtb-1", Some("alice"), "viewer");
        memory.stores().crtbs.create(&binding).await.expect("create");
        let subject = build_subject(&binding.subject_source()).expect("subject");
        let labels = BTreeMap::from([(CRTB_OWNER_LABEL.to_string(), "crtb-1".to_string())]);
        let crbs = &memory.stores().cluster_role_bindings;
        for role in ["viewer-aggregator", "viewer-aggregator", "stale"] {
            crbs.create(&build_generated_cluster_role_binding(role, subject.clone(), labels.clone()))
                .await
                .expect("seed");
        }

        r.on_change_crtb(&binding).await.expect("reconcile");
        let owned = crbs
            .list(None, &Selector::eq(CRTB_OWNER_LABEL, "crtb-1"))
            .await
            .expect("list");
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].role_ref.name, "viewer-aggregator");
    }

    #[tokio::test]
    async fn other_clusters_are_ignored() {
        let (memory, r) = setup().await;
        let mut binding = crtb("crtb-1", Some("alice"), "viewer");
        binding.spec.cluster_name = "c2".to_string();
        let writes = memory.writes().await;
        r.on_change_crtb(&binding).await.expect("ignored");
        assert_eq!(memory.writes().await, writes);
    }

    #[tokio::test]
    async fn removal_cleans_up_everything() {
        let (memory, r) = setup().await;
        let binding = crtb("crtb-1", Some("alice"), "viewer");
        memory.stores().crtbs.create(&binding).await.expect("create");
        r.on_change_crtb(&binding).await.expect("reconcile");
        let crbs = &memory.stores().cluster_role_bindings;
        assert!(crbs.get(None, &impersonator_name("alice")).await.is_ok());

        r.on_remove_crtb(&stored(&memory, &binding).await).await.expect("remove");
        assert!(
            crbs.list(None, &Selector::exists(CRTB_OWNER_LABEL))
                .await
                .expect("list")
                .is_empty()
        );
        assert!(
            crbs.list(None, &Selector::exists("c1_crtb-1"))
                .await
                .expect("list")
                .is_empty()
        );
        assert!(
            memory
                .stores()
                .cluster_roles
                .get(None, &impersonator_name("alice"))
                .await
                .is_err()
        );
    }
}

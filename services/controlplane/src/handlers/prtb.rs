// ProjectRoleTemplateBinding reconciliation.
//
// A PRTB owns RoleBindings in every namespace of its project and
// ClusterRoleBindings for promoted rules and namespace access. All of them
// are named deterministically and may be shared with other PRTBs of the same
// subject, so ownership is one `prtb-owner-<name>` label per PRTB.
use super::membership::{self, Membership};
use super::namespace_access::{
    delete_psa_role_if_unused, ensure_psa_role, namespace_access_role_names, psa_role_name,
};
use super::shared::{SyncError, SyncPhase, release_all, sync_shared};
use super::{Reconciler, StepError, outcome};
use crate::errors::{ErrorSet, ReconcileResult};
use crate::model::{ProjectRoleTemplateBinding, RoleTemplate, RoleTemplateBinding, binding_key};
use crate::status::conditions::*;
use crate::status::{StatusReport, Step, reasons};
use crate::store::{Selector, StoreResultExt};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, Subject};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::debug;
use trellis_rbac::{
    PROJECT_ID_LABEL, ProjectId, aggregated_cluster_role_name_for, build_named_cluster_role_binding,
    build_named_role_binding, build_subject, cluster_role_ref, is_prtb_owner_label,
    prtb_owner_label, promoted_cluster_role_name_for,
};

fn role_binding_failure(err: SyncError) -> StepError {
    let reason = match err.phase {
        SyncPhase::List => reasons::FAILED_TO_GET_EXISTING_ROLE_BINDINGS,
        SyncPhase::Create => reasons::FAILED_TO_CREATE_ROLE_BINDING,
        SyncPhase::Delete => reasons::FAILED_TO_DELETE_ROLE_BINDING,
    };
    StepError::new(reason, err.source)
}

fn cluster_role_binding_failure(err: SyncError) -> StepError {
    let reason = match err.phase {
        SyncPhase::List => reasons::FAILURE_TO_LIST_CLUSTER_ROLE_BINDINGS,
        SyncPhase::Create => reasons::FAILURE_TO_CREATE_CLUSTER_ROLE_BINDING,
        SyncPhase::Delete => reasons::FAILURE_TO_DELETE_CLUSTER_ROLE_BINDING,
    };
    StepError::new(reason, err.source)
}

fn is_terminating(namespace: &Namespace) -> bool {
    namespace.metadata.deletion_timestamp.is_some()
        || namespace
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some("Terminating")
}

/// Role every namespace RoleBinding of the template points at.
fn bound_role(template: &RoleTemplate) -> String {
    if template.spec.external {
        template.name_any()
    } else {
        aggregated_cluster_role_name_for(&template.name_any())
    }
}

impl Reconciler {
    pub async fn on_change_prtb(&self, prtb: &ProjectRoleTemplateBinding) -> ReconcileResult<()> {
        if !self.manages(prtb) {
            debug!(prtb = %binding_key(prtb), "binding targets another cluster");
            return Ok(());
        }
        let project = ProjectId::parse(&prtb.spec.project_name)?;
        let mut report = StatusReport::default();
        let mut errors = ErrorSet::default();

        let subject = match build_subject(&prtb.subject_source()) {
            Ok(subject) => subject,
            Err(err) => {
                report.local(Step::failed(RECONCILE_SUBJECT, reasons::PRTB_HAS_NO_SUBJECT, &err));
                report.remote(Step::failed(
                    RECONCILE_BINDINGS,
                    reasons::FAILED_TO_GET_DESIRED_ROLE_BINDINGS,
                    &err,
                ));
                report.remote(Step::failed(
                    RECONCILE_CLUSTER_ROLE_BINDINGS,
                    reasons::FAILURE_TO_BUILD_CLUSTER_ROLE_BINDING,
                    &err,
                ));
                errors.push(err);
                errors.check(self.write_status(&self.stores.prtbs, prtb, &report).await);
                return errors.finish();
            }
        };
        report.local(Step::ok(RECONCILE_SUBJECT, reasons::SUBJECT_EXISTS));

        let result = self.sync_prtb_membership(prtb, &project, &subject).await;
        report.local(outcome(
            RECONCILE_MEMBERSHIP_BINDINGS,
            reasons::MEMBERSHIP_BINDING_EXISTS,
            result,
            &mut errors,
        ));

        match self
            .stores
            .role_templates
            .get(None, prtb.role_template_name())
            .await
        {
            Ok(template) => {
                let result = self
                    .sync_prtb_role_bindings(prtb, &project, &template, &subject)
                    .await;
                report.remote(outcome(
                    RECONCILE_BINDINGS,
                    reasons::BINDINGS_EXISTS,
                    result,
                    &mut errors,
                ));
                let result = self
                    .sync_prtb_cluster_role_bindings(prtb, &project, &template, &subject)
                    .await;
                report.remote(outcome(
                    RECONCILE_CLUSTER_ROLE_BINDINGS,
                    reasons::CLUSTER_ROLE_BINDING_EXISTS,
                    result,
                    &mut errors,
                ));
            }
            Err(err) => {
                report.remote(Step::failed(
                    RECONCILE_BINDINGS,
                    reasons::FAILED_TO_GET_DESIRED_ROLE_BINDINGS,
                    &err,
                ));
                report.remote(Step::failed(
                    RECONCILE_CLUSTER_ROLE_BINDINGS,
                    reasons::FAILURE_TO_BUILD_CLUSTER_ROLE_BINDING,
                    &err,
                ));
                errors.push(err);
            }
        }

        if let Some(result) = self.sync_impersonator(&subject).await {
            report.remote(outcome(
                RECONCILE_IMPERSONATOR,
                reasons::IMPERSONATOR_EXISTS,
                result,
                &mut errors,
            ));
        }

        errors.check(self.write_status(&self.stores.prtbs, prtb, &report).await);
        errors.finish()
    }

    pub async fn on_remove_prtb(&self, prtb: &ProjectRoleTemplateBinding) -> ReconcileResult<()> {
        if !self.manages(prtb) {
            return Ok(());
        }
        let project = ProjectId::parse(&prtb.spec.project_name)?;
        let owner_label = prtb_owner_label(&prtb.name_any());
        let mut report = StatusReport::default();
        let mut errors = ErrorSet::default();

        let result = release_all(
            &self.stores.role_bindings,
            self.retry,
            None,
            &owner_label,
            is_prtb_owner_label,
        )
        .await
        .map_err(role_binding_failure);
        report.remote(outcome(
            REMOVE_ROLE_BINDINGS,
            reasons::ROLE_BINDINGS_DELETED,
            result,
            &mut errors,
        ));

        let result = release_all(
            &self.stores.cluster_role_bindings,
            self.retry,
            None,
            &owner_label,
            is_prtb_owner_label,
        )
        .await
        .map_err(cluster_role_binding_failure);
        let result = match result {
            Ok(()) => delete_psa_role_if_unused(
                &self.stores.cluster_roles,
                &self.stores.cluster_role_bindings,
                &project.project,
            )
            .await
            .map(|_| ())
            .map_err(|err| StepError::new(reasons::FAILURE_TO_DELETE_CLUSTER_ROLE_BINDING, err)),
            Err(err) => Err(err),
        };
        report.remote(outcome(
            DELETE_CLUSTER_ROLE_BINDINGS,
            reasons::CLUSTER_ROLE_BINDINGS_DELETED,
            result,
            &mut errors,
        ));

        let label = membership::label_for(prtb);
        let mut result =
            membership::release_cluster_membership(&self.stores.cluster_role_bindings, self.retry, &label)
                .await;
        if result.is_ok() {
            result = membership::release_project_membership(
                &self.stores.role_bindings,
                self.retry,
                &project.cluster,
                &label,
            )
            .await;
        }
        report.local(outcome(
            RECONCILE_MEMBERSHIP_BINDINGS,
            reasons::MEMBERSHIP_BINDING_EXISTS,
            result,
            &mut errors,
        ));

        errors.check(self.release_impersonator(prtb).await);
        errors.check(self.write_status(&self.stores.prtbs, prtb, &report).await);
        errors.finish()
    }

    /// Cluster membership is always plain membership for a PRTB; project
    /// membership is ownership when the template owns projects.
    async fn sync_prtb_membership(
        &self,
        prtb: &ProjectRoleTemplateBinding,
        project: &ProjectId,
        subject: &Subject,
    ) -> Result<(), StepError> {
        let label = membership::label_for(prtb);
        let cluster = Membership {
            label: &label,
            subject,
            cluster: &project.cluster,
            rules: None,
        };
        membership::sync_cluster_membership(&self.stores.cluster_role_bindings, self.retry, &cluster)
            .await?;

        let rules =
            membership::aggregated_rules(&self.stores.cluster_roles, prtb.role_template_name()).await?;
        let project_membership = Membership {
            rules: Some(&rules),
            ..cluster
        };
        membership::sync_project_membership(
            &self.stores.role_bindings,
            self.retry,
            &project_membership,
            &project.project,
        )
        .await
    }

    /// One RoleBinding per live namespace of the project.
    async fn sync_prtb_role_bindings(
        &self,
        prtb: &ProjectRoleTemplateBinding,
        project: &ProjectId,
        template: &RoleTemplate,
        subject: &Subject,
    ) -> Result<(), StepError> {
        let namespaces = self
            .stores
            .namespaces
            .list(None, &Selector::eq(PROJECT_ID_LABEL, &project.project))
            .await
            .map_err(|err| StepError::new(reasons::FAILED_TO_GET_NAMESPACES, err))?;

        let owner_label = prtb_owner_label(&prtb.name_any());
        let role = cluster_role_ref(&bound_role(template));
        let desired: Vec<RoleBinding> = namespaces
            .iter()
            .filter(|ns| !is_terminating(ns))
            .map(|ns| {
                build_named_role_binding(
                    &ns.name_any(),
                    role.clone(),
                    subject.clone(),
                    BTreeMap::from([(owner_label.clone(), "true".to_string())]),
                )
            })
            .collect();
        debug!(prtb = %binding_key(prtb), count = desired.len(), "syncing project role bindings");

        sync_shared(
            &self.stores.role_bindings,
            self.retry,
            &owner_label,
            is_prtb_owner_label,
            desired,
        )
        .await
        .map_err(role_binding_failure)
    }

    /// Promoted-rules binding plus namespace-access bindings.
    async fn sync_prtb_cluster_role_bindings(
        &self,
        prtb: &ProjectRoleTemplateBinding,
        project: &ProjectId,
        template: &RoleTemplate,
        subject: &Subject,
    ) -> Result<(), StepError> {
        let roles = &self.stores.cluster_roles;
        let mut wanted_roles = Vec::new();

        let promoted = aggregated_cluster_role_name_for(&promoted_cluster_role_name_for(&template.name_any()));
        let promoted_exists = roles
            .get(None, &promoted)
            .await
            .optional()
            .map_err(|err| StepError::new(reasons::FAILED_TO_GET_CLUSTER_ROLE, err))?
            .is_some();
        if promoted_exists {
            wanted_roles.push(promoted);
        }

        let rules = membership::aggregated_rules(roles, &template.name_any()).await?;
        let access = namespace_access_role_names(&project.project, &rules);
        if access.contains(&psa_role_name(&project.project)) {
            ensure_psa_role(roles, &project.project)
                .await
                .map_err(|err| StepError::new(reasons::FAILURE_TO_CREATE_CLUSTER_ROLE_BINDING, err))?;
        }
        wanted_roles.extend(access);

        let owner_label = prtb_owner_label(&prtb.name_any());
        let desired: Vec<ClusterRoleBinding> = wanted_roles
            .iter()
            .map(|role| {
                build_named_cluster_role_binding(
                    cluster_role_ref(role),
                    subject.clone(),
                    BTreeMap::from([(owner_label.clone(), "true".to_string())]),
                )
            })
            .collect();

        sync_shared(
            &self.stores.cluster_role_bindings,
            self.retry,
            &owner_label,
            is_prtb_owner_label,
            desired,
        )
        .await
        .map_err(cluster_role_binding_failure)
    }
}

//! Reconcile handlers for RoleTemplates and their bindings.
//!
//! # Purpose
//! [`Reconciler`] exposes one `on_change`/`on_remove` pair per watched kind.
//! Each handler reads desired state from the object, compares it with the
//! derived objects in the store and writes only the difference.
//!
//! # How it fits
//! The controller calls these handlers for apply and cleanup events; tests
//! call them directly against the in-memory store. Handlers never assume the
//! store view is fresh: every write path tolerates `NotFound` and
//! `AlreadyExists`, and partial failures are repaired by the next reconcile.
//!
//! # Key invariants
//! - Derived bindings are never mutated in their roleRef or subjects; a
//!   content mismatch is delete-then-create.
//! - A derived object is deleted only when no owner label remains on it.
//! - Independent sub-steps all run; their errors are joined.
mod crtb;
mod membership;
mod namespace_access;
mod prtb;
mod role_template;
mod shared;

use crate::errors::{ErrorSet, ReconcileError, ReconcileResult};
use crate::impersonation::{Impersonator, Removing, UserResolver};
use crate::model::RoleTemplateBinding;
use crate::retry::RetryPolicy;
use crate::status::{Step, StatusReport, apply_report, reasons};
use crate::store::{ClusterStores, DynStore};
use chrono::Utc;
use k8s_openapi::api::rbac::v1::Subject;
use kube::ResourceExt;
use std::sync::Arc;

pub use namespace_access::{
    CREATE_NS_ROLE, namespace_access_role_names, psa_role_name, readonly_role_name,
};

/// A failed sub-step: the condition reason to report and the cause.
#[derive(Debug)]
pub(crate) struct StepError {
    pub reason: &'static str,
    pub source: ReconcileError,
}

impl StepError {
    pub(crate) fn new(reason: &'static str, source: impl Into<ReconcileError>) -> Self {
        Self {
            reason,
            source: source.into(),
        }
    }
}

/// Turn a sub-step outcome into its condition, keeping the error for the
/// joined result.
fn outcome(
    condition: &'static str,
    ok_reason: &'static str,
    result: Result<(), StepError>,
    errors: &mut ErrorSet,
) -> Step {
    match result {
        Ok(()) => Step::ok(condition, ok_reason),
        Err(err) => {
            let step = Step::failed(condition, err.reason, &err.source);
            errors.push(err.source);
            step
        }
    }
}

/// Handler context for one downstream cluster.
pub struct Reconciler {
    stores: ClusterStores,
    impersonator: Impersonator,
    cluster_name: String,
    retry: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        stores: ClusterStores,
        resolver: Arc<dyn UserResolver>,
        cluster_name: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        let cluster_name = cluster_name.into();
        Self {
            impersonator: Impersonator::new(stores.clone(), resolver, retry, cluster_name.clone()),
            stores,
            cluster_name,
            retry,
        }
    }

    pub fn stores(&self) -> &ClusterStores {
        &self.stores
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Bindings that target another cluster belong to another reconciler.
    fn manages<B: RoleTemplateBinding>(&self, binding: &B) -> bool {
        binding.target_cluster().as_deref() == Some(self.cluster_name.as_str())
    }

    /// Ensure the impersonator of a user subject; `None` for other subjects.
    async fn sync_impersonator(&self, subject: &Subject) -> Option<Result<(), StepError>> {
        if subject.kind != "User" {
            return None;
        }
        let result = self
            .impersonator
            .ensure(&subject.name)
            .await
            .map_err(|err| StepError::new(reasons::FAILED_TO_ENSURE_IMPERSONATOR, err));
        Some(result)
    }

    /// Tear down `user`'s impersonator unless another binding still uses it.
    async fn release_impersonator<B: RoleTemplateBinding>(&self, binding: &B) -> ReconcileResult<()> {
        let Some(user) = binding.user_name() else {
            return Ok(());
        };
        let namespace = binding.namespace().unwrap_or_default();
        let name = binding.name_any();
        self.impersonator
            .delete_if_unused(
                user,
                Removing {
                    namespace: &namespace,
                    name: &name,
                },
            )
            .await?;
        Ok(())
    }

    /// Persist `report` onto `binding` when it changes the visible status.
    async fn write_status<B>(
        &self,
        store: &DynStore<B>,
        binding: &B,
        report: &StatusReport,
    ) -> ReconcileResult<()>
    where
        B: RoleTemplateBinding,
    {
        let Some(status) = apply_report(binding.status(), report, Utc::now()) else {
            return Ok(());
        };
        let mut updated = binding.clone();
        *updated.status_mut() = status;
        // Status writes are last-writer-wins, like a status merge patch.
        updated.meta_mut().resource_version = None;
        store.update_status(&updated).await?;
        Ok(())
    }
}

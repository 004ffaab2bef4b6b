//! Binding status reporting.
//!
//! # Purpose
//! Handlers record one [`Step`] per reconciliation sub-step. [`apply_report`]
//! turns those steps into conditions and summaries on a [`BindingStatus`] and
//! reports whether anything observable changed, so the status is written back
//! only when it must be.
//!
//! # Key invariants
//! - A condition is `True` with an empty message on success and `False` with
//!   the error text on failure.
//! - `lastTransitionTime` only moves when a condition's status flips.
//! - A side summary is `Error` if any of its conditions is `False`, otherwise
//!   `Completed`. The overall summary is `Error` if either side errored,
//!   `Completed` when both sides completed, and `InProgress` otherwise.
use crate::model::BindingStatus;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const SUMMARY_COMPLETED: &str = "Completed";
pub const SUMMARY_ERROR: &str = "Error";
pub const SUMMARY_IN_PROGRESS: &str = "InProgress";

pub mod conditions {
    pub const RECONCILE_SUBJECT: &str = "ReconcileSubject";
    pub const RECONCILE_MEMBERSHIP_BINDINGS: &str = "ReconcileMembershipBindings";
    pub const RECONCILE_BINDINGS: &str = "ReconcileBindings";
    pub const RECONCILE_CLUSTER_ROLE_BINDINGS: &str = "ReconcileClusterRoleBindings";
    pub const RECONCILE_IMPERSONATOR: &str = "ReconcileImpersonator";
    pub const DELETE_CLUSTER_ROLE_BINDINGS: &str = "DeleteClusterRoleBindings";
    pub const REMOVE_ROLE_BINDINGS: &str = "RemoveRoleBindings";
}

pub mod reasons {
    pub const SUBJECT_EXISTS: &str = "SubjectExists";
    pub const CRTB_HAS_NO_SUBJECT: &str = "CRTBHasNoSubject";
    pub const PRTB_HAS_NO_SUBJECT: &str = "PRTBHasNoSubject";
    pub const MEMBERSHIP_BINDING_EXISTS: &str = "MembershipBindingExists";
    pub const FAILED_TO_GET_CLUSTER_ROLE: &str = "FailedToGetClusterRole";
    pub const FAILED_TO_CREATE_OR_UPDATE_MEMBERSHIP_BINDING: &str =
        "FailedToCreateOrUpdateMembershipBinding";
    pub const CLUSTER_ROLE_BINDING_EXISTS: &str = "ClusterRoleBindingExists";
    pub const BINDINGS_EXISTS: &str = "BindingsExists";
    pub const FAILURE_TO_BUILD_CLUSTER_ROLE_BINDING: &str = "FailureToBuildClusterRoleBinding";
    pub const FAILURE_TO_LIST_CLUSTER_ROLE_BINDINGS: &str = "FailureToListClusterRoleBindings";
    pub const FAILURE_TO_CREATE_CLUSTER_ROLE_BINDING: &str = "FailureToCreateClusterRoleBinding";
    pub const FAILURE_TO_DELETE_CLUSTER_ROLE_BINDING: &str = "FailureToDeleteClusterRoleBinding";
    pub const FAILED_TO_GET_EXISTING_ROLE_BINDINGS: &str = "FailedToGetExistingRoleBindings";
    pub const FAILED_TO_CREATE_ROLE_BINDING: &str = "FailedToCreateRoleBinding";
    pub const FAILED_TO_DELETE_ROLE_BINDING: &str = "FailedToDeleteRoleBinding";
    pub const FAILED_TO_GET_DESIRED_ROLE_BINDINGS: &str = "FailedToGetDesiredRoleBindings";
    pub const FAILED_TO_GET_NAMESPACES: &str = "FailedToGetNamespaces";
    pub const IMPERSONATOR_EXISTS: &str = "ImpersonatorExists";
    pub const FAILED_TO_ENSURE_IMPERSONATOR: &str = "FailedToEnsureImpersonator";
    pub const CLUSTER_ROLE_BINDINGS_DELETED: &str = "ClusterRoleBindingsDeleted";
    pub const ROLE_BINDINGS_DELETED: &str = "RoleBindingsDeleted";
}

/// Outcome of one reconciliation sub-step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub condition: &'static str,
    pub reason: &'static str,
    /// `None` on success.
    pub error: Option<String>,
}

impl Step {
    pub fn ok(condition: &'static str, reason: &'static str) -> Self {
        Self {
            condition,
            reason,
            error: None,
        }
    }

    pub fn failed(condition: &'static str, reason: &'static str, error: impl ToString) -> Self {
        Self {
            condition,
            reason,
            error: Some(error.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Steps gathered during one reconcile, split by where they ran.
///
/// A side left at `None` keeps the conditions already on the object.
#[derive(Debug, Default, Clone)]
pub struct StatusReport {
    pub local: Option<Vec<Step>>,
    pub remote: Option<Vec<Step>>,
}

impl StatusReport {
    pub fn local(&mut self, step: Step) {
        self.local.get_or_insert_with(Vec::new).push(step);
    }

    pub fn remote(&mut self, step: Step) {
        self.remote.get_or_insert_with(Vec::new).push(step);
    }
}

fn to_condition(step: &Step, previous: &[Condition], now: DateTime<Utc>) -> Condition {
    let status = if step.is_failure() { "False" } else { "True" };
    let last_transition_time = previous
        .iter()
        .find(|c| c.type_ == step.condition && c.status == status)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or(Time(now));
    Condition {
        type_: step.condition.to_string(),
        status: status.to_string(),
        reason: step.reason.to_string(),
        message: step.error.clone().unwrap_or_default(),
        last_transition_time,
        observed_generation: None,
    }
}

fn side_summary(conditions: &[Condition]) -> Option<String> {
    if conditions.is_empty() {
        return None;
    }
    let failed = conditions.iter().any(|c| c.status == "False");
    Some(if failed { SUMMARY_ERROR } else { SUMMARY_COMPLETED }.to_string())
}

fn overall_summary(local: Option<&str>, remote: Option<&str>) -> String {
    if local == Some(SUMMARY_ERROR) || remote == Some(SUMMARY_ERROR) {
        SUMMARY_ERROR
    } else if local == Some(SUMMARY_COMPLETED) && remote == Some(SUMMARY_COMPLETED) {
        SUMMARY_COMPLETED
    } else {
        SUMMARY_IN_PROGRESS
    }
    .to_string()
}

fn conditions_eq(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.type_ == y.type_ && x.status == y.status && x.reason == y.reason && x.message == y.message
        })
}

/// Fold `report` into `current`. Returns the new status when it differs from
/// `current` in anything but timestamps.
pub fn apply_report(
    current: Option<&BindingStatus>,
    report: &StatusReport,
    now: DateTime<Utc>,
) -> Option<BindingStatus> {
    let current = current.cloned().unwrap_or_default();
    let mut next = current.clone();

    if let Some(steps) = &report.local {
        next.local_conditions = steps
            .iter()
            .map(|step| to_condition(step, &current.local_conditions, now))
            .collect();
    }
    if let Some(steps) = &report.remote {
        next.remote_conditions = steps
            .iter()
            .map(|step| to_condition(step, &current.remote_conditions, now))
            .collect();
    }
    next.summary_local = side_summary(&next.local_conditions);
    next.summary_remote = side_summary(&next.remote_conditions);
    next.summary = Some(overall_summary(
        next.summary_local.as_deref(),
        next.summary_remote.as_deref(),
    ));

    let unchanged = conditions_eq(&next.local_conditions, &current.local_conditions)
        && conditions_eq(&next.remote_conditions, &current.remote_conditions)
        && next.summary_local == current.summary_local
        && next.summary_remote == current.summary_remote
        && next.summary == current.summary;
    if unchanged {
        return None;
    }
    next.last_update_time = Some(now.to_rfc3339());
    Some(next)
}

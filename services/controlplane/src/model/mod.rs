//! Reconciler data model.
//!
//! # Purpose
//! Defines the custom resources the reconciler consumes (RoleTemplates and the
//! two binding kinds) and the status structure it writes back onto bindings.
mod binding;
mod role_template;

pub use binding::{
    BindingStatus, ClusterRoleTemplateBinding, ClusterRoleTemplateBindingSpec,
    ProjectRoleTemplateBinding, ProjectRoleTemplateBindingSpec, RoleTemplateBinding, binding_key,
};
pub use role_template::{RoleTemplate, RoleTemplateSpec};

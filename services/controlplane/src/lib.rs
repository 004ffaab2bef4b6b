//! Role-template authorization reconciler.
//!
//! # Purpose
//! Materializes RoleTemplates into ClusterRoles and keeps the RBAC bindings
//! derived from cluster- and project-scoped template bindings in sync with
//! them, including per-user impersonation accounts and binding status.
//!
//! # How it fits
//! [`handlers::Reconciler`] holds the reconcile logic and talks to the API
//! only through [`store::ObjectStore`]. [`controller`] drives it from watch
//! events (or polling, for the in-memory backend); the binary wires config,
//! observability and storage around it.
pub mod config;
pub mod controller;
pub mod errors;
pub mod handlers;
pub mod impersonation;
pub mod model;
pub mod observability;
pub mod retry;
pub mod status;
pub mod store;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RbacError {
    #[error("binding {0} has no subject")]
    NoSubject(String),
    #[error("binding {0} names more than one subject")]
    AmbiguousSubject(String),
    #[error("invalid service account reference {0:?}, expected namespace:name")]
    InvalidServiceAccount(String),
    #[error("invalid project id {0:?}, expected cluster:project")]
    InvalidProjectId(String),
    #[error("unknown role template context {0:?}")]
    UnknownContext(String),
}

pub type RbacResult<T> = Result<T, RbacError>;

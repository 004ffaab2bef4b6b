use crate::store::StoreError;
use thiserror::Error;
use trellis_rbac::RbacError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rbac(#[from] RbacError),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
    #[error("{}", join_messages(.0))]
    Joined(Vec<ReconcileError>),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

fn join_messages(errors: &[ReconcileError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReconcileError {
    /// Collapse the failures of independent sub-steps into one result.
    pub fn join(errors: Vec<ReconcileError>) -> ReconcileResult<()> {
        let mut errors: Vec<ReconcileError> = errors
            .into_iter()
            .flat_map(|err| match err {
                ReconcileError::Joined(inner) => inner,
                other => vec![other],
            })
            .collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ReconcileError::Joined(errors)),
        }
    }
}

/// Accumulates sub-step failures without stopping at the first one.
#[derive(Debug, Default)]
pub struct ErrorSet {
    errors: Vec<ReconcileError>,
}

impl ErrorSet {
    pub fn push(&mut self, err: impl Into<ReconcileError>) {
        self.errors.push(err.into());
    }

    /// Keep the value on success, record the error otherwise.
    pub fn check<T, E: Into<ReconcileError>>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.push(err);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(self) -> ReconcileResult<()> {
        ReconcileError::join(self.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_of_nothing_is_ok() {
        assert!(ReconcileError::join(Vec::new()).is_ok());
    }

    #[test]
    fn join_of_one_is_that_error() {
        let err = ReconcileError::join(vec![ReconcileError::Invalid("bad".to_string())])
            .expect_err("error");
        assert!(matches!(err, ReconcileError::Invalid(_)));
    }

    #[test]
    fn join_flattens_and_lists_every_message() {
        let nested = ReconcileError::Joined(vec![
            ReconcileError::Invalid("a".to_string()),
            ReconcileError::Invalid("b".to_string()),
        ]);
        let err = ReconcileError::join(vec![nested, ReconcileError::Invalid("c".to_string())])
            .expect_err("error");
        match &err {
            ReconcileError::Joined(inner) => assert_eq!(inner.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.to_string(), "a; b; c");
    }

    #[test]
    fn error_set_collects_failures() {
        let mut errors = ErrorSet::default();
        let kept: Option<u8> = errors.check(Ok::<u8, ReconcileError>(1));
        assert_eq!(kept, Some(1));
        errors.check(Err::<u8, _>(RbacError::UnknownContext("x".to_string())));
        assert!(!errors.is_empty());
        assert!(errors.finish().is_err());
    }
}

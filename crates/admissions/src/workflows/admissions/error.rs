use serde::Serialize;

use super::documents::DocumentStorageError;
use super::domain::InvalidTransition;
use super::payments::{EventError, GatewayError};
use super::store::StoreError;

/// Machine-readable error classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    Conflict,
    PreconditionFailed,
    InvalidSignature,
    NotFound,
    ExternalDependencyError,
    IntegrityFailure,
}

impl ErrorKind {
    pub const fn label(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Conflict => "conflict",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ExternalDependencyError => "external_dependency_error",
            ErrorKind::IntegrityFailure => "integrity_failure",
        }
    }

    /// Whether repeating the same call may succeed.
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorKind::ExternalDependencyError | ErrorKind::IntegrityFailure
        )
    }
}

/// Error raised by every admissions operation.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionsError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0}")]
    PreconditionFailed(String),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("{0} not found")]
    NotFound(String),
    #[error("sequence {scope} is exhausted")]
    SequenceExhausted { scope: String },
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Documents(#[from] DocumentStorageError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdmissionsError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AdmissionsError::Validation(_) => ErrorKind::ValidationError,
            AdmissionsError::Conflict(_) | AdmissionsError::AlreadyExists(_) => ErrorKind::Conflict,
            AdmissionsError::PreconditionFailed(_) | AdmissionsError::InvalidTransition(_) => {
                ErrorKind::PreconditionFailed
            }
            AdmissionsError::NotFound(_) => ErrorKind::NotFound,
            AdmissionsError::SequenceExhausted { .. } => ErrorKind::IntegrityFailure,
            AdmissionsError::Event(EventError::Malformed(_)) => ErrorKind::ValidationError,
            AdmissionsError::Event(_) => ErrorKind::InvalidSignature,
            AdmissionsError::Gateway(_) | AdmissionsError::Documents(_) => {
                ErrorKind::ExternalDependencyError
            }
            AdmissionsError::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            AdmissionsError::Store(_) => ErrorKind::IntegrityFailure,
        }
    }
}

pub type AdmissionsResult<T> = Result<T, AdmissionsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::admissions::domain::ApplicantStatus;

    #[test]
    fn invalid_transition_reports_precondition_failed() {
        let err: AdmissionsError = ApplicantStatus::Enrolled
            .transition(ApplicantStatus::Rejected)
            .expect_err("enrolled is terminal")
            .into();
        assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
        assert!(!err.kind().is_retriable());
    }

    #[test]
    fn store_failures_are_retriable_integrity_failures() {
        let err = AdmissionsError::from(StoreError::Unavailable("disk".to_string()));
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
        assert!(err.kind().is_retriable());
        assert_eq!(err.kind().label(), "integrity_failure");
    }

    #[test]
    fn signature_and_payload_errors_are_classified_separately() {
        let bad_signature = AdmissionsError::from(EventError::SignatureMismatch);
        let bad_payload = AdmissionsError::from(EventError::Malformed("eof".to_string()));
        assert_eq!(bad_signature.kind(), ErrorKind::InvalidSignature);
        assert_eq!(bad_payload.kind(), ErrorKind::ValidationError);
    }
}

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Status codes shared by the backend, the streams and the local engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
        }
    }

    /// The code without the `firestore/` prefix, e.g. `"permission-denied"`.
    pub fn name(&self) -> &'static str {
        let full = self.as_str();
        full.strip_prefix("firestore/").unwrap_or(full)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [FirestoreErrorCode; 16] = [
            FirestoreErrorCode::Cancelled,
            FirestoreErrorCode::Unknown,
            FirestoreErrorCode::InvalidArgument,
            FirestoreErrorCode::DeadlineExceeded,
            FirestoreErrorCode::NotFound,
            FirestoreErrorCode::AlreadyExists,
            FirestoreErrorCode::PermissionDenied,
            FirestoreErrorCode::Unauthenticated,
            FirestoreErrorCode::ResourceExhausted,
            FirestoreErrorCode::FailedPrecondition,
            FirestoreErrorCode::Aborted,
            FirestoreErrorCode::OutOfRange,
            FirestoreErrorCode::Unimplemented,
            FirestoreErrorCode::Internal,
            FirestoreErrorCode::Unavailable,
            FirestoreErrorCode::DataLoss,
        ];
        ALL.into_iter().find(|code| code.name() == name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
    transaction_failure: bool,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            transaction_failure: false,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for failures of the storage backend that a later retry may fix.
    pub fn is_persistence_transaction_error(&self) -> bool {
        self.transaction_failure
    }

    pub fn is_primary_lease_lost(&self) -> bool {
        self.code == FirestoreErrorCode::FailedPrecondition
            && self.message == PRIMARY_LEASE_LOST_ERROR_MSG
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current tab is not in the required state to perform this operation. \
     It might be necessary to refresh the browser tab.";

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn unknown(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unknown, message)
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn already_exists(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::AlreadyExists, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

/// A storage transaction failed for a reason unrelated to the operation itself.
pub fn persistence_transaction_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError {
        code: FirestoreErrorCode::Unavailable,
        message: message.into(),
        transaction_failure: true,
    }
}

pub fn primary_lease_lost() -> FirestoreError {
    failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG)
}

/// Swallows the error raised when this client loses its primary lease while
/// running a primary-only operation. Everything else is passed through.
pub fn ignore_if_primary_lease_loss(result: FirestoreResult<()>) -> FirestoreResult<()> {
    match result {
        Err(err) if err.is_primary_lease_lost() => {
            log::debug!("Persistence: unexpectedly lost primary lease");
            Ok(())
        }
        other => other,
    }
}

/// Error handed to user callbacks. Transient storage failures become
/// `Unavailable` with `message` as context.
pub fn wrap_in_user_error_if_recoverable(error: FirestoreError, message: &str) -> FirestoreError {
    if error.is_persistence_transaction_error() {
        unavailable(format!("{message}: {}", error.message))
    } else {
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_become_unavailable() {
        let wrapped = wrap_in_user_error_if_recoverable(
            persistence_transaction_error("disk full"),
            "Failed to persist write",
        );
        assert_eq!(wrapped.code, FirestoreErrorCode::Unavailable);
        assert!(!wrapped.is_persistence_transaction_error());
        assert_eq!(wrapped.message(), "Failed to persist write: disk full");

        let passthrough = wrap_in_user_error_if_recoverable(aborted("x"), "ignored");
        assert_eq!(passthrough.code, FirestoreErrorCode::Aborted);
    }

    #[test]
    fn display_includes_code() {
        let err = aborted("conflict");
        assert_eq!(err.to_string(), "conflict (firestore/aborted)");
        assert_eq!(err.message(), "conflict");
    }

    #[test]
    fn transaction_errors_are_flagged() {
        let err = persistence_transaction_error("disk full");
        assert!(err.is_persistence_transaction_error());
        assert!(!unavailable("offline").is_persistence_transaction_error());
    }

    #[test]
    fn only_lease_loss_is_ignored() {
        assert!(ignore_if_primary_lease_loss(Err(primary_lease_lost())).is_ok());
        let other = ignore_if_primary_lease_loss(Err(failed_precondition("missing index")));
        assert_eq!(other.unwrap_err().code, FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn code_names_round_trip() {
        assert_eq!(FirestoreErrorCode::PermissionDenied.name(), "permission-denied");
        assert_eq!(
            FirestoreErrorCode::from_name("data-loss"),
            Some(FirestoreErrorCode::DataLoss)
        );
        assert_eq!(FirestoreErrorCode::from_name("bogus"), None);
    }
}

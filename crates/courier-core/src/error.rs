use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("storage")]
    Storage,
    #[error("validation {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("timeout")]
    Timeout,
}

/// Classification of a job failure. Retry policy is a pure function of this
/// kind, never of the concrete error type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network unreachable, server 5xx. Re-enqueued with backoff.
    RetryableTransient,
    /// A local precondition (e.g. pending migration) is not met yet.
    /// Re-enqueued without consuming a retry attempt.
    RetryablePrecondition,
    /// Corrupt content, unsupported version, identity mismatch. Terminal.
    PermanentContent,
    /// Impossible state. Never retried, never expected.
    Fatal,
}

pub fn should_retry(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::RetryableTransient | ErrorKind::RetryablePrecondition
    )
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("precondition: {0}")]
    Precondition(String),
    #[error("permanent: {0}")]
    Permanent(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Transient(_) => ErrorKind::RetryableTransient,
            JobError::Precondition(_) => ErrorKind::RetryablePrecondition,
            JobError::Permanent(_) => ErrorKind::PermanentContent,
            JobError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Outcome of attempting to decrypt an incoming envelope. Returned, not
/// thrown, so the receive pipeline can map each variant to its placeholder.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DecryptError {
    #[error("invalid protocol version")]
    InvalidVersion,
    #[error("corrupt ciphertext")]
    Corrupt,
    #[error("no session")]
    NoSession,
    #[error("legacy protocol version")]
    Legacy,
    #[error("duplicate message")]
    Duplicate,
    #[error("unsupported data message")]
    Unsupported,
    #[error("self send")]
    SelfSend,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io")]
    Io,
    #[error("codec")]
    Codec,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_is_pure() {
        assert!(should_retry(ErrorKind::RetryableTransient));
        assert!(should_retry(ErrorKind::RetryablePrecondition));
        assert!(!should_retry(ErrorKind::PermanentContent));
        assert!(!should_retry(ErrorKind::Fatal));
    }

    #[test]
    fn job_error_maps_to_kind() {
        assert_eq!(
            JobError::Transient("net".to_string()).kind(),
            ErrorKind::RetryableTransient
        );
        assert_eq!(
            JobError::Precondition("migration".to_string()).kind(),
            ErrorKind::RetryablePrecondition
        );
        assert_eq!(
            JobError::Permanent("corrupt".to_string()).kind(),
            ErrorKind::PermanentContent
        );
    }
}

//! Error types for the attestation core.

use thiserror::Error;

/// Result type alias for attestation operations.
pub type Result<T> = std::result::Result<T, AttestError>;

/// Which continuity check a re-verifying device failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MismatchKind {
    /// Device is pinned to a different account.
    Owner,
    /// A pinned-immutable field (root, certificates, security level)
    /// changed.
    Pinning,
    /// A monotonic counter went backwards.
    Downgrade,
}

impl std::fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MismatchKind::Owner => write!(f, "owner"),
            MismatchKind::Pinning => write!(f, "pinning"),
            MismatchKind::Downgrade => write!(f, "downgrade"),
        }
    }
}

/// Error kinds surfaced by the attestation core. Mapping to HTTP status
/// codes happens at the ingress boundary only.
#[derive(Error, Debug)]
pub enum AttestError {
    /// Request body or attestation bundle does not decode.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Missing/invalid session or subscribe key mismatch.
    #[error("authentication failed")]
    Unauthenticated,

    /// Challenge nonce absent from the index or expired.
    #[error("stale or unknown challenge")]
    StaleChallenge,

    /// Verified-boot key not present in the fingerprint catalogue.
    #[error("unknown device")]
    UnknownDevice,

    /// Continuity check failed in the pinning store.
    #[error("pinning mismatch: {0}")]
    Mismatch(MismatchKind),

    /// Device was soft-deleted by its owner.
    #[error("device has been deleted")]
    Revoked,

    /// Request body exceeded its size cap.
    #[error("request body too large")]
    TooLarge,

    /// Unique constraint violation (username already taken).
    #[error("already exists")]
    Conflict,

    /// Database busy/locked past the retry. Internal kind; surfaces as
    /// an unhandled fault at the ingress boundary.
    #[error("database busy")]
    Busy,

    /// Any unexpected fault. Detail is logged, never sent to clients.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AttestError {
    /// True for the terminal verification failures that must never be
    /// retried by the server.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            AttestError::StaleChallenge
                | AttestError::UnknownDevice
                | AttestError::Mismatch(_)
                | AttestError::Revoked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_display() {
        assert_eq!(
            AttestError::Mismatch(MismatchKind::Downgrade).to_string(),
            "pinning mismatch: downgrade"
        );
    }

    #[test]
    fn verification_failures_classified() {
        assert!(AttestError::StaleChallenge.is_verification_failure());
        assert!(AttestError::Revoked.is_verification_failure());
        assert!(!AttestError::Conflict.is_verification_failure());
        assert!(!AttestError::Internal("x".into()).is_verification_failure());
    }
}

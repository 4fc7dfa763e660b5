//! auditord-types -- shared types for the auditord attestation server.
//!
//! Leaf crate holding the error type, protocol constants and the
//! normalized report/outcome types exchanged between the verifier,
//! the pinning store and the ingress layer.

pub mod constants;
pub mod error;
pub mod report;

pub use constants::*;
pub use error::{AttestError, MismatchKind, Result};
pub use report::{AttestationReport, AuditorState, Outcome, SecurityLevel};

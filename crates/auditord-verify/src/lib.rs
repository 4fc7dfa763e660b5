//! auditord-verify -- the attestation verification pipeline.
//!
//! Takes a serialized auditor bundle (framing byte, device state, four
//! DER certificates) and produces a normalized [`AttestationReport`]:
//!
//! 1. framing and size checks ([`chain::decode_message`])
//! 2. X.509 chain parse and per-link signature verification, rooted at
//!    the pinned vendor attestation key ([`chain::verify_chain`])
//! 3. keystore attestation extension extraction ([`extension`])
//! 4. challenge binding against the one-shot index ([`challenge`])
//! 5. fingerprint derivation and catalogue lookup ([`catalogue`])
//!
//! The pipeline holds no per-request state; the challenge index is the
//! only shared structure and is safe under concurrent callers.

pub mod catalogue;
pub mod challenge;
pub mod chain;
mod der;
pub mod extension;
pub mod verifier;

pub use auditord_types::AttestationReport;
pub use catalogue::{DeviceInfo, OsVariant};
pub use challenge::ChallengeIndex;
pub use verifier::Verifier;

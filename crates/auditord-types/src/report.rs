//! Normalized attestation report and pinning outcome types.

use serde::{Deserialize, Serialize};

/// Keystore security level of the attestation key.
///
/// The discriminants are the stored representation; software-backed
/// keystores are rejected before a report is ever built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Trusted execution environment keystore.
    Tee = 1,
    /// Discrete secure element ("StrongBox").
    StrongBox = 2,
}

impl SecurityLevel {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(SecurityLevel::Tee),
            2 => Some(SecurityLevel::StrongBox),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// OS-enforced state captured by the auditor app and carried in the
/// attestation bundle alongside the certificate chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditorState {
    pub user_profile_secure: bool,
    pub enrolled_biometrics: bool,
    pub accessibility: bool,
    pub adb_enabled: bool,
    pub add_users_when_locked: bool,
    pub deny_new_usb: bool,
    pub oem_unlock_allowed: bool,
    pub system_user: bool,
    /// 0 = none, 1 = non-system device admin, 2 = system device admin.
    pub device_admin: u8,
}

/// Normalized output of a successful verification, handed to the
/// pinning store.
#[derive(Clone, Debug)]
pub struct AttestationReport {
    /// Persistent device identifier: SHA-256 of the second-to-root
    /// certificate's SubjectPublicKeyInfo.
    pub fingerprint: [u8; 32],
    /// The consumed challenge nonce.
    pub challenge: [u8; 32],
    /// DER certificates along the chain, leaf first.
    pub chain: Vec<Vec<u8>>,
    /// Digest of the verified-boot public key; catalogue key.
    pub verified_boot_key: [u8; 32],
    /// Per-boot measurement, when the device reports one.
    pub verified_boot_hash: Option<[u8; 32]>,
    pub security_level: SecurityLevel,
    pub os_version: i64,
    pub os_patch_level: i64,
    pub vendor_patch_level: Option<i64>,
    pub boot_patch_level: Option<i64>,
    pub app_version: i64,
    pub state: AuditorState,
    /// Catalogue identity resolved from the verified-boot key.
    pub device_name: &'static str,
    pub os_name: &'static str,
    /// Human-readable summaries of the TEE- and OS-enforced attribute
    /// sets, persisted verbatim with each history row.
    pub tee_enforced: String,
    pub os_enforced: String,
}

/// Result of recording a report against the pinning store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// First sighting of the fingerprint; the device was pinned.
    Enrolled,
    /// Continuity checks passed and the record was advanced.
    Verified,
}

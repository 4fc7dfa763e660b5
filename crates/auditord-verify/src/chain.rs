//! Auditor message framing and X.509 chain validation.
//!
//! Wire layout of an attestation bundle (big-endian):
//!
//! ```text
//! offset 0      protocol version  u8
//! offset 1      state flags       u8
//! offset 2      deviceAdmin       u8   (0, 1, 2)
//! offset 3..7   appVersion        u32
//! offset 7      certificate count u8   (must be 4: leaf..root)
//! then per certificate: u16 DER length || DER bytes
//! ```
//!
//! Unknown versions, out-of-range declared lengths, trailing bytes and
//! wrong chain lengths all fail closed.

use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use auditord_types::{
    AttestError, AuditorState, Result, CHAIN_LENGTH, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};

const FLAG_USER_PROFILE_SECURE: u8 = 1 << 0;
const FLAG_ENROLLED_BIOMETRICS: u8 = 1 << 1;
const FLAG_ACCESSIBILITY: u8 = 1 << 2;
const FLAG_ADB_ENABLED: u8 = 1 << 3;
const FLAG_ADD_USERS_WHEN_LOCKED: u8 = 1 << 4;
const FLAG_DENY_NEW_USB: u8 = 1 << 5;
const FLAG_OEM_UNLOCK_ALLOWED: u8 = 1 << 6;
const FLAG_SYSTEM_USER: u8 = 1 << 7;

const HEADER_SIZE: usize = 8;

/// OID of the keystore attestation extension in the leaf certificate.
pub const ATTESTATION_EXTENSION_OID: &str = "1.3.6.1.4.1.11129.2.1.17";

/// Decoded framing of an attestation bundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditorMessage {
    pub state: AuditorState,
    pub app_version: i64,
    /// DER certificates, leaf first, root last.
    pub certificates: Vec<Vec<u8>>,
}

/// Decode the auditor framing. Content of the certificates is not
/// interpreted here.
pub fn decode_message(data: &[u8]) -> Result<AuditorMessage> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(AttestError::TooLarge);
    }
    if data.len() < HEADER_SIZE {
        return Err(AttestError::Malformed("truncated attestation header".into()));
    }
    if data[0] != PROTOCOL_VERSION {
        return Err(AttestError::Malformed(format!(
            "unsupported protocol version {}",
            data[0]
        )));
    }

    let flags = data[1];
    let device_admin = data[2];
    if device_admin > 2 {
        return Err(AttestError::Malformed("bad deviceAdmin value".into()));
    }
    let app_version = i64::from(u32::from_be_bytes([data[3], data[4], data[5], data[6]]));
    let count = usize::from(data[7]);
    if count != CHAIN_LENGTH {
        return Err(AttestError::Malformed(format!(
            "expected {CHAIN_LENGTH} certificates, got {count}"
        )));
    }

    let mut certificates = Vec::with_capacity(count);
    let mut pos = HEADER_SIZE;
    for _ in 0..count {
        let len_end = pos
            .checked_add(2)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| AttestError::Malformed("truncated certificate length".into()))?;
        let declared = usize::from(u16::from_be_bytes([data[pos], data[pos + 1]]));
        if declared == 0 {
            return Err(AttestError::Malformed("empty certificate".into()));
        }
        let end = len_end
            .checked_add(declared)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| AttestError::Malformed("certificate length out of range".into()))?;
        certificates.push(data[len_end..end].to_vec());
        pos = end;
    }
    if pos != data.len() {
        return Err(AttestError::Malformed("trailing bytes after chain".into()));
    }

    let state = AuditorState {
        user_profile_secure: flags & FLAG_USER_PROFILE_SECURE != 0,
        enrolled_biometrics: flags & FLAG_ENROLLED_BIOMETRICS != 0,
        accessibility: flags & FLAG_ACCESSIBILITY != 0,
        adb_enabled: flags & FLAG_ADB_ENABLED != 0,
        add_users_when_locked: flags & FLAG_ADD_USERS_WHEN_LOCKED != 0,
        deny_new_usb: flags & FLAG_DENY_NEW_USB != 0,
        oem_unlock_allowed: flags & FLAG_OEM_UNLOCK_ALLOWED != 0,
        system_user: flags & FLAG_SYSTEM_USER != 0,
        device_admin,
    };

    Ok(AuditorMessage {
        state,
        app_version,
        certificates,
    })
}

/// Encode an attestation bundle. Used by client tooling and tests; the
/// server only ever decodes.
pub fn encode_message(state: &AuditorState, app_version: i64, certificates: &[Vec<u8>]) -> Vec<u8> {
    let mut flags = 0u8;
    if state.user_profile_secure {
        flags |= FLAG_USER_PROFILE_SECURE;
    }
    if state.enrolled_biometrics {
        flags |= FLAG_ENROLLED_BIOMETRICS;
    }
    if state.accessibility {
        flags |= FLAG_ACCESSIBILITY;
    }
    if state.adb_enabled {
        flags |= FLAG_ADB_ENABLED;
    }
    if state.add_users_when_locked {
        flags |= FLAG_ADD_USERS_WHEN_LOCKED;
    }
    if state.deny_new_usb {
        flags |= FLAG_DENY_NEW_USB;
    }
    if state.oem_unlock_allowed {
        flags |= FLAG_OEM_UNLOCK_ALLOWED;
    }
    if state.system_user {
        flags |= FLAG_SYSTEM_USER;
    }

    let mut out = vec![PROTOCOL_VERSION, flags, state.device_admin];
    out.extend_from_slice(&(app_version as u32).to_be_bytes());
    out.push(certificates.len() as u8);
    for cert in certificates {
        out.extend_from_slice(&(cert.len() as u16).to_be_bytes());
        out.extend_from_slice(cert);
    }
    out
}

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|_| AttestError::Malformed("certificate does not parse".into()))
}

/// Verify signatures and validity along the chain and pin the root.
///
/// Every certificate must be signed by its successor, the root by
/// itself, and the root's SubjectPublicKeyInfo must match the vendor
/// attestation key built into the server. Validity windows are checked
/// at `now_ms`.
pub fn verify_chain(certificates: &[Vec<u8>], vendor_root_spki: &[u8], now_ms: i64) -> Result<()> {
    let parsed: Vec<X509Certificate<'_>> = certificates
        .iter()
        .map(|der| parse_certificate(der))
        .collect::<Result<_>>()?;
    if parsed.len() < 2 {
        return Err(AttestError::Malformed("chain too short".into()));
    }

    let now_secs = now_ms / 1000;
    for cert in &parsed {
        let validity = cert.validity();
        if now_secs < validity.not_before.timestamp() || now_secs > validity.not_after.timestamp() {
            return Err(AttestError::Malformed("certificate outside validity window".into()));
        }
    }

    for (cert, issuer) in parsed.iter().zip(parsed.iter().skip(1)) {
        cert.verify_signature(Some(issuer.public_key()))
            .map_err(|_| AttestError::Malformed("certificate signature invalid".into()))?;
    }

    let root = parsed.last().expect("checked length above");
    root.verify_signature(Some(root.public_key()))
        .map_err(|_| AttestError::Malformed("root signature invalid".into()))?;
    if root.public_key().raw != vendor_root_spki {
        return Err(AttestError::Malformed("root is not the vendor attestation root".into()));
    }

    Ok(())
}

/// Raw SubjectPublicKeyInfo bytes of a certificate.
pub fn public_key_of(der: &[u8]) -> Result<Vec<u8>> {
    Ok(parse_certificate(der)?.public_key().raw.to_vec())
}

/// Persistent device fingerprint: SHA-256 of the second-to-root
/// certificate's SubjectPublicKeyInfo. That key is the device's batched
/// attestation key, stable across factory-reset-free reboots.
pub fn device_fingerprint(certificates: &[Vec<u8>]) -> Result<[u8; 32]> {
    let index = certificates
        .len()
        .checked_sub(2)
        .ok_or_else(|| AttestError::Malformed("chain too short".into()))?;
    let spki = public_key_of(&certificates[index])?;
    Ok(Sha256::digest(&spki).into())
}

/// Extract the keystore attestation extension payload from the leaf.
pub fn attestation_extension(leaf_der: &[u8]) -> Result<Vec<u8>> {
    let leaf = parse_certificate(leaf_der)?;
    let ext = leaf
        .extensions()
        .iter()
        .find(|ext| ext.oid.to_id_string() == ATTESTATION_EXTENSION_OID)
        .ok_or_else(|| AttestError::Malformed("attestation extension missing".into()))?;
    Ok(ext.value.to_vec())
}

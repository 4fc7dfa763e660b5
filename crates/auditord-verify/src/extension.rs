//! Keystore attestation extension parsing.
//!
//! The leaf certificate carries a KeyDescription structure under OID
//! 1.3.6.1.4.1.11129.2.1.17:
//!
//! ```text
//! KeyDescription ::= SEQUENCE {
//!     attestationVersion        INTEGER,
//!     attestationSecurityLevel  ENUMERATED,   -- 0 sw, 1 TEE, 2 StrongBox
//!     keymasterVersion          INTEGER,
//!     keymasterSecurityLevel    ENUMERATED,
//!     attestationChallenge      OCTET STRING,
//!     uniqueId                  OCTET STRING,
//!     softwareEnforced          AuthorizationList,
//!     teeEnforced               AuthorizationList }
//!
//! AuthorizationList ::= SEQUENCE {
//!     rootOfTrust              [704] EXPLICIT RootOfTrust OPTIONAL,
//!     osVersion                [705] EXPLICIT INTEGER OPTIONAL,
//!     osPatchLevel             [706] EXPLICIT INTEGER OPTIONAL,
//!     attestationApplicationId [709] EXPLICIT OCTET STRING OPTIONAL,
//!     vendorPatchLevel         [718] EXPLICIT INTEGER OPTIONAL,
//!     bootPatchLevel           [719] EXPLICIT INTEGER OPTIONAL }
//!
//! RootOfTrust ::= SEQUENCE {
//!     verifiedBootKey    OCTET STRING,
//!     deviceLocked       BOOLEAN,
//!     verifiedBootState  ENUMERATED,
//!     verifiedBootHash   OCTET STRING OPTIONAL }
//! ```
//!
//! Unknown authorization tags are skipped; missing optional fields stay
//! absent rather than defaulting to zero.

use auditord_types::{AttestError, Result};

use crate::der::{
    decode_boolean, decode_integer, DerHeader, DerReader, CLASS_CONTEXT, CLASS_UNIVERSAL,
    TAG_BOOLEAN, TAG_ENUMERATED, TAG_INTEGER, TAG_OCTET_STRING, TAG_SEQUENCE,
};

pub const TAG_ROOT_OF_TRUST: u32 = 704;
pub const TAG_OS_VERSION: u32 = 705;
pub const TAG_OS_PATCH_LEVEL: u32 = 706;
pub const TAG_ATTESTATION_APPLICATION_ID: u32 = 709;
pub const TAG_VENDOR_PATCH_LEVEL: u32 = 718;
pub const TAG_BOOT_PATCH_LEVEL: u32 = 719;

pub const SECURITY_LEVEL_SOFTWARE: i64 = 0;
pub const SECURITY_LEVEL_TEE: i64 = 1;
pub const SECURITY_LEVEL_STRONGBOX: i64 = 2;

/// What the bootloader reported verifying at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifiedBootState {
    Verified,
    SelfSigned,
    Unverified,
    Failed,
}

impl VerifiedBootState {
    fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(VerifiedBootState::Verified),
            1 => Ok(VerifiedBootState::SelfSigned),
            2 => Ok(VerifiedBootState::Unverified),
            3 => Ok(VerifiedBootState::Failed),
            _ => Err(AttestError::Malformed("bad verified boot state".into())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VerifiedBootState::Verified => "verified",
            VerifiedBootState::SelfSigned => "self-signed",
            VerifiedBootState::Unverified => "unverified",
            VerifiedBootState::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootOfTrust {
    pub verified_boot_key: [u8; 32],
    pub device_locked: bool,
    pub verified_boot_state: VerifiedBootState,
    pub verified_boot_hash: Option<[u8; 32]>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthorizationList {
    pub root_of_trust: Option<RootOfTrust>,
    pub os_version: Option<i64>,
    pub os_patch_level: Option<i64>,
    pub attestation_application_id: Option<Vec<u8>>,
    pub vendor_patch_level: Option<i64>,
    pub boot_patch_level: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDescription {
    pub attestation_version: i64,
    pub attestation_security_level: i64,
    pub keymaster_version: i64,
    pub keymaster_security_level: i64,
    pub challenge: Vec<u8>,
    pub unique_id: Vec<u8>,
    pub software_enforced: AuthorizationList,
    pub tee_enforced: AuthorizationList,
}

fn expect(header: DerHeader, class: u8, tag: u32, what: &str) -> Result<()> {
    if header.class != class || header.tag != tag {
        return Err(AttestError::Malformed(format!("expected {what}")));
    }
    Ok(())
}

fn read_universal<'a>(reader: &mut DerReader<'a>, tag: u32, what: &str) -> Result<&'a [u8]> {
    let (header, value) = reader.read_tlv()?;
    expect(header, CLASS_UNIVERSAL, tag, what)?;
    Ok(value)
}

/// Parse the full extension payload.
pub fn parse_key_description(data: &[u8]) -> Result<KeyDescription> {
    let mut outer = DerReader::new(data);
    let (header, body) = outer.read_tlv()?;
    expect(header, CLASS_UNIVERSAL, TAG_SEQUENCE, "KeyDescription sequence")?;
    if !outer.is_empty() {
        return Err(AttestError::Malformed("trailing bytes after KeyDescription".into()));
    }

    let mut reader = DerReader::new(body);
    let attestation_version = decode_integer(read_universal(&mut reader, TAG_INTEGER, "attestationVersion")?)?;
    let attestation_security_level =
        decode_integer(read_universal(&mut reader, TAG_ENUMERATED, "attestationSecurityLevel")?)?;
    let keymaster_version = decode_integer(read_universal(&mut reader, TAG_INTEGER, "keymasterVersion")?)?;
    let keymaster_security_level =
        decode_integer(read_universal(&mut reader, TAG_ENUMERATED, "keymasterSecurityLevel")?)?;
    let challenge = read_universal(&mut reader, TAG_OCTET_STRING, "attestationChallenge")?.to_vec();
    let unique_id = read_universal(&mut reader, TAG_OCTET_STRING, "uniqueId")?.to_vec();
    let software_enforced =
        parse_authorization_list(read_universal(&mut reader, TAG_SEQUENCE, "softwareEnforced")?)?;
    let tee_enforced =
        parse_authorization_list(read_universal(&mut reader, TAG_SEQUENCE, "teeEnforced")?)?;

    Ok(KeyDescription {
        attestation_version,
        attestation_security_level,
        keymaster_version,
        keymaster_security_level,
        challenge,
        unique_id,
        software_enforced,
        tee_enforced,
    })
}

fn parse_authorization_list(body: &[u8]) -> Result<AuthorizationList> {
    let mut list = AuthorizationList::default();
    let mut reader = DerReader::new(body);

    while !reader.is_empty() {
        let (header, value) = reader.read_tlv()?;
        if header.class != CLASS_CONTEXT {
            return Err(AttestError::Malformed("bad authorization entry class".into()));
        }
        match header.tag {
            TAG_ROOT_OF_TRUST => {
                let inner = read_explicit(value, TAG_SEQUENCE, "rootOfTrust")?;
                list.root_of_trust = Some(parse_root_of_trust(inner)?);
            }
            TAG_OS_VERSION => {
                list.os_version = Some(decode_integer(read_explicit(value, TAG_INTEGER, "osVersion")?)?);
            }
            TAG_OS_PATCH_LEVEL => {
                list.os_patch_level =
                    Some(decode_integer(read_explicit(value, TAG_INTEGER, "osPatchLevel")?)?);
            }
            TAG_ATTESTATION_APPLICATION_ID => {
                list.attestation_application_id =
                    Some(read_explicit(value, TAG_OCTET_STRING, "attestationApplicationId")?.to_vec());
            }
            TAG_VENDOR_PATCH_LEVEL => {
                list.vendor_patch_level =
                    Some(decode_integer(read_explicit(value, TAG_INTEGER, "vendorPatchLevel")?)?);
            }
            TAG_BOOT_PATCH_LEVEL => {
                list.boot_patch_level =
                    Some(decode_integer(read_explicit(value, TAG_INTEGER, "bootPatchLevel")?)?);
            }
            // Keymint emits many tags this server does not consume.
            _ => {}
        }
    }

    Ok(list)
}

/// Unwrap the EXPLICIT inner TLV of a context-tagged value.
fn read_explicit<'a>(value: &'a [u8], tag: u32, what: &str) -> Result<&'a [u8]> {
    let mut reader = DerReader::new(value);
    let (header, inner) = reader.read_tlv()?;
    expect(header, CLASS_UNIVERSAL, tag, what)?;
    if !reader.is_empty() {
        return Err(AttestError::Malformed(format!("trailing bytes in {what}")));
    }
    Ok(inner)
}

fn parse_root_of_trust(body: &[u8]) -> Result<RootOfTrust> {
    let mut reader = DerReader::new(body);
    let key = read_universal(&mut reader, TAG_OCTET_STRING, "verifiedBootKey")?;
    let verified_boot_key = digest32(key, "verifiedBootKey")?;
    let device_locked = decode_boolean(read_universal(&mut reader, TAG_BOOLEAN, "deviceLocked")?)?;
    let verified_boot_state =
        VerifiedBootState::from_i64(decode_integer(read_universal(&mut reader, TAG_ENUMERATED, "verifiedBootState")?)?)?;
    let verified_boot_hash = if reader.is_empty() {
        None
    } else {
        Some(digest32(read_universal(&mut reader, TAG_OCTET_STRING, "verifiedBootHash")?, "verifiedBootHash")?)
    };

    Ok(RootOfTrust {
        verified_boot_key,
        device_locked,
        verified_boot_state,
        verified_boot_hash,
    })
}

fn digest32(bytes: &[u8], what: &str) -> Result<[u8; 32]> {
    <[u8; 32]>::try_from(bytes)
        .map_err(|_| AttestError::Malformed(format!("{what} must be 32 bytes")))
}

//! The attestation verification pipeline.
//!
//! Stateless across requests; the challenge index is the only shared
//! structure. Order matters: the challenge is consumed only after the
//! chain has been cryptographically validated, so malformed or forged
//! bundles cannot burn an outstanding nonce.

use std::sync::Arc;

use serde::Serialize;

use auditord_types::{
    AttestError, AttestationReport, AuditorState, Result, SecurityLevel, CHALLENGE_LENGTH,
};

use crate::catalogue::{self, OsVariant};
use crate::challenge::ChallengeIndex;
use crate::chain;
use crate::extension::{
    self, VerifiedBootState, SECURITY_LEVEL_STRONGBOX, SECURITY_LEVEL_TEE,
};

/// SubjectPublicKeyInfo (DER) of the vendor attestation root key.
/// Deployments tracking a different vendor inject their own through
/// [`Verifier::new`].
const VENDOR_ROOT_SPKI_HEX: &str = "3059301306072a8648ce3d020106082a8648ce3d03010703420004\
7c61e4afd2b91304857c250e2c18bba3d0a4c67d0b39ef1840cc35a98b7d2f63\
9b415d80e7c2a6f1503db92adc608d11f94e27c8305f16ab49d2c7e30196fd84";

/// Verifies serialized attestation bundles into normalized reports.
pub struct Verifier {
    vendor_root_spki: Vec<u8>,
    challenges: Arc<ChallengeIndex>,
}

impl Verifier {
    /// Verifier pinned to an explicit vendor root key.
    pub fn new(vendor_root_spki: Vec<u8>, challenges: Arc<ChallengeIndex>) -> Self {
        Self {
            vendor_root_spki,
            challenges,
        }
    }

    /// Verifier pinned to the built-in vendor attestation root.
    pub fn with_builtin_root(challenges: Arc<ChallengeIndex>) -> Self {
        let spki = hex::decode(VENDOR_ROOT_SPKI_HEX).expect("embedded root key is valid hex");
        Self::new(spki, challenges)
    }

    /// The shared challenge index, for the issue path.
    pub fn challenges(&self) -> &Arc<ChallengeIndex> {
        &self.challenges
    }

    /// Run the full pipeline over a serialized bundle.
    pub fn verify(&self, message: &[u8], now_ms: i64) -> Result<AttestationReport> {
        // 1. Framing.
        let message = chain::decode_message(message)?;

        // 2./3. Chain parse, signatures, validity, root pinning.
        chain::verify_chain(&message.certificates, &self.vendor_root_spki, now_ms)?;

        // 4. Attestation extension.
        let payload = chain::attestation_extension(&message.certificates[0])?;
        let description = extension::parse_key_description(&payload)?;

        let security_level = match description.attestation_security_level {
            SECURITY_LEVEL_TEE => SecurityLevel::Tee,
            SECURITY_LEVEL_STRONGBOX => SecurityLevel::StrongBox,
            // Software keystores are not devices we can identify.
            _ => return Err(AttestError::UnknownDevice),
        };

        let root_of_trust = description
            .tee_enforced
            .root_of_trust
            .as_ref()
            .ok_or_else(|| AttestError::Malformed("root of trust not hardware-enforced".into()))?;
        let os_version = description
            .tee_enforced
            .os_version
            .ok_or_else(|| AttestError::Malformed("osVersion not hardware-enforced".into()))?;
        let os_patch_level = description
            .tee_enforced
            .os_patch_level
            .ok_or_else(|| AttestError::Malformed("osPatchLevel not hardware-enforced".into()))?;

        // 5. Challenge binding. One-shot: replays die here.
        let nonce: [u8; CHALLENGE_LENGTH] = description
            .challenge
            .as_slice()
            .try_into()
            .map_err(|_| AttestError::StaleChallenge)?;
        if !self.challenges.consume(&nonce) {
            return Err(AttestError::StaleChallenge);
        }

        // 6. Fingerprint derivation.
        let fingerprint = chain::device_fingerprint(&message.certificates)?;

        // 7. Catalogue lookup.
        let variant = match root_of_trust.verified_boot_state {
            VerifiedBootState::Verified => OsVariant::Stock,
            VerifiedBootState::SelfSigned => OsVariant::Custom,
            VerifiedBootState::Unverified | VerifiedBootState::Failed => {
                return Err(AttestError::UnknownDevice)
            }
        };
        let boot_key_hex = hex::encode_upper(root_of_trust.verified_boot_key);
        let info = catalogue::lookup(security_level, variant, &boot_key_hex)
            .ok_or(AttestError::UnknownDevice)?;

        // 8. Report assembly.
        let tee_enforced = serde_json::to_string(&TeeEnforcedSummary {
            attestation_version: description.attestation_version,
            security_level: security_level_name(security_level),
            os_version,
            os_patch_level,
            vendor_patch_level: description.tee_enforced.vendor_patch_level,
            boot_patch_level: description.tee_enforced.boot_patch_level,
            verified_boot_key: boot_key_hex,
            verified_boot_hash: root_of_trust.verified_boot_hash.map(hex::encode_upper),
            device_locked: root_of_trust.device_locked,
            verified_boot_state: root_of_trust.verified_boot_state.as_str(),
        })
        .map_err(|e| AttestError::Internal(e.to_string()))?;
        let os_enforced = serde_json::to_string(&OsEnforcedSummary {
            app_version: message.app_version,
            state: message.state,
        })
        .map_err(|e| AttestError::Internal(e.to_string()))?;

        Ok(AttestationReport {
            fingerprint,
            challenge: nonce,
            chain: message.certificates,
            verified_boot_key: root_of_trust.verified_boot_key,
            verified_boot_hash: root_of_trust.verified_boot_hash,
            security_level,
            os_version,
            os_patch_level,
            vendor_patch_level: description.tee_enforced.vendor_patch_level,
            boot_patch_level: description.tee_enforced.boot_patch_level,
            app_version: message.app_version,
            state: message.state,
            device_name: info.name,
            os_name: info.os_name,
            tee_enforced,
            os_enforced,
        })
    }
}

fn security_level_name(level: SecurityLevel) -> &'static str {
    match level {
        SecurityLevel::Tee => "TEE",
        SecurityLevel::StrongBox => "StrongBox",
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TeeEnforcedSummary {
    attestation_version: i64,
    security_level: &'static str,
    os_version: i64,
    os_patch_level: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    vendor_patch_level: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    boot_patch_level: Option<i64>,
    verified_boot_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified_boot_hash: Option<String>,
    device_locked: bool,
    verified_boot_state: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OsEnforcedSummary {
    app_version: i64,
    #[serde(flatten)]
    state: AuditorState,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rcgen::{
        BasicConstraints, CertificateParams, CustomExtension, IsCa, KeyPair,
        PKCS_ECDSA_P256_SHA256,
    };
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::catalogue::{CROSSHATCH_SB_STOCK, SAILFISH_TEE_CUSTOM, SAILFISH_TEE_STOCK};
    use crate::extension::testenc;

    const ATTESTATION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 11129, 2, 1, 17];

    fn now_ms() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    fn ca_params() -> CertificateParams {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
    }

    /// Mint leaf + two intermediates + root, with `ext` in the leaf.
    fn make_chain(ext: &[u8]) -> (Vec<Vec<u8>>, Vec<u8>) {
        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let root = ca_params().self_signed(&root_key).unwrap();

        let int1_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let int1 = ca_params().signed_by(&int1_key, &root, &root_key).unwrap();

        let int2_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let int2 = ca_params().signed_by(&int2_key, &int1, &int1_key).unwrap();

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut leaf_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        leaf_params
            .custom_extensions
            .push(CustomExtension::from_oid_content(ATTESTATION_OID, ext.to_vec()));
        let leaf = leaf_params.signed_by(&leaf_key, &int2, &int2_key).unwrap();

        let chain = vec![
            leaf.der().to_vec(),
            int2.der().to_vec(),
            int1.der().to_vec(),
            root.der().to_vec(),
        ];
        let root_spki = chain::public_key_of(&chain[3]).unwrap();
        (chain, root_spki)
    }

    fn boot_key_bytes(hex_key: &str) -> [u8; 32] {
        hex::decode(hex_key).unwrap().try_into().unwrap()
    }

    struct Setup {
        verifier: Verifier,
        message: Vec<u8>,
        chain: Vec<Vec<u8>>,
    }

    fn setup(security_level: i64, boot_key: &str, boot_state: i64) -> Setup {
        let index = Arc::new(ChallengeIndex::new());
        let nonce = index.issue();
        let ext = testenc::key_description_der(
            security_level,
            &nonce,
            &boot_key_bytes(boot_key),
            boot_state,
            Some(&[0x5au8; 32]),
            140000,
            202406,
            Some(202405),
            None,
        );
        let (chain, root_spki) = make_chain(&ext);
        let state = AuditorState {
            user_profile_secure: true,
            enrolled_biometrics: true,
            device_admin: 1,
            ..Default::default()
        };
        let message = chain::encode_message(&state, 31, &chain);
        Setup {
            verifier: Verifier::new(root_spki, index),
            message,
            chain,
        }
    }

    #[test]
    fn valid_bundle_produces_report() {
        let s = setup(SECURITY_LEVEL_TEE, SAILFISH_TEE_STOCK, 0);
        let report = s.verifier.verify(&s.message, now_ms()).unwrap();

        let expected_fp: [u8; 32] =
            Sha256::digest(chain::public_key_of(&s.chain[2]).unwrap()).into();
        assert_eq!(report.fingerprint, expected_fp);
        assert_eq!(report.security_level, SecurityLevel::Tee);
        assert_eq!(report.device_name, "Sailfish");
        assert_eq!(report.os_name, "Stock");
        assert_eq!(report.os_version, 140000);
        assert_eq!(report.os_patch_level, 202406);
        assert_eq!(report.vendor_patch_level, Some(202405));
        assert_eq!(report.boot_patch_level, None);
        assert_eq!(report.app_version, 31);
        assert!(report.state.user_profile_secure);
        assert_eq!(report.chain.len(), 4);

        let tee: serde_json::Value = serde_json::from_str(&report.tee_enforced).unwrap();
        assert_eq!(tee["securityLevel"], "TEE");
        assert_eq!(tee["osPatchLevel"], 202406);
        assert_eq!(tee["verifiedBootKey"], SAILFISH_TEE_STOCK);
        assert!(tee.get("bootPatchLevel").is_none());
        let os: serde_json::Value = serde_json::from_str(&report.os_enforced).unwrap();
        assert_eq!(os["appVersion"], 31);
        assert_eq!(os["userProfileSecure"], true);
    }

    #[test]
    fn self_signed_boot_selects_custom_table() {
        let s = setup(SECURITY_LEVEL_TEE, SAILFISH_TEE_CUSTOM, 1);
        let report = s.verifier.verify(&s.message, now_ms()).unwrap();
        assert_eq!(report.os_name, "Meridian OS");
    }

    #[test]
    fn strongbox_selects_strongbox_table() {
        let s = setup(SECURITY_LEVEL_STRONGBOX, CROSSHATCH_SB_STOCK, 0);
        let report = s.verifier.verify(&s.message, now_ms()).unwrap();
        assert_eq!(report.security_level, SecurityLevel::StrongBox);
        assert_eq!(report.device_name, "Crosshatch");
    }

    #[test]
    fn replay_is_rejected() {
        let s = setup(SECURITY_LEVEL_TEE, SAILFISH_TEE_STOCK, 0);
        s.verifier.verify(&s.message, now_ms()).unwrap();
        assert!(matches!(
            s.verifier.verify(&s.message, now_ms()),
            Err(AttestError::StaleChallenge)
        ));
    }

    #[test]
    fn foreign_challenge_is_stale() {
        let index = Arc::new(ChallengeIndex::new());
        let ext = testenc::key_description_der(
            SECURITY_LEVEL_TEE,
            &[0x42u8; 32], // never issued
            &boot_key_bytes(SAILFISH_TEE_STOCK),
            0,
            None,
            140000,
            202406,
            None,
            None,
        );
        let (chain_der, root_spki) = make_chain(&ext);
        let message = chain::encode_message(&AuditorState::default(), 1, &chain_der);
        let verifier = Verifier::new(root_spki, index);
        assert!(matches!(
            verifier.verify(&message, now_ms()),
            Err(AttestError::StaleChallenge)
        ));
    }

    #[test]
    fn expired_challenge_is_stale() {
        let index = Arc::new(ChallengeIndex::with_limits(Duration::from_millis(10), 64));
        let nonce = index.issue();
        let ext = testenc::key_description_der(
            SECURITY_LEVEL_TEE,
            &nonce,
            &boot_key_bytes(SAILFISH_TEE_STOCK),
            0,
            None,
            140000,
            202406,
            None,
            None,
        );
        let (chain_der, root_spki) = make_chain(&ext);
        let message = chain::encode_message(&AuditorState::default(), 1, &chain_der);
        let verifier = Verifier::new(root_spki, index);
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(
            verifier.verify(&message, now_ms()),
            Err(AttestError::StaleChallenge)
        ));
    }

    #[test]
    fn wrong_root_is_rejected_before_challenge_burns() {
        let s = setup(SECURITY_LEVEL_TEE, SAILFISH_TEE_STOCK, 0);
        // A different trust root: same bundle, foreign verifier.
        let (_, other_root) = make_chain(b"unused");
        let foreign = Verifier::new(other_root, Arc::clone(s.verifier.challenges()));
        assert!(matches!(
            foreign.verify(&s.message, now_ms()),
            Err(AttestError::Malformed(_))
        ));
        // The nonce survived the failed attempt.
        assert!(s.verifier.verify(&s.message, now_ms()).is_ok());
    }

    #[test]
    fn broken_signature_chain_rejected() {
        let index = Arc::new(ChallengeIndex::new());
        let nonce = index.issue();
        let ext = testenc::key_description_der(
            SECURITY_LEVEL_TEE,
            &nonce,
            &boot_key_bytes(SAILFISH_TEE_STOCK),
            0,
            None,
            140000,
            202406,
            None,
            None,
        );
        let (mut chain_der, root_spki) = make_chain(&ext);
        // Swap in an intermediate from an unrelated chain.
        let (other_chain, _) = make_chain(&ext);
        chain_der[1] = other_chain[1].clone();
        let message = chain::encode_message(&AuditorState::default(), 1, &chain_der);
        let verifier = Verifier::new(root_spki, index);
        assert!(matches!(
            verifier.verify(&message, now_ms()),
            Err(AttestError::Malformed(_))
        ));
    }

    #[test]
    fn software_security_level_rejected() {
        let s = setup(0, SAILFISH_TEE_STOCK, 0);
        assert!(matches!(
            s.verifier.verify(&s.message, now_ms()),
            Err(AttestError::UnknownDevice)
        ));
    }

    #[test]
    fn unknown_boot_key_rejected() {
        let bogus = hex::encode_upper([0xEEu8; 32]);
        let s = setup(SECURITY_LEVEL_TEE, &bogus, 0);
        assert!(matches!(
            s.verifier.verify(&s.message, now_ms()),
            Err(AttestError::UnknownDevice)
        ));
    }

    #[test]
    fn unverified_boot_state_rejected() {
        let s = setup(SECURITY_LEVEL_TEE, SAILFISH_TEE_STOCK, 2);
        assert!(matches!(
            s.verifier.verify(&s.message, now_ms()),
            Err(AttestError::UnknownDevice)
        ));
    }

    #[test]
    fn missing_extension_rejected() {
        let index = Arc::new(ChallengeIndex::new());
        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let root = ca_params().self_signed(&root_key).unwrap();
        let int1_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let int1 = ca_params().signed_by(&int1_key, &root, &root_key).unwrap();
        let int2_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let int2 = ca_params().signed_by(&int2_key, &int1, &int1_key).unwrap();
        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let leaf = CertificateParams::new(Vec::<String>::new())
            .unwrap()
            .signed_by(&leaf_key, &int2, &int2_key)
            .unwrap();
        let chain_der = vec![
            leaf.der().to_vec(),
            int2.der().to_vec(),
            int1.der().to_vec(),
            root.der().to_vec(),
        ];
        let root_spki = chain::public_key_of(&chain_der[3]).unwrap();
        let message = chain::encode_message(&AuditorState::default(), 1, &chain_der);
        let verifier = Verifier::new(root_spki, index);
        assert!(matches!(
            verifier.verify(&message, now_ms()),
            Err(AttestError::Malformed(_))
        ));
    }

    #[test]
    fn builtin_root_constant_decodes() {
        let verifier = Verifier::with_builtin_root(Arc::new(ChallengeIndex::new()));
        assert_eq!(verifier.vendor_root_spki.len(), 91);
    }
}

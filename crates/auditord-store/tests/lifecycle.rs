//! End-to-end lifecycle of a device against the store: enrol,
//! re-verify, downgrade, soft delete, revocation.

use auditord_store::db::{self, Database};
use auditord_store::{accounts, pinning};
use auditord_types::{AttestError, AttestationReport, AuditorState, MismatchKind, Outcome, SecurityLevel};
use tempfile::TempDir;

fn open_store() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let database = Database::new(dir.path().join("attestation.db"));
    db::initialize_attestation(&database).unwrap();
    (dir, database)
}

fn sample_report() -> AttestationReport {
    AttestationReport {
        fingerprint: [0xf1; 32],
        challenge: [0x01; 32],
        chain: (0u8..4).map(|i| vec![0x30, 0x82, i]).collect(),
        verified_boot_key: [0xb0; 32],
        verified_boot_hash: None,
        security_level: SecurityLevel::StrongBox,
        os_version: 150000,
        os_patch_level: 202501,
        vendor_patch_level: None,
        boot_patch_level: Some(202501),
        app_version: 40,
        state: AuditorState {
            user_profile_secure: true,
            ..Default::default()
        },
        device_name: "Crosshatch",
        os_name: "Stock",
        tee_enforced: "{\"osVersion\":150000}".into(),
        os_enforced: "{\"appVersion\":40}".into(),
    }
}

#[test]
fn device_lifecycle() {
    let (_dir, database) = open_store();
    let mut conn = database.open().unwrap();

    accounts::create_account(&conn, "owner", "a strong password", 0).unwrap();
    let session = accounts::login(&mut conn, "owner", "a strong password", 0).unwrap();
    let account = accounts::verify_session(
        &mut conn,
        session.session_id,
        &session.cookie_token,
        &session.request_token,
        0,
        false,
    )
    .unwrap();

    // Enrol.
    let outcome = pinning::record(&mut conn, &sample_report(), account.user_id, false, 1_000).unwrap();
    assert_eq!(outcome, Outcome::Enrolled);

    // Re-verify with advanced counters, strong this time.
    let mut second = sample_report();
    second.os_patch_level += 1;
    let outcome = pinning::record(&mut conn, &second, account.user_id, true, 2_000).unwrap();
    assert_eq!(outcome, Outcome::Verified);

    let devices = pinning::devices_for_account(&conn, account.user_id).unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].os_patch_level, 202502);
    assert_eq!(devices[0].verified_time_first, 1_000);
    assert_eq!(devices[0].verified_time_last, 2_000);

    let history =
        pinning::attestation_history(&conn, account.user_id, &[0xf1; 32], i64::MAX).unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].strong);

    // Downgrade attempt is refused and leaves the record unchanged.
    let downgraded = sample_report();
    assert!(matches!(
        pinning::record(&mut conn, &downgraded, account.user_id, false, 3_000),
        Err(AttestError::Mismatch(MismatchKind::Downgrade))
    ));
    let devices = pinning::devices_for_account(&conn, account.user_id).unwrap();
    assert_eq!(devices[0].os_patch_level, 202502);

    // Soft delete, then every further verify is revoked.
    pinning::delete_device(&conn, account.user_id, &[0xf1; 32], 4_000).unwrap();
    assert!(matches!(
        pinning::record(&mut conn, &second, account.user_id, true, 5_000),
        Err(AttestError::Revoked)
    ));
    assert!(pinning::devices_for_account(&conn, account.user_id)
        .unwrap()
        .is_empty());
}

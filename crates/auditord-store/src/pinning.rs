//! The per-device pinning store.
//!
//! First sighting of a fingerprint pins the device: attestation chain,
//! verified-boot key, security level and owning account are captured and
//! never change afterwards. Subsequent reports are continuity-checked in
//! a fixed order (owner, tombstone, pinned immutables, monotonic
//! counters) inside one immediate transaction, and every success appends
//! a history row. A failed continuity check commits only the
//! `failureTimeLast` stamp.

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use auditord_types::{
    AttestError, AttestationReport, AuditorState, MismatchKind, Outcome, Result, SecurityLevel,
    HISTORY_PER_PAGE,
};

use crate::db::{db_err, with_immediate};

/// A stored device row, as read back for the account API.
#[derive(Clone, Debug)]
pub struct DeviceRow {
    pub fingerprint: Vec<u8>,
    pub pinned_certificates: [Vec<u8>; 4],
    pub verified_boot_key: Vec<u8>,
    pub verified_boot_hash: Option<Vec<u8>>,
    pub os_version: i64,
    pub os_patch_level: i64,
    pub vendor_patch_level: Option<i64>,
    pub boot_patch_level: Option<i64>,
    pub app_version: i64,
    pub security_level: SecurityLevel,
    pub state: AuditorState,
    pub verified_time_first: i64,
    pub verified_time_last: i64,
    pub min_history_id: i64,
    pub max_history_id: i64,
}

/// One attestation history row.
#[derive(Clone, Debug)]
pub struct HistoryRow {
    pub id: i64,
    pub time: i64,
    pub strong: bool,
    pub tee_enforced: String,
    pub os_enforced: String,
}

struct PinnedRow {
    user_id: i64,
    deletion_time: Option<i64>,
    verified_boot_key: Vec<u8>,
    certificates: [Vec<u8>; 4],
    security_level: i64,
    os_version: i64,
    os_patch_level: i64,
    vendor_patch_level: Option<i64>,
    boot_patch_level: Option<i64>,
    app_version: i64,
}

/// Committed result of the transaction; continuity failures must commit
/// their `failureTimeLast` update, so they are data here rather than an
/// error that would roll the transaction back.
enum RecordResult {
    Accepted(Outcome),
    Refused(AttestError),
}

/// Record a verified report against the pinning store.
pub fn record(
    conn: &mut Connection,
    report: &AttestationReport,
    user_id: i64,
    strong: bool,
    now: i64,
) -> Result<Outcome> {
    if report.chain.len() != 4 {
        return Err(AttestError::Malformed("pinned chain must be four certificates".into()));
    }

    let result = with_immediate(conn, |tx| {
        let existing = load_pinned(tx, &report.fingerprint)?;
        match existing {
            None => {
                pin(tx, report, user_id, now)?;
                append_history(tx, report, strong, now)?;
                Ok(RecordResult::Accepted(Outcome::Enrolled))
            }
            Some(row) => {
                if row.user_id != user_id {
                    return Ok(RecordResult::Refused(AttestError::Mismatch(MismatchKind::Owner)));
                }
                if row.deletion_time.is_some() {
                    return Ok(RecordResult::Refused(AttestError::Revoked));
                }
                if !pinned_immutables_match(&row, report) {
                    stamp_failure(tx, &report.fingerprint, now)?;
                    return Ok(RecordResult::Refused(AttestError::Mismatch(MismatchKind::Pinning)));
                }
                if let Some(kind) = downgrade(&row, report) {
                    stamp_failure(tx, &report.fingerprint, now)?;
                    return Ok(RecordResult::Refused(AttestError::Mismatch(kind)));
                }

                advance(tx, report, now)?;
                append_history(tx, report, strong, now)?;
                Ok(RecordResult::Accepted(Outcome::Verified))
            }
        }
    })?;

    match result {
        RecordResult::Accepted(outcome) => Ok(outcome),
        RecordResult::Refused(err) => Err(err),
    }
}

fn load_pinned(tx: &Transaction<'_>, fingerprint: &[u8; 32]) -> Result<Option<PinnedRow>> {
    tx.query_row(
        "SELECT userId, deletionTime, pinnedVerifiedBootKey,
                pinnedCertificate0, pinnedCertificate1, pinnedCertificate2, pinnedCertificate3,
                pinnedSecurityLevel, pinnedOsVersion, pinnedOsPatchLevel,
                pinnedVendorPatchLevel, pinnedBootPatchLevel, pinnedAppVersion
         FROM Devices WHERE fingerprint = ?1",
        params![fingerprint.as_slice()],
        |row| {
            Ok(PinnedRow {
                user_id: row.get(0)?,
                deletion_time: row.get(1)?,
                verified_boot_key: row.get(2)?,
                certificates: [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?],
                security_level: row.get(7)?,
                os_version: row.get(8)?,
                os_patch_level: row.get(9)?,
                vendor_patch_level: row.get(10)?,
                boot_patch_level: row.get(11)?,
                app_version: row.get(12)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn pinned_immutables_match(row: &PinnedRow, report: &AttestationReport) -> bool {
    row.verified_boot_key == report.verified_boot_key
        && row.certificates.iter().zip(report.chain.iter()).all(|(a, b)| a == b)
        && row.security_level == report.security_level.as_i64()
}

/// First monotonic counter that went backwards, if any. An optional
/// counter that disappears after being pinned counts as a downgrade.
fn downgrade(row: &PinnedRow, report: &AttestationReport) -> Option<MismatchKind> {
    let simple = [
        (row.os_version, report.os_version),
        (row.os_patch_level, report.os_patch_level),
        (row.app_version, report.app_version),
    ];
    if simple.iter().any(|(pinned, seen)| seen < pinned) {
        return Some(MismatchKind::Downgrade);
    }
    let optional = [
        (row.vendor_patch_level, report.vendor_patch_level),
        (row.boot_patch_level, report.boot_patch_level),
    ];
    for (pinned, seen) in optional {
        match (pinned, seen) {
            (Some(pinned), Some(seen)) if seen < pinned => return Some(MismatchKind::Downgrade),
            (Some(_), None) => return Some(MismatchKind::Downgrade),
            _ => {}
        }
    }
    None
}

fn stamp_failure(tx: &Transaction<'_>, fingerprint: &[u8; 32], now: i64) -> Result<()> {
    tx.execute(
        "UPDATE Devices SET failureTimeLast = ?1 WHERE fingerprint = ?2",
        params![now, fingerprint.as_slice()],
    )
    .map_err(db_err)?;
    Ok(())
}

fn pin(tx: &Transaction<'_>, report: &AttestationReport, user_id: i64, now: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO Devices (fingerprint,
            pinnedCertificate0, pinnedCertificate1, pinnedCertificate2, pinnedCertificate3,
            pinnedVerifiedBootKey, verifiedBootHash,
            pinnedOsVersion, pinnedOsPatchLevel, pinnedVendorPatchLevel, pinnedBootPatchLevel,
            pinnedAppVersion, pinnedSecurityLevel,
            userProfileSecure, enrolledBiometrics, accessibility, deviceAdmin, adbEnabled,
            addUsersWhenLocked, denyNewUsb, oemUnlockAllowed, systemUser,
            verifiedTimeFirst, verifiedTimeLast, userId)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                 ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
        params![
            report.fingerprint.as_slice(),
            report.chain[0],
            report.chain[1],
            report.chain[2],
            report.chain[3],
            report.verified_boot_key.as_slice(),
            report.verified_boot_hash.as_ref().map(|hash| hash.as_slice()),
            report.os_version,
            report.os_patch_level,
            report.vendor_patch_level,
            report.boot_patch_level,
            report.app_version,
            report.security_level.as_i64(),
            report.state.user_profile_secure,
            report.state.enrolled_biometrics,
            report.state.accessibility,
            report.state.device_admin,
            report.state.adb_enabled,
            report.state.add_users_when_locked,
            report.state.deny_new_usb,
            report.state.oem_unlock_allowed,
            report.state.system_user,
            now,
            now,
            user_id,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn advance(tx: &Transaction<'_>, report: &AttestationReport, now: i64) -> Result<()> {
    tx.execute(
        "UPDATE Devices SET
            verifiedBootHash = ?1,
            pinnedOsVersion = ?2, pinnedOsPatchLevel = ?3,
            pinnedVendorPatchLevel = ?4, pinnedBootPatchLevel = ?5,
            pinnedAppVersion = ?6,
            userProfileSecure = ?7, enrolledBiometrics = ?8, accessibility = ?9,
            deviceAdmin = ?10, adbEnabled = ?11, addUsersWhenLocked = ?12,
            denyNewUsb = ?13, oemUnlockAllowed = ?14, systemUser = ?15,
            verifiedTimeLast = ?16, failureTimeLast = NULL
         WHERE fingerprint = ?17",
        params![
            report.verified_boot_hash.as_ref().map(|hash| hash.as_slice()),
            report.os_version,
            report.os_patch_level,
            report.vendor_patch_level,
            report.boot_patch_level,
            report.app_version,
            report.state.user_profile_secure,
            report.state.enrolled_biometrics,
            report.state.accessibility,
            report.state.device_admin,
            report.state.adb_enabled,
            report.state.add_users_when_locked,
            report.state.deny_new_usb,
            report.state.oem_unlock_allowed,
            report.state.system_user,
            now,
            report.fingerprint.as_slice(),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn append_history(tx: &Transaction<'_>, report: &AttestationReport, strong: bool, now: i64) -> Result<()> {
    tx.execute(
        "INSERT INTO Attestations (fingerprint, time, strong, teeEnforced, osEnforced)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            report.fingerprint.as_slice(),
            now,
            strong,
            report.tee_enforced,
            report.os_enforced,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Non-deleted devices of an account, oldest enrolment first.
pub fn devices_for_account(conn: &Connection, user_id: i64) -> Result<Vec<DeviceRow>> {
    let mut statement = conn
        .prepare(
            "SELECT fingerprint,
                    pinnedCertificate0, pinnedCertificate1, pinnedCertificate2, pinnedCertificate3,
                    pinnedVerifiedBootKey, verifiedBootHash,
                    pinnedOsVersion, pinnedOsPatchLevel, pinnedVendorPatchLevel, pinnedBootPatchLevel,
                    pinnedAppVersion, pinnedSecurityLevel,
                    userProfileSecure, enrolledBiometrics, accessibility, deviceAdmin, adbEnabled,
                    addUsersWhenLocked, denyNewUsb, oemUnlockAllowed, systemUser,
                    verifiedTimeFirst, verifiedTimeLast,
                    (SELECT MIN(id) FROM Attestations WHERE fingerprint = Devices.fingerprint),
                    (SELECT MAX(id) FROM Attestations WHERE fingerprint = Devices.fingerprint)
             FROM Devices
             WHERE userId = ?1 AND deletionTime IS NULL
             ORDER BY verifiedTimeFirst",
        )
        .map_err(db_err)?;

    let rows = statement
        .query_map(params![user_id], |row| {
            let security_level: i64 = row.get(12)?;
            Ok(DeviceRow {
                fingerprint: row.get(0)?,
                pinned_certificates: [row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?],
                verified_boot_key: row.get(5)?,
                verified_boot_hash: row.get(6)?,
                os_version: row.get(7)?,
                os_patch_level: row.get(8)?,
                vendor_patch_level: row.get(9)?,
                boot_patch_level: row.get(10)?,
                app_version: row.get(11)?,
                security_level: SecurityLevel::from_i64(security_level)
                    .unwrap_or(SecurityLevel::Tee),
                state: AuditorState {
                    user_profile_secure: row.get(13)?,
                    enrolled_biometrics: row.get(14)?,
                    accessibility: row.get(15)?,
                    device_admin: row.get::<_, i64>(16)? as u8,
                    adb_enabled: row.get(17)?,
                    add_users_when_locked: row.get(18)?,
                    deny_new_usb: row.get(19)?,
                    oem_unlock_allowed: row.get(20)?,
                    system_user: row.get(21)?,
                },
                verified_time_first: row.get(22)?,
                verified_time_last: row.get(23)?,
                min_history_id: row.get(24)?,
                max_history_id: row.get(25)?,
            })
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// One page of attestation history for an owned device: rows with
/// `id <= offset_id`, newest first. An empty page means the device does
/// not belong to the account, has no history at that offset, or does
/// not exist; all of those surface as a malformed request.
pub fn attestation_history(
    conn: &Connection,
    user_id: i64,
    fingerprint: &[u8],
    offset_id: i64,
) -> Result<Vec<HistoryRow>> {
    let mut statement = conn
        .prepare(
            "SELECT Attestations.time, Attestations.strong, Attestations.teeEnforced,
                    Attestations.osEnforced, Attestations.id
             FROM Attestations
             INNER JOIN Devices ON Attestations.fingerprint = Devices.fingerprint
             WHERE Devices.fingerprint = ?1 AND Devices.userId = ?2 AND Attestations.id <= ?3
             ORDER BY Attestations.id DESC
             LIMIT ?4",
        )
        .map_err(db_err)?;

    let rows = statement
        .query_map(params![fingerprint, user_id, offset_id, HISTORY_PER_PAGE], |row| {
            Ok(HistoryRow {
                time: row.get(0)?,
                strong: row.get(1)?,
                tee_enforced: row.get(2)?,
                os_enforced: row.get(3)?,
                id: row.get(4)?,
            })
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;

    if rows.is_empty() {
        return Err(AttestError::Malformed("no attestation history".into()));
    }
    Ok(rows)
}

/// Soft-delete an owned device. The tombstone is write-once; deleting an
/// unknown, foreign or already-deleted device is a malformed request.
pub fn delete_device(conn: &Connection, user_id: i64, fingerprint: &[u8], now: i64) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE Devices SET deletionTime = ?1
             WHERE userId = ?2 AND fingerprint = ?3 AND deletionTime IS NULL",
            params![now, user_id, fingerprint],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(AttestError::Malformed("unknown device".into()));
    }
    Ok(())
}

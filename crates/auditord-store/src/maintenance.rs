//! Daily maintenance pass.
//!
//! Sweeps expired sessions, garbage-collects attestation history of
//! long-tombstoned devices, refreshes planner statistics, compacts both
//! databases and writes a timestamped backup of the main database
//! through the SQLite online backup API.

use std::path::Path;
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::Connection;

use auditord_types::{AttestError, Result, DELETED_DEVICE_RETENTION_MS};

use crate::db::{db_err, Database};

/// Counts of one maintenance pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub expired_sessions: usize,
    pub purged_history_rows: usize,
}

/// Run one maintenance pass at time `now`.
pub fn run_maintenance(
    main_db: &Database,
    samples_db: &Database,
    backup_dir: &Path,
    now: i64,
) -> Result<MaintenanceSummary> {
    let conn = main_db.open()?;

    let expired_sessions = conn
        .execute("DELETE FROM Sessions WHERE expiryTime < ?1", [now])
        .map_err(db_err)?;

    let horizon = now - DELETED_DEVICE_RETENTION_MS;
    let purged_history_rows = conn
        .execute(
            "DELETE FROM Attestations WHERE fingerprint IN
                 (SELECT fingerprint FROM Devices
                  WHERE deletionTime IS NOT NULL AND deletionTime < ?1)",
            [horizon],
        )
        .map_err(db_err)?;

    conn.execute_batch("ANALYZE").map_err(db_err)?;
    conn.execute_batch("VACUUM").map_err(db_err)?;

    backup(&conn, backup_dir, now)?;
    drop(conn);

    let samples_conn = samples_db.open()?;
    samples_conn.execute_batch("VACUUM").map_err(db_err)?;

    Ok(MaintenanceSummary {
        expired_sessions,
        purged_history_rows,
    })
}

fn backup(conn: &Connection, backup_dir: &Path, now: i64) -> Result<()> {
    std::fs::create_dir_all(backup_dir)
        .map_err(|e| AttestError::Internal(format!("backup dir: {e}")))?;
    let target = backup_dir.join(format!("attestation-{now}.db"));
    let mut dest = Connection::open(&target).map_err(db_err)?;
    let backup = Backup::new(conn, &mut dest).map_err(db_err)?;
    backup
        .run_to_completion(100, Duration::from_millis(100), None)
        .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::{main_db, samples_db};
    use crate::pinning::testutil::{insert_account, report};
    use crate::pinning;
    use rusqlite::params;

    #[test]
    fn expired_sessions_swept() {
        let (dir, db) = main_db();
        let (_sdir, samples) = samples_db();
        let conn = db.open().unwrap();
        let user = insert_account(&conn, "alice");
        conn.execute(
            "INSERT INTO Sessions (userId, cookieToken, requestToken, expiryTime)
             VALUES (?1, x'11', x'22', 100), (?1, x'33', x'44', 9999)",
            [user],
        )
        .unwrap();
        drop(conn);

        let summary = run_maintenance(&db, &samples, &dir.path().join("backup"), 5000).unwrap();
        assert_eq!(summary.expired_sessions, 1);

        let conn = db.open().unwrap();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM Sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn old_tombstoned_history_is_purged() {
        let (dir, db) = main_db();
        let (_sdir, samples) = samples_db();
        let mut conn = db.open().unwrap();
        let user = insert_account(&mut conn, "alice");
        pinning::record(&mut conn, &report(1), user, false, 0).unwrap();
        pinning::record(&mut conn, &report(2), user, false, 0).unwrap();
        // Device 1 deleted long ago, device 2 recently.
        conn.execute(
            "UPDATE Devices SET deletionTime = 0 WHERE fingerprint = ?1",
            params![[1u8; 32].as_slice()],
        )
        .unwrap();
        let now = DELETED_DEVICE_RETENTION_MS + 10_000;
        conn.execute(
            "UPDATE Devices SET deletionTime = ?1 WHERE fingerprint = ?2",
            params![now - 1000, [2u8; 32].as_slice()],
        )
        .unwrap();
        drop(conn);

        let summary = run_maintenance(&db, &samples, &dir.path().join("backup"), now).unwrap();
        assert_eq!(summary.purged_history_rows, 1);

        let conn = db.open().unwrap();
        let kept: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM Attestations WHERE fingerprint = ?1",
                params![[2u8; 32].as_slice()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(kept, 1);
    }

    #[test]
    fn backup_file_is_written() {
        let (dir, db) = main_db();
        let (_sdir, samples) = samples_db();
        let backup_dir = dir.path().join("backup");
        run_maintenance(&db, &samples, &backup_dir, 42).unwrap();

        let target = backup_dir.join("attestation-42.db");
        assert!(target.exists());
        // The backup is itself a usable database.
        let copy = Connection::open(&target).unwrap();
        let accounts: i64 = copy
            .query_row("SELECT COUNT(*) FROM Accounts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(accounts, 0);
    }
}

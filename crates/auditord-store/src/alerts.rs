//! Missed-verification alerting.
//!
//! One scan pass walks the non-deleted devices of accounts that have an
//! alert address and decides, per device, whether to send an overdue
//! alert or a one-shot recovery notice. `expiredTimeLast` doubles as the
//! alert marker: set when an overdue alert went out, cleared when the
//! device recovered. Mail failures leave the marker untouched so the
//! next tick retries.

use rusqlite::{params, Connection};
use tracing::{info, warn};

use auditord_types::Result;

use crate::db::db_err;

/// Outbound mail seam. Transport (SMTP relay, queueing) is an external
/// collaborator; implementations only need to accept or refuse one
/// message. Object-safe for dynamic dispatch.
pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> std::result::Result<(), String>;
}

/// Mailer that records deliveries in the log. Stands in wherever no
/// real transport is wired up.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, _body: &str) -> std::result::Result<(), String> {
        info!(to, subject, "alert mail");
        Ok(())
    }
}

/// Counts of one scan pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AlertScanSummary {
    pub alerts_sent: usize,
    pub recoveries_sent: usize,
}

struct Candidate {
    fingerprint: Vec<u8>,
    verified_time_last: i64,
    expired_time_last: Option<i64>,
    alert_delay: i64,
    address: String,
    username: String,
}

/// Run one alert scan at time `now`.
pub fn run_alert_scan(
    conn: &mut Connection,
    mailer: &dyn Mailer,
    now: i64,
) -> Result<AlertScanSummary> {
    let candidates = load_candidates(conn)?;
    let mut summary = AlertScanSummary::default();

    for candidate in candidates {
        let delay_ms = candidate.alert_delay * 1000;
        let overdue = now - candidate.verified_time_last > delay_ms;
        let fingerprint_hex = hex::encode_upper(&candidate.fingerprint);

        if overdue {
            // At most one alert per device per alertDelay window.
            let already_alerted = match candidate.expired_time_last {
                Some(expired) => {
                    expired > candidate.verified_time_last && now - expired <= delay_ms
                }
                None => false,
            };
            if already_alerted {
                continue;
            }
            let subject = "Devices failed to provide valid attestations";
            let body = format!(
                "Device {} of account {} has not provided a valid attestation within its alert window.",
                fingerprint_hex, candidate.username,
            );
            match mailer.send(&candidate.address, subject, &body) {
                Ok(()) => {
                    conn.execute(
                        "UPDATE Devices SET expiredTimeLast = ?1 WHERE fingerprint = ?2",
                        params![now, candidate.fingerprint],
                    )
                    .map_err(db_err)?;
                    summary.alerts_sent += 1;
                }
                Err(error) => {
                    warn!(%error, fingerprint = %fingerprint_hex, "alert mail failed, will retry");
                }
            }
        } else if let Some(expired) = candidate.expired_time_last {
            if candidate.verified_time_last > expired {
                let subject = "Devices resumed providing valid attestations";
                let body = format!(
                    "Device {} of account {} is providing valid attestations again.",
                    fingerprint_hex, candidate.username,
                );
                match mailer.send(&candidate.address, subject, &body) {
                    Ok(()) => {
                        conn.execute(
                            "UPDATE Devices SET expiredTimeLast = NULL WHERE fingerprint = ?1",
                            params![candidate.fingerprint],
                        )
                        .map_err(db_err)?;
                        summary.recoveries_sent += 1;
                    }
                    Err(error) => {
                        warn!(%error, fingerprint = %fingerprint_hex, "recovery mail failed, will retry");
                    }
                }
            }
        }
    }

    Ok(summary)
}

fn load_candidates(conn: &Connection) -> Result<Vec<Candidate>> {
    let mut statement = conn
        .prepare(
            "SELECT Devices.fingerprint, Devices.verifiedTimeLast, Devices.expiredTimeLast,
                    Accounts.alertDelay, EmailAddresses.address, Accounts.username
             FROM Devices
             INNER JOIN Accounts ON Accounts.userId = Devices.userId
             INNER JOIN EmailAddresses ON EmailAddresses.userId = Accounts.userId
             WHERE Devices.deletionTime IS NULL",
        )
        .map_err(db_err)?;
    let rows = statement
        .query_map([], |row| {
            Ok(Candidate {
                fingerprint: row.get(0)?,
                verified_time_last: row.get(1)?,
                expired_time_last: row.get(2)?,
                alert_delay: row.get(3)?,
                address: row.get(4)?,
                username: row.get(5)?,
            })
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::db::testutil::main_db;
    use crate::pinning::testutil::{insert_account, report};
    use crate::pinning;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl Mailer for RecordingMailer {
        fn send(&self, to: &str, subject: &str, _body: &str) -> std::result::Result<(), String> {
            if self.fail {
                return Err("relay down".into());
            }
            self.sent.lock().unwrap().push((to.into(), subject.into()));
            Ok(())
        }
    }

    const DELAY_MS: i64 = 172800 * 1000;

    fn setup_device(conn: &mut Connection) -> i64 {
        let user = insert_account(conn, "alice");
        conn.execute(
            "INSERT INTO EmailAddresses (userId, address) VALUES (?1, 'alice@example.com')",
            [user],
        )
        .unwrap();
        pinning::record(conn, &report(1), user, false, 0).unwrap();
        user
    }

    #[test]
    fn fresh_device_not_alerted() {
        let (_dir, db) = main_db();
        let mut conn = db.open().unwrap();
        setup_device(&mut conn);
        let mailer = RecordingMailer::default();
        let summary = run_alert_scan(&mut conn, &mailer, DELAY_MS / 2).unwrap();
        assert_eq!(summary, AlertScanSummary::default());
    }

    #[test]
    fn overdue_device_alerted_once_per_window() {
        let (_dir, db) = main_db();
        let mut conn = db.open().unwrap();
        setup_device(&mut conn);
        let mailer = RecordingMailer::default();

        let now = DELAY_MS + 1000;
        let summary = run_alert_scan(&mut conn, &mailer, now).unwrap();
        assert_eq!(summary.alerts_sent, 1);
        let expired: Option<i64> = conn
            .query_row("SELECT expiredTimeLast FROM Devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(expired, Some(now));

        // Within the same window: silent.
        let summary = run_alert_scan(&mut conn, &mailer, now + 1000).unwrap();
        assert_eq!(summary.alerts_sent, 0);

        // A full window later: alerted again.
        let summary = run_alert_scan(&mut conn, &mailer, now + DELAY_MS + 1000).unwrap();
        assert_eq!(summary.alerts_sent, 1);
        assert_eq!(mailer.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn recovery_notice_is_one_shot() {
        let (_dir, db) = main_db();
        let mut conn = db.open().unwrap();
        let user = setup_device(&mut conn);
        let mailer = RecordingMailer::default();

        let alert_time = DELAY_MS + 1000;
        run_alert_scan(&mut conn, &mailer, alert_time).unwrap();

        // The device verifies again.
        pinning::record(&mut conn, &report(1), user, true, alert_time + 5000).unwrap();

        let summary = run_alert_scan(&mut conn, &mailer, alert_time + 6000).unwrap();
        assert_eq!(summary.recoveries_sent, 1);
        let expired: Option<i64> = conn
            .query_row("SELECT expiredTimeLast FROM Devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(expired, None);

        // Exactly once.
        let summary = run_alert_scan(&mut conn, &mailer, alert_time + 7000).unwrap();
        assert_eq!(summary.recoveries_sent, 0);
    }

    #[test]
    fn mail_failure_leaves_state_for_retry() {
        let (_dir, db) = main_db();
        let mut conn = db.open().unwrap();
        setup_device(&mut conn);
        let failing = RecordingMailer { fail: true, ..Default::default() };

        let now = DELAY_MS + 1000;
        let summary = run_alert_scan(&mut conn, &failing, now).unwrap();
        assert_eq!(summary.alerts_sent, 0);
        let expired: Option<i64> = conn
            .query_row("SELECT expiredTimeLast FROM Devices", [], |row| row.get(0))
            .unwrap();
        assert_eq!(expired, None);

        // Next tick with a healthy relay delivers.
        let working = RecordingMailer::default();
        let summary = run_alert_scan(&mut conn, &working, now + 1000).unwrap();
        assert_eq!(summary.alerts_sent, 1);
    }

    #[test]
    fn deleted_and_unsubscribed_devices_skipped() {
        let (_dir, db) = main_db();
        let mut conn = db.open().unwrap();
        let user = setup_device(&mut conn);
        pinning::delete_device(&conn, user, &[1u8; 32], 100).unwrap();

        // Account without an email address.
        let other = insert_account(&conn, "bob");
        pinning::record(&mut conn, &report(2), other, false, 0).unwrap();

        let mailer = RecordingMailer::default();
        let summary = run_alert_scan(&mut conn, &mailer, DELAY_MS * 2).unwrap();
        assert_eq!(summary, AlertScanSummary::default());
    }
}

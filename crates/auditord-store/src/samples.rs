//! Write-only sample submissions.
//!
//! Opaque blobs from auditor builds under test land in their own
//! database and are never read back by the server.

use rusqlite::{params, Connection};

use auditord_types::{AttestError, Result, MAX_SAMPLE_SIZE};

use crate::db::db_err;

/// Store one submitted sample.
pub fn insert_sample(conn: &Connection, sample: &[u8], now: i64) -> Result<()> {
    if sample.is_empty() {
        return Err(AttestError::Malformed("empty sample".into()));
    }
    if sample.len() > MAX_SAMPLE_SIZE {
        return Err(AttestError::TooLarge);
    }
    conn.execute(
        "INSERT INTO Samples (sample, time) VALUES (?1, ?2)",
        params![sample, now],
    )
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testutil::samples_db;

    #[test]
    fn samples_are_stored() {
        let (_dir, db) = samples_db();
        let conn = db.open().unwrap();
        insert_sample(&conn, b"sample-bytes", 1234).unwrap();
        let (count, time): (i64, i64) = conn
            .query_row("SELECT COUNT(*), MAX(time) FROM Samples", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(time, 1234);
    }

    #[test]
    fn empty_sample_rejected() {
        let (_dir, db) = samples_db();
        let conn = db.open().unwrap();
        assert!(matches!(
            insert_sample(&conn, b"", 0),
            Err(AttestError::Malformed(_))
        ));
    }

    #[test]
    fn oversized_sample_rejected() {
        let (_dir, db) = samples_db();
        let conn = db.open().unwrap();
        let blob = vec![0u8; MAX_SAMPLE_SIZE + 1];
        assert!(matches!(
            insert_sample(&conn, &blob, 0),
            Err(AttestError::TooLarge)
        ));
    }
}

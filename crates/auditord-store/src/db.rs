//! Connection handling, schema and transaction discipline.
//!
//! Connections are opened per operation with a 10 s busy timeout,
//! foreign keys on and WAL journaling. The schema is versioned through
//! `PRAGMA user_version`; migrations are forward-only.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};

use auditord_types::{AttestError, Result, BUSY_TIMEOUT_MS};

/// Current schema version of both databases.
const SCHEMA_VERSION: i64 = 1;

/// Handle to one SQLite database file.
#[derive(Clone, Debug)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a read-write connection with the standard pragmas.
    pub fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(db_err)?;
        configure(&conn)?;
        Ok(conn)
    }

    /// Open a read-only connection with the standard pragmas.
    pub fn open_read_only(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(db_err)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
            .map_err(db_err)?;
        Ok(conn)
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .map_err(db_err)?;
    conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
    // journal_mode reports the resulting mode as a row.
    conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
        .map_err(db_err)?;
    Ok(())
}

/// Wall-clock milliseconds since the Unix epoch. All persisted
/// timestamps use this representation.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

fn user_version(conn: &Connection) -> Result<i64> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(db_err)
}

fn set_user_version(conn: &Connection, version: i64) -> Result<()> {
    conn.pragma_update(None, "user_version", version).map_err(db_err)
}

/// Create or upgrade the main database schema.
pub fn initialize_attestation(db: &Database) -> Result<()> {
    let mut conn = db.open()?;
    let version = user_version(&conn)?;
    if version > SCHEMA_VERSION {
        return Err(AttestError::Internal(format!(
            "database schema version {version} is newer than this server"
        )));
    }

    with_immediate(&mut conn, |tx| {
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS Accounts (
                userId INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL COLLATE NOCASE UNIQUE,
                passwordHash BLOB NOT NULL,
                passwordSalt BLOB NOT NULL,
                subscribeKey BLOB NOT NULL,
                creationTime INTEGER NOT NULL,
                loginTime INTEGER NOT NULL,
                verifyInterval INTEGER NOT NULL,
                alertDelay INTEGER NOT NULL
            ) STRICT;

            CREATE TABLE IF NOT EXISTS EmailAddresses (
                userId INTEGER NOT NULL REFERENCES Accounts (userId) ON DELETE CASCADE,
                address TEXT NOT NULL,
                PRIMARY KEY (userId, address)
            ) STRICT;

            CREATE TABLE IF NOT EXISTS Sessions (
                sessionId INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                userId INTEGER NOT NULL REFERENCES Accounts (userId) ON DELETE CASCADE,
                cookieToken BLOB NOT NULL,
                requestToken BLOB NOT NULL,
                expiryTime INTEGER NOT NULL
            ) STRICT;

            CREATE TABLE IF NOT EXISTS Devices (
                fingerprint BLOB NOT NULL PRIMARY KEY,
                pinnedCertificate0 BLOB NOT NULL,
                pinnedCertificate1 BLOB NOT NULL,
                pinnedCertificate2 BLOB NOT NULL,
                pinnedCertificate3 BLOB NOT NULL,
                pinnedVerifiedBootKey BLOB NOT NULL,
                verifiedBootHash BLOB,
                pinnedOsVersion INTEGER NOT NULL,
                pinnedOsPatchLevel INTEGER NOT NULL,
                pinnedVendorPatchLevel INTEGER,
                pinnedBootPatchLevel INTEGER,
                pinnedAppVersion INTEGER NOT NULL,
                pinnedSecurityLevel INTEGER NOT NULL,
                userProfileSecure INTEGER NOT NULL CHECK (userProfileSecure in (0, 1)),
                enrolledBiometrics INTEGER NOT NULL CHECK (enrolledBiometrics in (0, 1)),
                accessibility INTEGER NOT NULL CHECK (accessibility in (0, 1)),
                deviceAdmin INTEGER NOT NULL CHECK (deviceAdmin in (0, 1, 2)),
                adbEnabled INTEGER NOT NULL CHECK (adbEnabled in (0, 1)),
                addUsersWhenLocked INTEGER NOT NULL CHECK (addUsersWhenLocked in (0, 1)),
                denyNewUsb INTEGER NOT NULL CHECK (denyNewUsb in (0, 1)),
                oemUnlockAllowed INTEGER NOT NULL CHECK (oemUnlockAllowed in (0, 1)),
                systemUser INTEGER NOT NULL CHECK (systemUser in (0, 1)),
                verifiedTimeFirst INTEGER NOT NULL,
                verifiedTimeLast INTEGER NOT NULL,
                expiredTimeLast INTEGER,
                failureTimeLast INTEGER,
                userId INTEGER NOT NULL REFERENCES Accounts (userId) ON DELETE CASCADE,
                deletionTime INTEGER
            ) STRICT;

            CREATE TABLE IF NOT EXISTS Attestations (
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                fingerprint BLOB NOT NULL REFERENCES Devices (fingerprint) ON DELETE CASCADE,
                time INTEGER NOT NULL,
                strong INTEGER NOT NULL CHECK (strong in (0, 1)),
                teeEnforced TEXT NOT NULL,
                osEnforced TEXT NOT NULL
            ) STRICT;

            CREATE INDEX IF NOT EXISTS Accounts_loginTime
                ON Accounts (loginTime);
            CREATE INDEX IF NOT EXISTS Sessions_expiryTime
                ON Sessions (expiryTime);
            CREATE INDEX IF NOT EXISTS Sessions_userId
                ON Sessions (userId);
            CREATE INDEX IF NOT EXISTS Devices_userId_verifiedTimeFirst
                ON Devices (userId, verifiedTimeFirst);
            CREATE INDEX IF NOT EXISTS Devices_deletionTime
                ON Devices (deletionTime) WHERE deletionTime IS NOT NULL;
            CREATE INDEX IF NOT EXISTS Devices_verifiedTimeLast_deletionTimeNull
                ON Devices (verifiedTimeLast) WHERE deletionTime IS NULL;
            CREATE INDEX IF NOT EXISTS Attestations_fingerprint_id
                ON Attestations (fingerprint, id);",
        )
        .map_err(db_err)?;
        Ok(())
    })?;

    set_user_version(&conn, SCHEMA_VERSION)
}

/// Create or upgrade the samples database schema.
pub fn initialize_samples(db: &Database) -> Result<()> {
    let conn = db.open()?;
    let version = user_version(&conn)?;
    if version > SCHEMA_VERSION {
        return Err(AttestError::Internal(format!(
            "samples schema version {version} is newer than this server"
        )));
    }
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS Samples (
            sample BLOB NOT NULL,
            time INTEGER NOT NULL
        ) STRICT;",
    )
    .map_err(db_err)?;
    set_user_version(&conn, SCHEMA_VERSION)
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on `Ok`.
/// A busy/locked failure is retried once after a short backoff.
pub fn with_immediate<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: Fn(&Transaction<'_>) -> Result<T>,
{
    let mut retried = false;
    loop {
        let result = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)
            .and_then(|tx| {
                let value = f(&tx)?;
                tx.commit().map_err(db_err)?;
                Ok(value)
            });
        match result {
            Err(AttestError::Busy) if !retried => {
                retried = true;
                std::thread::sleep(Duration::from_millis(100));
            }
            other => return other,
        }
    }
}

/// Map a rusqlite error onto the core error kinds: unique-constraint
/// violations become `Conflict`, busy/locked becomes the retryable
/// `Busy`, everything else is an internal fault.
pub(crate) fn db_err(e: rusqlite::Error) -> AttestError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e {
        if inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return AttestError::Conflict;
        }
        if matches!(
            inner.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return AttestError::Busy;
        }
    }
    AttestError::Internal(format!("database: {e}"))
}

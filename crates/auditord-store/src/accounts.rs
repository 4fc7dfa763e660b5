//! Accounts, sessions and account configuration.
//!
//! Passwords are stored as scrypt verifiers (N=32768, r=8, p=1, 32-byte
//! output) with per-account random salts. Sessions carry two independent
//! 32-byte tokens: the cookie token travels in the `__Host-` cookie, the
//! request token in the request body (double-submit CSRF). All token and
//! verifier comparisons are constant-time.

use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use scrypt::Params as ScryptParams;
use subtle::ConstantTimeEq;

use auditord_types::{
    AttestError, Result, DEFAULT_ALERT_DELAY, DEFAULT_VERIFY_INTERVAL, MAX_ALERT_DELAY,
    MAX_VERIFY_INTERVAL, MIN_ALERT_DELAY, MIN_VERIFY_INTERVAL, SESSION_LENGTH_MS,
};

use crate::db::{db_err, with_immediate};

static USERNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-zA-Z0-9]{1,32}$").expect("static regex"));

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("static regex"));

// Role addresses are never valid alert targets.
static EMAIL_BLACKLIST: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![Regex::new(
        "^(abuse|admin|administrator|contact|hostmaster|postmaster|root|security|webmaster)@",
    )
    .expect("static regex")]
});

/// Authenticated account context attached to a request.
#[derive(Clone, Debug)]
pub struct Account {
    pub user_id: i64,
    pub username: String,
    pub subscribe_key: Vec<u8>,
    pub verify_interval: i64,
    pub alert_delay: i64,
}

/// A freshly created login session.
#[derive(Clone, Debug)]
pub struct Session {
    pub session_id: i64,
    pub cookie_token: Vec<u8>,
    pub request_token: Vec<u8>,
}

fn generate_token() -> [u8; 32] {
    let mut token = [0u8; 32];
    OsRng.fill_bytes(&mut token);
    token
}

fn hash_password(password: &str, salt: &[u8]) -> Result<[u8; 32]> {
    // log2(32768) = 15.
    let params = ScryptParams::new(15, 8, 1, 32)
        .map_err(|e| AttestError::Internal(format!("scrypt params: {e}")))?;
    let mut out = [0u8; 32];
    scrypt::scrypt(password.as_bytes(), salt, &params, &mut out)
        .map_err(|e| AttestError::Internal(format!("scrypt: {e}")))?;
    Ok(out)
}

fn validate_username(username: &str) -> Result<()> {
    if !USERNAME.is_match(username) {
        return Err(AttestError::Malformed("invalid username".into()));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<()> {
    let length = password.chars().count();
    if !(8..=256).contains(&length) {
        return Err(AttestError::Malformed("invalid password length".into()));
    }
    Ok(())
}

/// Create an account with default intervals and a fresh subscribe key.
pub fn create_account(conn: &Connection, username: &str, password: &str, now: i64) -> Result<()> {
    validate_username(username)?;
    validate_password(password)?;

    let salt = generate_token();
    let hash = hash_password(password, &salt)?;
    let subscribe_key = generate_token();

    conn.execute(
        "INSERT INTO Accounts (username, passwordHash, passwordSalt, subscribeKey,
         creationTime, loginTime, verifyInterval, alertDelay)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            username,
            hash.as_slice(),
            salt.as_slice(),
            subscribe_key.as_slice(),
            now,
            now,
            DEFAULT_VERIFY_INTERVAL,
            DEFAULT_ALERT_DELAY,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Authenticate a username/password pair and mint a session. Expired
/// sessions are swept opportunistically inside the same transaction.
pub fn login(conn: &mut Connection, username: &str, password: &str, now: i64) -> Result<Session> {
    validate_password(password)?;
    let password = password.to_owned();
    let username = username.to_owned();

    with_immediate(conn, |tx| {
        let row = tx
            .query_row(
                "SELECT userId, passwordHash, passwordSalt FROM Accounts WHERE username = ?1",
                params![username],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        let (user_id, stored_hash, salt) = row.ok_or(AttestError::Unauthenticated)?;

        let candidate = hash_password(&password, &salt)?;
        if !bool::from(candidate.as_slice().ct_eq(stored_hash.as_slice())) {
            return Err(AttestError::Unauthenticated);
        }

        tx.execute("DELETE FROM Sessions WHERE expiryTime < ?1", params![now])
            .map_err(db_err)?;

        let cookie_token = generate_token();
        let request_token = generate_token();
        tx.execute(
            "INSERT INTO Sessions (userId, cookieToken, requestToken, expiryTime)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                cookie_token.as_slice(),
                request_token.as_slice(),
                now + SESSION_LENGTH_MS,
            ],
        )
        .map_err(db_err)?;
        let session_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE Accounts SET loginTime = ?1 WHERE userId = ?2",
            params![now, user_id],
        )
        .map_err(db_err)?;

        Ok(Session {
            session_id,
            cookie_token: cookie_token.to_vec(),
            request_token: request_token.to_vec(),
        })
    })
}

/// Verify a session by id and both tokens, returning the account.
/// With `end` the session row is deleted on success (logout).
pub fn verify_session(
    conn: &mut Connection,
    session_id: i64,
    cookie_token: &[u8],
    request_token: &[u8],
    now: i64,
    end: bool,
) -> Result<Account> {
    let cookie_token = cookie_token.to_vec();
    let request_token = request_token.to_vec();

    with_immediate(conn, |tx| {
        let row = tx
            .query_row(
                "SELECT Sessions.cookieToken, Sessions.requestToken, Sessions.expiryTime,
                        Accounts.userId, Accounts.username, Accounts.subscribeKey,
                        Accounts.verifyInterval, Accounts.alertDelay
                 FROM Sessions
                 INNER JOIN Accounts ON Accounts.userId = Sessions.userId
                 WHERE sessionId = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;
        let (stored_cookie, stored_request, expiry, user_id, username, subscribe_key, verify_interval, alert_delay) =
            row.ok_or(AttestError::Unauthenticated)?;

        let cookie_ok = bool::from(cookie_token.as_slice().ct_eq(stored_cookie.as_slice()));
        let request_ok = bool::from(request_token.as_slice().ct_eq(stored_request.as_slice()));
        if !cookie_ok || !request_ok || expiry < now {
            return Err(AttestError::Unauthenticated);
        }

        if end {
            tx.execute("DELETE FROM Sessions WHERE sessionId = ?1", params![session_id])
                .map_err(db_err)?;
        }

        Ok(Account {
            user_id,
            username,
            subscribe_key,
            verify_interval,
            alert_delay,
        })
    })
}

/// Delete every session of the account.
pub fn logout_everywhere(conn: &Connection, user_id: i64) -> Result<()> {
    conn.execute("DELETE FROM Sessions WHERE userId = ?1", params![user_id])
        .map_err(db_err)?;
    Ok(())
}

/// Change the password after verifying the current one. Every other
/// session of the account is invalidated in the same transaction.
pub fn change_password(
    conn: &mut Connection,
    user_id: i64,
    session_id: i64,
    current_password: &str,
    new_password: &str,
) -> Result<()> {
    validate_password(current_password)?;
    validate_password(new_password)?;
    let current_password = current_password.to_owned();
    let new_password = new_password.to_owned();

    with_immediate(conn, |tx| {
        let (stored_hash, salt) = tx
            .query_row(
                "SELECT passwordHash, passwordSalt FROM Accounts WHERE userId = ?1",
                params![user_id],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .map_err(db_err)?;
        let candidate = hash_password(&current_password, &salt)?;
        if !bool::from(candidate.as_slice().ct_eq(stored_hash.as_slice())) {
            return Err(AttestError::Unauthenticated);
        }

        let new_salt = generate_token();
        let new_hash = hash_password(&new_password, &new_salt)?;
        tx.execute(
            "UPDATE Accounts SET passwordHash = ?1, passwordSalt = ?2 WHERE userId = ?3",
            params![new_hash.as_slice(), new_salt.as_slice(), user_id],
        )
        .map_err(db_err)?;

        tx.execute(
            "DELETE FROM Sessions WHERE userId = ?1 AND sessionId != ?2",
            params![user_id, session_id],
        )
        .map_err(db_err)?;
        Ok(())
    })
}

/// Replace the account's subscribe key with fresh random bytes.
pub fn rotate_subscribe_key(conn: &Connection, user_id: i64) -> Result<()> {
    let key = generate_token();
    conn.execute(
        "UPDATE Accounts SET subscribeKey = ?1 WHERE userId = ?2",
        params![key.as_slice(), user_id],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Update verify/alert intervals and the alert address.
///
/// Accepted iff `MIN_VERIFY_INTERVAL <= verifyInterval <= MAX_VERIFY_INTERVAL`,
/// `MIN_ALERT_DELAY <= alertDelay <= MAX_ALERT_DELAY` and
/// `alertDelay > verifyInterval`. An empty email clears the address.
pub fn update_configuration(
    conn: &mut Connection,
    user_id: i64,
    verify_interval: i64,
    alert_delay: i64,
    email: &str,
) -> Result<()> {
    if !(MIN_VERIFY_INTERVAL..=MAX_VERIFY_INTERVAL).contains(&verify_interval) {
        return Err(AttestError::Malformed("verifyInterval out of range".into()));
    }
    if !(MIN_ALERT_DELAY..=MAX_ALERT_DELAY).contains(&alert_delay) || alert_delay <= verify_interval
    {
        return Err(AttestError::Malformed("alertDelay out of range".into()));
    }
    let email = email.trim().to_owned();
    if !email.is_empty() {
        if !EMAIL.is_match(&email) {
            return Err(AttestError::Malformed("invalid email address".into()));
        }
        if EMAIL_BLACKLIST.iter().any(|pattern| pattern.is_match(&email)) {
            return Err(AttestError::Malformed("role addresses are not accepted".into()));
        }
    }

    with_immediate(conn, |tx| {
        tx.execute(
            "UPDATE Accounts SET verifyInterval = ?1, alertDelay = ?2 WHERE userId = ?3",
            params![verify_interval, alert_delay, user_id],
        )
        .map_err(db_err)?;
        tx.execute("DELETE FROM EmailAddresses WHERE userId = ?1", params![user_id])
            .map_err(db_err)?;
        if !email.is_empty() {
            tx.execute(
                "INSERT INTO EmailAddresses (userId, address) VALUES (?1, ?2)",
                params![user_id, email],
            )
            .map_err(db_err)?;
        }
        Ok(())
    })
}

/// The account's alert address, if configured.
pub fn account_email(conn: &Connection, user_id: i64) -> Result<Option<String>> {
    conn.query_row(
        "SELECT address FROM EmailAddresses WHERE userId = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err)
}

/// Subscribe key and verify interval for the `/verify` authorization
/// path. `None` when the account does not exist.
pub fn subscribe_key_and_interval(conn: &Connection, user_id: i64) -> Result<Option<(Vec<u8>, i64)>> {
    conn.query_row(
        "SELECT subscribeKey, verifyInterval FROM Accounts WHERE userId = ?1",
        params![user_id],
        |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
    )
    .optional()
    .map_err(db_err)
}

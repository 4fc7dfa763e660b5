//! Protocol and policy constants.

/// Auditor protocol version accepted by the server. Messages carrying any
/// other version fail closed.
pub const PROTOCOL_VERSION: u8 = 4;

/// Length in bytes of a server-issued challenge nonce.
pub const CHALLENGE_LENGTH: usize = 32;

/// Seconds a challenge stays consumable after issue.
pub const CHALLENGE_EXPIRY_SECS: u64 = 60;

/// Upper bound on outstanding challenges. Bounds memory under
/// challenge-flood traffic; overflow evicts the oldest entry.
pub const MAX_PENDING_CHALLENGES: usize = 1_000_000;

/// Number of certificates in an auditor attestation chain:
/// leaf, two intermediates, vendor root.
pub const CHAIN_LENGTH: usize = 4;

/// Upper bound on a serialized attestation bundle.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Upper bound on an opaque sample submission.
pub const MAX_SAMPLE_SIZE: usize = 64 * 1024;

/// Seconds between verifications an account asks its devices for.
pub const DEFAULT_VERIFY_INTERVAL: i64 = 4 * 60 * 60;
pub const MIN_VERIFY_INTERVAL: i64 = 60 * 60;
pub const MAX_VERIFY_INTERVAL: i64 = 7 * 24 * 60 * 60;

/// Seconds without a verification before the owner is alerted.
/// Always strictly greater than the account's verify interval.
pub const DEFAULT_ALERT_DELAY: i64 = 48 * 60 * 60;
pub const MIN_ALERT_DELAY: i64 = 32 * 60 * 60;
pub const MAX_ALERT_DELAY: i64 = 2 * 7 * 24 * 60 * 60;

/// Session lifetime in milliseconds (48 hours).
pub const SESSION_LENGTH_MS: i64 = 48 * 60 * 60 * 1000;

/// Rows per page of attestation history.
pub const HISTORY_PER_PAGE: i64 = 20;

/// SQLite busy timeout in milliseconds.
pub const BUSY_TIMEOUT_MS: u64 = 10 * 1000;

/// Seconds between alert dispatcher wakeups.
pub const ALERT_TICK_SECS: u64 = 15 * 60;

/// Seconds between maintenance passes.
pub const MAINTENANCE_TICK_SECS: u64 = 24 * 60 * 60;

/// Milliseconds a soft-deleted device keeps its attestation history.
pub const DELETED_DEVICE_RETENTION_MS: i64 = 90 * 24 * 60 * 60 * 1000;

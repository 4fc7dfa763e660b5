//! auditord-store -- durable state for the attestation server.
//!
//! Two SQLite databases hold the truth: the main database (accounts,
//! sessions, devices, attestation history) and a write-only samples
//! database. Every multi-statement mutation runs inside a single
//! `BEGIN IMMEDIATE` transaction; busy/locked errors are retried once.
//!
//! The crate is synchronous. The server drives it from blocking tasks
//! and owns the cadence of the alert and maintenance passes.

pub mod accounts;
pub mod alerts;
pub mod db;
pub mod maintenance;
pub mod pinning;
pub mod samples;

pub use accounts::{Account, Session};
pub use alerts::{AlertScanSummary, LogMailer, Mailer};
pub use db::{now_millis, Database};
pub use maintenance::MaintenanceSummary;
pub use pinning::{DeviceRow, HistoryRow};

//! auditord-server -- HTTP ingress and background loops.
//!
//! Three public attestation endpoints (`/challenge`, `/verify`,
//! `/submit`), the authenticated account API over the pinning store,
//! and the two long-running tasks: the alert dispatcher and the daily
//! maintenance pass. Bound to loopback; a front proxy terminates TLS
//! and serves static assets.

pub mod error;
pub mod http;
pub mod session;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use auditord_store::{alerts, db, maintenance, now_millis, Database, LogMailer};
use auditord_types::{ALERT_TICK_SECS, MAINTENANCE_TICK_SECS};
use auditord_verify::{ChallengeIndex, Verifier};

/// Server configuration, assembled by the binary.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Listen address. Loopback in production; TLS terminates upstream.
    pub listen: SocketAddr,
    /// Directory holding the two databases.
    pub data_dir: PathBuf,
    /// Directory receiving maintenance backups.
    pub backup_dir: PathBuf,
    /// Canonical origin enforced on browser requests.
    pub origin: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".parse().expect("static address"),
            data_dir: PathBuf::from("."),
            backup_dir: PathBuf::from("backup"),
            origin: "https://attestation.example".into(),
        }
    }
}

/// Shared application state threaded to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub samples_db: Arc<Database>,
    pub verifier: Arc<Verifier>,
    pub origin: Arc<str>,
}

/// Initialize storage, start the background loops and serve until the
/// listener fails.
pub async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.backup_dir)?;

    let main_db = Arc::new(Database::new(config.data_dir.join("attestation.db")));
    let samples_db = Arc::new(Database::new(config.data_dir.join("samples.db")));
    db::initialize_attestation(&main_db)?;
    db::initialize_samples(&samples_db)?;
    info!("databases ready");

    let challenges = Arc::new(ChallengeIndex::new());
    let verifier = Arc::new(Verifier::with_builtin_root(challenges));

    let state = AppState {
        db: main_db.clone(),
        samples_db: samples_db.clone(),
        verifier,
        origin: config.origin.clone().into(),
    };

    spawn_alert_loop(main_db.clone());
    spawn_maintenance_loop(main_db, samples_db, config.backup_dir.clone());

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!("listening on {}", config.listen);
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_alert_loop(db: Arc<Database>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(ALERT_TICK_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let db = db.clone();
            let result = tokio::task::spawn_blocking(move || {
                let mut conn = db.open()?;
                alerts::run_alert_scan(&mut conn, &LogMailer, now_millis())
            })
            .await;
            match result {
                Ok(Ok(summary)) => {
                    if summary.alerts_sent > 0 || summary.recoveries_sent > 0 {
                        info!(
                            alerts = summary.alerts_sent,
                            recoveries = summary.recoveries_sent,
                            "alert scan"
                        );
                    }
                }
                Ok(Err(error)) => warn!(%error, "alert scan failed"),
                Err(error) => warn!(%error, "alert task panicked"),
            }
        }
    });
}

fn spawn_maintenance_loop(main_db: Arc<Database>, samples_db: Arc<Database>, backup_dir: PathBuf) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(MAINTENANCE_TICK_SECS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let main_db = main_db.clone();
            let samples_db = samples_db.clone();
            let backup_dir = backup_dir.clone();
            let result = tokio::task::spawn_blocking(move || {
                maintenance::run_maintenance(&main_db, &samples_db, &backup_dir, now_millis())
            })
            .await;
            match result {
                Ok(Ok(summary)) => info!(
                    expired_sessions = summary.expired_sessions,
                    purged_history = summary.purged_history_rows,
                    "maintenance pass"
                ),
                Ok(Err(error)) => warn!(%error, "maintenance failed"),
                Err(error) => warn!(%error, "maintenance task panicked"),
            }
        }
    });
}

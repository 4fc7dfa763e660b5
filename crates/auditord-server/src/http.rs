//! HTTP endpoints.
//!
//! Public attestation endpoints:
//! - POST /challenge -- one-shot nonce, `version || zeros || nonce`
//! - POST /verify    -- attestation bundle, `Authorization: Auditor ...`
//! - POST /submit    -- opaque sample blob
//! - GET  /api/status -- liveness probe
//!
//! Authenticated account API (session cookie + request-token
//! double-submit, origin-guarded): create-account, login, logout,
//! logout-everywhere, change-password, rotate, account, configuration,
//! devices.json, attestation-history.json, delete-device.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::trace::TraceLayer;
use tracing::info;

use auditord_store::{accounts, now_millis, pinning, samples};
use auditord_types::{
    AttestError, AuditorState, Result, CHALLENGE_LENGTH, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
    SESSION_LENGTH_MS,
};
use auditord_verify::catalogue;

use crate::error::{ApiError, PURGE_SESSION_COOKIE};
use crate::session::{self, AuthedSession};
use crate::AppState;

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/create-account", post(create_account))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/logout-everywhere", post(logout_everywhere))
        .route("/api/change-password", post(change_password))
        .route("/api/rotate", post(rotate))
        .route("/api/account", post(account))
        .route("/api/configuration", post(configuration))
        .route("/api/devices.json", post(devices_json))
        .route("/api/attestation-history.json", post(attestation_history))
        .route("/api/delete-device", post(delete_device))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session::origin_guard,
        ));

    Router::new()
        .route("/challenge", post(challenge))
        .route("/verify", post(verify))
        .route("/submit", post(submit))
        .route("/api/status", get(status))
        .merge(admin)
        .layer(DefaultBodyLimit::max(MAX_MESSAGE_SIZE))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run a synchronous store operation on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AttestError::Internal(format!("join: {e}")))?
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| AttestError::Malformed(format!("bad request body: {e}")))
}

// ── Public attestation endpoints ────────────────────────────────────

async fn status() -> &'static str {
    "success\n"
}

async fn challenge(State(state): State<AppState>) -> impl IntoResponse {
    let nonce = state.verifier.challenges().issue();
    let mut message = Vec::with_capacity(1 + CHALLENGE_LENGTH * 2);
    message.push(PROTOCOL_VERSION);
    message.extend_from_slice(&[0u8; CHALLENGE_LENGTH]);
    message.extend_from_slice(&nonce);
    message
}

async fn verify(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match verify_inner(state, headers, body).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(AttestError::TooLarge) => ApiError(AttestError::TooLarge).into_response(),
        Err(err @ (AttestError::Busy | AttestError::Internal(_))) => ApiError(err).into_response(),
        // Everything else, authentication included, is a plain 400 on
        // this endpoint; the auditor protocol has no 403 leg.
        Err(error) => {
            info!(%error, "verify rejected");
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
    }
}

async fn verify_inner(state: AppState, headers: HeaderMap, body: Bytes) -> Result<String> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AttestError::Malformed("missing authorization".into()))?;
    let mut tokens = authorization.split_ascii_whitespace();
    if tokens.next() != Some("Auditor") {
        return Err(AttestError::Malformed("bad authorization scheme".into()));
    }
    let user_id: i64 = tokens
        .next()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| AttestError::Malformed("bad userId".into()))?;
    let provided_key = match tokens.next() {
        Some(encoded) => Some(
            BASE64
                .decode(encoded)
                .map_err(|_| AttestError::Malformed("bad subscribe key encoding".into()))?,
        ),
        None => None,
    };
    if tokens.next().is_some() {
        return Err(AttestError::Malformed("bad authorization".into()));
    }

    let now = now_millis();
    blocking(move || {
        let mut conn = state.db.open()?;
        let (subscribe_key, verify_interval) =
            accounts::subscribe_key_and_interval(&conn, user_id)?
                .ok_or(AttestError::Unauthenticated)?;

        let strong = match &provided_key {
            Some(provided) => {
                if !bool::from(provided.as_slice().ct_eq(subscribe_key.as_slice())) {
                    return Err(AttestError::Unauthenticated);
                }
                true
            }
            None => false,
        };

        let report = state.verifier.verify(&body, now)?;
        pinning::record(&mut conn, &report, user_id, strong, now)?;

        Ok(format!("{} {}", BASE64.encode(&subscribe_key), verify_interval))
    })
    .await
}

async fn submit(State(state): State<AppState>, body: Bytes) -> std::result::Result<StatusCode, ApiError> {
    let now = now_millis();
    blocking(move || {
        let conn = state.samples_db.open()?;
        samples::insert_sample(&conn, &body, now)
    })
    .await?;
    Ok(StatusCode::OK)
}

// ── Account API ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateAccountRequest {
    username: String,
    password: String,
}

async fn create_account(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let request: CreateAccountRequest = parse_json(&body)?;
    let now = now_millis();
    blocking(move || {
        let conn = state.db.open()?;
        accounts::create_account(&conn, &request.username, &request.password, now)
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let request: LoginRequest = parse_json(&body)?;
    let now = now_millis();
    let session = blocking(move || {
        let mut conn = state.db.open()?;
        accounts::login(&mut conn, &request.username, &request.password, now)
    })
    .await?;

    let cookie = format!(
        "__Host-session={}|{}; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age={}",
        session.session_id,
        BASE64.encode(&session.cookie_token),
        SESSION_LENGTH_MS / 1000,
    );
    Ok((
        [(header::SET_COOKIE, cookie)],
        BASE64.encode(&session.request_token),
    )
        .into_response())
}

async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    session::authenticate(&state, &headers, &body, true).await?;
    Ok(([(header::SET_COOKIE, PURGE_SESSION_COOKIE)], StatusCode::OK).into_response())
}

async fn logout_everywhere(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let authed = session::authenticate(&state, &headers, &body, false).await?;
    blocking({
        let state = state.clone();
        move || {
            let conn = state.db.open()?;
            accounts::logout_everywhere(&conn, authed.account.user_id)
        }
    })
    .await?;
    Ok(([(header::SET_COOKIE, PURGE_SESSION_COOKIE)], StatusCode::OK).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest {
    request_token: String,
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let request: ChangePasswordRequest = parse_json(&body)?;
    let authed =
        session::authenticate(&state, &headers, request.request_token.as_bytes(), false).await?;
    blocking(move || {
        let mut conn = state.db.open()?;
        accounts::change_password(
            &mut conn,
            authed.account.user_id,
            authed.session_id,
            &request.current_password,
            &request.new_password,
        )
    })
    .await?;
    Ok(StatusCode::OK)
}

async fn rotate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let authed = session::authenticate(&state, &headers, &body, false).await?;
    blocking(move || {
        let conn = state.db.open()?;
        accounts::rotate_subscribe_key(&conn, authed.account.user_id)
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    username: String,
    verify_interval: i64,
    alert_delay: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
}

async fn account(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<AccountResponse>, ApiError> {
    let authed = session::authenticate(&state, &headers, &body, false).await?;
    let email = blocking({
        let state = state.clone();
        let user_id = authed.account.user_id;
        move || {
            let conn = state.db.open_read_only()?;
            accounts::account_email(&conn, user_id)
        }
    })
    .await?;

    Ok(Json(AccountResponse {
        username: authed.account.username,
        verify_interval: authed.account.verify_interval,
        alert_delay: authed.account.alert_delay,
        email,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigurationRequest {
    request_token: String,
    verify_interval: i64,
    alert_delay: i64,
    email: String,
}

async fn configuration(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let request: ConfigurationRequest = parse_json(&body)?;
    let authed =
        session::authenticate(&state, &headers, request.request_token.as_bytes(), false).await?;
    blocking(move || {
        let mut conn = state.db.open()?;
        accounts::update_configuration(
            &mut conn,
            authed.account.user_id,
            request.verify_interval,
            request.alert_delay,
            &request.email,
        )
    })
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceJson {
    fingerprint: String,
    pinned_certificate0: String,
    pinned_certificate1: String,
    pinned_certificate2: String,
    pinned_certificate3: String,
    verified_boot_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified_boot_hash: Option<String>,
    os_name: String,
    name: String,
    pinned_os_version: i64,
    pinned_os_patch_level: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pinned_vendor_patch_level: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pinned_boot_patch_level: Option<i64>,
    pinned_app_version: i64,
    pinned_security_level: i64,
    #[serde(flatten)]
    state: AuditorState,
    verified_time_first: i64,
    verified_time_last: i64,
    min_id: i64,
    max_id: i64,
}

async fn devices_json(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<Vec<DeviceJson>>, ApiError> {
    let authed = session::authenticate(&state, &headers, &body, false).await?;
    let rows = blocking({
        let state = state.clone();
        let user_id = authed.account.user_id;
        move || {
            let conn = state.db.open_read_only()?;
            pinning::devices_for_account(&conn, user_id)
        }
    })
    .await?;

    let devices = rows
        .into_iter()
        .map(|row| {
            let boot_key_hex = hex::encode_upper(&row.verified_boot_key);
            let info = catalogue::lookup_any(row.security_level, &boot_key_hex).ok_or_else(|| {
                AttestError::Internal(format!("pinned verified boot key {boot_key_hex} not in catalogue"))
            })?;
            Ok(DeviceJson {
                fingerprint: hex::encode_upper(&row.fingerprint),
                pinned_certificate0: to_pem(&row.pinned_certificates[0]),
                pinned_certificate1: to_pem(&row.pinned_certificates[1]),
                pinned_certificate2: to_pem(&row.pinned_certificates[2]),
                pinned_certificate3: to_pem(&row.pinned_certificates[3]),
                verified_boot_key: boot_key_hex,
                verified_boot_hash: row.verified_boot_hash.map(hex::encode_upper),
                os_name: info.os_name.to_owned(),
                name: info.name.to_owned(),
                pinned_os_version: row.os_version,
                pinned_os_patch_level: row.os_patch_level,
                pinned_vendor_patch_level: row.vendor_patch_level,
                pinned_boot_patch_level: row.boot_patch_level,
                pinned_app_version: row.app_version,
                pinned_security_level: row.security_level.as_i64(),
                state: row.state,
                verified_time_first: row.verified_time_first,
                verified_time_last: row.verified_time_last,
                min_id: row.min_history_id,
                max_id: row.max_history_id,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Json(devices))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRequest {
    request_token: String,
    fingerprint: String,
    offset_id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryJson {
    id: i64,
    time: i64,
    strong: bool,
    tee_enforced: String,
    os_enforced: String,
}

async fn attestation_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<Vec<HistoryJson>>, ApiError> {
    let request: HistoryRequest = parse_json(&body)?;
    let authed =
        session::authenticate(&state, &headers, request.request_token.as_bytes(), false).await?;
    let fingerprint = hex::decode(&request.fingerprint)
        .map_err(|_| AttestError::Malformed("bad fingerprint encoding".into()))?;

    let rows = blocking({
        let state = state.clone();
        let user_id = authed.account.user_id;
        move || {
            let conn = state.db.open_read_only()?;
            pinning::attestation_history(&conn, user_id, &fingerprint, request.offset_id)
        }
    })
    .await?;

    Ok(Json(
        rows.into_iter()
            .map(|row| HistoryJson {
                id: row.id,
                time: row.time,
                strong: row.strong,
                tee_enforced: row.tee_enforced,
                os_enforced: row.os_enforced,
            })
            .collect(),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteDeviceRequest {
    request_token: String,
    fingerprint: String,
}

async fn delete_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, ApiError> {
    let request: DeleteDeviceRequest = parse_json(&body)?;
    let authed =
        session::authenticate(&state, &headers, request.request_token.as_bytes(), false).await?;
    let fingerprint = hex::decode(&request.fingerprint)
        .map_err(|_| AttestError::Malformed("bad fingerprint encoding".into()))?;

    let now = now_millis();
    blocking(move || {
        let conn = state.db.open()?;
        pinning::delete_device(&conn, authed.account.user_id, &fingerprint, now)
    })
    .await?;
    Ok(StatusCode::OK)
}

fn to_pem(der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = String::with_capacity(encoded.len() + 64);
    pem.push_str("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(chunk).expect("base64 output is ascii"));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_wraps_at_64_columns() {
        let pem = to_pem(&[0xabu8; 120]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.ends_with("-----END CERTIFICATE-----"));
        let lines: Vec<&str> = pem.lines().collect();
        // 120 bytes -> 160 base64 chars -> 64 + 64 + 32.
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[1].len(), 64);
        assert_eq!(lines[2].len(), 64);
        assert_eq!(lines[3].len(), 32);
    }

    #[test]
    fn challenge_message_layout() {
        // version || zeros || nonce, 65 bytes total.
        assert_eq!(1 + CHALLENGE_LENGTH * 2, 65);
    }
}

//! Session cookie handling, CSRF double-submit and the origin guard.
//!
//! The origin guard runs as middleware over the admin routes; handlers
//! call [`authenticate`] with the request token their body carried.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use auditord_store::{accounts, now_millis, Account};
use auditord_types::{AttestError, Result};

use crate::error::ApiError;
use crate::AppState;

pub const SESSION_COOKIE: &str = "__Host-session";

/// Credentials carried by the session cookie.
pub struct SessionCredentials {
    pub session_id: i64,
    pub cookie_token: Vec<u8>,
}

/// An authenticated request context.
pub struct AuthedSession {
    pub account: Account,
    pub session_id: i64,
}

/// Extract `<sessionId>|<base64 cookieToken>` from the cookie header.
pub fn credentials_from_headers(headers: &axum::http::HeaderMap) -> Result<SessionCredentials> {
    let cookie_value = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|cookie| {
            let (name, value) = cookie.trim().split_once('=')?;
            (name == SESSION_COOKIE).then(|| value.to_owned())
        })
        .next()
        .ok_or(AttestError::Unauthenticated)?;

    let (id, token_b64) = cookie_value
        .split_once('|')
        .ok_or(AttestError::Unauthenticated)?;
    let session_id: i64 = id.parse().map_err(|_| AttestError::Unauthenticated)?;
    let cookie_token = BASE64
        .decode(token_b64)
        .map_err(|_| AttestError::Unauthenticated)?;
    Ok(SessionCredentials {
        session_id,
        cookie_token,
    })
}

/// Verify the session cookie against the base64 request token from the
/// request body. With `end` the session is terminated (logout).
pub async fn authenticate(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    request_token_b64: &[u8],
    end: bool,
) -> Result<AuthedSession> {
    let credentials = credentials_from_headers(headers)?;
    let request_token = BASE64
        .decode(request_token_b64)
        .map_err(|_| AttestError::Unauthenticated)?;

    let db = state.db.clone();
    let session_id = credentials.session_id;
    let account = tokio::task::spawn_blocking(move || {
        let mut conn = db.open()?;
        accounts::verify_session(
            &mut conn,
            session_id,
            &credentials.cookie_token,
            &request_token,
            now_millis(),
            end,
        )
    })
    .await
    .map_err(|e| AttestError::Internal(format!("join: {e}")))??;

    Ok(AuthedSession {
        account,
        session_id,
    })
}

/// Reject cross-origin browser requests on the admin routes. Headers
/// that are absent are allowed (native clients); present headers must
/// name the canonical origin / same-origin fetch.
pub async fn origin_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();

    let origin_ok = match headers.get(header::ORIGIN) {
        Some(value) => value.to_str().is_ok_and(|value| value == state.origin.as_ref()),
        None => true,
    };
    let mode_ok = match headers.get("sec-fetch-mode") {
        Some(value) => value.to_str().is_ok_and(|value| value == "same-origin"),
        None => true,
    };
    let site_ok = match headers.get("sec-fetch-site") {
        Some(value) => value.to_str().is_ok_and(|value| value == "same-origin"),
        None => true,
    };

    if !(origin_ok && mode_ok && site_ok) {
        return ApiError(AttestError::Unauthenticated).into_response();
    }
    next.run(request).await
}

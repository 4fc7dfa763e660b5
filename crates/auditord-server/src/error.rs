//! HTTP mapping of the core error kinds.
//!
//! Status codes are assigned here and nowhere else: 400 malformed or
//! verification failure, 403 authentication, 409 unique conflict, 413
//! body too large, 500 anything unexpected. Internal detail is logged
//! and never sent to clients.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::error;

use auditord_types::AttestError;

/// Cookie value that expires the session cookie immediately.
pub const PURGE_SESSION_COOKIE: &str =
    "__Host-session=; HttpOnly; Secure; SameSite=Strict; Path=/; Max-Age=0";

/// Wrapper carrying a core error across the axum boundary.
#[derive(Debug)]
pub struct ApiError(pub AttestError);

impl From<AttestError> for ApiError {
    fn from(err: AttestError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self.0 {
            AttestError::Malformed(_)
            | AttestError::StaleChallenge
            | AttestError::UnknownDevice
            | AttestError::Mismatch(_)
            | AttestError::Revoked => (StatusCode::BAD_REQUEST, self.0.to_string()).into_response(),
            AttestError::Unauthenticated => (
                StatusCode::FORBIDDEN,
                [(header::SET_COOKIE, PURGE_SESSION_COOKIE)],
                self.0.to_string(),
            )
                .into_response(),
            AttestError::TooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.0.to_string()).into_response()
            }
            AttestError::Conflict => (StatusCode::CONFLICT, self.0.to_string()).into_response(),
            AttestError::Busy | AttestError::Internal(_) => {
                error!(error = %self.0, "unhandled error handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditord_types::MismatchKind;

    fn status_of(err: AttestError) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn status_mapping() {
        assert_eq!(status_of(AttestError::Malformed("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(AttestError::StaleChallenge), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(AttestError::UnknownDevice), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(AttestError::Mismatch(MismatchKind::Pinning)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(AttestError::Revoked), StatusCode::BAD_REQUEST);
        assert_eq!(status_of(AttestError::Unauthenticated), StatusCode::FORBIDDEN);
        assert_eq!(status_of(AttestError::TooLarge), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(status_of(AttestError::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_of(AttestError::Busy), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            status_of(AttestError::Internal("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_never_leaks() {
        let response = ApiError(AttestError::Internal("secret path".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        // Body is the generic message; the detail only reaches the log.
    }

    #[test]
    fn unauthenticated_purges_cookie() {
        let response = ApiError(AttestError::Unauthenticated).into_response();
        let cookie = response.headers().get(header::SET_COOKIE).unwrap();
        assert!(cookie.to_str().unwrap().contains("Max-Age=0"));
    }
}

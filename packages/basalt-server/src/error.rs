//! HTTP mapping for core errors.
//!
//! Semantic error kinds map onto status codes; the body carries a JSON
//! `{ "error": ... }` with the display message. Auth *failures* (wrong
//! signature on a challenge) are not errors on the wire — the auth route
//! answers 200 with `success: false`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use basalt_core::Error;

/// Wrapper giving core errors an HTTP shape.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) | Error::UserNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidToken | Error::ChallengeExpired => StatusCode::UNAUTHORIZED,
            Error::UserRevoked(_) | Error::InvalidSignature | Error::UnknownSigner(_) => {
                StatusCode::FORBIDDEN
            }
            Error::InvalidArgument(_) | Error::DependencyMissing(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal error");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: Error) -> StatusCode {
        ApiError(err).into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(Error::NotFound("doc".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_of(Error::InvalidToken), StatusCode::UNAUTHORIZED);
        assert_eq!(status_of(Error::ChallengeExpired), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_of(Error::UserRevoked("alice".into())),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_of(Error::InvalidSignature), StatusCode::FORBIDDEN);
        assert_eq!(
            status_of(Error::InvalidArgument("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(Error::Corruption("tag".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

//! HTTP rendering of fabric errors.
//!
//! Handlers and middleware speak the domain error taxonomy; this
//! wrapper decides which status code each kind maps to and renders the
//! JSON body, so no route builds responses for failures by hand.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use acf_domain::Error;

/// A fabric error crossing the HTTP boundary.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::LockFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

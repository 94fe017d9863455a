//! Bearer-token guard for protected routes.
//!
//! The token itself never lives in memory past startup: the env var
//! named by `config.server.api_token_env` is hashed once into
//! `AppState::api_token_digest`, and each request's presented token is
//! hashed and compared against that digest in constant time.  With no
//! digest configured the guard waves everything through (dev mode).

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use acf_domain::Error;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Middleware for `axum::middleware::from_fn_with_state`: rejects
/// requests whose bearer token does not hash to the configured digest.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_token_digest else {
        // Dev mode: no token configured, nothing to enforce.
        return Ok(next.run(req).await);
    };

    match presented_digest(req.headers()) {
        Some(digest) if bool::from(digest.as_slice().ct_eq(expected.as_slice())) => {
            Ok(next.run(req).await)
        }
        _ => Err(Error::Auth("invalid or missing API token".into()).into()),
    }
}

/// SHA-256 of the bearer token carried on the request, if any.
/// Hashing before comparison keeps the check constant-time without
/// leaking the configured token's length.
fn presented_digest(headers: &HeaderMap) -> Option<[u8; 32]> {
    let authorization = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = authorization.strip_prefix("Bearer ")?;
    Some(Sha256::digest(token.as_bytes()).into())
}

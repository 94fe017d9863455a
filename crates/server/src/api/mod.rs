pub mod auth;
pub mod error;
pub mod health;
pub mod inbound;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the API router.
///
/// Routes are split into **public** (health probes) and **protected**
/// (gated behind the `ACF_API_TOKEN` bearer-token middleware).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/healthz", get(health::healthz));

    let protected = Router::new()
        .route("/v1/inbound", post(inbound::inbound))
        .layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}

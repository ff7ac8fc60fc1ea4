pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod rate_limit;
pub mod routes;
pub mod state;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Assembles the relay's router: a public branch reachable without a
/// signed request (§4.5 step 5's unsigned-endpoint allowlist) merged with
/// a protected branch that runs signature verification then rate limiting.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/api/identity/register", post(routes::identity::register))
        .route("/api/identity/:moltbot_id", get(routes::identity::fetch))
        .route("/api/identity/:moltbot_id/prekey", get(routes::identity::consume_prekey))
        .route("/api/pair/submit/:token", post(routes::pairing::submit))
        .route("/api/pair/status/:token", get(routes::pairing::status));

    let protected = Router::new()
        .route("/api/identity/:moltbot_id/prekeys", post(routes::identity::replenish_prekeys))
        .route("/api/conversations", post(routes::conversations::create))
        .route("/api/conversations/:conversation_id", get(routes::conversations::fetch))
        .route("/api/conversations/:conversation_id/members", post(routes::conversations::add_member))
        .route(
            "/api/conversations/:conversation_id/members/:moltbot_id",
            axum::routing::delete(routes::conversations::remove_member),
        )
        .route("/api/conversations/:conversation_id/leave", post(routes::conversations::leave))
        .route("/api/conversations/:conversation_id/messages", post(routes::messages::post))
        .route("/api/conversations/:conversation_id/messages", get(routes::messages::poll))
        .route("/api/pair/initiate", post(routes::pairing::initiate))
        .layer(middleware::from_fn_with_state(state.clone(), auth::enforce_rate_limit))
        .layer(middleware::from_fn_with_state(state.clone(), auth::verify_signature));

    public.merge(protected).with_state(state)
}

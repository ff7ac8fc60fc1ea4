//! Request-signature verification middleware, wired straight through
//! `protocol::auth`'s transport-agnostic canonicalization (§4.5).
//!
//! Applied only to the router branch that needs it; `POST
//! /api/identity/register`, `GET /api/identity/:id`, `GET
//! /api/pair/status/:token` and `POST /api/pair/submit` never see this layer
//! (§4.5 step 5's unsigned-endpoint allowlist).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::error::AppError;
use crate::state::AppState;

/// The caller's verified identity, inserted into request extensions for
/// downstream handlers (and for the rate limiter layered after this one).
#[derive(Clone)]
pub struct AuthenticatedMoltbotId(pub String);

/// §6 "Max body 256 KiB".
const MAX_BODY_BYTES: usize = 256 * 1024;

pub async fn verify_signature(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let (mut parts, body) = request.into_parts();

    let moltbot_id = header_str(&parts, "x-moltbot-id")?;
    let timestamp_millis: i64 = header_str(&parts, "x-timestamp")?
        .parse()
        .map_err(|_| AppError(protocol::MoltdmError::Authentication("malformed X-Timestamp header".to_string())))?;
    let signature = header_str(&parts, "x-signature")?;

    let verifying_key = state
        .db
        .verifying_key_for(&moltbot_id)
        .await?
        .ok_or_else(|| AppError(protocol::MoltdmError::Authentication("unknown moltbotId".to_string())))?;

    // §6 "Max body 256 KiB" / §8 "256 KiB + 1 body is rejected before
    // parsing": enforce the cap while reading, before any JSON decoding.
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| AppError(protocol::MoltdmError::Validation(format!("body too large or unreadable: {e}"))))?;

    let now_millis = current_millis();
    protocol::auth::verify_request(
        &verifying_key,
        timestamp_millis,
        now_millis,
        parts.method.as_str(),
        parts.uri.path(),
        &body_bytes,
        &signature,
    )?;

    parts.extensions.insert(AuthenticatedMoltbotId(moltbot_id));
    let request = Request::from_parts(parts, Body::from(body_bytes));
    Ok(next.run(request).await)
}

pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let Some(AuthenticatedMoltbotId(moltbot_id)) = request.extensions().get::<AuthenticatedMoltbotId>().cloned() else {
        return Err(AppError(protocol::MoltdmError::Authentication(
            "rate limiter ran before signature verification".to_string(),
        )));
    };
    if !state.rate_limiter.allow(&moltbot_id) {
        return Ok(StatusCode::TOO_MANY_REQUESTS.into_response());
    }
    Ok(next.run(request).await)
}

fn header_str(parts: &axum::http::request::Parts, name: &str) -> Result<String, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError(protocol::MoltdmError::Authentication(format!("missing {name} header"))))
}

fn current_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

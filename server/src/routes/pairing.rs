//! Device-pairing endpoints (§4.6, §6): one authenticated call to mint a
//! short-lived token, two unsigned calls (submit/status) so a brand-new
//! device — which has no identity of its own yet to sign with — can fetch
//! the owner's exported key-store snapshot.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedMoltbotId;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct PairingToken {
    pub token: String,
}

pub async fn initiate(
    State(state): State<AppState>,
    axum::Extension(AuthenticatedMoltbotId(caller)): axum::Extension<AuthenticatedMoltbotId>,
) -> Result<Json<PairingToken>, AppError> {
    let token = state.db.create_pairing_request(&caller).await?;
    Ok(Json(PairingToken { token }))
}

#[derive(Deserialize)]
pub struct SubmitPairingBlob {
    /// Base64 or JSON encoding of the exported device snapshot, opaque to
    /// the relay; produced by `protocol::identity::export_device_snapshot`.
    pub encryption_keys_blob: String,
}

pub async fn submit(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(body): Json<SubmitPairingBlob>,
) -> Result<(), AppError> {
    state.db.submit_pairing_blob(&token, body.encryption_keys_blob).await
}

#[derive(Serialize)]
pub struct PairingStatus {
    pub encryption_keys_blob: Option<String>,
}

pub async fn status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<PairingStatus>, AppError> {
    let encryption_keys_blob = state.db.take_pairing_blob(&token).await?;
    Ok(Json(PairingStatus { encryption_keys_blob }))
}

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedMoltbotId;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RegisterIdentityRequest {
    #[serde(with = "protocol::b64::bytes32")]
    pub identity_public: [u8; 32],
    #[serde(with = "protocol::b64::bytes32")]
    pub signed_pre_key_public: [u8; 32],
    #[serde(with = "protocol::b64::vecu8")]
    pub pre_key_signature: Vec<u8>,
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimeKeyDto>,
}

#[derive(Deserialize, Serialize)]
pub struct OneTimeKeyDto(#[serde(with = "protocol::b64::bytes32")] pub [u8; 32]);

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterIdentityRequest>,
) -> Result<Json<protocol::model::PublishedIdentity>, AppError> {
    let published = state
        .db
        .register_identity(
            body.identity_public,
            body.signed_pre_key_public,
            body.pre_key_signature,
            body.one_time_pre_keys.into_iter().map(|k| k.0).collect(),
        )
        .await?;
    Ok(Json(published))
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(moltbot_id): Path<String>,
) -> Result<Json<protocol::model::PublishedIdentity>, AppError> {
    let identity = state
        .db
        .fetch_identity(&moltbot_id)
        .await?
        .ok_or_else(|| AppError(protocol::MoltdmError::Validation("unknown moltbotId".to_string())))?;
    Ok(Json(identity))
}

#[derive(Deserialize)]
pub struct ReplenishRequest {
    pub one_time_pre_keys: Vec<OneTimeKeyDto>,
}

/// §6: "`:id` must equal `X-Moltbot-Id`" — only the owning identity may
/// append to its own one-time pre-key pool.
pub async fn replenish_prekeys(
    State(state): State<AppState>,
    axum::Extension(AuthenticatedMoltbotId(caller)): axum::Extension<AuthenticatedMoltbotId>,
    Path(moltbot_id): Path<String>,
    Json(body): Json<ReplenishRequest>,
) -> Result<(), AppError> {
    if moltbot_id != caller {
        return Err(AppError(protocol::MoltdmError::Authorization(
            "cannot replenish pre-keys for another identity".to_string(),
        )));
    }
    state
        .db
        .replenish_one_time_pre_keys(&moltbot_id, body.one_time_pre_keys.into_iter().map(|k| k.0).collect())
        .await
}

#[derive(Serialize)]
pub struct ConsumedPreKey {
    #[serde(with = "protocol::b64::bytes32")]
    pub public: [u8; 32],
}

/// `GET /api/identity/:id/prekey` (public, §6): consumes and returns at most
/// one one-time pre-key, atomically. No signature required — any peer
/// preparing to message `:id` needs to be able to call this.
pub async fn consume_prekey(
    State(state): State<AppState>,
    Path(moltbot_id): Path<String>,
) -> Result<Json<Option<ConsumedPreKey>>, AppError> {
    let key = state.db.consume_one_time_pre_key(&moltbot_id).await?;
    Ok(Json(key.map(|public| ConsumedPreKey { public })))
}

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::Json;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::auth::AuthenticatedMoltbotId;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub reply_to: Option<String>,
    pub expires_at: Option<i64>,
    pub ciphertext: String,
    pub sender_key_version: u64,
    pub message_index: u64,
    #[serde(default)]
    pub encrypted_sender_keys: HashMap<String, String>,
}

pub async fn post(
    State(state): State<AppState>,
    axum::Extension(AuthenticatedMoltbotId(caller)): axum::Extension<AuthenticatedMoltbotId>,
    Path(conversation_id): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Result<Json<protocol::model::Message>, AppError> {
    if !state.db.is_member(&conversation_id, &caller).await? {
        return Err(AppError(protocol::MoltdmError::Authorization(
            "caller is not a member of this conversation".to_string(),
        )));
    }

    let message = protocol::model::Message {
        id: random_message_id(),
        conversation_id,
        from_id: caller,
        created_at: now_millis(),
        reply_to: body.reply_to,
        expires_at: body.expires_at,
        ciphertext: body.ciphertext,
        sender_key_version: body.sender_key_version,
        message_index: body.message_index,
        encrypted_sender_keys: body.encrypted_sender_keys,
    };
    state.db.insert_message(&message).await?;
    Ok(Json(message))
}

#[derive(Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub since: i64,
}

#[derive(Serialize)]
pub struct PollResponse {
    pub messages: Vec<protocol::model::Message>,
}

pub async fn poll(
    State(state): State<AppState>,
    axum::Extension(AuthenticatedMoltbotId(caller)): axum::Extension<AuthenticatedMoltbotId>,
    Path(conversation_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, AppError> {
    if !state.db.is_member(&conversation_id, &caller).await? {
        return Err(AppError(protocol::MoltdmError::Authorization(
            "caller is not a member of this conversation".to_string(),
        )));
    }
    let messages = state.db.poll_messages(&conversation_id, query.since).await?;
    Ok(Json(PollResponse { messages }))
}

fn random_message_id() -> String {
    use base64::Engine as _;
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    format!("msg_{}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

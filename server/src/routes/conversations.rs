use std::collections::HashSet;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::auth::AuthenticatedMoltbotId;
use crate::error::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct CreateConversationRequest {
    pub id: String,
    pub members: HashSet<String>,
    #[serde(default)]
    pub admins: HashSet<String>,
}

pub async fn create(
    State(state): State<AppState>,
    axum::Extension(AuthenticatedMoltbotId(caller)): axum::Extension<AuthenticatedMoltbotId>,
    Json(mut body): Json<CreateConversationRequest>,
) -> Result<(), AppError> {
    body.members.insert(caller.clone());
    body.admins.insert(caller);
    state.db.create_conversation(body.id, body.members, body.admins).await
}

pub async fn fetch(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> Result<Json<protocol::model::Conversation>, AppError> {
    let conversation = state
        .db
        .get_conversation(&conversation_id)
        .await?
        .ok_or_else(|| AppError(protocol::MoltdmError::Validation("unknown conversation".to_string())))?;
    Ok(Json(conversation))
}

#[derive(Deserialize)]
pub struct MemberRequest {
    pub moltbot_id: String,
}

pub async fn add_member(
    State(state): State<AppState>,
    axum::Extension(AuthenticatedMoltbotId(caller)): axum::Extension<AuthenticatedMoltbotId>,
    Path(conversation_id): Path<String>,
    Json(body): Json<MemberRequest>,
) -> Result<(), AppError> {
    require_member(&state, &conversation_id, &caller).await?;
    state.db.add_member(&conversation_id, &body.moltbot_id).await
}

pub async fn remove_member(
    State(state): State<AppState>,
    axum::Extension(AuthenticatedMoltbotId(caller)): axum::Extension<AuthenticatedMoltbotId>,
    Path((conversation_id, moltbot_id)): Path<(String, String)>,
) -> Result<(), AppError> {
    require_member(&state, &conversation_id, &caller).await?;
    state.db.remove_member(&conversation_id, &moltbot_id).await
}

pub async fn leave(
    State(state): State<AppState>,
    axum::Extension(AuthenticatedMoltbotId(caller)): axum::Extension<AuthenticatedMoltbotId>,
    Path(conversation_id): Path<String>,
) -> Result<(), AppError> {
    state.db.remove_member(&conversation_id, &caller).await
}

async fn require_member(state: &AppState, conversation_id: &str, moltbot_id: &str) -> Result<(), AppError> {
    if state.db.is_member(conversation_id, moltbot_id).await? {
        Ok(())
    } else {
        Err(AppError(protocol::MoltdmError::Authorization(
            "caller is not a member of this conversation".to_string(),
        )))
    }
}

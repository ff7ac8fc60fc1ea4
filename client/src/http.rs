//! Thin `reqwest`-based relay transport. Every signed call goes through
//! [`RelayClient::signed`], which builds the same canonical string the
//! server's `verify_signature` middleware recomputes (`protocol::auth`) —
//! this is the "transport-agnostic canonicalization" seam §4.5 calls for.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use protocol::model::{Conversation, Message, PublishedIdentity};
use protocol::{MoltdmError, Result};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn unsigned(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.http.request(method, &url);
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| MoltdmError::Transport(format!("{e}")))?;
        read_response(response).await
    }

    /// `path` is the canonical path the server's middleware will recompute
    /// (`axum`'s `Uri::path()` never includes the query string, per
    /// `protocol::auth::canonical_message`); any query string goes in
    /// `query_suffix` and is appended only to the actual request URL.
    async fn signed(
        &self,
        moltbot_id: &str,
        identity_key: &SigningKey,
        method: Method,
        path: &str,
        query_suffix: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        let body_bytes = match &body {
            Some(v) => serde_json::to_vec(v).map_err(|e| MoltdmError::Validation(format!("request body serialize: {e}")))?,
            None => Vec::new(),
        };
        let timestamp_millis = now_millis();
        let signed = protocol::auth::sign_request(moltbot_id, identity_key, timestamp_millis, method.as_str(), path, &body_bytes);

        let url = format!("{}{path}{query_suffix}", self.base_url);
        let mut request = self
            .http
            .request(method, &url)
            .header("X-Moltbot-Id", &signed.moltbot_id)
            .header("X-Timestamp", signed.timestamp_millis.to_string())
            .header("X-Signature", &signed.signature);
        if !body_bytes.is_empty() {
            request = request.header("content-type", "application/json").body(body_bytes);
        }
        let response = request.send().await.map_err(|e| MoltdmError::Transport(format!("{e}")))?;
        read_response(response).await
    }

    pub async fn register_identity(
        &self,
        identity_public: [u8; 32],
        signed_pre_key_public: [u8; 32],
        pre_key_signature: &[u8],
        one_time_pre_keys: &[[u8; 32]],
    ) -> Result<PublishedIdentity> {
        let body = json!({
            "identity_public": protocol::b64::encode(&identity_public),
            "signed_pre_key_public": protocol::b64::encode(&signed_pre_key_public),
            "pre_key_signature": protocol::b64::encode(pre_key_signature),
            "one_time_pre_keys": one_time_pre_keys.iter().map(|k| protocol::b64::encode(k)).collect::<Vec<_>>(),
        });
        let value = self.unsigned(Method::POST, "/api/identity/register", Some(body)).await?;
        from_value(value)
    }

    pub async fn fetch_identity(&self, moltbot_id: &str) -> Result<PublishedIdentity> {
        let value = self.unsigned(Method::GET, &format!("/api/identity/{moltbot_id}"), None).await?;
        from_value(value)
    }

    pub async fn create_conversation(
        &self,
        moltbot_id: &str,
        identity_key: &SigningKey,
        conversation_id: &str,
        members: &[String],
    ) -> Result<()> {
        let body = json!({ "id": conversation_id, "members": members });
        self.signed(moltbot_id, identity_key, Method::POST, "/api/conversations", "", Some(body)).await?;
        Ok(())
    }

    pub async fn get_conversation(&self, moltbot_id: &str, identity_key: &SigningKey, conversation_id: &str) -> Result<Conversation> {
        let value = self
            .signed(
                moltbot_id,
                identity_key,
                Method::GET,
                &format!("/api/conversations/{conversation_id}"),
                "",
                None,
            )
            .await?;
        from_value(value)
    }

    pub async fn add_member(&self, moltbot_id: &str, identity_key: &SigningKey, conversation_id: &str, new_member: &str) -> Result<()> {
        let body = json!({ "moltbot_id": new_member });
        self.signed(
            moltbot_id,
            identity_key,
            Method::POST,
            &format!("/api/conversations/{conversation_id}/members"),
            "",
            Some(body),
        )
        .await?;
        Ok(())
    }

    pub async fn remove_member(&self, moltbot_id: &str, identity_key: &SigningKey, conversation_id: &str, member: &str) -> Result<()> {
        self.signed(
            moltbot_id,
            identity_key,
            Method::DELETE,
            &format!("/api/conversations/{conversation_id}/members/{member}"),
            "",
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn leave_conversation(&self, moltbot_id: &str, identity_key: &SigningKey, conversation_id: &str) -> Result<()> {
        self.signed(
            moltbot_id,
            identity_key,
            Method::POST,
            &format!("/api/conversations/{conversation_id}/leave"),
            "",
            None,
        )
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn post_message(
        &self,
        moltbot_id: &str,
        identity_key: &SigningKey,
        conversation_id: &str,
        ciphertext: &str,
        sender_key_version: u64,
        message_index: u64,
        encrypted_sender_keys: &HashMap<String, String>,
    ) -> Result<Message> {
        let body = json!({
            "reply_to": Value::Null,
            "expires_at": Value::Null,
            "ciphertext": ciphertext,
            "sender_key_version": sender_key_version,
            "message_index": message_index,
            "encrypted_sender_keys": encrypted_sender_keys,
        });
        let value = self
            .signed(
                moltbot_id,
                identity_key,
                Method::POST,
                &format!("/api/conversations/{conversation_id}/messages"),
                "",
                Some(body),
            )
            .await?;
        from_value(value)
    }

    pub async fn poll_messages(&self, moltbot_id: &str, identity_key: &SigningKey, conversation_id: &str, since_millis: i64) -> Result<Vec<Message>> {
        let path = format!("/api/conversations/{conversation_id}/messages");
        let query_suffix = format!("?since={since_millis}");
        let value = self.signed(moltbot_id, identity_key, Method::GET, &path, &query_suffix, None).await?;
        let messages = value
            .get("messages")
            .cloned()
            .ok_or_else(|| MoltdmError::Transport("relay response missing `messages`".to_string()))?;
        from_value(messages)
    }

    pub async fn initiate_pairing(&self, moltbot_id: &str, identity_key: &SigningKey) -> Result<String> {
        let value = self.signed(moltbot_id, identity_key, Method::POST, "/api/pair/initiate", "", None).await?;
        value
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MoltdmError::Transport("relay response missing `token`".to_string()))
    }

    pub async fn submit_pairing_blob(&self, token: &str, encryption_keys_blob: String) -> Result<()> {
        let body = json!({ "encryption_keys_blob": encryption_keys_blob });
        self.unsigned(Method::POST, &format!("/api/pair/submit/{token}"), Some(body)).await?;
        Ok(())
    }

    pub async fn pairing_status(&self, token: &str) -> Result<Option<String>> {
        let value = self.unsigned(Method::GET, &format!("/api/pair/status/{token}"), None).await?;
        Ok(value.get("encryption_keys_blob").and_then(Value::as_str).map(str::to_string))
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let value: Value = response.json().await.unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(value);
    }
    let message = value.get("message").and_then(Value::as_str).unwrap_or("relay request failed").to_string();
    Err(match status {
        StatusCode::BAD_REQUEST => MoltdmError::Validation(message),
        StatusCode::UNAUTHORIZED => MoltdmError::Authentication(message),
        StatusCode::FORBIDDEN => MoltdmError::Authorization(message),
        StatusCode::CONFLICT => MoltdmError::Keying(message),
        _ => MoltdmError::Transport(format!("{status}: {message}")),
    })
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| MoltdmError::Validation(format!("relay response decode: {e}")))
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

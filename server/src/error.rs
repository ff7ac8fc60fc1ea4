//! Maps `protocol::MoltdmError` (and the relay's own storage/IO failures)
//! onto HTTP responses, per §6: "the server maps these to HTTP status codes
//! via an `axum::response::IntoResponse` impl."

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::MoltdmError;
use serde::Serialize;

pub struct AppError(pub MoltdmError);

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            MoltdmError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            MoltdmError::Authentication(_) => (StatusCode::UNAUTHORIZED, "authentication"),
            MoltdmError::Authorization(_) => (StatusCode::FORBIDDEN, "authorization"),
            MoltdmError::Keying(_) => (StatusCode::CONFLICT, "keying"),
            MoltdmError::CryptoIntegrity(_) => (StatusCode::BAD_REQUEST, "crypto_integrity"),
            MoltdmError::Transport(_) => (StatusCode::INTERNAL_SERVER_ERROR, "transport"),
            MoltdmError::ProtocolBreaking(_) => (StatusCode::CONFLICT, "protocol_breaking"),
        };
        (
            status,
            Json(ErrorBody {
                kind,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<MoltdmError> for AppError {
    fn from(value: MoltdmError) -> Self {
        AppError(value)
    }
}

impl From<tokio_rusqlite::Error> for AppError {
    fn from(value: tokio_rusqlite::Error) -> Self {
        AppError(MoltdmError::Transport(format!("sqlite: {value}")))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        AppError(MoltdmError::Transport(format!("sqlite: {value}")))
    }
}

use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::anthropic::GenerationError;

#[derive(Debug, Error)]
pub enum StoryError {
    #[error("invalid request: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("a generation is already in progress for this session")]
    RequestInFlight,
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("story {0} not found")]
    StoryNotFound(Uuid),
    #[error("version {0} not found")]
    VersionNotFound(u32),
    #[error("unknown section {0:?}")]
    UnknownSection(String),
    #[error("unknown export format {0:?}; expected txt, md, json, pdf or zip")]
    UnknownFormat(String),
    #[error("export failed: {0}")]
    Export(String),
}

impl StoryError {
    /// Stable machine-readable kind, shown next to the human message.
    pub fn kind(&self) -> &'static str {
        match self {
            StoryError::Validation(_) => "ValidationError",
            StoryError::Generation(e) => e.kind(),
            StoryError::RequestInFlight => "RequestInFlight",
            StoryError::SessionNotFound(_) => "SessionNotFound",
            StoryError::StoryNotFound(_) => "StoryNotFound",
            StoryError::VersionNotFound(_) => "VersionNotFound",
            StoryError::UnknownSection(_) => "UnknownSection",
            StoryError::UnknownFormat(_) => "UnknownFormat",
            StoryError::Export(_) => "ExportError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            StoryError::Validation(_)
            | StoryError::UnknownSection(_)
            | StoryError::UnknownFormat(_) => StatusCode::BAD_REQUEST,
            StoryError::Generation(e) => match e {
                GenerationError::Authentication(_) => StatusCode::UNAUTHORIZED,
                GenerationError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
                GenerationError::Network(_) | GenerationError::Service { .. } => StatusCode::BAD_GATEWAY,
                GenerationError::Cancelled => StatusCode::CONFLICT,
            },
            StoryError::RequestInFlight => StatusCode::CONFLICT,
            StoryError::SessionNotFound(_)
            | StoryError::StoryNotFound(_)
            | StoryError::VersionNotFound(_) => StatusCode::NOT_FOUND,
            StoryError::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JsonRejection> for StoryError {
    fn from(rejection: JsonRejection) -> Self {
        StoryError::Validation(vec![rejection.body_text()])
    }
}

impl From<PathRejection> for StoryError {
    fn from(rejection: PathRejection) -> Self {
        StoryError::Validation(vec![rejection.body_text()])
    }
}

impl IntoResponse for StoryError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "❌ {}", self);
        } else {
            tracing::warn!(kind = self.kind(), "{}", self);
        }
        let mut body = json!({ "error": self.kind(), "message": self.to_string() });
        if let StoryError::Validation(problems) = &self {
            body["problems"] = json!(problems);
        }
        (status, Json(body)).into_response()
    }
}

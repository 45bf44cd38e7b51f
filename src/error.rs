use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum AppError {
    #[error("failed to spawn process '{process}': {reason}")]
    SpawnError { process: String, reason: String },

    #[error("transport failure on process '{process}': {reason}")]
    TransportError { process: String, reason: String },

    #[error("protocol violation from process '{process}': {reason}")]
    ProtocolError { process: String, reason: String },

    #[error("tool reported an error: {0}")]
    ToolError(String),

    #[error("unknown process: '{0}'")]
    UnknownProcessError(String),

    #[error("unknown tool '{tool}' on process '{process}'")]
    UnknownToolError { process: String, tool: String },

    #[error("no tool matched the request above confidence {threshold}")]
    NoMatchError { threshold: f32 },

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("call to process '{process}' timed out after {timeout_ms}ms")]
    Timeout { process: String, timeout_ms: u64 },

    #[error("catalog error: {0}")]
    CatalogError(String),

    #[error("embedding failed: {0}")]
    EmbeddingError(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("Service temporarily unavailable: {0}")]
    ResourceError(String),
}

impl AppError {
    /// Stable tag for the error kind, used in responses and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::SpawnError { .. } => "spawn_error",
            AppError::TransportError { .. } => "transport_error",
            AppError::ProtocolError { .. } => "protocol_error",
            AppError::ToolError(_) => "tool_error",
            AppError::UnknownProcessError(_) => "unknown_process",
            AppError::UnknownToolError { .. } => "unknown_tool",
            AppError::NoMatchError { .. } => "no_match",
            AppError::InvalidArguments { .. } => "invalid_arguments",
            AppError::Timeout { .. } => "timeout",
            AppError::CatalogError(_) => "catalog_error",
            AppError::EmbeddingError(_) => "embedding_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::ResourceError(_) => "resource_error",
        }
    }

    /// True for failures of the machinery itself, as opposed to ordinary
    /// outcomes such as "nothing matched" or a tool refusing its input.
    pub fn is_abnormal(&self) -> bool {
        matches!(
            self,
            AppError::SpawnError { .. }
                | AppError::TransportError { .. }
                | AppError::ProtocolError { .. }
                | AppError::Timeout { .. }
                | AppError::CatalogError(_)
                | AppError::EmbeddingError(_)
        )
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::NoMatchError { .. }
            | AppError::UnknownProcessError(_)
            | AppError::UnknownToolError { .. } => StatusCode::NOT_FOUND,
            AppError::ValidationError(_) | AppError::InvalidArguments { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::ToolError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::SpawnError { .. }
            | AppError::TransportError { .. }
            | AppError::ProtocolError { .. } => StatusCode::BAD_GATEWAY,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::ResourceError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CatalogError(_) | AppError::EmbeddingError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
    code: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();

        if self.is_abnormal() {
            tracing::error!(error = %self, kind, "Request failed");
        } else if matches!(self, AppError::NoMatchError { .. }) {
            tracing::debug!(error = %self, "No tool matched");
        } else {
            tracing::warn!(error = %self, kind, "Request rejected");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            kind,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_match_is_not_abnormal() {
        let err = AppError::NoMatchError { threshold: 0.6 };
        assert!(!err.is_abnormal());
        assert_eq!(err.kind(), "no_match");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_transport_error_is_abnormal() {
        let err = AppError::TransportError {
            process: "files".into(),
            reason: "broken pipe".into(),
        };
        assert!(err.is_abnormal());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(err.to_string().contains("files"));
    }

    #[test]
    fn test_tool_error_carries_message() {
        let err = AppError::ToolError("file not found".into());
        assert_eq!(err.to_string(), "tool reported an error: file not found");
        assert!(!err.is_abnormal());
    }
}

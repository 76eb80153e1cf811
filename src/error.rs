use axum::http::StatusCode;
use thiserror::Error;

/// Every failure the control plane reports to a caller.
///
/// `Display` is the operator-facing detail and goes to the log; `public_message`
/// is what leaves the process.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Server not found: {0}")]
    NotFound(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The server root itself does not exist. Not a traversal attempt.
    #[error("Server root missing: {0}")]
    RootMissing(String),

    #[error("Script missing: {0}")]
    ScriptMissing(String),

    #[error("{0}")]
    ExecutionFailure(String),

    #[error("Log unavailable: {0}")]
    LogUnavailable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0} not configured")]
    ServiceUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::UnknownAction(_) => "unknown_action",
            Self::InvalidPath(_) => "invalid_path",
            Self::RootMissing(_) => "root_missing",
            Self::ScriptMissing(_) => "script_missing",
            Self::ExecutionFailure(_) => "execution_failure",
            Self::LogUnavailable(_) => "log_unavailable",
            Self::BadRequest(_) => "bad_request",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Upstream(_) => "upstream",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) | Self::ScriptMissing(_) | Self::RootMissing(_) => {
                StatusCode::NOT_FOUND
            }
            Self::UnknownAction(_) | Self::InvalidPath(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::ServiceUnavailable(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::ExecutionFailure(_) | Self::LogUnavailable(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to hand to a caller. Never carries a filesystem path.
    pub fn public_message(&self) -> String {
        match self {
            Self::Unauthorized => "Unauthorized".to_string(),
            Self::NotFound(_) => "Not found".to_string(),
            Self::UnknownAction(_) => "Unknown action".to_string(),
            Self::InvalidPath(_) => "invalid path".to_string(),
            Self::RootMissing(_) => "server root missing".to_string(),
            Self::ScriptMissing(_) => "Script not found".to_string(),
            Self::LogUnavailable(_) => "could not read log".to_string(),
            Self::Internal(_) => "internal error".to_string(),
            Self::ExecutionFailure(msg)
            | Self::BadRequest(msg)
            | Self::Upstream(msg) => msg.clone(),
            Self::ServiceUnavailable(_) => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_hides_paths() {
        let err = ControlError::InvalidPath("/srv/app/../../etc/passwd".into());
        assert_eq!(err.public_message(), "invalid path");
        assert!(err.to_string().contains("/etc/passwd"));

        let err = ControlError::LogUnavailable("/srv/app/server.log: No such file".into());
        assert!(!err.public_message().contains("/srv"));

        let err = ControlError::Internal("servers.json: expected value".into());
        assert_eq!(err.public_message(), "internal error");

        let err = ControlError::RootMissing("/srv/gone".into());
        assert_eq!(err.public_message(), "server root missing");
        assert_eq!(err.kind(), "root_missing");
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ControlError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ControlError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ControlError::UnknownAction("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ControlError::ServiceUnavailable("assistant".into()).status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            ControlError::ExecutionFailure("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_kinds_are_snake_case() {
        assert_eq!(ControlError::ScriptMissing("x".into()).kind(), "script_missing");
        assert_eq!(ControlError::ServiceUnavailable("x".into()).kind(), "service_unavailable");
    }
}

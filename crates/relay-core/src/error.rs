//! Error taxonomy shared by every component of the routing core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error kinds a caller can ever observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "NotFoundError")]
    NotFound,
    #[serde(rename = "AuthorizationError")]
    Authorization,
    #[serde(rename = "ConflictError")]
    Conflict,
    #[serde(rename = "InternalError")]
    Internal,
    #[serde(rename = "RoutingError")]
    Routing,
    #[serde(rename = "TimeoutError")]
    Timeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "ValidationError"),
            Self::NotFound => write!(f, "NotFoundError"),
            Self::Authorization => write!(f, "AuthorizationError"),
            Self::Conflict => write!(f, "ConflictError"),
            Self::Internal => write!(f, "InternalError"),
            Self::Routing => write!(f, "RoutingError"),
            Self::Timeout => write!(f, "TimeoutError"),
        }
    }
}

/// Typed failure raised by agents, the registry, or the orchestrator.
///
/// Agents return these (wrapped in `anyhow::Error`) for expected failures.
/// Anything that is not an `AgentError` is demoted to `InternalError` by the
/// orchestrator before it reaches a caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("{message}{}", field_suffix(.field))]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    Routing(String),

    #[error("{0}")]
    Timeout(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("dispatch cancelled by caller")]
    Cancelled,
}

fn field_suffix(field: &Option<String>) -> String {
    field
        .as_ref()
        .map(|f| format!(" (field: {})", f))
        .unwrap_or_default()
}

impl AgentError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The taxonomy kind this error is reported as
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Routing(_) | Self::ShuttingDown => ErrorKind::Routing,
            Self::Timeout(_) | Self::Cancelled => ErrorKind::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(AgentError::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(AgentError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(
            AgentError::Authorization("x".into()).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(AgentError::conflict("x").kind(), ErrorKind::Conflict);
        assert_eq!(AgentError::internal("x").kind(), ErrorKind::Internal);
        assert_eq!(AgentError::routing("x").kind(), ErrorKind::Routing);
        assert_eq!(AgentError::ShuttingDown.kind(), ErrorKind::Routing);
        assert_eq!(AgentError::Cancelled.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_validation_display_with_field() {
        let err = AgentError::invalid_field("title", "Title cannot be empty");
        assert_eq!(err.to_string(), "Title cannot be empty (field: title)");

        let err = AgentError::validation("Action cannot be empty");
        assert_eq!(err.to_string(), "Action cannot be empty");
    }

    #[test]
    fn test_error_kind_serde() {
        let json = serde_json::to_string(&ErrorKind::Routing).unwrap();
        assert_eq!(json, "\"RoutingError\"");
        let kind: ErrorKind = serde_json::from_str("\"TimeoutError\"").unwrap();
        assert_eq!(kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_error_kind_display_matches_serde() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::NotFound,
            ErrorKind::Authorization,
            ErrorKind::Conflict,
            ErrorKind::Internal,
            ErrorKind::Routing,
            ErrorKind::Timeout,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = AgentError::not_found("Task not found: 42").into();
        let typed = err.downcast_ref::<AgentError>().unwrap();
        assert_eq!(typed.kind(), ErrorKind::NotFound);
    }
}

//! Error types for the finance query orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("Connector error: {0}")]
    ConnectorError(#[from] ConnectorError),

    #[error(transparent)]
    SchemaViolation(#[from] SchemaViolation),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Narration error: {0}")]
    NarrationError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl OrchestrationError {
    /// Transient faults are the only ones the orchestrator retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestrationError::ConnectorError(ConnectorError::Timeout(_))
        )
    }

    /// Short machine-readable kind, used in result markers and API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::PlanningError(_) => "planning_error",
            OrchestrationError::ConnectorError(ConnectorError::Timeout(_)) => "timeout",
            OrchestrationError::ConnectorError(ConnectorError::NotFound(_)) => "not_found",
            OrchestrationError::ConnectorError(ConnectorError::AuthFailure(_)) => "auth_failure",
            OrchestrationError::ConnectorError(ConnectorError::Source(_)) => "connector_error",
            OrchestrationError::SchemaViolation(_) => "schema_violation",
            OrchestrationError::ComputationError(_) => "computation_error",
            OrchestrationError::Timeout(_) => "request_timeout",
            OrchestrationError::NarrationError(_) => "narration_error",
            OrchestrationError::LlmError(_) => "llm_error",
            OrchestrationError::ConfigError(_) => "config_error",
            OrchestrationError::DatabaseError(_) => "database_error",
            OrchestrationError::AuditError(_) => "audit_error",
            OrchestrationError::SerializationError(_) => "serialization_error",
            OrchestrationError::HttpError(_) => "http_error",
            OrchestrationError::IoError(_) => "io_error",
        }
    }
}

/// Source-level faults raised by data connectors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("capability not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("source failure: {0}")]
    Source(String),
}

/// A payload that does not match its declared contract at a component boundary
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Schema violation at {boundary} ({path}): {message}")]
pub struct SchemaViolation {
    pub boundary: String,
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(
        boundary: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            boundary: boundary.into(),
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connector_timeouts_are_transient() {
        assert!(OrchestrationError::from(ConnectorError::Timeout("slow".into())).is_transient());
        assert!(!OrchestrationError::from(ConnectorError::NotFound("x".into())).is_transient());
        assert!(!OrchestrationError::from(SchemaViolation::new("b", "$", "bad")).is_transient());
        assert!(!OrchestrationError::ComputationError("bad".into()).is_transient());
        assert!(!OrchestrationError::Timeout("budget".into()).is_transient());
    }

    #[test]
    fn test_kind_labels() {
        let err = OrchestrationError::from(SchemaViolation::new("connector:x", "$[0].amount", "expected decimal"));
        assert_eq!(err.kind(), "schema_violation");
        assert!(err.to_string().contains("$[0].amount"));
    }
}

use std::time::Duration;

use thiserror::Error;

use crate::domain::turn::FailureKind;

/// Failure talking to something outside the engine: HTTP endpoints, LLM providers, tools.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExternalCallError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider error: {0}")]
    Provider(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("agent step budget of {0} exhausted")]
    StepBudgetExhausted(u32),
    #[error("{0} is not configured")]
    NotConfigured(String),
}

impl ExternalCallError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Status { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

/// Rate limiting and server-side failures are worth another attempt.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

/// Errors raised while interpreting a solution graph.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("dangling configuration reference: {0}")]
    ConfigReference(String),
    #[error("expression evaluation failed: {0}")]
    ExpressionEvaluation(String),
    #[error("external call failed: {0}")]
    ExternalCall(#[from] ExternalCallError),
    #[error("suspended position no longer matches the solution: {0}")]
    SuspensionMismatch(String),
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ConfigReference(_) => FailureKind::ConfigReference,
            Self::ExpressionEvaluation(_) => FailureKind::ExpressionEvaluation,
            Self::ExternalCall(_) => FailureKind::ExternalCall,
            Self::SuspensionMismatch(_) => FailureKind::SuspensionMismatch,
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            Self::ConfigReference(_) => "config_reference",
            Self::ExpressionEvaluation(_) => "expression_evaluation",
            Self::ExternalCall(_) => "external_call",
            Self::SuspensionMismatch(_) => "suspension_mismatch",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("session store backend failure: {0}")]
    Backend(String),
    #[error("could not decode stored session `{session_id}`: {message}")]
    Decode { session_id: String, message: String },
    #[error("session `{session_id}` was modified concurrently (expected version {expected})")]
    VersionConflict { session_id: String, expected: u64 },
}

/// Errors that stop the turn pipeline before the engine can answer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("session `{0}` already has a turn in flight")]
    SessionBusy(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl RuntimeError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        match self {
            Self::SessionBusy(session_id) => InterfaceError::ServiceUnavailable {
                message: format!("session `{session_id}` is busy"),
                correlation_id,
            },
            Self::Store(StoreError::VersionConflict { .. }) => InterfaceError::ServiceUnavailable {
                message: "session was updated concurrently".to_owned(),
                correlation_id,
            },
            Self::Store(StoreError::Backend(message)) => {
                InterfaceError::ServiceUnavailable { message, correlation_id }
            }
            Self::Store(error @ StoreError::Decode { .. }) => {
                InterfaceError::Internal { message: error.to_string(), correlation_id }
            }
        }
    }
}

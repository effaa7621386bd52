//! Error types for the ThinkLoop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentState;

/// The top-level error type for all ThinkLoop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Skill errors ---
    #[error("Skill error: {0}")]
    Skill(#[from] SkillError),

    // --- Lifecycle errors ---
    #[error("Invalid state: {0}")]
    InvalidState(#[from] InvalidStateError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a reasoning loop may continue past this error as an observation.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Tool(e) => e.is_recoverable(),
            Self::Skill(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Structured `{code, message, recoverable}` view of this error.
    pub fn detail(&self) -> ErrorDetail {
        match self {
            Self::Tool(e) => e.detail(),
            Self::Skill(e) => e.detail(),
            Self::Provider(_) => ErrorDetail::new("PROVIDER_ERROR", self.to_string(), false),
            Self::InvalidState(_) => ErrorDetail::new("INVALID_STATE", self.to_string(), false),
            Self::Execution(_) => ErrorDetail::new("EXECUTION_ERROR", self.to_string(), false),
            _ => ErrorDetail::new("INTERNAL_ERROR", self.to_string(), false),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Best-effort text of a caught panic payload.
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

/// The `{code, message, recoverable}` triple carried by failed tool and
/// skill results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub recoverable: bool,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            recoverable,
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid tool arguments for {tool_name}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    /// The tool ran and reported `success: false`.
    #[error("Tool {tool_name} failed [{code}]: {message}")]
    Failed {
        tool_name: String,
        code: String,
        message: String,
        recoverable: bool,
    },
}

impl ToolError {
    pub fn code(&self) -> &str {
        match self {
            Self::NotFound(_) => "TOOL_NOT_FOUND",
            Self::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Failed { code, .. } => code,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Failed { recoverable, .. } => *recoverable,
            _ => true,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        let message = match self {
            Self::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorDetail::new(self.code(), message, self.is_recoverable())
    }
}

#[derive(Debug, Clone, Error)]
pub enum SkillError {
    #[error("Skill not found: {0}")]
    NotFound(String),

    #[error("Invalid input for skill {skill_id}: {reason}")]
    InvalidInput { skill_id: String, reason: String },

    #[error("Skill {skill_id} was aborted")]
    Aborted { skill_id: String },

    /// The skill ran and reported `success: false`.
    #[error("Skill {skill_id} failed [{code}]: {message}")]
    Failed {
        skill_id: String,
        code: String,
        message: String,
        recoverable: bool,
    },
}

impl SkillError {
    pub fn code(&self) -> &str {
        match self {
            Self::NotFound(_) => "SKILL_NOT_FOUND",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Aborted { .. } => "ABORTED",
            Self::Failed { code, .. } => code,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Failed { recoverable, .. } => *recoverable,
            Self::Aborted { .. } => false,
            _ => true,
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        let message = match self {
            Self::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorDetail::new(self.code(), message, self.is_recoverable())
    }
}

/// An operation was attempted in a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidStateError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: AgentState, to: AgentState },

    #[error("cannot {operation} while agent is {state}")]
    Busy { operation: String, state: AgentState },

    #[error("cannot {operation}: agent is destroyed")]
    Destroyed { operation: String },
}

/// Wraps an uncaught failure from a top-level entry point.
///
/// Never recoverable: the agent has moved to `ERROR`.
#[derive(Debug, Error)]
#[error("Execution of {operation} failed: {source}")]
pub struct ExecutionError {
    pub operation: String,
    #[source]
    pub source: Box<Error>,
}

impl ExecutionError {
    pub fn new(operation: impl Into<String>, source: Error) -> Self {
        Self {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn recoverable(&self) -> bool {
        false
    }
}

//! Error types for the virtual gateway

use std::io;

use thiserror::Error;

use crate::composer::{TemplateError, WorkflowError};
use crate::discovery::DiscoveryError;

/// Result type alias for the virtual gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Virtual gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Composite tool definition failed validation
    #[error("{0}")]
    Validation(String),

    /// No authenticated identity on the call context
    #[error("no authenticated identity in context")]
    NoIdentity,

    /// Capability discovery failed
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Capability name is unknown to every backend
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    /// Backend not found in the registry
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Backend could not be reached (transport-level failure)
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend ran the tool but the tool reported a failure
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// Session lookup failed
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session exists but holds no usable state
    #[error("Session error: {0}")]
    Session(String),

    /// Template expansion error
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Workflow execution error
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    /// The owning call context was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// The owning call context ran past its deadline
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::Json(_) | Self::Yaml(_) => rpc_codes::PARSE_ERROR,
            Self::Validation(_) | Self::Config(_) => rpc_codes::INVALID_PARAMS,
            Self::CapabilityNotFound(_) | Self::BackendNotFound(_) => rpc_codes::NOT_FOUND,
            Self::NoIdentity | Self::SessionNotFound(_) => rpc_codes::UNAUTHORIZED,
            Self::BackendUnavailable(_) | Self::Discovery(_) => rpc_codes::SERVER_ERROR_START,
            Self::DeadlineExceeded => rpc_codes::TIMEOUT,
            Self::Workflow(e) if e.is_timeout() => rpc_codes::TIMEOUT,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Whether this error stems from a deadline rather than a failure
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::DeadlineExceeded => true,
            Self::Discovery(e) => matches!(e, DiscoveryError::DeadlineExceeded),
            Self::Workflow(e) => e.is_timeout(),
            _ => false,
        }
    }

    /// Whether this error stems from cancellation of the owning context
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Discovery(e) => matches!(e, DiscoveryError::Cancelled),
            Self::Template(e) => matches!(e, TemplateError::Cancelled),
            Self::Workflow(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

/// JSON-RPC error codes used by the gateway
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start (backend unavailable)
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Capability or backend not found
    pub const NOT_FOUND: i32 = -32001;
    /// Missing or unknown identity/session
    pub const UNAUTHORIZED: i32 = -32002;
    /// Operation exceeded its deadline
    pub const TIMEOUT: i32 = -32003;
}

//! Capability discovery.
//!
//! - [`manager`]: per-identity, version-aware cache in front of the aggregator
//! - [`middleware`]: runs discovery once per protocol session

pub mod manager;
pub mod middleware;

use thiserror::Error;

pub use manager::{DefaultManager, DiscoveryOptions, Manager};
pub use middleware::{
    DiscoveredCapabilities, DiscoveryLayerState, SESSION_ID_HEADER, discovered_capabilities,
    discovery_middleware, with_discovery,
};

/// Discovery failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    /// Discovery was attempted for an anonymous caller
    #[error(
        "no authenticated identity in context; ensure auth middleware runs before discovery middleware"
    )]
    NoIdentity,

    /// Aggregation failed
    #[error("capability discovery failed: {0}")]
    Failed(String),

    /// The caller's context was cancelled
    #[error("capability discovery cancelled")]
    Cancelled,

    /// The caller's deadline passed before aggregation finished
    #[error("capability discovery timed out")]
    DeadlineExceeded,
}

impl From<crate::context::Interrupt> for DiscoveryError {
    fn from(value: crate::context::Interrupt) -> Self {
        match value {
            crate::context::Interrupt::Cancelled => Self::Cancelled,
            crate::context::Interrupt::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

impl From<crate::Error> for DiscoveryError {
    fn from(value: crate::Error) -> Self {
        match value {
            crate::Error::Discovery(e) => e,
            crate::Error::Cancelled => Self::Cancelled,
            crate::Error::DeadlineExceeded => Self::DeadlineExceeded,
            crate::Error::NoIdentity => Self::NoIdentity,
            other => Self::Failed(other.to_string()),
        }
    }
}

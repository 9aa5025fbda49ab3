//! Virtual MCP gateway library
//!
//! Aggregates the capabilities of many backend MCP servers behind one
//! endpoint and exposes composite tools implemented as workflows.
//!
//! # Components
//!
//! - **Discovery**: per-identity, registry-version-aware capability cache with
//!   health filtering, plus an axum middleware that discovers once per session
//! - **Composer**: template expansion, DAG execution with retries and
//!   elicitation pause/resume, typed output construction
//! - **Validation**: static checks on composite tool definitions before they
//!   are exposed to clients

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod cli;
pub mod composer;
pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod health;
pub mod session;
pub mod vmcp;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}

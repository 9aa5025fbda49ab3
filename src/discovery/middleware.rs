//! Discovery middleware.
//!
//! Requests without an `Mcp-Session-Id` header start a session: capabilities
//! are discovered once under a bounded timeout and the routing table is stored
//! in the session after the handler ran. Requests carrying the header reuse the
//! stored routing table and never trigger discovery.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use super::{DiscoveryError, Manager};
use crate::context::{CallContext, Identity};
use crate::error::rpc_codes;
use crate::session::SessionManager;
use crate::vmcp::{AggregatedCapabilities, AggregationMetadata, BackendRegistry};

/// Session header name (lowercase, as axum normalizes)
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Default bound on discovery during session initialization
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Capabilities attached to a request by the middleware
#[derive(Debug, Clone)]
pub struct DiscoveredCapabilities(pub Arc<AggregatedCapabilities>);

/// Shared state for [`discovery_middleware`]
#[derive(Clone)]
pub struct DiscoveryLayerState {
    manager: Arc<dyn Manager>,
    registry: Arc<dyn BackendRegistry>,
    sessions: Arc<SessionManager>,
    timeout: Duration,
}

impl DiscoveryLayerState {
    /// State with the default discovery timeout
    pub fn new(
        manager: Arc<dyn Manager>,
        registry: Arc<dyn BackendRegistry>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            manager,
            registry,
            sessions,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    /// Override the discovery timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Wrap `router` with discovery plus the panic and trace layers.
///
/// Layers added after this call run before discovery, so authentication that
/// inserts an [`Identity`] extension must be layered on the returned router.
pub fn with_discovery<S>(router: Router<S>, state: DiscoveryLayerState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(middleware::from_fn_with_state(state, discovery_middleware))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Capabilities the middleware attached to `request`, if any
pub fn discovered_capabilities<B>(request: &Request<B>) -> Option<Arc<AggregatedCapabilities>> {
    request
        .extensions()
        .get::<DiscoveredCapabilities>()
        .map(|c| Arc::clone(&c.0))
}

/// Discovery middleware, mounted with `axum::middleware::from_fn_with_state`
pub async fn discovery_middleware(
    State(state): State<DiscoveryLayerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let session_id = request
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string);

    match session_id {
        None => initialize_session(&state, request, next).await,
        Some(id) => resume_session(&state, &id, request, next).await,
    }
}

async fn initialize_session(
    state: &DiscoveryLayerState,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let mut ctx = CallContext::new();
    if let Some(identity) = request.extensions().get::<Identity>() {
        ctx = ctx.with_identity(identity.clone());
    }

    let backends = state.registry.list();
    debug!(backends = backends.len(), "Discovering capabilities for new session");

    let discovery_ctx = ctx.with_timeout(state.timeout);
    let capabilities = match state.manager.discover(&discovery_ctx, &backends).await {
        Ok(caps) => caps,
        Err(DiscoveryError::DeadlineExceeded) => {
            warn!(timeout = ?state.timeout, "Capability discovery timed out");
            return rpc_error_response(
                StatusCode::GATEWAY_TIMEOUT,
                rpc_codes::TIMEOUT,
                "Gateway Timeout: capability discovery timed out",
            );
        }
        Err(e) => {
            error!(error = %e, "Capability discovery failed");
            return rpc_error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                rpc_codes::SERVER_ERROR_START,
                &format!("Service Unavailable: {e}"),
            );
        }
    };

    let ctx = ctx.with_capabilities(Arc::clone(&capabilities));
    request
        .extensions_mut()
        .insert(DiscoveredCapabilities(Arc::clone(&capabilities)));
    request.extensions_mut().insert(ctx);

    let mut response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let existing = response
        .headers()
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToString::to_string);

    let session = match existing {
        Some(id) => state.sessions.get_or_create(&id),
        None => {
            let session = state.sessions.create();
            match HeaderValue::from_str(session.id()) {
                Ok(value) => {
                    response.headers_mut().insert(SESSION_ID_HEADER, value);
                }
                Err(e) => warn!(session_id = %session.id(), error = %e, "Invalid session header"),
            }
            session
        }
    };

    session.set_capabilities(capabilities.routing_table.clone(), capabilities.tools.clone());
    info!(
        session_id = %session.id(),
        tools = capabilities.tools.len(),
        "Stored routing table in session"
    );
    response
}

async fn resume_session(
    state: &DiscoveryLayerState,
    session_id: &str,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(session) = state.sessions.get(session_id) else {
        warn!(session_id = %session_id, "Unknown session");
        return rpc_error_response(
            StatusCode::UNAUTHORIZED,
            rpc_codes::UNAUTHORIZED,
            "Session not found",
        );
    };

    let Some(routing_table) = session.routing_table() else {
        error!(session_id = %session_id, "Session has no routing table");
        return rpc_error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            rpc_codes::INTERNAL_ERROR,
            "Session has no stored routing table",
        );
    };

    let tools = session.tools();
    let capabilities = Arc::new(AggregatedCapabilities {
        metadata: AggregationMetadata {
            tool_count: tools.len(),
            resource_count: routing_table.resources.len(),
            prompt_count: routing_table.prompts.len(),
            ..AggregationMetadata::default()
        },
        tools,
        routing_table,
        ..AggregatedCapabilities::default()
    });
    debug!(session_id = %session_id, "Reusing session routing table");

    let mut ctx = CallContext::new()
        .with_session_id(session_id)
        .with_capabilities(Arc::clone(&capabilities));
    if let Some(identity) = request.extensions().get::<Identity>() {
        ctx = ctx.with_identity(identity.clone());
    }
    request
        .extensions_mut()
        .insert(DiscoveredCapabilities(capabilities));
    request.extensions_mut().insert(ctx);
    next.run(request).await
}

fn rpc_error_response(status: StatusCode, code: i32, message: &str) -> Response {
    (
        status,
        Json(json!({
            "jsonrpc": "2.0",
            "error": {
                "code": code,
                "message": message
            },
            "id": null
        })),
    )
        .into_response()
}

//! Backend client seam and per-kind call dispatch.

use async_trait::async_trait;
use tracing::debug;

use super::{
    BackendTarget, CapabilityKind, CapabilityList, JsonMap, PromptGetResult, ResourceReadResult,
    Router, ToolCallResult,
};
use crate::context::CallContext;

/// Protocol client for backend servers.
///
/// Implementations report transport failures as
/// [`Error::BackendUnavailable`](crate::Error::BackendUnavailable) and leave
/// tool-level failures in [`ToolCallResult::is_error`].
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Invoke a tool by its backend-facing name
    async fn call_tool(
        &self,
        ctx: &CallContext,
        target: &BackendTarget,
        tool_name: &str,
        arguments: JsonMap,
    ) -> crate::Result<ToolCallResult>;

    /// Read a resource by URI
    async fn read_resource(
        &self,
        ctx: &CallContext,
        target: &BackendTarget,
        uri: &str,
    ) -> crate::Result<ResourceReadResult>;

    /// Render a prompt
    async fn get_prompt(
        &self,
        ctx: &CallContext,
        target: &BackendTarget,
        name: &str,
        arguments: JsonMap,
    ) -> crate::Result<PromptGetResult>;

    /// List everything the backend exposes
    async fn list_capabilities(
        &self,
        ctx: &CallContext,
        target: &BackendTarget,
    ) -> crate::Result<CapabilityList>;
}

/// A client request for one capability
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityCall {
    /// Call a tool
    Tool {
        /// Client-facing tool name
        name: String,
        /// Arguments
        arguments: JsonMap,
    },
    /// Read a resource
    Resource {
        /// Resource URI
        uri: String,
    },
    /// Get a prompt
    Prompt {
        /// Client-facing prompt name
        name: String,
        /// Arguments
        arguments: JsonMap,
    },
}

impl CapabilityCall {
    /// Kind of capability addressed
    #[must_use]
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Self::Tool { .. } => CapabilityKind::Tool,
            Self::Resource { .. } => CapabilityKind::Resource,
            Self::Prompt { .. } => CapabilityKind::Prompt,
        }
    }

    /// Client-facing name (URI for resources)
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Tool { name, .. } | Self::Prompt { name, .. } => name,
            Self::Resource { uri } => uri,
        }
    }
}

/// Backend response matching a [`CapabilityCall`]
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityResponse {
    /// Tool result
    Tool(ToolCallResult),
    /// Resource contents
    Resource(ResourceReadResult),
    /// Prompt text
    Prompt(PromptGetResult),
}

/// Route a call, translate the capability name for the backend, and invoke
/// the client method for its kind.
pub async fn forward_call(
    ctx: &CallContext,
    router: &dyn Router,
    client: &dyn BackendClient,
    call: CapabilityCall,
) -> crate::Result<CapabilityResponse> {
    let target = router.route(ctx, call.kind(), call.name())?;
    debug!(
        kind = %call.kind(),
        name = %call.name(),
        backend = %target.workload_id,
        "Forwarding capability call"
    );

    match call {
        CapabilityCall::Tool { name, arguments } => {
            let backend_name = target.get_backend_capability_name(&name);
            client
                .call_tool(ctx, &target, backend_name, arguments)
                .await
                .map(CapabilityResponse::Tool)
        }
        CapabilityCall::Resource { uri } => {
            let backend_uri = target.get_backend_capability_name(&uri);
            client
                .read_resource(ctx, &target, backend_uri)
                .await
                .map(CapabilityResponse::Resource)
        }
        CapabilityCall::Prompt { name, arguments } => {
            let backend_name = target.get_backend_capability_name(&name);
            client
                .get_prompt(ctx, &target, backend_name, arguments)
                .await
                .map(CapabilityResponse::Prompt)
        }
    }
}

//! Capability routing.

use std::fmt;

use super::{BackendTarget, RoutingTable};
use crate::context::CallContext;

/// The closed set of capability kinds a client can address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// `tools/call`
    Tool,
    /// `resources/read`
    Resource,
    /// `prompts/get`
    Prompt,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        })
    }
}

impl RoutingTable {
    /// Look up a route of the given kind
    #[must_use]
    pub fn lookup(&self, kind: CapabilityKind, name: &str) -> Option<&BackendTarget> {
        match kind {
            CapabilityKind::Tool => self.tools.get(name),
            CapabilityKind::Resource => self.resources.get(name),
            CapabilityKind::Prompt => self.prompts.get(name),
        }
    }
}

/// Resolves client-facing capability names to backend targets
pub trait Router: Send + Sync {
    /// Route a capability of any kind
    fn route(&self, ctx: &CallContext, kind: CapabilityKind, name: &str)
    -> crate::Result<BackendTarget>;

    /// Route a tool
    fn route_tool(&self, ctx: &CallContext, name: &str) -> crate::Result<BackendTarget> {
        self.route(ctx, CapabilityKind::Tool, name)
    }

    /// Route a resource by URI
    fn route_resource(&self, ctx: &CallContext, uri: &str) -> crate::Result<BackendTarget> {
        self.route(ctx, CapabilityKind::Resource, uri)
    }

    /// Route a prompt
    fn route_prompt(&self, ctx: &CallContext, name: &str) -> crate::Result<BackendTarget> {
        self.route(ctx, CapabilityKind::Prompt, name)
    }
}

/// Router over the routing table of the capabilities on the call context,
/// falling back to a fixed table when the context carries none.
#[derive(Debug, Clone, Default)]
pub struct RoutingTableRouter {
    fallback: Option<RoutingTable>,
}

impl RoutingTableRouter {
    /// Router that only uses the per-call capabilities
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with a fixed table used when the context has no capabilities
    #[must_use]
    pub fn with_table(table: RoutingTable) -> Self {
        Self {
            fallback: Some(table),
        }
    }
}

impl Router for RoutingTableRouter {
    fn route(
        &self,
        ctx: &CallContext,
        kind: CapabilityKind,
        name: &str,
    ) -> crate::Result<BackendTarget> {
        let table = ctx
            .capabilities()
            .map(|caps| &caps.routing_table)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                crate::Error::Internal("no routing table available for this call".to_string())
            })?;

        table
            .lookup(kind, name)
            .cloned()
            .ok_or_else(|| crate::Error::CapabilityNotFound(format!("{kind} {name}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::vmcp::AggregatedCapabilities;

    fn table() -> RoutingTable {
        let mut table = RoutingTable::default();
        table.tools.insert(
            "github_fetch".into(),
            BackendTarget {
                workload_id: "github".into(),
                original_capability_name: Some("fetch".into()),
                ..BackendTarget::default()
            },
        );
        table
    }

    #[test]
    fn routes_from_context_capabilities() {
        let caps = AggregatedCapabilities {
            routing_table: table(),
            ..AggregatedCapabilities::default()
        };
        let ctx = CallContext::new().with_capabilities(Arc::new(caps));
        let target = RoutingTableRouter::new().route_tool(&ctx, "github_fetch").unwrap();
        assert_eq!(target.workload_id, "github");
        assert_eq!(target.get_backend_capability_name("github_fetch"), "fetch");
    }

    #[test]
    fn unknown_capability_is_not_found() {
        let router = RoutingTableRouter::with_table(table());
        let err = router
            .route_prompt(&CallContext::new(), "github_fetch")
            .unwrap_err();
        assert!(matches!(err, crate::Error::CapabilityNotFound(_)));
    }

    #[test]
    fn missing_table_is_internal_error() {
        let err = RoutingTableRouter::new()
            .route_tool(&CallContext::new(), "x")
            .unwrap_err();
        assert!(matches!(err, crate::Error::Internal(_)));
    }
}

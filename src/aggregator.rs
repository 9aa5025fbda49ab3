//! Capability aggregation across backends.
//!
//! Queries every backend's capability list concurrently, resolves tool name
//! conflicts, and produces the routing table clients are served from.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::context::CallContext;
use crate::vmcp::{
    AggregatedCapabilities, AggregationMetadata, Backend, BackendClient, CapabilityList,
    ConflictResolutionStrategy, backend_to_target,
};
use crate::{Error, Result};

/// Maximum backends queried at once
const MAX_CONCURRENT_QUERIES: usize = 10;

/// Produces a unified capability view over a set of backends
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Query `backends` and merge their capabilities
    async fn aggregate_capabilities(
        &self,
        ctx: &CallContext,
        backends: &[Backend],
    ) -> Result<AggregatedCapabilities>;
}

/// [`Aggregator`] over a [`BackendClient`]
pub struct DefaultAggregator {
    client: Arc<dyn BackendClient>,
    strategy: ConflictResolutionStrategy,
    priority: Vec<String>,
}

impl DefaultAggregator {
    /// Aggregator using the `prefix` strategy
    pub fn new(client: Arc<dyn BackendClient>) -> Self {
        Self {
            client,
            strategy: ConflictResolutionStrategy::Prefix,
            priority: Vec::new(),
        }
    }

    /// Use the `priority` strategy: backends earlier in `order` win conflicts,
    /// unlisted backends lose to listed ones.
    #[must_use]
    pub fn with_priority(mut self, order: Vec<String>) -> Self {
        self.strategy = ConflictResolutionStrategy::Priority;
        self.priority = order;
        self
    }

    fn rank(&self, backend_id: &str) -> usize {
        self.priority
            .iter()
            .position(|id| id == backend_id)
            .unwrap_or(usize::MAX)
    }

    fn merge(&self, mut results: Vec<(Backend, CapabilityList)>) -> AggregatedCapabilities {
        if self.strategy == ConflictResolutionStrategy::Priority {
            // stable: unlisted backends keep their input order
            results.sort_by_key(|(backend, _)| self.rank(&backend.id));
        }

        let mut caps = AggregatedCapabilities {
            metadata: AggregationMetadata {
                backend_count: results.len(),
                conflict_strategy: self.strategy,
                ..AggregationMetadata::default()
            },
            ..AggregatedCapabilities::default()
        };
        let mut seen_tools = HashSet::new();
        let mut seen_resources = HashSet::new();
        let mut seen_prompts = HashSet::new();

        for (backend, list) in results {
            caps.supports_logging |= list.supports_logging;
            caps.supports_sampling |= list.supports_sampling;

            for mut tool in list.tools {
                let original = tool.name.clone();
                let resolved = match self.strategy {
                    ConflictResolutionStrategy::Prefix => format!("{}_{}", backend.id, original),
                    ConflictResolutionStrategy::Priority => original.clone(),
                };
                if !seen_tools.insert(resolved.clone()) {
                    debug!(tool = %resolved, backend = %backend.id, "Dropping conflicting tool");
                    continue;
                }

                let mut target = backend_to_target(&backend);
                if resolved != original {
                    target.original_capability_name = Some(original);
                }
                tool.name.clone_from(&resolved);
                tool.backend_id.clone_from(&backend.id);
                caps.routing_table.tools.insert(resolved, target);
                caps.tools.push(tool);
            }

            for mut resource in list.resources {
                if !seen_resources.insert(resource.uri.clone()) {
                    continue;
                }
                resource.backend_id.clone_from(&backend.id);
                caps.routing_table
                    .resources
                    .insert(resource.uri.clone(), backend_to_target(&backend));
                caps.resources.push(resource);
            }

            for mut prompt in list.prompts {
                if !seen_prompts.insert(prompt.name.clone()) {
                    continue;
                }
                prompt.backend_id.clone_from(&backend.id);
                caps.routing_table
                    .prompts
                    .insert(prompt.name.clone(), backend_to_target(&backend));
                caps.prompts.push(prompt);
            }
        }

        caps.metadata.tool_count = caps.tools.len();
        caps.metadata.resource_count = caps.resources.len();
        caps.metadata.prompt_count = caps.prompts.len();
        caps
    }
}

#[async_trait]
impl Aggregator for DefaultAggregator {
    async fn aggregate_capabilities(
        &self,
        ctx: &CallContext,
        backends: &[Backend],
    ) -> Result<AggregatedCapabilities> {
        if backends.is_empty() {
            return Ok(self.merge(Vec::new()));
        }

        let client = &self.client;
        let queries: Vec<(usize, Backend)> = backends.iter().cloned().enumerate().collect();
        let mut results: Vec<(usize, Backend, CapabilityList)> =
            stream::iter(queries)
                .map(|(index, backend)| async move {
                    let target = backend_to_target(&backend);
                    match client.list_capabilities(ctx, &target).await {
                        Ok(list) => Some((index, backend, list)),
                        Err(e) => {
                            warn!(backend = %backend.id, error = %e, "Capability query failed");
                            None
                        }
                    }
                })
                .buffer_unordered(MAX_CONCURRENT_QUERIES)
                .filter_map(|r| async move { r })
                .collect()
                .await;

        if let Some(reason) = ctx.err() {
            return Err(reason.into());
        }
        if results.is_empty() {
            return Err(Error::BackendUnavailable(
                "no backends returned capabilities".to_string(),
            ));
        }

        results.sort_by_key(|(index, _, _)| *index);
        let caps = self.merge(results.into_iter().map(|(_, b, l)| (b, l)).collect());
        info!(
            backends = caps.metadata.backend_count,
            tools = caps.metadata.tool_count,
            resources = caps.metadata.resource_count,
            prompts = caps.metadata.prompt_count,
            "Capabilities aggregated"
        );
        Ok(caps)
    }
}

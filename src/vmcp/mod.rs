//! Core domain types shared by discovery, routing and the workflow composer.

pub mod client;
pub mod registry;
pub mod router;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use client::{BackendClient, CapabilityCall, CapabilityResponse, forward_call};
pub use registry::{BackendRegistry, DynamicRegistry, ImmutableRegistry, backend_to_target};
pub use router::{CapabilityKind, Router, RoutingTableRouter};

/// JSON object as used for tool arguments and step outputs
pub type JsonMap = Map<String, Value>;

/// Health state of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendHealthStatus {
    /// Responding normally
    Healthy,
    /// Responding but slow or recovering
    Degraded,
    /// Not responding to health checks
    Unhealthy,
    /// Never checked
    #[default]
    Unknown,
    /// Rejecting the gateway's credentials
    Unauthenticated,
}

impl BackendHealthStatus {
    /// Wire name of the status
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for BackendHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend protocol server known to the registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backend {
    /// Unique identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Base URL of the backend's server
    pub base_url: String,
    /// Transport kind ("stdio", "http", "sse", "streamable-http")
    pub transport_type: String,
    /// Last known health state
    pub health_status: BackendHealthStatus,
    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

impl Backend {
    /// Minimal backend with id and name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Where to forward a capability call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendTarget {
    /// Backend identifier
    pub workload_id: String,
    /// Backend display name
    pub workload_name: String,
    /// Backend base URL
    pub base_url: String,
    /// Transport kind
    pub transport_type: String,
    /// Name the backend knows the capability by, when conflict resolution
    /// renamed it. Read through [`Self::get_backend_capability_name`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_capability_name: Option<String>,
    /// Whether requests of a session must stick to this backend
    pub session_affinity: bool,
    /// Health at the time the target was built
    pub health_status: BackendHealthStatus,
    /// Backend metadata
    pub metadata: HashMap<String, String>,
}

impl BackendTarget {
    /// Name to send to the backend for a client-facing capability name.
    #[must_use]
    pub fn get_backend_capability_name<'a>(&'a self, resolved_name: &'a str) -> &'a str {
        match self.original_capability_name.as_deref() {
            Some(original) if !original.is_empty() => original,
            _ => resolved_name,
        }
    }
}

/// Tool capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Client-facing name (unique after conflict resolution)
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments
    #[serde(default)]
    pub input_schema: Value,
    /// JSON Schema of the structured output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Originating backend
    #[serde(default)]
    pub backend_id: String,
}

/// Resource capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource URI
    pub uri: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Originating backend
    #[serde(default)]
    pub backend_id: String,
}

/// Prompt argument
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Whether the argument must be supplied
    #[serde(default)]
    pub required: bool,
}

/// Prompt capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    /// Client-facing name
    pub name: String,
    /// Description
    #[serde(default)]
    pub description: String,
    /// Parameters
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    /// Originating backend
    #[serde(default)]
    pub backend_id: String,
}

/// One item of tool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Content {
    /// Text content
    Text {
        /// The text
        text: String,
    },
    /// Base64 image
    Image {
        /// Encoded data
        data: String,
        /// MIME type
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Base64 audio
    Audio {
        /// Encoded data
        data: String,
        /// MIME type
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource reference
    Resource {
        /// Resource URI
        uri: String,
    },
}

/// Result of a backend tool call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    /// Raw content items
    #[serde(default)]
    pub content: Vec<Content>,
    /// Structured output, preferred by workflows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<JsonMap>,
    /// The tool reported failure
    #[serde(default)]
    pub is_error: bool,
    /// Protocol metadata (`_meta`)
    #[serde(default, rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonMap>,
}

impl ToolCallResult {
    /// Successful result carrying structured output
    #[must_use]
    pub fn structured(output: JsonMap) -> Self {
        Self {
            structured_content: Some(output),
            ..Self::default()
        }
    }

    /// Result with a single text item
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text { text: text.into() }],
            ..Self::default()
        }
    }

    /// Output map for workflow templates.
    ///
    /// Structured content is used as-is. Otherwise content items are keyed
    /// `text`, `text_1`, ... and `image_0`, `image_1`, ... in order.
    pub fn into_output(self, tool: &str) -> crate::Result<JsonMap> {
        if self.is_error {
            let message = self
                .content
                .iter()
                .find_map(|c| match c {
                    Content::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .unwrap_or_else(|| "tool returned an error".to_string());
            return Err(crate::Error::ToolExecution(format!("{tool}: {message}")));
        }
        if let Some(structured) = self.structured_content {
            return Ok(structured);
        }

        let mut output = JsonMap::new();
        let mut texts = 0usize;
        let mut images = 0usize;
        for item in self.content {
            match item {
                Content::Text { text } => {
                    let key = if texts == 0 {
                        "text".to_string()
                    } else {
                        format!("text_{texts}")
                    };
                    output.insert(key, Value::String(text));
                    texts += 1;
                }
                Content::Image { data, .. } => {
                    output.insert(format!("image_{images}"), Value::String(data));
                    images += 1;
                }
                Content::Audio { .. } | Content::Resource { .. } => {}
            }
        }
        Ok(output)
    }
}

/// Result of a resource read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceReadResult {
    /// Concatenated resource bytes
    pub contents: Vec<u8>,
    /// MIME type
    pub mime_type: Option<String>,
}

/// Result of a prompt fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptGetResult {
    /// Concatenated prompt text
    pub messages: String,
    /// Optional description
    pub description: Option<String>,
}

/// Capabilities reported by a single backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityList {
    /// Tools
    pub tools: Vec<Tool>,
    /// Resources
    pub resources: Vec<Resource>,
    /// Prompts
    pub prompts: Vec<Prompt>,
    /// Backend supports logging
    pub supports_logging: bool,
    /// Backend supports sampling
    pub supports_sampling: bool,
}

/// Capability name → backend target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Tool routes
    pub tools: HashMap<String, BackendTarget>,
    /// Resource routes (keyed by URI)
    pub resources: HashMap<String, BackendTarget>,
    /// Prompt routes
    pub prompts: HashMap<String, BackendTarget>,
}

/// How tool name conflicts across backends are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolutionStrategy {
    /// Prefix every tool with its backend ID
    #[default]
    Prefix,
    /// First backend in priority order wins
    Priority,
}

/// Counters describing an aggregation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationMetadata {
    /// Backends that contributed capabilities
    pub backend_count: usize,
    /// Advertised tools
    pub tool_count: usize,
    /// Advertised resources
    pub resource_count: usize,
    /// Advertised prompts
    pub prompt_count: usize,
    /// Strategy applied to tool names
    pub conflict_strategy: ConflictResolutionStrategy,
}

/// Unified view of every backend's capabilities. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedCapabilities {
    /// Tools in advertisement order
    pub tools: Vec<Tool>,
    /// Resources
    pub resources: Vec<Resource>,
    /// Prompts
    pub prompts: Vec<Prompt>,
    /// Any backend supports logging
    pub supports_logging: bool,
    /// Any backend supports sampling
    pub supports_sampling: bool,
    /// Capability routes
    pub routing_table: RoutingTable,
    /// Aggregation counters
    pub metadata: AggregationMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backend_capability_name_prefers_original() {
        let mut target = BackendTarget::default();
        assert_eq!(target.get_backend_capability_name("list_issues"), "list_issues");

        target.original_capability_name = Some("fetch".into());
        assert_eq!(target.get_backend_capability_name("github_fetch"), "fetch");

        target.original_capability_name = Some(String::new());
        assert_eq!(target.get_backend_capability_name("github_fetch"), "github_fetch");
    }

    #[test]
    fn structured_content_wins() {
        let mut output = JsonMap::new();
        output.insert("url".into(), json!("http://example.com"));
        let result = ToolCallResult {
            content: vec![Content::Text { text: "ignored".into() }],
            structured_content: Some(output.clone()),
            ..ToolCallResult::default()
        };
        assert_eq!(result.into_output("create").unwrap(), output);
    }

    #[test]
    fn content_items_are_keyed_in_order() {
        let result = ToolCallResult {
            content: vec![
                Content::Text { text: "a".into() },
                Content::Image {
                    data: "aW1n".into(),
                    mime_type: "image/png".into(),
                },
                Content::Text { text: "b".into() },
            ],
            ..ToolCallResult::default()
        };
        let output = result.into_output("t").unwrap();
        assert_eq!(output["text"], json!("a"));
        assert_eq!(output["text_1"], json!("b"));
        assert_eq!(output["image_0"], json!("aW1n"));
    }

    #[test]
    fn error_result_is_tool_execution_failure() {
        let mut result = ToolCallResult::text("rate limited");
        result.is_error = true;
        let err = result.into_output("search").unwrap_err();
        assert!(matches!(err, crate::Error::ToolExecution(ref m) if m.contains("rate limited")));
    }

    #[test]
    fn health_status_wire_names() {
        let status: BackendHealthStatus = serde_json::from_value(json!("unauthenticated")).unwrap();
        assert_eq!(status, BackendHealthStatus::Unauthenticated);
        assert_eq!(BackendHealthStatus::Degraded.to_string(), "degraded");
    }
}

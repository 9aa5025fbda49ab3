//! Composite tool definitions as written in configuration.
//!
//! Keys are camelCase, matching the wire format:
//!
//! ```yaml
//! compositeTools:
//!   - name: triage_issue
//!     description: Fetch an issue and summarize it
//!     parameters:
//!       type: object
//!       properties:
//!         repo: { type: string, default: "acme/api" }
//!     steps:
//!       - id: fetch
//!         tool: github.get_issue
//!         arguments: { repo: "{{.params.repo}}" }
//!       - id: summarize
//!         tool: llm.summarize
//!         dependsOn: [fetch]
//!         arguments: { text: "{{.steps.fetch.output.body}}" }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::humantime_serde;
use crate::vmcp::JsonMap;

/// Step type names accepted in configuration
pub const STEP_TYPE_TOOL: &str = "tool";
/// Elicitation step type
pub const STEP_TYPE_ELICITATION: &str = "elicitation";

/// Error actions accepted in `onError.action`
pub const ERROR_ACTION_ABORT: &str = "abort";
/// Continue with default results
pub const ERROR_ACTION_CONTINUE: &str = "continue";
/// Retry with backoff
pub const ERROR_ACTION_RETRY: &str = "retry";

/// Elicitation handler actions accepted in `onDecline` / `onCancel`
pub const ELICITATION_ACTION_ABORT: &str = "abort";
/// Keep going with the next step
pub const ELICITATION_ACTION_CONTINUE: &str = "continue";
/// Skip every step that has not run yet
pub const ELICITATION_ACTION_SKIP_REMAINING: &str = "skip_remaining";

/// Output property types
pub const OUTPUT_TYPES: [&str; 6] = ["string", "integer", "number", "boolean", "object", "array"];

/// A client-visible tool implemented as a workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeToolConfig {
    /// Tool name exposed to clients
    #[serde(default)]
    pub name: String,

    /// Tool description exposed to clients
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// JSON Schema (`type: object`) for the tool's input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,

    /// Overall workflow timeout
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// `abort` (default) or `continue`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<String>,

    /// Ordered steps
    #[serde(default)]
    pub steps: Vec<WorkflowStepConfig>,

    /// Structured output; the last step's output is returned when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputConfig>,
}

/// One workflow step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStepConfig {
    /// Unique step ID
    #[serde(default)]
    pub id: String,

    /// `tool` (default) or `elicitation`
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub step_type: String,

    /// Tool to call (`workload.tool`, `workload_tool` or `tool`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool: String,

    /// Tool arguments; string values are templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonMap>,

    /// Template that must render `true` for the step to run
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,

    /// Steps that must finish first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// Failure policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<StepErrorHandling>,

    /// Elicitation prompt template
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// JSON Schema for the elicitation answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,

    /// Step timeout (elicitation expiry for elicitation steps)
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    /// What to do when the user declines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_decline: Option<ElicitationResponseConfig>,

    /// What to do when the user cancels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_cancel: Option<ElicitationResponseConfig>,

    /// Output substituted when the step is skipped or fails and continues
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_results: Option<JsonMap>,
}

impl WorkflowStepConfig {
    /// Declared type, defaulting to `tool`
    #[must_use]
    pub fn effective_type(&self) -> &str {
        if self.step_type.is_empty() {
            STEP_TYPE_TOOL
        } else {
            &self.step_type
        }
    }

    /// Whether the step may end without producing its own output
    #[must_use]
    pub fn may_be_skipped(&self) -> bool {
        !self.condition.is_empty()
            || self
                .on_error
                .as_ref()
                .is_some_and(|e| e.action == ERROR_ACTION_CONTINUE)
    }
}

/// `onError` block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepErrorHandling {
    /// `abort` (default), `continue` or `retry`
    #[serde(default)]
    pub action: String,

    /// Retries after the first attempt
    #[serde(default)]
    pub retry_count: u32,

    /// Initial backoff delay
    #[serde(
        default,
        with = "humantime_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_delay: Option<Duration>,
}

/// `onDecline` / `onCancel` block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElicitationResponseConfig {
    /// `abort`, `continue` or `skip_remaining`
    #[serde(default)]
    pub action: String,
}

/// Structured workflow output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfig {
    /// Output properties by name
    #[serde(default)]
    pub properties: BTreeMap<String, OutputProperty>,

    /// Properties that must be present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,

    /// JSON template rendered instead of `properties`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// One output property
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputProperty {
    /// JSON Schema type
    #[serde(rename = "type")]
    pub property_type: String,

    /// Description exposed to clients
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Value template
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,

    /// Nested properties for object types
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, OutputProperty>,

    /// Fallback when the value cannot be produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl OutputConfig {
    /// JSON Schema describing the constructed output
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut schema = serde_json::json!({
            "type": "object",
            "properties": properties_schema(&self.properties),
        });
        if !self.required.is_empty() {
            schema["required"] = serde_json::json!(self.required);
        }
        schema
    }
}

fn properties_schema(properties: &BTreeMap<String, OutputProperty>) -> Value {
    let map = properties
        .iter()
        .map(|(name, prop)| {
            let mut entry = serde_json::json!({ "type": prop.property_type });
            if !prop.description.is_empty() {
                entry["description"] = Value::String(prop.description.clone());
            }
            if !prop.properties.is_empty() {
                entry["properties"] = properties_schema(&prop.properties);
            }
            (name.clone(), entry)
        })
        .collect();
    Value::Object(map)
}

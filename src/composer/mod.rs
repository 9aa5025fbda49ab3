//! Composite tool workflow engine.
//!
//! A composite tool is a client-visible tool backed by a graph of steps:
//!
//! ```text
//!   params ──► [fetch] ──► [enrich] ──┐
//!                 │                    ├──► output
//!                 └──────► [approve] ──┘
//!                          (elicitation: pauses, resumed later)
//! ```
//!
//! - [`template`]: Go-template style expansion over params, step outputs and metadata
//! - [`context`]: run-time step results shared between concurrent steps
//! - [`dag`]: level-by-level execution of the dependency graph
//! - [`output`]: typed construction of the workflow's result
//! - [`state_store`]: workflow status persistence
//! - [`engine`]: ties the above together, including elicitation pause/resume

pub mod context;
pub mod dag;
pub mod engine;
pub mod error;
pub mod output;
mod retry;
pub mod state_store;
pub mod template;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::composite::{
    CompositeToolConfig, ELICITATION_ACTION_ABORT, ELICITATION_ACTION_CONTINUE,
    ELICITATION_ACTION_SKIP_REMAINING, ERROR_ACTION_ABORT, ERROR_ACTION_CONTINUE,
    ERROR_ACTION_RETRY, ElicitationResponseConfig, OutputConfig, STEP_TYPE_ELICITATION,
    STEP_TYPE_TOOL,
};
use crate::vmcp::JsonMap;

pub use context::WorkflowContext;
pub use dag::{DagExecutor, DagOutcome, ExecutionStats, StepFlow};
pub use engine::{EngineOptions, WorkflowEngine, workflow_tool_result};
pub use error::{TemplateError, WorkflowError};
pub use output::construct_output;
pub use state_store::{InMemoryStateStore, WorkflowStateStore};
pub use template::{DefaultTemplateExpander, TemplateExpander};

/// Default overall workflow timeout
pub const DEFAULT_WORKFLOW_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Default per-step timeout
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Maximum steps in one workflow
pub const MAX_WORKFLOW_STEPS: usize = 100;
/// Retry counts above this are capped
pub const MAX_RETRY_COUNT: u32 = 10;
/// Initial retry delay when none is configured
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Steps run at once within one level
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 10;

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Backend tool call
    #[default]
    Tool,
    /// Pause for human input
    Elicitation,
}

/// How the workflow reacts to a failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop at the first failure
    #[default]
    Abort,
    /// Keep running independent steps
    Continue,
}

/// Per-step failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Fail the workflow
    #[default]
    Abort,
    /// Use default results and go on
    Continue,
    /// Re-attempt with exponential backoff
    Retry,
}

/// Error policy of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorHandler {
    /// Action on failure
    pub action: ErrorAction,
    /// Retries after the first attempt (capped at [`MAX_RETRY_COUNT`])
    pub retry_count: u32,
    /// Initial backoff delay
    pub retry_delay: Duration,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self {
            action: ErrorAction::Abort,
            retry_count: 0,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl ErrorHandler {
    /// Whether a failure is absorbed into default results
    #[must_use]
    pub fn continue_on_error(&self) -> bool {
        self.action == ErrorAction::Continue
    }
}

/// Reaction to a declined or cancelled elicitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElicitationAction {
    /// Skip every step that has not run and complete the workflow
    SkipRemaining,
    /// Fail the workflow
    Abort,
    /// Record the answer and go on
    Continue,
}

/// Elicitation step settings
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElicitationConfig {
    /// Prompt template
    pub message: String,
    /// Answer schema
    pub schema: Value,
    /// Expiry of the pending request; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Declined handler
    pub on_decline: Option<ElicitationAction>,
    /// Cancelled (or expired) handler
    pub on_cancel: Option<ElicitationAction>,
}

/// A step ready for execution
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowStep {
    /// Unique step ID
    pub id: String,
    /// Step kind
    pub step_type: StepType,
    /// Tool to call (tool steps)
    pub tool: String,
    /// Argument templates
    pub arguments: JsonMap,
    /// Run condition template
    pub condition: Option<String>,
    /// Explicit predecessors
    pub depends_on: Vec<String>,
    /// Failure policy
    pub on_error: Option<ErrorHandler>,
    /// Elicitation settings (elicitation steps)
    pub elicitation: Option<ElicitationConfig>,
    /// Per-step timeout
    pub timeout: Option<Duration>,
    /// Output used when skipped or failed-and-continued
    pub default_results: Option<JsonMap>,
}

/// A workflow ready for execution
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkflowDefinition {
    /// Workflow (tool) name
    pub name: String,
    /// Description
    pub description: String,
    /// Input JSON Schema
    pub parameters: Option<Value>,
    /// Steps in declaration order
    pub steps: Vec<WorkflowStep>,
    /// Overall timeout
    pub timeout: Option<Duration>,
    /// Reaction to failed steps
    pub failure_mode: FailureMode,
    /// Structured output
    pub output: Option<OutputConfig>,
}

impl WorkflowDefinition {
    /// Build an executable definition from a validated composite tool config
    pub fn from_config(config: &CompositeToolConfig) -> Result<Self, WorkflowError> {
        let failure_mode = match config.failure_mode.as_deref() {
            None | Some("" | "abort") => FailureMode::Abort,
            Some("continue") => FailureMode::Continue,
            Some(other) => {
                return Err(WorkflowError::validation(
                    "failureMode",
                    format!("unknown failure mode {other:?}"),
                ));
            }
        };

        let steps = config
            .steps
            .iter()
            .map(|step| {
                let step_type = match step.effective_type() {
                    STEP_TYPE_TOOL => StepType::Tool,
                    STEP_TYPE_ELICITATION => StepType::Elicitation,
                    other => {
                        return Err(WorkflowError::validation(
                            format!("steps[{}].type", step.id),
                            format!("invalid step type {other:?}"),
                        ));
                    }
                };

                let on_error = step
                    .on_error
                    .as_ref()
                    .map(|handling| {
                        let action = match handling.action.as_str() {
                            "" | ERROR_ACTION_ABORT => ErrorAction::Abort,
                            ERROR_ACTION_CONTINUE => ErrorAction::Continue,
                            ERROR_ACTION_RETRY => ErrorAction::Retry,
                            other => {
                                return Err(WorkflowError::validation(
                                    format!("steps[{}].onError.action", step.id),
                                    format!("invalid action {other:?}"),
                                ));
                            }
                        };
                        Ok(ErrorHandler {
                            action,
                            retry_count: handling.retry_count,
                            retry_delay: handling
                                .retry_delay
                                .filter(|d| !d.is_zero())
                                .unwrap_or(DEFAULT_RETRY_DELAY),
                        })
                    })
                    .transpose()?;

                let elicitation = if step_type == StepType::Elicitation {
                    Some(ElicitationConfig {
                        message: step.message.clone(),
                        schema: step.schema.clone().unwrap_or(Value::Null),
                        timeout: step.timeout,
                        on_decline: elicitation_action(&step.id, step.on_decline.as_ref())?,
                        on_cancel: elicitation_action(&step.id, step.on_cancel.as_ref())?,
                    })
                } else {
                    None
                };

                Ok(WorkflowStep {
                    id: step.id.clone(),
                    step_type,
                    tool: step.tool.clone(),
                    arguments: step.arguments.clone().unwrap_or_default(),
                    condition: Some(step.condition.clone()).filter(|c| !c.is_empty()),
                    depends_on: step.depends_on.clone(),
                    on_error,
                    elicitation,
                    timeout: step.timeout,
                    default_results: step.default_results.clone(),
                })
            })
            .collect::<Result<Vec<_>, WorkflowError>>()?;

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            parameters: config.parameters.clone(),
            steps,
            timeout: config.timeout,
            failure_mode,
            output: config.output.clone(),
        })
    }

    /// Step by ID
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

fn elicitation_action(
    step_id: &str,
    handler: Option<&ElicitationResponseConfig>,
) -> Result<Option<ElicitationAction>, WorkflowError> {
    let Some(handler) = handler else {
        return Ok(None);
    };
    match handler.action.as_str() {
        ELICITATION_ACTION_SKIP_REMAINING => Ok(Some(ElicitationAction::SkipRemaining)),
        ELICITATION_ACTION_ABORT => Ok(Some(ElicitationAction::Abort)),
        ELICITATION_ACTION_CONTINUE => Ok(Some(ElicitationAction::Continue)),
        other => Err(WorkflowError::validation(
            format!("steps[{step_id}].elicitation"),
            format!("invalid response action {other:?}"),
        )),
    }
}

/// Lifecycle of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started
    #[default]
    Pending,
    /// In progress
    Running,
    /// Finished with output
    Completed,
    /// Finished with an error
    Failed,
    /// Not run; default results substituted
    Skipped,
}

impl StepStatus {
    /// Lowercase name used in templates
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether the step will not change state again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    /// Step ID
    pub step_id: String,
    /// Current status
    pub status: StepStatus,
    /// Output (default results when skipped or continued)
    pub output: Option<JsonMap>,
    /// Failure message
    pub error: Option<String>,
    /// When the step started
    pub start_time: DateTime<Utc>,
    /// When the step finished
    pub end_time: Option<DateTime<Utc>>,
    /// Wall time spent
    pub duration: Duration,
    /// Retries performed
    pub retry_count: u32,
}

/// Lifecycle of one workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Created, not started
    #[default]
    Pending,
    /// Steps executing
    Running,
    /// Paused on one or more elicitations
    WaitingForElicitation,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the caller
    Cancelled,
    /// Ran past its timeout
    TimedOut,
}

impl WorkflowState {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingForElicitation => "waiting_for_elicitation",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    /// Whether the workflow has finished
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human input a paused workflow is waiting for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingElicitation {
    /// Elicitation step
    pub step_id: String,
    /// Rendered prompt
    pub message: String,
    /// Answer schema
    #[serde(default)]
    pub schema: Value,
    /// When the request lapses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Persisted status of a workflow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    /// Execution ID
    pub workflow_id: String,
    /// Workflow (tool) name
    pub workflow_name: String,
    /// Current state
    pub status: WorkflowState,
    /// Step most recently started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Completed steps in completion order
    #[serde(default)]
    pub completed_steps: Vec<String>,
    /// Outstanding elicitations
    #[serde(default)]
    pub pending_elicitations: Vec<PendingElicitation>,
    /// Execution start
    pub start_time: DateTime<Utc>,
    /// Last change
    pub last_update_time: DateTime<Utc>,
}

/// User's answer to an elicitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElicitationResponseAction {
    /// User answered
    Accept,
    /// User refused
    Decline,
    /// User dismissed the request
    Cancel,
}

impl ElicitationResponseAction {
    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
            Self::Cancel => "cancel",
        }
    }
}

/// Answer delivered to a paused workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElicitationResponse {
    /// What the user did
    pub action: ElicitationResponseAction,
    /// Submitted content (accept only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<JsonMap>,
    /// When the answer arrived
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl ElicitationResponse {
    /// Accepted answer with `content`
    #[must_use]
    pub fn accept(content: JsonMap) -> Self {
        Self {
            action: ElicitationResponseAction::Accept,
            content: Some(content),
            received_at: Utc::now(),
        }
    }

    /// Declined answer
    #[must_use]
    pub fn decline() -> Self {
        Self {
            action: ElicitationResponseAction::Decline,
            content: None,
            received_at: Utc::now(),
        }
    }

    /// Cancelled answer
    #[must_use]
    pub fn cancel() -> Self {
        Self {
            action: ElicitationResponseAction::Cancel,
            content: None,
            received_at: Utc::now(),
        }
    }
}

/// Result of running (or resuming) a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowResult {
    /// Execution ID
    pub workflow_id: String,
    /// Final or paused state
    pub status: WorkflowState,
    /// Constructed output (completed workflows)
    pub output: Option<JsonMap>,
    /// Per-step results
    pub steps: std::collections::HashMap<String, StepResult>,
    /// Failure, for failed, cancelled and timed out workflows
    pub error: Option<WorkflowError>,
    /// Execution start
    pub start_time: DateTime<Utc>,
    /// When this run segment ended
    pub end_time: DateTime<Utc>,
    /// Wall time since start
    pub duration: Duration,
    /// Requests the workflow is waiting on
    pub pending_elicitations: Vec<PendingElicitation>,
}

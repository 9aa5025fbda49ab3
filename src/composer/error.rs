//! Workflow and template error types

use thiserror::Error;

/// Template parsing and expansion failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// Template text does not parse
    #[error("invalid template syntax: {0}")]
    Parse(String),

    /// Template parsed but failed while executing
    #[error("template execution failed: {0}")]
    Exec(String),

    /// Data nesting exceeded the recursion limit
    #[error("template expansion depth limit exceeded: maximum nesting depth is {0}")]
    DepthExceeded(usize),

    /// Expanded output exceeded the size limit
    #[error("template output too large: exceeds limit of {limit} bytes")]
    OutputTooLarge {
        /// Byte limit that was hit
        limit: usize,
    },

    /// The owning context was cancelled or ran out of time
    #[error("template expansion aborted: context cancelled")]
    Cancelled,

    /// A condition rendered to something other than `true`/`false`
    #[error("condition must evaluate to 'true' or 'false', got {0:?}")]
    InvalidCondition(String),

    /// Output format template does not parse
    #[error("invalid output format template: {0}")]
    InvalidOutputFormat(String),

    /// Output format rendered to something that is not a JSON object
    #[error("output format must produce valid JSON: {0}")]
    OutputNotJson(String),
}

/// Workflow validation and execution failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    /// Workflow ran past its timeout
    #[error("workflow timeout exceeded")]
    Timeout,

    /// Workflow context was cancelled
    #[error("workflow cancelled")]
    Cancelled,

    /// A tool step failed after exhausting its retries
    #[error("tool call failed: workflow {workflow_id}, step {step_id}, tool {tool}: {message}")]
    ToolCallFailed {
        /// Owning workflow execution
        workflow_id: String,
        /// Failing step
        step_id: String,
        /// Tool the step called
        tool: String,
        /// Underlying failure
        message: String,
    },

    /// Argument, message or condition expansion failed
    #[error("template expansion failed: workflow {workflow_id}, step {step_id}: {message}")]
    TemplateExpansion {
        /// Owning workflow execution
        workflow_id: String,
        /// Step whose templates failed
        step_id: String,
        /// Underlying failure
        message: String,
    },

    /// The step dependency graph has a cycle
    #[error("circular dependency detected involving step {0}")]
    CircularDependency(String),

    /// The user declined an elicitation and no handler allowed continuing
    #[error("elicitation declined by user in step {0}")]
    ElicitationDeclined(String),

    /// The user cancelled an elicitation and no handler allowed continuing
    #[error("elicitation cancelled by user in step {0}")]
    ElicitationCancelled(String),

    /// No answer arrived before the elicitation expired
    #[error("elicitation timed out in step {0}")]
    ElicitationTimeout(String),

    /// Malformed elicitation request or response
    #[error("invalid elicitation: {0}")]
    InvalidElicitation(String),

    /// Structural problem in a workflow definition
    #[error("validation error for field {field}: {message}")]
    Validation {
        /// Offending field
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// No state is known for the workflow ID
    #[error("workflow not found: {0}")]
    NotFound(String),

    /// The workflow already finished
    #[error("workflow {workflow_id} is already in terminal state: {status}")]
    TerminalState {
        /// Workflow execution ID
        workflow_id: String,
        /// Its final status
        status: String,
    },

    /// A step failed for a reason other than its tool call
    #[error("step failed: workflow {workflow_id}, step {step_id}: {message}")]
    StepFailed {
        /// Owning workflow execution
        workflow_id: String,
        /// Failing step
        step_id: String,
        /// Underlying failure
        message: String,
    },

    /// Building the workflow output failed
    #[error("output construction failed: {0}")]
    OutputConstruction(String),

    /// State persistence failed
    #[error("state store error: {0}")]
    StateStore(String),
}

impl WorkflowError {
    /// Validation error for `field`
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the workflow stopped because it ran out of time
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Whether the workflow stopped because its context was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<crate::context::Interrupt> for WorkflowError {
    fn from(value: crate::context::Interrupt) -> Self {
        match value {
            crate::context::Interrupt::Cancelled => Self::Cancelled,
            crate::context::Interrupt::DeadlineExceeded => Self::Timeout,
        }
    }
}

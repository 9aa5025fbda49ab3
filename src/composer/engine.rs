//! Workflow engine: runs composite tools, pauses on elicitation steps and
//! resumes them when the answer arrives.
//!
//! A paused workflow is not a parked task. Its definition and context are
//! kept in an in-process table and its status (with the pending requests)
//! goes to the state store; [`WorkflowEngine::resume_workflow`] applies the
//! answer and runs the remaining steps in a new segment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dag::{DagExecutor, DagOutcome, StepFlow};
use super::output::construct_output;
use super::retry::{RetryPolicy, with_retry};
use super::{
    DEFAULT_MAX_PARALLEL_STEPS, DEFAULT_STEP_TIMEOUT, DEFAULT_WORKFLOW_TIMEOUT,
    DefaultTemplateExpander, ElicitationAction, ElicitationResponse, ElicitationResponseAction,
    ErrorAction, MAX_RETRY_COUNT, MAX_WORKFLOW_STEPS, PendingElicitation, StepType,
    TemplateExpander, WorkflowContext, WorkflowDefinition, WorkflowError, WorkflowResult,
    WorkflowState, WorkflowStateStore, WorkflowStatus, WorkflowStep,
};
use crate::config::WorkflowConfig;
use crate::context::{CallContext, Interrupt};
use crate::vmcp::{BackendClient, Content, JsonMap, Router, ToolCallResult};

/// Engine limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Workflow timeout when the definition sets none
    pub default_timeout: Duration,
    /// Tool call timeout when the step sets none
    pub default_step_timeout: Duration,
    /// Steps run at once within one level
    pub max_parallel_steps: usize,
    /// Upper bound on per-step retries
    pub max_retry_count: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_WORKFLOW_TIMEOUT,
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            max_retry_count: MAX_RETRY_COUNT,
        }
    }
}

impl From<&WorkflowConfig> for EngineOptions {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            default_timeout: config.default_timeout,
            default_step_timeout: config.default_step_timeout,
            max_parallel_steps: config.max_parallel_steps,
            max_retry_count: config.max_retry_count.min(MAX_RETRY_COUNT),
        }
    }
}

struct SuspendedWorkflow {
    definition: Arc<WorkflowDefinition>,
    context: Arc<WorkflowContext>,
    pending: Vec<PendingElicitation>,
}

/// Executes workflow definitions against backend tools
pub struct WorkflowEngine {
    router: Arc<dyn Router>,
    client: Arc<dyn BackendClient>,
    state_store: Arc<dyn WorkflowStateStore>,
    expander: Arc<dyn TemplateExpander>,
    options: EngineOptions,
    suspended: Mutex<HashMap<String, SuspendedWorkflow>>,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl WorkflowEngine {
    /// Engine with the default template expander and limits
    pub fn new(
        router: Arc<dyn Router>,
        client: Arc<dyn BackendClient>,
        state_store: Arc<dyn WorkflowStateStore>,
    ) -> Self {
        Self {
            router,
            client,
            state_store,
            expander: Arc::new(DefaultTemplateExpander::new()),
            options: EngineOptions::default(),
            suspended: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the template expander
    #[must_use]
    pub fn with_expander(mut self, expander: Arc<dyn TemplateExpander>) -> Self {
        self.expander = expander;
        self
    }

    /// Replace the limits
    #[must_use]
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Number of workflows waiting for elicitation answers
    #[must_use]
    pub fn suspended_count(&self) -> usize {
        self.suspended.lock().len()
    }

    /// Structural checks run before every execution
    pub fn validate_workflow(&self, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
        if def.name.is_empty() {
            return Err(WorkflowError::validation("name", "workflow name is required"));
        }
        if def.steps.is_empty() {
            return Err(WorkflowError::validation(
                "steps",
                "workflow must have at least one step",
            ));
        }
        if def.steps.len() > MAX_WORKFLOW_STEPS {
            return Err(WorkflowError::validation(
                "steps",
                format!(
                    "too many steps: {} (max {MAX_WORKFLOW_STEPS})",
                    def.steps.len()
                ),
            ));
        }

        for (i, step) in def.steps.iter().enumerate() {
            if step.id.is_empty() {
                return Err(WorkflowError::validation(
                    format!("steps[{i}].id"),
                    "step ID is required",
                ));
            }
            match step.step_type {
                StepType::Tool if step.tool.is_empty() => {
                    return Err(WorkflowError::validation(
                        format!("steps[{i}].tool"),
                        "tool name is required for tool steps",
                    ));
                }
                StepType::Elicitation
                    if step
                        .elicitation
                        .as_ref()
                        .is_none_or(|e| e.message.is_empty()) =>
                {
                    return Err(WorkflowError::validation(
                        format!("steps[{i}].message"),
                        "elicitation message is required for elicitation steps",
                    ));
                }
                _ => {}
            }
        }

        DagExecutor::build_levels(&def.steps).map(|_| ())
    }

    /// Run `def` with `params`.
    ///
    /// Only an invalid definition is an `Err`; run-time failures are reported
    /// in the returned result's `status` and `error`.
    pub async fn execute_workflow(
        &self,
        ctx: &CallContext,
        def: &WorkflowDefinition,
        params: JsonMap,
    ) -> Result<WorkflowResult, WorkflowError> {
        self.validate_workflow(def)?;

        let params = apply_parameter_defaults(def.parameters.as_ref(), params);
        let workflow_id = Uuid::new_v4().to_string();
        let wctx = Arc::new(WorkflowContext::new(workflow_id.clone(), params));
        let definition = Arc::new(def.clone());

        info!(
            workflow_id = %workflow_id,
            workflow = %def.name,
            steps = def.steps.len(),
            "Starting workflow"
        );
        self.save_status(&definition, &wctx, WorkflowState::Running, &[])
            .await;

        Ok(self.run_segment(ctx, definition, wctx).await)
    }

    /// Deliver the answer for a paused elicitation step and continue
    pub async fn resume_workflow(
        &self,
        ctx: &CallContext,
        workflow_id: &str,
        step_id: &str,
        response: ElicitationResponse,
    ) -> Result<WorkflowResult, WorkflowError> {
        let suspended = {
            let mut table = self.suspended.lock();
            match table.get(workflow_id) {
                None => None,
                Some(entry) => {
                    let Some(pending) = entry.pending.iter().find(|p| p.step_id == step_id) else {
                        return Err(WorkflowError::InvalidElicitation(format!(
                            "workflow {workflow_id} has no pending elicitation for step {step_id}"
                        )));
                    };
                    // an expired answer is a cancel and its content is not validated
                    let expired = pending
                        .expires_at
                        .is_some_and(|at| response.received_at > at);
                    if response.action == ElicitationResponseAction::Accept && !expired {
                        check_content(pending, response.content.as_ref())?;
                    }
                    table.remove(workflow_id).map(|entry| (entry, expired))
                }
            }
        };
        let Some((mut suspended, expired)) = suspended else {
            return Err(self.not_resumable(ctx, workflow_id).await);
        };

        let definition = Arc::clone(&suspended.definition);
        let wctx = Arc::clone(&suspended.context);
        let Some(step) = definition.step(step_id) else {
            return Err(WorkflowError::NotFound(format!("step {step_id}")));
        };

        suspended.pending.retain(|p| p.step_id != step_id);

        info!(
            workflow_id = %workflow_id,
            step = %step_id,
            action = response.action.as_str(),
            expired,
            "Resuming workflow"
        );

        let flow = match apply_response(&wctx, step, &response, expired) {
            Ok(flow) => flow,
            Err(e) => {
                warn!(workflow_id = %workflow_id, step = %step_id, error = %e, "Elicitation ended workflow");
                return Ok(self
                    .fail(&definition, &wctx, WorkflowState::Failed, e)
                    .await);
            }
        };

        if flow == StepFlow::SkipRemaining {
            mark_remaining_skipped(&definition, &wctx);
            return Ok(self.finish(ctx, &definition, &wctx).await);
        }

        if !suspended.pending.is_empty() {
            let pending = suspended.pending.clone();
            self.save_status(
                &definition,
                &wctx,
                WorkflowState::WaitingForElicitation,
                &pending,
            )
            .await;
            self.suspended
                .lock()
                .insert(workflow_id.to_string(), suspended);
            return Ok(build_result(&wctx, WorkflowState::WaitingForElicitation, None, None, pending));
        }

        wctx.set_status(WorkflowState::Running);
        self.save_status(&definition, &wctx, WorkflowState::Running, &[])
            .await;
        Ok(self.run_segment(ctx, definition, wctx).await)
    }

    /// Cancel a running or paused workflow
    pub async fn cancel_workflow(
        &self,
        ctx: &CallContext,
        workflow_id: &str,
    ) -> Result<(), WorkflowError> {
        let mut status = self.state_store.load_state(ctx, workflow_id).await?;
        if status.status.is_terminal() {
            return Err(WorkflowError::TerminalState {
                workflow_id: workflow_id.to_string(),
                status: status.status.to_string(),
            });
        }

        status.status = WorkflowState::Cancelled;
        status.pending_elicitations.clear();
        status.last_update_time = Utc::now();
        self.state_store
            .save_state(ctx, workflow_id, &status)
            .await?;

        if let Some(token) = self.running.lock().remove(workflow_id) {
            token.cancel();
        }
        self.suspended.lock().remove(workflow_id);

        info!(workflow_id = %workflow_id, "Workflow cancelled");
        Ok(())
    }

    /// Persisted status of a workflow execution
    pub async fn get_workflow_status(
        &self,
        ctx: &CallContext,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, WorkflowError> {
        self.state_store.load_state(ctx, workflow_id).await
    }

    async fn not_resumable(&self, ctx: &CallContext, workflow_id: &str) -> WorkflowError {
        match self.state_store.load_state(ctx, workflow_id).await {
            Ok(status) if status.status.is_terminal() => WorkflowError::TerminalState {
                workflow_id: workflow_id.to_string(),
                status: status.status.to_string(),
            },
            Ok(_) => WorkflowError::InvalidElicitation(format!(
                "workflow {workflow_id} is not waiting for elicitation"
            )),
            Err(e) => e,
        }
    }

    /// Run every step that has not finished yet, under the workflow timeout
    async fn run_segment(
        &self,
        ctx: &CallContext,
        definition: Arc<WorkflowDefinition>,
        wctx: Arc<WorkflowContext>,
    ) -> WorkflowResult {
        let timeout = definition
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.options.default_timeout);
        let exec_ctx = ctx.with_timeout(timeout);
        let workflow_id = wctx.workflow_id().to_string();
        self.running
            .lock()
            .insert(workflow_id.clone(), exec_ctx.cancellation_token().clone());

        let paused: Mutex<Vec<PendingElicitation>> = Mutex::new(Vec::new());
        let outcome = DagExecutor::new(self.options.max_parallel_steps)
            .execute(
                &exec_ctx,
                &definition.steps,
                definition.failure_mode,
                |step| wctx.is_step_terminal(&step.id),
                |step| self.run_step(&exec_ctx, &definition, &wctx, step, &paused),
            )
            .await;
        self.running.lock().remove(&workflow_id);

        match outcome {
            Ok(DagOutcome::Completed) => self.finish(ctx, &definition, &wctx).await,
            Ok(DagOutcome::SkippedRemaining) => {
                mark_remaining_skipped(&definition, &wctx);
                self.finish(ctx, &definition, &wctx).await
            }
            Ok(DagOutcome::Paused) => {
                let pending = paused.into_inner();
                wctx.set_status(WorkflowState::WaitingForElicitation);
                self.save_status(
                    &definition,
                    &wctx,
                    WorkflowState::WaitingForElicitation,
                    &pending,
                )
                .await;
                self.suspended.lock().insert(
                    workflow_id.clone(),
                    SuspendedWorkflow {
                        definition: Arc::clone(&definition),
                        context: Arc::clone(&wctx),
                        pending: pending.clone(),
                    },
                );
                info!(
                    workflow_id = %workflow_id,
                    pending = pending.len(),
                    "Workflow paused for elicitation"
                );
                build_result(&wctx, WorkflowState::WaitingForElicitation, None, None, pending)
            }
            Err(e) => {
                let (state, error) = match exec_ctx.err() {
                    Some(Interrupt::DeadlineExceeded) => (WorkflowState::TimedOut, WorkflowError::Timeout),
                    Some(Interrupt::Cancelled) => (WorkflowState::Cancelled, WorkflowError::Cancelled),
                    None => (WorkflowState::Failed, e),
                };
                self.fail(&definition, &wctx, state, error).await
            }
        }
    }

    async fn run_step(
        &self,
        ctx: &CallContext,
        def: &WorkflowDefinition,
        wctx: &WorkflowContext,
        step: &WorkflowStep,
        paused: &Mutex<Vec<PendingElicitation>>,
    ) -> Result<StepFlow, WorkflowError> {
        if let Some(condition) = &step.condition {
            match self.expander.evaluate_condition(ctx, condition, wctx).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(workflow_id = %wctx.workflow_id(), step = %step.id, "Condition false, skipping step");
                    wctx.record_step_skipped(&step.id, step.default_results.clone());
                    return Ok(StepFlow::Continue);
                }
                Err(e) => {
                    wctx.record_step_failure(&step.id, e.to_string(), None, 0);
                    return Err(WorkflowError::TemplateExpansion {
                        workflow_id: wctx.workflow_id().to_string(),
                        step_id: step.id.clone(),
                        message: format!("failed to evaluate condition: {e}"),
                    });
                }
            }
        }

        match step.step_type {
            StepType::Tool => self.run_tool_step(ctx, def, wctx, step).await,
            StepType::Elicitation => self.run_elicitation_step(ctx, wctx, step, paused).await,
        }
    }

    async fn run_tool_step(
        &self,
        ctx: &CallContext,
        def: &WorkflowDefinition,
        wctx: &WorkflowContext,
        step: &WorkflowStep,
    ) -> Result<StepFlow, WorkflowError> {
        wctx.record_step_start(&step.id);
        debug!(workflow_id = %wctx.workflow_id(), step = %step.id, tool = %step.tool, "Executing tool step");

        let arguments = match self.expander.expand(ctx, &step.arguments, wctx).await {
            Ok(arguments) => arguments,
            Err(e) => {
                wctx.record_step_failure(&step.id, e.to_string(), None, 0);
                return Err(WorkflowError::TemplateExpansion {
                    workflow_id: wctx.workflow_id().to_string(),
                    step_id: step.id.clone(),
                    message: format!("failed to expand arguments for step: {e}"),
                });
            }
        };

        let target = match self.router.route_tool(ctx, &step.tool) {
            Ok(target) => target,
            Err(e) => {
                wctx.record_step_failure(&step.id, e.to_string(), None, 0);
                return Err(WorkflowError::StepFailed {
                    workflow_id: wctx.workflow_id().to_string(),
                    step_id: step.id.clone(),
                    message: format!("failed to route tool {}: {e}", step.tool),
                });
            }
        };
        let backend_tool = target.get_backend_capability_name(&step.tool).to_string();

        let policy = match &step.on_error {
            Some(handler) if handler.action == ErrorAction::Retry => RetryPolicy {
                max_retries: handler.retry_count.min(self.options.max_retry_count),
                initial_delay: handler.retry_delay,
            },
            _ => RetryPolicy::none(),
        };
        let step_timeout = step
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.options.default_step_timeout);

        // one deadline for the step, retries included
        let step_ctx = ctx.with_timeout(step_timeout);
        let (outcome, retries) = with_retry(&step_ctx, policy, &step.id, || {
            let step_ctx = &step_ctx;
            let arguments = arguments.clone();
            let target = &target;
            let backend_tool = backend_tool.as_str();
            async move {
                match step_ctx
                    .run(self.client.call_tool(step_ctx, target, backend_tool, arguments))
                    .await
                {
                    Ok(Ok(result)) => result.into_output(&step.tool),
                    Ok(Err(e)) => Err(e),
                    Err(reason) => Err(crate::Error::from(reason)),
                }
            }
        })
        .await;

        match outcome {
            Ok(output) => {
                wctx.record_step_success(&step.id, output, retries);
                debug!(workflow_id = %wctx.workflow_id(), step = %step.id, retries, "Step completed");
                self.save_status(def, wctx, WorkflowState::Running, &[])
                    .await;
                Ok(StepFlow::Continue)
            }
            Err(e) => {
                if let Some(reason) = ctx.err() {
                    wctx.record_step_failure(&step.id, e.to_string(), None, retries);
                    return Err(reason.into());
                }

                let continue_on_error = step
                    .on_error
                    .as_ref()
                    .is_some_and(super::ErrorHandler::continue_on_error);
                if continue_on_error {
                    warn!(
                        workflow_id = %wctx.workflow_id(),
                        step = %step.id,
                        error = %e,
                        "Step failed, continuing with default results"
                    );
                    wctx.record_step_failure(
                        &step.id,
                        e.to_string(),
                        step.default_results.clone(),
                        retries,
                    );
                    return Ok(StepFlow::Continue);
                }

                warn!(workflow_id = %wctx.workflow_id(), step = %step.id, retries, error = %e, "Step failed");
                wctx.record_step_failure(&step.id, e.to_string(), None, retries);
                Err(WorkflowError::ToolCallFailed {
                    workflow_id: wctx.workflow_id().to_string(),
                    step_id: step.id.clone(),
                    tool: step.tool.clone(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn run_elicitation_step(
        &self,
        ctx: &CallContext,
        wctx: &WorkflowContext,
        step: &WorkflowStep,
        paused: &Mutex<Vec<PendingElicitation>>,
    ) -> Result<StepFlow, WorkflowError> {
        let Some(config) = &step.elicitation else {
            return Err(WorkflowError::InvalidElicitation(format!(
                "step {} has no elicitation settings",
                step.id
            )));
        };
        wctx.record_step_start(&step.id);

        let mut template = JsonMap::new();
        template.insert("message".into(), Value::String(config.message.clone()));
        let message = match self.expander.expand(ctx, &template, wctx).await {
            Ok(mut expanded) => match expanded.remove("message") {
                Some(Value::String(message)) => message,
                _ => config.message.clone(),
            },
            Err(e) => {
                wctx.record_step_failure(&step.id, e.to_string(), None, 0);
                return Err(WorkflowError::TemplateExpansion {
                    workflow_id: wctx.workflow_id().to_string(),
                    step_id: step.id.clone(),
                    message: format!("failed to expand elicitation message: {e}"),
                });
            }
        };

        let expires_at = config
            .timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| Utc::now() + t);
        debug!(workflow_id = %wctx.workflow_id(), step = %step.id, "Requesting elicitation");
        paused.lock().push(PendingElicitation {
            step_id: step.id.clone(),
            message,
            schema: config.schema.clone(),
            expires_at,
        });
        Ok(StepFlow::Pause)
    }

    /// Build the output and record completion
    async fn finish(
        &self,
        ctx: &CallContext,
        def: &WorkflowDefinition,
        wctx: &WorkflowContext,
    ) -> WorkflowResult {
        let output = match &def.output {
            Some(config) => construct_output(ctx, self.expander.as_ref(), config, wctx).await,
            None => Ok(wctx.last_step_output().unwrap_or_default()),
        };

        match output {
            Ok(output) => {
                wctx.set_status(WorkflowState::Completed);
                self.save_status(def, wctx, WorkflowState::Completed, &[])
                    .await;
                let result = build_result(wctx, WorkflowState::Completed, Some(output), None, Vec::new());
                info!(
                    workflow_id = %wctx.workflow_id(),
                    duration_ms = result.duration.as_millis(),
                    "Workflow completed"
                );
                result
            }
            Err(e) => self.fail(def, wctx, WorkflowState::Failed, e).await,
        }
    }

    async fn fail(
        &self,
        def: &WorkflowDefinition,
        wctx: &WorkflowContext,
        state: WorkflowState,
        error: WorkflowError,
    ) -> WorkflowResult {
        warn!(workflow_id = %wctx.workflow_id(), status = %state, error = %error, "Workflow did not complete");
        wctx.set_status(state);
        self.save_status(def, wctx, state, &[]).await;
        build_result(wctx, state, None, Some(error), Vec::new())
    }

    /// Checkpoint. Store failures are logged, never fatal.
    async fn save_status(
        &self,
        def: &WorkflowDefinition,
        wctx: &WorkflowContext,
        state: WorkflowState,
        pending: &[PendingElicitation],
    ) {
        let status = WorkflowStatus {
            workflow_id: wctx.workflow_id().to_string(),
            workflow_name: def.name.clone(),
            status: state,
            current_step: wctx.current_step(),
            completed_steps: wctx.completed_steps(),
            pending_elicitations: pending.to_vec(),
            start_time: wctx.start_time(),
            last_update_time: Utc::now(),
        };
        // Detached from the caller so an expired workflow still records its end
        let store_ctx = CallContext::new();
        if let Err(e) = self
            .state_store
            .save_state(&store_ctx, wctx.workflow_id(), &status)
            .await
        {
            warn!(workflow_id = %wctx.workflow_id(), error = %e, "Failed to save workflow state");
        }
    }
}

/// Fill absent parameters from `properties.*.default` of the input schema
#[must_use]
pub fn apply_parameter_defaults(schema: Option<&Value>, mut params: JsonMap) -> JsonMap {
    let Some(properties) = schema
        .and_then(|s| s.get("properties"))
        .and_then(Value::as_object)
    else {
        return params;
    };
    for (name, property) in properties {
        if let Some(default) = property.get("default") {
            params
                .entry(name.clone())
                .or_insert_with(|| default.clone());
        }
    }
    params
}

fn check_content(
    pending: &PendingElicitation,
    content: Option<&JsonMap>,
) -> Result<(), WorkflowError> {
    if !pending.schema.is_object() {
        return Ok(());
    }
    let validator = jsonschema::options().build(&pending.schema).map_err(|e| {
        WorkflowError::InvalidElicitation(format!("invalid schema for step {}: {e}", pending.step_id))
    })?;
    let instance = Value::Object(content.cloned().unwrap_or_default());
    if let Err(error) = validator.validate(&instance) {
        return Err(WorkflowError::InvalidElicitation(format!(
            "response for step {} does not match schema: {error}",
            pending.step_id
        )));
    }
    Ok(())
}

/// Record the answer for an elicitation step
fn apply_response(
    wctx: &WorkflowContext,
    step: &WorkflowStep,
    response: &ElicitationResponse,
    expired: bool,
) -> Result<StepFlow, WorkflowError> {
    let config = step.elicitation.as_ref();
    let action = if expired {
        ElicitationResponseAction::Cancel
    } else {
        response.action
    };

    if action == ElicitationResponseAction::Accept {
        let mut output = JsonMap::new();
        output.insert("action".into(), json!("accept"));
        output.insert(
            "content".into(),
            Value::Object(response.content.clone().unwrap_or_default()),
        );
        wctx.record_step_success(&step.id, output, 0);
        return Ok(StepFlow::Continue);
    }

    let (handler, refused) = if action == ElicitationResponseAction::Decline {
        (
            config.and_then(|c| c.on_decline),
            WorkflowError::ElicitationDeclined(step.id.clone()),
        )
    } else if expired {
        (
            config.and_then(|c| c.on_cancel),
            WorkflowError::ElicitationTimeout(step.id.clone()),
        )
    } else {
        (
            config.and_then(|c| c.on_cancel),
            WorkflowError::ElicitationCancelled(step.id.clone()),
        )
    };

    let mut output = JsonMap::new();
    output.insert("action".into(), json!(action.as_str()));
    match handler {
        Some(ElicitationAction::Continue) => {
            wctx.record_step_success(&step.id, output, 0);
            Ok(StepFlow::Continue)
        }
        Some(ElicitationAction::SkipRemaining) => {
            output.insert("skipped".into(), json!(true));
            wctx.record_step_success(&step.id, output, 0);
            Ok(StepFlow::SkipRemaining)
        }
        Some(ElicitationAction::Abort) | None => {
            wctx.record_step_failure(&step.id, refused.to_string(), None, 0);
            Err(refused)
        }
    }
}

fn mark_remaining_skipped(def: &WorkflowDefinition, wctx: &WorkflowContext) {
    for step in &def.steps {
        if !wctx.is_step_terminal(&step.id) {
            debug!(workflow_id = %wctx.workflow_id(), step = %step.id, "Skipping remaining step");
            wctx.record_step_skipped(&step.id, step.default_results.clone());
        }
    }
}

fn build_result(
    wctx: &WorkflowContext,
    status: WorkflowState,
    output: Option<JsonMap>,
    error: Option<WorkflowError>,
    pending_elicitations: Vec<PendingElicitation>,
) -> WorkflowResult {
    let end_time = Utc::now();
    WorkflowResult {
        workflow_id: wctx.workflow_id().to_string(),
        status,
        output,
        steps: wctx.steps(),
        error,
        start_time: wctx.start_time(),
        end_time,
        duration: (end_time - wctx.start_time()).to_std().unwrap_or_default(),
        pending_elicitations,
    }
}

/// Protocol tool result for a workflow outcome
#[must_use]
pub fn workflow_tool_result(result: &WorkflowResult) -> ToolCallResult {
    match result.status {
        WorkflowState::Completed => {
            let output = result.output.clone().unwrap_or_default();
            let text = serde_json::to_string(&output).unwrap_or_default();
            ToolCallResult {
                content: vec![Content::Text { text }],
                structured_content: Some(output),
                ..ToolCallResult::default()
            }
        }
        WorkflowState::WaitingForElicitation | WorkflowState::Pending | WorkflowState::Running => {
            let mut structured = JsonMap::new();
            structured.insert("workflow_id".into(), json!(result.workflow_id));
            structured.insert("status".into(), json!(result.status.as_str()));
            structured.insert(
                "pending_elicitations".into(),
                serde_json::to_value(&result.pending_elicitations).unwrap_or_default(),
            );
            let prompts: Vec<&str> = result
                .pending_elicitations
                .iter()
                .map(|p| p.message.as_str())
                .collect();
            ToolCallResult {
                content: vec![Content::Text {
                    text: format!(
                        "workflow {} is waiting for input: {}",
                        result.workflow_id,
                        prompts.join("; ")
                    ),
                }],
                structured_content: Some(structured),
                ..ToolCallResult::default()
            }
        }
        WorkflowState::TimedOut => error_result("workflow execution timeout exceeded".into()),
        WorkflowState::Cancelled => error_result("workflow execution cancelled".into()),
        WorkflowState::Failed => error_result(match &result.error {
            Some(e) => format!("workflow execution failed: {e}"),
            None => "workflow execution failed".into(),
        }),
    }
}

fn error_result(text: String) -> ToolCallResult {
    ToolCallResult {
        content: vec![Content::Text { text }],
        is_error: true,
        ..ToolCallResult::default()
    }
}

//! Run-time state of one workflow execution.
//!
//! Concurrent steps write their results here and the template expander reads
//! a snapshot. The lock is held only for the duration of a single read or
//! write, never across a backend call.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Value, json};

use super::{StepResult, StepStatus, WorkflowState};
use crate::vmcp::JsonMap;

#[derive(Debug, Clone, Default)]
struct Shared {
    steps: HashMap<String, StepResult>,
    variables: JsonMap,
    status: WorkflowState,
    current_step: Option<String>,
}

/// Params, variables and step results of a running workflow
#[derive(Debug)]
pub struct WorkflowContext {
    workflow_id: String,
    params: JsonMap,
    start_time: DateTime<Utc>,
    shared: RwLock<Shared>,
}

impl Clone for WorkflowContext {
    fn clone(&self) -> Self {
        Self {
            workflow_id: self.workflow_id.clone(),
            params: self.params.clone(),
            start_time: self.start_time,
            shared: RwLock::new(self.shared.read().clone()),
        }
    }
}

impl WorkflowContext {
    /// Context for a new execution
    pub fn new(workflow_id: impl Into<String>, params: JsonMap) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            params,
            start_time: Utc::now(),
            shared: RwLock::new(Shared {
                status: WorkflowState::Running,
                ..Shared::default()
            }),
        }
    }

    /// Execution ID
    #[must_use]
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Input parameters (defaults applied)
    #[must_use]
    pub fn params(&self) -> &JsonMap {
        &self.params
    }

    /// Execution start
    #[must_use]
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Current workflow state
    #[must_use]
    pub fn status(&self) -> WorkflowState {
        self.shared.read().status
    }

    /// Move the workflow to `status`
    pub fn set_status(&self, status: WorkflowState) {
        self.shared.write().status = status;
    }

    /// Step most recently started
    #[must_use]
    pub fn current_step(&self) -> Option<String> {
        self.shared.read().current_step.clone()
    }

    /// Set a workflow variable
    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.shared.write().variables.insert(name.into(), value);
    }

    /// Workflow variable
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<Value> {
        self.shared.read().variables.get(name).cloned()
    }

    /// Mark a step running
    pub fn record_step_start(&self, step_id: &str) {
        let mut shared = self.shared.write();
        shared.current_step = Some(step_id.to_string());
        shared.steps.insert(
            step_id.to_string(),
            StepResult {
                step_id: step_id.to_string(),
                status: StepStatus::Running,
                output: None,
                error: None,
                start_time: Utc::now(),
                end_time: None,
                duration: Duration::ZERO,
                retry_count: 0,
            },
        );
    }

    /// Mark a step completed with `output`
    pub fn record_step_success(&self, step_id: &str, output: JsonMap, retry_count: u32) {
        self.finish(step_id, StepStatus::Completed, Some(output), None, retry_count);
    }

    /// Mark a step failed. `output` carries default results when the failure
    /// is absorbed.
    pub fn record_step_failure(
        &self,
        step_id: &str,
        error: impl Into<String>,
        output: Option<JsonMap>,
        retry_count: u32,
    ) {
        self.finish(
            step_id,
            StepStatus::Failed,
            output,
            Some(error.into()),
            retry_count,
        );
    }

    /// Mark a step skipped with its default results as output
    pub fn record_step_skipped(&self, step_id: &str, default_results: Option<JsonMap>) {
        self.finish(step_id, StepStatus::Skipped, default_results, None, 0);
    }

    fn finish(
        &self,
        step_id: &str,
        status: StepStatus,
        output: Option<JsonMap>,
        error: Option<String>,
        retry_count: u32,
    ) {
        let now = Utc::now();
        let mut shared = self.shared.write();
        let result = shared
            .steps
            .entry(step_id.to_string())
            .or_insert_with(|| StepResult {
                step_id: step_id.to_string(),
                status: StepStatus::Pending,
                output: None,
                error: None,
                start_time: now,
                end_time: None,
                duration: Duration::ZERO,
                retry_count: 0,
            });
        result.status = status;
        result.output = output;
        result.error = error;
        result.end_time = Some(now);
        result.duration = (now - result.start_time).to_std().unwrap_or_default();
        result.retry_count = retry_count;
    }

    /// Snapshot of one step's result
    #[must_use]
    pub fn step_result(&self, step_id: &str) -> Option<StepResult> {
        self.shared.read().steps.get(step_id).cloned()
    }

    /// Snapshot of every step's result
    #[must_use]
    pub fn steps(&self) -> HashMap<String, StepResult> {
        self.shared.read().steps.clone()
    }

    fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.shared.read().steps.get(step_id).map(|r| r.status)
    }

    /// Whether the step completed successfully
    #[must_use]
    pub fn has_step_completed(&self, step_id: &str) -> bool {
        self.step_status(step_id) == Some(StepStatus::Completed)
    }

    /// Whether the step failed
    #[must_use]
    pub fn has_step_failed(&self, step_id: &str) -> bool {
        self.step_status(step_id) == Some(StepStatus::Failed)
    }

    /// Whether the step reached a final state
    #[must_use]
    pub fn is_step_terminal(&self, step_id: &str) -> bool {
        self.step_status(step_id).is_some_and(StepStatus::is_terminal)
    }

    /// Completed step IDs ordered by completion time
    #[must_use]
    pub fn completed_steps(&self) -> Vec<String> {
        let shared = self.shared.read();
        let mut done: Vec<&StepResult> = shared
            .steps
            .values()
            .filter(|r| r.status == StepStatus::Completed)
            .collect();
        done.sort_by(|a, b| a.end_time.cmp(&b.end_time).then(a.step_id.cmp(&b.step_id)));
        done.into_iter().map(|r| r.step_id.clone()).collect()
    }

    /// Output of the most recently completed step
    #[must_use]
    pub fn last_step_output(&self) -> Option<JsonMap> {
        let shared = self.shared.read();
        shared
            .steps
            .values()
            .filter(|r| r.status == StepStatus::Completed)
            .max_by(|a, b| a.end_time.cmp(&b.end_time).then(a.step_id.cmp(&b.step_id)))
            .and_then(|r| r.output.clone())
    }

    /// Template binding: `params`, `steps`, `vars` and `workflow`
    #[must_use]
    pub fn template_data(&self) -> Value {
        let shared = self.shared.read();

        let steps: JsonMap = shared
            .steps
            .iter()
            .map(|(id, result)| {
                let mut entry = json!({
                    "status": result.status.as_str(),
                    "output": result.output.clone().map_or(Value::Null, Value::Object),
                });
                if let Some(error) = &result.error {
                    entry["error"] = Value::String(error.clone());
                }
                (id.clone(), entry)
            })
            .collect();
        let completed = shared
            .steps
            .values()
            .filter(|r| r.status == StepStatus::Completed)
            .count();
        let elapsed = (Utc::now() - self.start_time).num_milliseconds().max(0);

        json!({
            "params": self.params,
            "steps": steps,
            "vars": shared.variables,
            "workflow": {
                "id": self.workflow_id,
                "start_time": self.start_time.timestamp_millis(),
                "step_count": completed,
                "status": shared.status.as_str(),
                "duration_ms": elapsed,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(key: &str, value: Value) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert(key.into(), value);
        map
    }

    #[test]
    fn step_lifecycle() {
        let ctx = WorkflowContext::new("wf-1", JsonMap::new());
        assert_eq!(ctx.status(), WorkflowState::Running);

        ctx.record_step_start("a");
        assert_eq!(ctx.step_result("a").unwrap().status, StepStatus::Running);
        assert!(!ctx.is_step_terminal("a"));
        std::thread::sleep(Duration::from_millis(2));
        ctx.record_step_success("a", output("x", json!(1)), 0);
        let a = ctx.step_result("a").unwrap();
        assert_eq!(a.status, StepStatus::Completed);
        assert!(a.duration > Duration::ZERO);
        assert!(ctx.has_step_completed("a"));

        ctx.record_step_start("b");
        ctx.record_step_failure("b", "boom", None, 2);
        assert!(ctx.has_step_failed("b"));
        assert!(!ctx.has_step_completed("b"));
        assert_eq!(ctx.step_result("b").unwrap().retry_count, 2);

        ctx.record_step_skipped("c", Some(output("y", json!(null))));
        assert!(!ctx.has_step_completed("c"));
        assert!(ctx.is_step_terminal("c"));
    }

    #[test]
    fn last_output_is_latest_completed() {
        let ctx = WorkflowContext::new("wf", JsonMap::new());
        ctx.record_step_start("first");
        ctx.record_step_success("first", output("n", json!(1)), 0);
        std::thread::sleep(Duration::from_millis(2));
        ctx.record_step_start("second");
        ctx.record_step_success("second", output("n", json!(2)), 0);
        std::thread::sleep(Duration::from_millis(2));
        ctx.record_step_skipped("third", Some(output("n", json!(3))));

        assert_eq!(ctx.last_step_output().unwrap()["n"], 2);
        assert_eq!(ctx.completed_steps(), vec!["first", "second"]);
    }

    #[test]
    fn clone_is_independent() {
        let ctx = WorkflowContext::new("wf", JsonMap::new());
        ctx.record_step_success("a", JsonMap::new(), 0);
        let copy = ctx.clone();
        ctx.record_step_failure("a", "changed", None, 0);
        ctx.set_variable("v", json!(true));

        assert!(copy.has_step_completed("a"));
        assert!(copy.variable("v").is_none());
    }

    #[test]
    fn template_data_shape() {
        let ctx = WorkflowContext::new("wf-9", output("repo", json!("acme/api")));
        ctx.record_step_success("fetch", output("title", json!("bug")), 0);
        ctx.record_step_failure("notify", "offline", None, 0);

        let data = ctx.template_data();
        assert_eq!(data["params"]["repo"], "acme/api");
        assert_eq!(data["steps"]["fetch"]["status"], "completed");
        assert_eq!(data["steps"]["fetch"]["output"]["title"], "bug");
        assert_eq!(data["steps"]["notify"]["error"], "offline");
        assert_eq!(data["workflow"]["id"], "wf-9");
        assert_eq!(data["workflow"]["step_count"], 1);
    }
}

//! Workflow status persistence

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{WorkflowError, WorkflowStatus};
use crate::context::CallContext;

/// Stores the status of workflow executions
#[async_trait]
pub trait WorkflowStateStore: Send + Sync {
    /// Insert or replace the status for `workflow_id`
    async fn save_state(
        &self,
        ctx: &CallContext,
        workflow_id: &str,
        status: &WorkflowStatus,
    ) -> Result<(), WorkflowError>;

    /// Status for `workflow_id`, or [`WorkflowError::NotFound`]
    async fn load_state(
        &self,
        ctx: &CallContext,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, WorkflowError>;

    /// Forget `workflow_id`; unknown IDs are not an error
    async fn delete_state(&self, ctx: &CallContext, workflow_id: &str)
    -> Result<(), WorkflowError>;

    /// IDs of workflows that have not reached a terminal state
    async fn list_active_workflows(&self, ctx: &CallContext) -> Result<Vec<String>, WorkflowError>;
}

/// Process-local state store. Saved and loaded values are copies.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, WorkflowStatus>>,
}

impl InMemoryStateStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored workflows
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Drop terminal workflows last updated more than `older_than` ago.
    /// Returns the number removed.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default();
        let mut states = self.states.write();
        let before = states.len();
        states.retain(|_, s| !(s.status.is_terminal() && s.last_update_time < cutoff));
        before - states.len()
    }
}

fn check(ctx: &CallContext) -> Result<(), WorkflowError> {
    match ctx.err() {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

#[async_trait]
impl WorkflowStateStore for InMemoryStateStore {
    async fn save_state(
        &self,
        ctx: &CallContext,
        workflow_id: &str,
        status: &WorkflowStatus,
    ) -> Result<(), WorkflowError> {
        check(ctx)?;
        self.states
            .write()
            .insert(workflow_id.to_string(), status.clone());
        Ok(())
    }

    async fn load_state(
        &self,
        ctx: &CallContext,
        workflow_id: &str,
    ) -> Result<WorkflowStatus, WorkflowError> {
        check(ctx)?;
        self.states
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))
    }

    async fn delete_state(
        &self,
        ctx: &CallContext,
        workflow_id: &str,
    ) -> Result<(), WorkflowError> {
        check(ctx)?;
        self.states.write().remove(workflow_id);
        Ok(())
    }

    async fn list_active_workflows(&self, ctx: &CallContext) -> Result<Vec<String>, WorkflowError> {
        check(ctx)?;
        let mut ids: Vec<String> = self
            .states
            .read()
            .iter()
            .filter(|(_, s)| !s.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::{PendingElicitation, WorkflowState};

    fn status(id: &str, state: WorkflowState) -> WorkflowStatus {
        WorkflowStatus {
            workflow_id: id.into(),
            workflow_name: "wf".into(),
            status: state,
            current_step: None,
            completed_steps: Vec::new(),
            pending_elicitations: Vec::new(),
            start_time: Utc::now(),
            last_update_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_delete() {
        let store = InMemoryStateStore::new();
        let ctx = CallContext::new();

        let err = store.load_state(&ctx, "missing").await.unwrap_err();
        assert_eq!(err, WorkflowError::NotFound("missing".into()));

        let mut saved = status("a", WorkflowState::WaitingForElicitation);
        saved.pending_elicitations.push(PendingElicitation {
            step_id: "approve".into(),
            message: "ok?".into(),
            schema: serde_json::Value::Null,
            expires_at: None,
        });
        store.save_state(&ctx, "a", &saved).await.unwrap();

        // Mutating the caller's copy leaves the stored one alone
        saved.completed_steps.push("x".into());
        let mut loaded = store.load_state(&ctx, "a").await.unwrap();
        assert!(loaded.completed_steps.is_empty());
        assert_eq!(loaded.pending_elicitations.len(), 1);

        loaded.pending_elicitations.clear();
        let again = store.load_state(&ctx, "a").await.unwrap();
        assert_eq!(again.pending_elicitations.len(), 1);

        store.delete_state(&ctx, "a").await.unwrap();
        store.delete_state(&ctx, "a").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lists_only_active() {
        let store = InMemoryStateStore::new();
        let ctx = CallContext::new();
        for (id, state) in [
            ("r", WorkflowState::Running),
            ("w", WorkflowState::WaitingForElicitation),
            ("c", WorkflowState::Completed),
            ("t", WorkflowState::TimedOut),
        ] {
            store.save_state(&ctx, id, &status(id, state)).await.unwrap();
        }
        assert_eq!(store.list_active_workflows(&ctx).await.unwrap(), vec!["r", "w"]);
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_states() {
        let store = InMemoryStateStore::new();
        let ctx = CallContext::new();
        let mut old = status("old", WorkflowState::Completed);
        old.last_update_time = Utc::now() - chrono::Duration::hours(2);
        store.save_state(&ctx, "old", &old).await.unwrap();
        let mut stale_running = status("run", WorkflowState::Running);
        stale_running.last_update_time = Utc::now() - chrono::Duration::hours(2);
        store.save_state(&ctx, "run", &stale_running).await.unwrap();
        store
            .save_state(&ctx, "new", &status("new", WorkflowState::Failed))
            .await
            .unwrap();

        assert_eq!(store.purge_finished(Duration::from_secs(3600)), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_context_is_rejected() {
        let store = InMemoryStateStore::new();
        let ctx = CallContext::new();
        ctx.cancel();
        assert_eq!(
            store.list_active_workflows(&ctx).await.unwrap_err(),
            WorkflowError::Cancelled
        );
    }
}

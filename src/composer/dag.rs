//! Level-by-level execution of a step dependency graph.
//!
//! Steps are grouped into levels with Kahn's algorithm: level 0 holds steps
//! without dependencies, level N holds steps whose dependencies all sit in
//! earlier levels. Levels run in order; steps within a level run
//! concurrently, bounded by `max_parallel`.

use std::collections::HashMap;
use std::future::Future;

use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::{DEFAULT_MAX_PARALLEL_STEPS, FailureMode, WorkflowError, WorkflowStep};
use crate::context::CallContext;

/// What a step asks the executor to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFlow {
    /// Keep going
    Continue,
    /// Stop after this level; the workflow waits for input
    Pause,
    /// Stop after this level; remaining steps are skipped
    SkipRemaining,
}

/// How a DAG run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagOutcome {
    /// Every level ran
    Completed,
    /// A step paused the run
    Paused,
    /// A step asked to skip the remaining steps
    SkippedRemaining,
}

/// Shape of the level plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecutionStats {
    /// Number of levels
    pub total_levels: usize,
    /// Number of steps
    pub total_steps: usize,
    /// Largest level
    pub max_parallelism: usize,
    /// Smallest level
    pub min_parallelism: usize,
}

/// Runs steps level by level
#[derive(Debug, Clone)]
pub struct DagExecutor {
    max_parallel: usize,
}

impl Default for DagExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PARALLEL_STEPS)
    }
}

impl DagExecutor {
    /// Executor running at most `max_parallel` steps at once (0 means the default)
    #[must_use]
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: if max_parallel == 0 {
                DEFAULT_MAX_PARALLEL_STEPS
            } else {
                max_parallel
            },
        }
    }

    /// Group steps into dependency levels. Each level lists step indices in
    /// declaration order.
    pub fn build_levels(steps: &[WorkflowStep]) -> Result<Vec<Vec<usize>>, WorkflowError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(WorkflowError::validation(
                    "steps",
                    format!("duplicate step id {:?}", step.id),
                ));
            }
        }

        let mut in_degree = vec![0usize; steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let &d = index.get(dep.as_str()).ok_or_else(|| {
                    WorkflowError::validation(
                        "depends_on",
                        format!("step {} depends on non-existent step {dep}", step.id),
                    )
                })?;
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut levels = Vec::new();
        let mut ready: Vec<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut placed = 0;
        while !ready.is_empty() {
            let mut next = Vec::new();
            for &i in &ready {
                for &dependent in &dependents[i] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            placed += ready.len();
            next.sort_unstable();
            levels.push(std::mem::replace(&mut ready, next));
        }

        if placed < steps.len() {
            let stuck = (0..steps.len())
                .find(|&i| in_degree[i] > 0)
                .map(|i| steps[i].id.clone())
                .unwrap_or_default();
            return Err(WorkflowError::CircularDependency(stuck));
        }
        Ok(levels)
    }

    /// Level plan statistics for `steps`
    pub fn stats(steps: &[WorkflowStep]) -> Result<ExecutionStats, WorkflowError> {
        let levels = Self::build_levels(steps)?;
        Ok(ExecutionStats {
            total_levels: levels.len(),
            total_steps: steps.len(),
            max_parallelism: levels.iter().map(Vec::len).max().unwrap_or(0),
            min_parallelism: levels.iter().map(Vec::len).min().unwrap_or(0),
        })
    }

    /// Run `steps`. Steps for which `skip` returns true are not run (they
    /// already finished in an earlier segment of the same execution).
    ///
    /// In [`FailureMode::Abort`] the first failing step of a level (in
    /// declaration order) ends the run once its siblings finish. In
    /// [`FailureMode::Continue`] failures are logged and the run goes on.
    pub async fn execute<'a, S, F, Fut>(
        &self,
        ctx: &CallContext,
        steps: &'a [WorkflowStep],
        failure_mode: FailureMode,
        skip: S,
        run: F,
    ) -> Result<DagOutcome, WorkflowError>
    where
        S: Fn(&WorkflowStep) -> bool,
        F: Fn(&'a WorkflowStep) -> Fut,
        Fut: Future<Output = Result<StepFlow, WorkflowError>>,
    {
        let levels = Self::build_levels(steps)?;
        debug!(
            levels = levels.len(),
            steps = steps.len(),
            max_parallel = self.max_parallel,
            "Executing workflow DAG"
        );

        for (level_no, level) in levels.iter().enumerate() {
            if let Some(reason) = ctx.err() {
                return Err(reason.into());
            }

            let pending: Vec<&'a WorkflowStep> = level
                .iter()
                .map(|&i| &steps[i])
                .filter(|step| !skip(*step))
                .collect();
            if pending.is_empty() {
                continue;
            }
            debug!(level = level_no, steps = pending.len(), "Executing level");

            let futures: Vec<_> = pending
                .into_iter()
                .enumerate()
                .map(|(order, step)| {
                    let fut = run(step);
                    async move { (order, fut.await) }
                })
                .collect();
            let mut results: Vec<(usize, Result<StepFlow, WorkflowError>)> =
                stream::iter(futures)
                    .buffer_unordered(self.max_parallel)
                    .collect()
                    .await;
            results.sort_by_key(|(order, _)| *order);

            let mut paused = false;
            let mut skip_remaining = false;
            let mut first_error = None;
            for (_, result) in results {
                match result {
                    Ok(StepFlow::Continue) => {}
                    Ok(StepFlow::Pause) => paused = true,
                    Ok(StepFlow::SkipRemaining) => skip_remaining = true,
                    Err(e) => match failure_mode {
                        FailureMode::Abort => {
                            first_error.get_or_insert(e);
                        }
                        FailureMode::Continue => {
                            warn!(level = level_no, error = %e, "Step failed, continuing");
                        }
                    },
                }
            }

            if let Some(e) = first_error {
                return Err(e);
            }
            if skip_remaining {
                return Ok(DagOutcome::SkippedRemaining);
            }
            if paused {
                return Ok(DagOutcome::Paused);
            }
        }

        Ok(DagOutcome::Completed)
    }
}

//! Parallel execution engine
//!
//! Forks one child task per branch under a parent task, runs them
//! concurrently and joins them under a [`JoinPolicy`]:
//!
//! - `fail_fast`: the first failed branch cancels every outstanding sibling
//!   and fails the parent
//! - otherwise the parent completes once all branches are terminal and at
//!   least `min_successes` (never less than one) completed
//!
//! The joined output is an array in fork order. A failed branch contributes
//! `{"error", "index", "task_id"}`, a cancelled one `{"cancelled": true, ...}`.

use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatch::{CancelHandle, CancelSignal, Dispatcher, StepOutcome};
use crate::error::WeftError;
use crate::model::{BranchSpec, JoinPolicy, Task};
use crate::protocol::{TaskId, TaskStatus};
use crate::state::{retry_on_conflict, task_key};

/// How one branch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchResult {
    Completed(Value),
    Failed(String),
    Cancelled,
}

/// The joined result of a fork.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Completed, Failed or Cancelled.
    pub status: TaskStatus,
    pub output: Value,
    pub children: Vec<TaskId>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub reason: Option<String>,
}

#[derive(Clone)]
pub struct ForkJoin {
    dispatcher: Dispatcher,
}

impl ForkJoin {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Run `branches` as children of `parent` (already persisted) and write
    /// the joined result back to the parent.
    #[instrument(skip_all, fields(parent = %parent.id, branches = branches.len()))]
    pub async fn run(
        &self,
        parent: &Task,
        branches: &[BranchSpec],
        policy: &JoinPolicy,
        cancel: &CancelSignal,
    ) -> Result<JoinOutcome, WeftError> {
        let parent_key = task_key(&parent.id);
        self.dispatcher
            .state()
            .update::<Task, _>(&parent_key, |t| {
                if t.status != TaskStatus::Pending {
                    return Ok(false);
                }
                t.transition(TaskStatus::Running)?;
                Ok(true)
            })
            .await?;

        let mut children = Vec::with_capacity(branches.len());
        for (index, branch) in branches.iter().enumerate() {
            let child = Task::new(
                parent.workflow_id,
                format!("{}[{index}]", parent.step_id),
                branch.capability.clone(),
                branch.input.clone(),
            )
            .with_parent(parent.id)
            .with_retries(parent.max_retries)
            .with_timeout_ms(parent.timeout_ms);
            self.dispatcher.create_task(&child).await?;
            children.push(child.id);
        }

        let fork = CancelHandle::new();
        let mut set = JoinSet::new();
        for (index, &child) in children.iter().enumerate() {
            let dispatcher = self.dispatcher.clone();
            let signal = fork.signal();
            set.spawn(async move { (index, dispatcher.run_task(child, &signal).await) });
        }

        let mut results: Vec<Option<BranchResult>> = vec![None; children.len()];
        let mut tripped: Option<(usize, String)> = None;
        let mut workflow_cancel = cancel.clone();

        loop {
            let joined = tokio::select! {
                joined = set.join_next() => joined,
                _ = workflow_cancel.cancelled(), if !fork.is_cancelled() => {
                    info!("fork cancelled with its workflow");
                    fork.cancel();
                    continue;
                }
            };
            let Some(joined) = joined else { break };

            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "branch runner aborted");
                    continue;
                }
            };

            let result = match result {
                Ok(StepOutcome::Completed { output, .. }) => BranchResult::Completed(output),
                Ok(StepOutcome::Failed { reason, .. }) => BranchResult::Failed(reason),
                Ok(StepOutcome::Cancelled { .. }) => BranchResult::Cancelled,
                Err(e) => BranchResult::Failed(e.to_string()),
            };
            debug!(index, ?result, "branch finished");

            if let BranchResult::Failed(reason) = &result {
                if policy.fail_fast && tripped.is_none() {
                    warn!(index, %reason, "branch failed, cancelling siblings");
                    tripped = Some((index, reason.clone()));
                    fork.cancel();
                }
            }
            results[index] = Some(result);
        }

        let mut outcome = JoinOutcome {
            status: TaskStatus::Completed,
            output: Value::Null,
            children: children.clone(),
            succeeded: 0,
            failed: 0,
            cancelled: 0,
            reason: None,
        };

        let merged: Vec<Value> = results
            .iter()
            .enumerate()
            .map(|(index, result)| match result {
                Some(BranchResult::Completed(value)) => {
                    outcome.succeeded += 1;
                    value.clone()
                }
                Some(BranchResult::Failed(reason)) => {
                    outcome.failed += 1;
                    json!({"error": reason, "index": index, "task_id": children[index]})
                }
                Some(BranchResult::Cancelled) => {
                    outcome.cancelled += 1;
                    json!({"cancelled": true, "index": index, "task_id": children[index]})
                }
                None => {
                    outcome.failed += 1;
                    json!({"error": "branch runner aborted", "index": index, "task_id": children[index]})
                }
            })
            .collect();
        outcome.output = Value::Array(merged);

        let required = policy.required();
        if cancel.is_cancelled() {
            outcome.status = TaskStatus::Cancelled;
            outcome.reason = Some("workflow cancelled".into());
        } else if let Some((index, reason)) = tripped {
            outcome.status = TaskStatus::Failed;
            outcome.reason = Some(format!("branch {index} failed: {reason}"));
        } else if outcome.succeeded < required {
            outcome.status = TaskStatus::Failed;
            outcome.reason = Some(format!(
                "{} of {} branches succeeded, {required} required",
                outcome.succeeded,
                children.len()
            ));
        }

        let status = outcome.status;
        let output = outcome.output.clone();
        let reason = outcome.reason.clone().unwrap_or_default();
        retry_on_conflict(|| {
            let output = output.clone();
            let reason = reason.clone();
            self.dispatcher.state().update::<Task, _>(&parent_key, move |t| {
                if t.is_terminal() {
                    return Ok(false);
                }
                match status {
                    TaskStatus::Completed => t.complete(output)?,
                    TaskStatus::Cancelled => t.cancel(reason)?,
                    _ => {
                        t.fail(reason)?;
                        t.output = Some(output);
                    }
                }
                Ok(true)
            })
        })
        .await?;

        info!(
            status = %outcome.status,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            cancelled = outcome.cancelled,
            "fork joined"
        );
        Ok(outcome)
    }
}

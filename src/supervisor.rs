//! Supervisor - drives one workflow instance to a terminal status
//!
//! The supervisor is the only writer of its workflow record. It asks the
//! topology policy what to do next, runs that step through the shared
//! dispatch machinery (a single task, a fork/join, a child workflow or a
//! swarm posting) and folds the result back into the record.
//!
//! Control arrives on the bus at `supervisor:{workflow_id}`: cancellation
//! requests and agent reports. Every failure that is not a cancellation is
//! downgraded to a `failed` workflow with the cause in `details`.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn, Instrument};

use crate::backoff::Backoff;
use crate::bus::{supervisor_address, Message, MessagePayload, MessagePriority, Subscription};
use crate::dispatch::{CancelHandle, CancelSignal, Dispatcher, StepOutcome};
use crate::error::WeftError;
use crate::model::{BranchSpec, JoinPolicy, ParentLink, StepKind, Task, WorkflowDefinition, WorkflowState};
use crate::parallel::ForkJoin;
use crate::protocol::{Event, NotificationLevel, TaskId, TaskStatus, TopologyKind, WorkflowId, WorkflowStatus};
use crate::state::{retry_on_conflict, task_key, workflow_key, Versioned, TASK_PREFIX};
use crate::topology::{policy_for, NextAction, StepPolicy};

/// Subscribe the supervisor mailbox for `workflow_id` and start driving it.
///
/// The mailbox exists before this returns, so a cancellation sent right
/// after submission is not lost.
pub fn spawn_supervisor(dispatcher: Dispatcher, workflow_id: WorkflowId) -> JoinHandle<Result<WorkflowStatus, WeftError>> {
    let mailbox = dispatcher.bus().subscribe(supervisor_address(&workflow_id));
    tokio::spawn(async move {
        match Supervisor::load(dispatcher.clone(), workflow_id).await {
            Ok(supervisor) => supervisor.run(mailbox).await,
            Err(e) => {
                error!(%workflow_id, error = %e, "could not load workflow");
                dispatcher.bus().unsubscribe(&supervisor_address(&workflow_id));
                Err(e)
            }
        }
    })
}

struct StepFailure {
    step: String,
    task_id: TaskId,
    reason: String,
}

/// A swarm task still being worked on.
struct Posting {
    task_id: TaskId,
    step: String,
    since: Instant,
}

pub struct Supervisor {
    dispatcher: Dispatcher,
    workflow: WorkflowState,
    /// Version of `workflow` as last read or written.
    version: u64,
    policy: &'static dyn StepPolicy,
    cancel: CancelHandle,
    cancel_reason: Arc<Mutex<Option<String>>>,
}

impl Supervisor {
    pub async fn load(dispatcher: Dispatcher, workflow_id: WorkflowId) -> Result<Self, WeftError> {
        let Versioned { value, version } = dispatcher
            .state()
            .load::<WorkflowState>(&workflow_key(&workflow_id))
            .await?;
        Ok(Self {
            policy: policy_for(value.topology()),
            workflow: value,
            version,
            dispatcher,
            cancel: CancelHandle::new(),
            cancel_reason: Arc::new(Mutex::new(None)),
        })
    }

    pub fn id(&self) -> WorkflowId {
        self.workflow.id
    }

    pub fn workflow(&self) -> &WorkflowState {
        &self.workflow
    }

    #[instrument(skip_all, fields(workflow_id = %self.workflow.id, topology = %self.workflow.topology()))]
    pub async fn run(mut self, mailbox: Subscription) -> Result<WorkflowStatus, WeftError> {
        let listener = self.listen(mailbox);
        info!(name = %self.workflow.name(), "supervisor started");

        let finished = match self.drive().await {
            Ok(status) => Ok(status),
            Err(WeftError::Cancelled) => self.finish_cancelled().await,
            Err(e) => {
                error!(error = %e, "workflow aborted");
                let step = self.workflow.current_steps.first().cloned();
                self.finish_failed(&e.to_string(), step.as_deref(), None).await
            }
        };

        listener.abort();
        self.dispatcher.bus().unsubscribe(&supervisor_address(&self.workflow.id));
        match &finished {
            Ok(status) => info!(%status, progress = self.workflow.progress, "supervisor finished"),
            Err(e) => error!(error = %e, "could not record final workflow status"),
        }
        finished
    }

    /// Handle control messages until the supervisor stops.
    fn listen(&self, mut mailbox: Subscription) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let cancel = self.cancel.clone();
        let slot = self.cancel_reason.clone();
        tokio::spawn(
            async move {
                while let Some(msg) = mailbox.recv().await {
                    match msg.payload {
                        MessagePayload::CancelWorkflow { reason, .. } => {
                            info!(%reason, sender = %msg.sender, "cancellation requested");
                            let mut slot = slot.lock();
                            if slot.is_none() {
                                *slot = Some(reason);
                            }
                            drop(slot);
                            cancel.cancel();
                        }
                        MessagePayload::Report(report) => {
                            if let Err(e) = dispatcher.record_report(&report).await {
                                warn!(task_id = %report.task_id, error = %e, "could not record report");
                            }
                        }
                        other => trace!(payload = ?other, "ignoring message"),
                    }
                }
            }
            .in_current_span(),
        )
    }

    async fn drive(&mut self) -> Result<WorkflowStatus, WeftError> {
        if self.workflow.is_terminal() {
            return Ok(self.workflow.status);
        }
        self.persist(|w| w.set_status(WorkflowStatus::Running)).await?;

        // a step left outstanding by an interrupted run goes first
        let mut resume = match self.workflow.topology() {
            TopologyKind::Swarm => None,
            _ => self.workflow.current_steps.first().cloned(),
        };

        loop {
            if self.cancel.is_cancelled() {
                return Err(WeftError::Cancelled);
            }

            let action = match resume.take() {
                Some(step) => {
                    info!(%step, "resuming interrupted step");
                    NextAction::Execute(step)
                }
                None => self.policy.advance(&self.workflow)?,
            };

            let step = match action {
                NextAction::Complete => return self.finish_completed().await,
                NextAction::Fail(reason) => {
                    let step = self.workflow.last_step.clone();
                    return self.finish_failed(&reason, step.as_deref(), None).await;
                }
                NextAction::Execute(step) => step,
                NextAction::Route { step, decision } => {
                    debug!(to = %step, "routing");
                    self.persist(|w| {
                        w.push_routing_decision(decision.clone());
                        Ok(())
                    })
                    .await?;
                    step
                }
                NextAction::Publish(steps) => {
                    if let Some(failure) = self.run_swarm(&steps).await? {
                        return self
                            .finish_failed(&failure.reason, Some(&failure.step), Some(failure.task_id))
                            .await;
                    }
                    continue;
                }
            };

            match self.execute_step(&step).await? {
                StepOutcome::Completed { task_id, output } => self.step_completed(&step, task_id, output).await?,
                StepOutcome::Failed { task_id, reason } => {
                    return self.finish_failed(&reason, Some(&step), Some(task_id)).await;
                }
                StepOutcome::Cancelled { .. } => return Err(WeftError::Cancelled),
            }
        }
    }

    /// Versioned write of the workflow record.
    ///
    /// A conflict means someone else wrote our record: re-read once and
    /// reapply `f`. A second conflict is a consistency error.
    async fn persist<F>(&mut self, f: F) -> Result<(), WeftError>
    where
        F: Fn(&mut WorkflowState) -> Result<(), WeftError>,
    {
        let key = workflow_key(&self.workflow.id);
        let previous = self.workflow.status;
        let mut next = self.workflow.clone();
        f(&mut next)?;

        let state = self.dispatcher.state();
        let written = match state.save(&key, &next, self.version).await {
            Ok(version) => (next, version),
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "workflow record changed underneath its supervisor, re-reading once");
                let Versioned { value: mut fresh, version } = state.load::<WorkflowState>(&key).await?;
                if fresh.is_terminal() {
                    return Err(WeftError::Consistency(format!(
                        "workflow {} was finalized as {} by another writer",
                        fresh.id, fresh.status
                    )));
                }
                f(&mut fresh)?;
                match state.save(&key, &fresh, version).await {
                    Ok(version) => (fresh, version),
                    Err(e) if e.is_conflict() => {
                        return Err(WeftError::Consistency(format!(
                            "workflow {} modified concurrently: {e}",
                            fresh.id
                        )));
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        (self.workflow, self.version) = written;
        if self.workflow.status != previous {
            self.dispatcher
                .events()
                .workflow_status(self.workflow.id, self.workflow.status, Some(previous));
        }
        Ok(())
    }

    fn step_task(&self, step_id: &str, capability: String, input: Value) -> Task {
        let config = self.dispatcher.config();
        Task::new(self.workflow.id, step_id, capability, input)
            .with_retries(self.workflow.retry_limit(config.retry_limit))
            .with_timeout_ms(self.workflow.task_timeout_ms(config.task_timeout_ms))
    }

    #[instrument(skip(self))]
    async fn execute_step(&mut self, step_id: &str) -> Result<StepOutcome, WeftError> {
        let step = self
            .workflow
            .definition
            .get_step(step_id)
            .cloned()
            .ok_or_else(|| WeftError::InvalidWorkflow(format!("unknown step '{step_id}'")))?;
        let input = self.workflow.input_for(&step);
        let capability = match &step.kind {
            StepKind::Task { capability, .. } => capability.clone(),
            _ => String::new(),
        };
        let task = self.step_task(&step.id, capability, input.clone());
        self.dispatcher.create_task(&task).await?;

        self.persist(|w| {
            if !w.current_steps.contains(&step.id) {
                w.current_steps.push(step.id.clone());
            }
            w.tasks.push(task.id);
            w.set_status(WorkflowStatus::Waiting)
        })
        .await?;
        debug!(task_id = %task.id, "step started");

        let signal = self.cancel.signal();
        match &step.kind {
            StepKind::Task { .. } => self.dispatcher.run_task(task.id, &signal).await,
            StepKind::Parallel { branches, join } => self.fork(&task, branches, join, &input, &signal).await,
            StepKind::SubWorkflow { definition } => self.delegate(&task, definition, input, &signal).await,
        }
    }

    async fn fork(
        &mut self,
        parent: &Task,
        branches: &[BranchSpec],
        join: &JoinPolicy,
        input: &Value,
        cancel: &CancelSignal,
    ) -> Result<StepOutcome, WeftError> {
        // branches without their own input get the step's input
        let branches: Vec<BranchSpec> = branches
            .iter()
            .map(|b| {
                if b.input.is_null() {
                    BranchSpec::new(b.capability.clone(), input.clone())
                } else {
                    b.clone()
                }
            })
            .collect();

        let joined = ForkJoin::new(self.dispatcher.clone())
            .run(parent, &branches, join, cancel)
            .await?;
        self.persist(|w| {
            w.tasks.extend(joined.children.iter().copied());
            Ok(())
        })
        .await?;

        Ok(match joined.status {
            TaskStatus::Completed => StepOutcome::Completed {
                task_id: parent.id,
                output: joined.output,
            },
            TaskStatus::Cancelled => StepOutcome::Cancelled { task_id: parent.id },
            _ => StepOutcome::Failed {
                task_id: parent.id,
                reason: joined.reason.unwrap_or_else(|| "fork failed".into()),
            },
        })
    }

    /// Run `definition` as a child workflow and fold its result into
    /// `parent`. Blocks until the child is terminal.
    async fn delegate(
        &mut self,
        parent: &Task,
        definition: &WorkflowDefinition,
        input: Value,
        cancel: &CancelSignal,
    ) -> Result<StepOutcome, WeftError> {
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

        let child = WorkflowState::new(definition.clone(), input).with_parent(ParentLink {
            workflow_id: self.workflow.id,
            task_id: parent.id,
        });
        let child_id = child.id;
        self.dispatcher.state().create(&workflow_key(&child_id), &child).await?;
        self.persist(|w| {
            w.children.push(child_id);
            Ok(())
        })
        .await?;
        info!(child = %child_id, name = %definition.name, "delegating to child workflow");

        let mut handle = spawn_supervisor(self.dispatcher.clone(), child_id);
        let mut signal = cancel.clone();
        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = signal.cancelled() => {
                self.request_cancel(child_id, "parent workflow cancelled");
                (&mut handle).await
            }
        };
        match joined {
            Ok(Ok(status)) => debug!(child = %child_id, %status, "child workflow finished"),
            Ok(Err(e)) => warn!(child = %child_id, error = %e, "child supervisor failed"),
            Err(e) => warn!(child = %child_id, error = %e, "child supervisor aborted"),
        }

        let child = self
            .dispatcher
            .state()
            .load::<WorkflowState>(&workflow_key(&child_id))
            .await?
            .value;
        match child.status {
            WorkflowStatus::Completed => {
                let output = child.output.unwrap_or(Value::Null);
                retry_on_conflict(|| {
                    let output = output.clone();
                    self.dispatcher.state().update::<Task, _>(&parent_key, move |t| {
                        if t.is_terminal() {
                            return Ok(false);
                        }
                        t.complete(output)?;
                        Ok(true)
                    })
                })
                .await?;
                Ok(StepOutcome::Completed {
                    task_id: parent.id,
                    output,
                })
            }
            WorkflowStatus::Cancelled => {
                self.dispatcher.cancel_task(parent.id, "child workflow cancelled").await?;
                Ok(StepOutcome::Cancelled { task_id: parent.id })
            }
            status => {
                let cause = child
                    .details
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("ended as {status}"));
                let reason = format!("child workflow {child_id} failed: {cause}");
                self.dispatcher.fail_task(parent.id, &reason).await?;
                Ok(StepOutcome::Failed {
                    task_id: parent.id,
                    reason,
                })
            }
        }
    }

    fn request_cancel(&self, workflow_id: WorkflowId, reason: &str) {
        let message = Message::direct(
            supervisor_address(&self.workflow.id),
            supervisor_address(&workflow_id),
            MessagePayload::CancelWorkflow {
                workflow_id,
                reason: reason.to_string(),
            },
        )
        .with_priority(MessagePriority::Urgent);
        if let Err(e) = self.dispatcher.bus().send(message) {
            debug!(%workflow_id, error = %e, "no supervisor to cancel");
        }
    }

    /// Post `steps` as claimable work and wait until every one is done or
    /// one fails for good.
    #[instrument(skip_all, fields(steps = steps.len()))]
    async fn run_swarm(&mut self, steps: &[String]) -> Result<Option<StepFailure>, WeftError> {
        let mut posted = Vec::with_capacity(steps.len());
        for step_id in steps {
            let step = self
                .workflow
                .definition
                .get_step(step_id)
                .ok_or_else(|| WeftError::InvalidWorkflow(format!("unknown step '{step_id}'")))?;
            let StepKind::Task { capability, .. } = &step.kind else {
                return Err(WeftError::InvalidWorkflow(format!("swarm step '{step_id}' is not a task")));
            };
            let task = self
                .step_task(step_id, capability.clone(), self.workflow.input_for(step))
                .claimable();
            self.dispatcher.create_task(&task).await?;
            posted.push(task);
        }

        let ids: Vec<TaskId> = posted.iter().map(|t| t.id).collect();
        self.persist(|w| {
            for step in steps {
                if !w.current_steps.contains(step) {
                    w.current_steps.push(step.clone());
                }
            }
            w.tasks.extend(ids.iter().copied());
            w.set_status(WorkflowStatus::Waiting)
        })
        .await?;

        let now = Instant::now();
        let mut open: Vec<Posting> = Vec::with_capacity(posted.len());
        for task in &posted {
            let heard = self.dispatcher.announce(task);
            debug!(task_id = %task.id, step = %task.step_id, heard, "work posted");
            open.push(Posting {
                task_id: task.id,
                step: task.step_id.clone(),
                since: now,
            });
        }

        let state = self.dispatcher.state().clone();
        let mut changes = state.subscribe(format!("{TASK_PREFIX}*"));
        let mut cancel = self.cancel.signal();
        let mut backoff = Backoff::new(self.dispatcher.config().backoff.clone());
        let claim_window = self.dispatcher.config().agent_wait_timeout();

        loop {
            if cancel.is_cancelled() {
                return Err(WeftError::Cancelled);
            }

            let mut i = 0;
            while i < open.len() {
                let task_id = open[i].task_id;
                let task = self.dispatcher.load_task(task_id).await?;
                match task.status {
                    TaskStatus::Completed => {
                        let posting = open.remove(i);
                        self.step_completed(&posting.step, task_id, task.output.unwrap_or(Value::Null))
                            .await?;
                        continue;
                    }
                    TaskStatus::Failed if task.can_retry() => {
                        let key = task_key(&task_id);
                        let retried = retry_on_conflict(|| {
                            state.update::<Task, _>(&key, |t| {
                                if !t.can_retry() {
                                    return Ok(false);
                                }
                                t.retry()?;
                                Ok(true)
                            })
                        })
                        .await?;
                        if retried.written {
                            info!(%task_id, attempt = retried.value.retry_count, "re-posting swarm task");
                            self.dispatcher.announce(&retried.value);
                            open[i].since = Instant::now();
                        }
                    }
                    TaskStatus::Failed | TaskStatus::Cancelled => {
                        self.withdraw_unclaimed(&open).await;
                        return Ok(Some(StepFailure {
                            step: open[i].step.clone(),
                            task_id,
                            reason: task.error.unwrap_or_else(|| format!("task {}", task.status)),
                        }));
                    }
                    TaskStatus::Pending => {
                        if open[i].since.elapsed() >= claim_window {
                            let reason = format!(
                                "no agent claimed task with capability '{}' within {}ms",
                                task.capability,
                                claim_window.as_millis()
                            );
                            self.dispatcher.fail_task(task_id, &reason).await?;
                            continue;
                        }
                    }
                    TaskStatus::Dispatched | TaskStatus::Running => {
                        if task.is_overdue(Utc::now()) {
                            self.dispatcher.expire_task(task_id).await?;
                            continue;
                        }
                    }
                }
                i += 1;
            }

            if open.is_empty() {
                return Ok(None);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(WeftError::Cancelled),
                _ = changes.next() => backoff.reset(),
                _ = tokio::time::sleep(backoff.next_delay()) => {
                    // topics do not replay: repeat the offer for late joiners
                    for posting in &open {
                        let task = self.dispatcher.load_task(posting.task_id).await?;
                        if task.status == TaskStatus::Pending && task.assigned_agent.is_none() {
                            self.dispatcher.announce(&task);
                        }
                    }
                }
            }
        }
    }

    /// Cancel swarm tasks nobody has claimed yet. Claimed ones are left for
    /// inspection.
    async fn withdraw_unclaimed(&self, open: &[Posting]) {
        for posting in open {
            let unclaimed = match self.dispatcher.load_task(posting.task_id).await {
                Ok(task) => task.status == TaskStatus::Pending && task.assigned_agent.is_none(),
                Err(_) => false,
            };
            if unclaimed {
                if let Err(e) = self.dispatcher.cancel_task(posting.task_id, "workflow failed").await {
                    warn!(task_id = %posting.task_id, error = %e, "could not withdraw task");
                }
            }
        }
    }

    async fn step_completed(&mut self, step_id: &str, task_id: TaskId, output: Value) -> Result<(), WeftError> {
        self.persist(|w| {
            w.complete_step(step_id, output.clone());
            if w.current_steps.is_empty() {
                w.set_status(WorkflowStatus::Running)?;
            }
            Ok(())
        })
        .await?;
        self.dispatcher.events().emit(Event::StepCompleted {
            workflow_id: self.workflow.id,
            step_id: step_id.to_string(),
            task_id: Some(task_id),
            timestamp: Utc::now(),
        });
        info!(step = step_id, progress = self.workflow.progress, "step completed");
        Ok(())
    }

    async fn finish_completed(&mut self) -> Result<WorkflowStatus, WeftError> {
        self.persist(|w| {
            w.output = w.last_output.clone();
            w.set_status(WorkflowStatus::Completed)
        })
        .await?;
        self.dispatcher.events().notify(
            NotificationLevel::Success,
            format!("workflow '{}' completed", self.workflow.name()),
        );
        Ok(WorkflowStatus::Completed)
    }

    async fn finish_failed(
        &mut self,
        reason: &str,
        step: Option<&str>,
        task_id: Option<TaskId>,
    ) -> Result<WorkflowStatus, WeftError> {
        error!(%reason, step, "workflow failed");
        self.persist(|w| {
            w.record_failure(reason, step, task_id);
            w.set_status(WorkflowStatus::Failed)
        })
        .await?;
        self.dispatcher.events().notify(
            NotificationLevel::Error,
            format!("workflow '{}' failed: {reason}", self.workflow.name()),
        );
        Ok(WorkflowStatus::Failed)
    }

    async fn finish_cancelled(&mut self) -> Result<WorkflowStatus, WeftError> {
        let reason = self
            .cancel_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "cancelled".to_string());

        for task_id in self.workflow.tasks.clone() {
            if let Err(e) = self.dispatcher.cancel_task(task_id, &reason).await {
                warn!(%task_id, error = %e, "could not cancel task");
            }
        }
        for child in self.workflow.children.clone() {
            self.request_cancel(child, &reason);
        }

        self.persist(|w| {
            w.details.insert("cancel_reason".into(), Value::String(reason.clone()));
            w.set_status(WorkflowStatus::Cancelled)
        })
        .await?;
        info!(%reason, "workflow cancelled");
        self.dispatcher.events().notify(
            NotificationLevel::Warning,
            format!("workflow '{}' cancelled: {reason}", self.workflow.name()),
        );
        Ok(WorkflowStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::agent::{handler_fn, AgentHandle, AgentWorker, TaskContext};
    use crate::backoff::BackoffConfig;
    use crate::bus::MessageBus;
    use crate::channel::EventSink;
    use crate::config::OrchestratorConfig;
    use crate::model::{AgentState, StepDefinition};
    use crate::state::{agent_key, StateManager};

    fn dispatcher() -> Dispatcher {
        let config = OrchestratorConfig {
            retry_limit: 0,
            task_timeout_ms: 2_000,
            agent_wait_timeout_ms: 500,
            backoff: BackoffConfig {
                initial_ms: 5,
                max_ms: 25,
                jitter: false,
            },
            ..OrchestratorConfig::default()
        };
        Dispatcher::new(
            StateManager::in_memory(),
            MessageBus::new(),
            EventSink::detached(),
            Arc::new(config),
        )
    }

    /// Worker that echoes `{"value": ..}`, fails on `{"fail": ..}`, sleeps on
    /// `{"sleep_ms": ..}` and otherwise tags its input with the capability.
    async fn agent(d: &Dispatcher, capability: &str) -> AgentHandle {
        let state = AgentState::new(capability, vec![capability.to_string()]);
        d.state().create(&agent_key(&state.id), &state).await.unwrap();
        let cap = capability.to_string();
        AgentWorker::new(
            d.clone(),
            state.id,
            state.capabilities.clone(),
            handler_fn(move |ctx: TaskContext| {
                let cap = cap.clone();
                async move {
                    if let Some(ms) = ctx.input.get("sleep_ms").and_then(Value::as_u64) {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    if let Some(reason) = ctx.input.get("fail").and_then(Value::as_str) {
                        anyhow::bail!("{reason}");
                    }
                    if let Some(value) = ctx.input.get("value") {
                        return Ok(value.clone());
                    }
                    Ok(json!({"by": cap, "input": ctx.input}))
                }
            }),
        )
        .spawn()
    }

    async fn submit(d: &Dispatcher, definition: WorkflowDefinition, input: Value) -> WorkflowId {
        definition.validate().unwrap();
        let wf = WorkflowState::new(definition, input);
        d.state().create(&workflow_key(&wf.id), &wf).await.unwrap();
        wf.id
    }

    async fn load(d: &Dispatcher, id: WorkflowId) -> WorkflowState {
        d.state().load::<WorkflowState>(&workflow_key(&id)).await.unwrap().value
    }

    #[tokio::test]
    async fn test_linear_passes_output_along() {
        let d = dispatcher();
        let _fetch = agent(&d, "fetch").await;
        let _parse = agent(&d, "parse").await;
        let id = submit(
            &d,
            WorkflowDefinition::new("pipeline", TopologyKind::Linear)
                .step(StepDefinition::task("fetch", "fetch"))
                .step(StepDefinition::task("parse", "parse")),
            json!("https://example.com"),
        )
        .await;

        let status = spawn_supervisor(d.clone(), id).await.unwrap().unwrap();
        assert_eq!(status, WorkflowStatus::Completed);

        let wf = load(&d, id).await;
        assert_eq!(wf.completed_steps, vec!["fetch", "parse"]);
        assert_eq!(wf.progress, 1.0);
        assert_eq!(wf.tasks.len(), 2);
        let output = wf.output.unwrap();
        assert_eq!(output["by"], "parse");
        assert_eq!(output["input"]["by"], "fetch");
        assert_eq!(output["input"]["input"], "https://example.com");
        assert!(wf.started_at.is_some() && wf.ended_at.is_some());
        assert!(!d.bus().is_registered(&supervisor_address(&id)));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_in_details() {
        let d = dispatcher();
        let _w = agent(&d, "work").await;
        let id = submit(
            &d,
            WorkflowDefinition::new("doomed", TopologyKind::Linear)
                .step(StepDefinition::task("only", "work").with_input(json!({"fail": "disk full"}))),
            Value::Null,
        )
        .await;

        let status = spawn_supervisor(d.clone(), id).await.unwrap().unwrap();
        assert_eq!(status, WorkflowStatus::Failed);

        let wf = load(&d, id).await;
        assert_eq!(wf.details["error"], "disk full");
        assert_eq!(wf.details["failed_step"], "only");
        assert_eq!(wf.details["failed_task"], json!(wf.tasks[0].to_string()));
    }

    #[tokio::test]
    async fn test_conditional_records_routing_history() {
        let d = dispatcher();
        let _g = agent(&d, "grade").await;
        let _p = agent(&d, "publish").await;
        let _r = agent(&d, "rewrite").await;
        let id = submit(
            &d,
            WorkflowDefinition::new("review", TopologyKind::Conditional)
                .step(
                    StepDefinition::task("grade", "grade")
                        .with_input(json!({"value": {"score": 0.7}}))
                        .route("output.score > 0.5", "publish")
                        .otherwise("rewrite"),
                )
                .step(StepDefinition::task("publish", "publish"))
                .step(StepDefinition::task("rewrite", "rewrite")),
            Value::Null,
        )
        .await;

        assert_eq!(
            spawn_supervisor(d.clone(), id).await.unwrap().unwrap(),
            WorkflowStatus::Completed
        );
        let wf = load(&d, id).await;
        assert_eq!(wf.completed_steps, vec!["grade", "publish"]);
        let history = wf.routing_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["to"], "publish");
    }

    #[tokio::test]
    async fn test_parallel_step_joins_in_fork_order() {
        let d = dispatcher();
        let _a = agent(&d, "echo").await;
        let _b = agent(&d, "echo").await;
        let id = submit(
            &d,
            WorkflowDefinition::new("fan", TopologyKind::Linear).step(StepDefinition::parallel(
                "fan",
                vec![
                    BranchSpec::new("echo", json!({"value": 1, "sleep_ms": 40})),
                    BranchSpec::new("echo", json!({"value": 2})),
                ],
                JoinPolicy::default(),
            )),
            Value::Null,
        )
        .await;

        assert_eq!(
            spawn_supervisor(d.clone(), id).await.unwrap().unwrap(),
            WorkflowStatus::Completed
        );
        let wf = load(&d, id).await;
        assert_eq!(wf.output, Some(json!([1, 2])));
        // parent plus two children
        assert_eq!(wf.tasks.len(), 3);
    }

    #[tokio::test]
    async fn test_hierarchical_folds_child_output() {
        let d = dispatcher();
        let _w = agent(&d, "summarize").await;
        let child = WorkflowDefinition::new("summary", TopologyKind::Linear)
            .step(StepDefinition::task("summarize", "summarize"));
        let id = submit(
            &d,
            WorkflowDefinition::new("report", TopologyKind::Hierarchical)
                .step(StepDefinition::sub_workflow("delegate", child)),
            json!("long text"),
        )
        .await;

        assert_eq!(
            spawn_supervisor(d.clone(), id).await.unwrap().unwrap(),
            WorkflowStatus::Completed
        );
        let parent = load(&d, id).await;
        assert_eq!(parent.children.len(), 1);
        let child = load(&d, parent.children[0]).await;
        assert_eq!(child.status, WorkflowStatus::Completed);
        assert_eq!(child.parent.map(|p| p.workflow_id), Some(id));
        assert_eq!(parent.output, child.output);

        let parent_task = d.load_task(parent.tasks[0]).await.unwrap();
        assert_eq!(parent_task.status, TaskStatus::Completed);
        assert_eq!(parent_task.output, child.output);
    }

    #[tokio::test]
    async fn test_swarm_completes_all_steps() {
        let d = dispatcher();
        let _a = agent(&d, "crawl").await;
        let _b = agent(&d, "crawl").await;
        let id = submit(
            &d,
            WorkflowDefinition::new("crawl", TopologyKind::Swarm)
                .step(StepDefinition::task("a", "crawl").with_input(json!({"value": "a", "sleep_ms": 20})))
                .step(StepDefinition::task("b", "crawl").with_input(json!({"value": "b", "sleep_ms": 20})))
                .step(StepDefinition::task("c", "crawl").with_input(json!({"value": "c"}))),
            Value::Null,
        )
        .await;

        assert_eq!(
            spawn_supervisor(d.clone(), id).await.unwrap().unwrap(),
            WorkflowStatus::Completed
        );
        let wf = load(&d, id).await;
        assert_eq!(wf.completed_steps.len(), 3);
        assert_eq!(wf.step_outputs["b"], json!("b"));
        for task_id in &wf.tasks {
            assert_eq!(d.load_task(*task_id).await.unwrap().status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn test_swarm_without_takers_fails() {
        let d = dispatcher();
        let id = submit(
            &d,
            WorkflowDefinition::new("lonely", TopologyKind::Swarm).step(StepDefinition::task("a", "nobody")),
            Value::Null,
        )
        .await;

        assert_eq!(
            spawn_supervisor(d.clone(), id).await.unwrap().unwrap(),
            WorkflowStatus::Failed
        );
        let wf = load(&d, id).await;
        assert!(wf.details["error"].as_str().unwrap().contains("no agent claimed"));
    }

    #[tokio::test]
    async fn test_cancel_over_the_bus() {
        let d = dispatcher();
        let _w = agent(&d, "slow").await;
        let id = submit(
            &d,
            WorkflowDefinition::new("long", TopologyKind::Linear)
                .step(StepDefinition::task("wait", "slow").with_input(json!({"sleep_ms": 10_000}))),
            Value::Null,
        )
        .await;

        let handle = spawn_supervisor(d.clone(), id);
        let mut changes = d.state().subscribe(workflow_key(&id));
        while load(&d, id).await.status != WorkflowStatus::Waiting {
            changes.next().await;
        }

        d.bus()
            .send(Message::direct(
                "operator",
                supervisor_address(&id),
                MessagePayload::CancelWorkflow {
                    workflow_id: id,
                    reason: "user asked".into(),
                },
            ))
            .unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), WorkflowStatus::Cancelled);
        let wf = load(&d, id).await;
        assert_eq!(wf.details["cancel_reason"], "user asked");
        assert!(wf.current_steps.is_empty());
        assert_eq!(d.load_task(wf.tasks[0]).await.unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_persist_rereads_once_after_foreign_write() {
        let d = dispatcher();
        let id = submit(
            &d,
            WorkflowDefinition::new("w", TopologyKind::Linear).step(StepDefinition::task("a", "x")),
            Value::Null,
        )
        .await;
        let mut supervisor = Supervisor::load(d.clone(), id).await.unwrap();

        let key = workflow_key(&id);
        d.state()
            .update::<WorkflowState, _>(&key, |w| {
                w.details.insert("note".into(), json!("external"));
                Ok(true)
            })
            .await
            .unwrap();

        supervisor
            .persist(|w| w.set_status(WorkflowStatus::Running))
            .await
            .unwrap();
        let wf = load(&d, id).await;
        assert_eq!(wf.status, WorkflowStatus::Running);
        assert_eq!(wf.details["note"], "external");
    }

    #[tokio::test]
    async fn test_persist_refuses_record_finalized_elsewhere() {
        let d = dispatcher();
        let id = submit(
            &d,
            WorkflowDefinition::new("w", TopologyKind::Linear).step(StepDefinition::task("a", "x")),
            Value::Null,
        )
        .await;
        let mut supervisor = Supervisor::load(d.clone(), id).await.unwrap();

        d.state()
            .update::<WorkflowState, _>(&workflow_key(&id), |w| {
                w.set_status(WorkflowStatus::Cancelled)?;
                Ok(true)
            })
            .await
            .unwrap();

        let err = supervisor
            .persist(|w| w.set_status(WorkflowStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Consistency(_)));
    }
}

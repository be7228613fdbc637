//! Task dispatch
//!
//! The machinery every supervisor shares: claiming an idle agent, moving a
//! task through its statuses, awaiting the outcome with a deadline, retrying,
//! and applying agent reports. Agent and task records are only ever changed
//! with versioned writes; a lost race is retried once after re-reading and
//! otherwise surfaces to the caller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use crate::backoff::Backoff;
use crate::bus::{agent_address, supervisor_address, Delivery, Message, MessageBus, MessagePayload, MessagePriority, SWARM_TOPIC};
use crate::channel::EventSink;
use crate::config::OrchestratorConfig;
use crate::error::WeftError;
use crate::model::{AgentState, Task, TaskOutcome, TaskReport, WorkflowState};
use crate::protocol::{AgentId, AgentStatus, TaskId, TaskStatus, WorkflowId};
use crate::state::{
    agent_key, retry_on_conflict, task_key, workflow_key, StateManager, Versioned, AGENT_PREFIX, TASK_PREFIX,
};

/// Owner side of a cancellation flag.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal(self.tx.subscribe())
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation flag.
#[derive(Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled; pends forever if the handle is dropped first.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Final result of running one task.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed { task_id: TaskId, output: Value },
    Failed { task_id: TaskId, reason: String },
    Cancelled { task_id: TaskId },
}

impl StepOutcome {
    pub fn task_id(&self) -> TaskId {
        match self {
            StepOutcome::Completed { task_id, .. }
            | StepOutcome::Failed { task_id, .. }
            | StepOutcome::Cancelled { task_id } => *task_id,
        }
    }
}

/// Why [`Dispatcher::await_task`] returned.
#[derive(Debug)]
pub enum Wait {
    Terminal(Task),
    TimedOut,
    Cancelled,
}

/// What happened to an agent's report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportDisposition {
    Accepted,
    /// The task was no longer awaiting this agent (timed out, cancelled,
    /// reassigned or already finished).
    Discarded,
}

/// Result of a swarm claim attempt.
#[derive(Debug)]
pub enum Claim {
    Won(Task),
    Lost,
}

enum Attempt {
    Done(StepOutcome),
    Failed { agent: Option<AgentId>, reason: String },
    Reload,
}

#[derive(Clone)]
pub struct Dispatcher {
    state: StateManager,
    bus: MessageBus,
    events: EventSink,
    config: Arc<OrchestratorConfig>,
}

impl Dispatcher {
    pub fn new(state: StateManager, bus: MessageBus, events: EventSink, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            state,
            bus,
            events,
            config,
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn create_task(&self, task: &Task) -> Result<(), WeftError> {
        self.state.create(&task_key(&task.id), task).await?;
        trace!(task_id = %task.id, step = %task.step_id, "task created");
        Ok(())
    }

    pub async fn load_task(&self, task_id: TaskId) -> Result<Task, WeftError> {
        Ok(self.state.load::<Task>(&task_key(&task_id)).await?.value)
    }

    /// Drive a task to a terminal status: acquire an agent, dispatch, await
    /// the report or the deadline, and retry failures up to the task's limit.
    #[instrument(skip_all, fields(task_id = %task_id))]
    pub async fn run_task(&self, task_id: TaskId, cancel: &CancelSignal) -> Result<StepOutcome, WeftError> {
        let mut avoid = None;
        loop {
            if cancel.is_cancelled() {
                self.cancel_task(task_id, "workflow cancelled").await?;
                return Ok(StepOutcome::Cancelled { task_id });
            }

            let task = self.load_task(task_id).await?;
            let attempt = match task.status {
                TaskStatus::Completed => {
                    return Ok(StepOutcome::Completed {
                        task_id,
                        output: task.output.unwrap_or(Value::Null),
                    })
                }
                TaskStatus::Cancelled => return Ok(StepOutcome::Cancelled { task_id }),
                TaskStatus::Failed => Attempt::Failed {
                    agent: task.assigned_agent,
                    reason: task.error.clone().unwrap_or_else(|| "task failed".into()),
                },
                TaskStatus::Pending => self.attempt(&task, avoid, cancel).await?,
                TaskStatus::Dispatched | TaskStatus::Running => self.supervise(&task, cancel).await?,
            };

            let reason = match attempt {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Reload => continue,
                Attempt::Failed { agent, reason } => {
                    if agent.is_some() {
                        avoid = agent;
                    }
                    reason
                }
            };

            let task = self.load_task(task_id).await?;
            if task.can_retry() {
                let key = task_key(&task_id);
                retry_on_conflict(|| {
                    self.state.update::<Task, _>(&key, move |t| {
                        if !t.can_retry() {
                            return Ok(false);
                        }
                        t.retry()?;
                        Ok(true)
                    })
                })
                .await?;
                info!(attempt = task.retry_count + 1, max = task.max_retries, %reason, "retrying task");
                continue;
            }

            warn!(%reason, retries = task.retry_count, "task failed");
            return Ok(StepOutcome::Failed { task_id, reason });
        }
    }

    async fn attempt(&self, task: &Task, avoid: Option<AgentId>, cancel: &CancelSignal) -> Result<Attempt, WeftError> {
        let agent = match self.acquire_agent(task, avoid, cancel).await {
            Ok(agent) => agent,
            Err(WeftError::Cancelled) => {
                self.cancel_task(task.id, "workflow cancelled").await?;
                return Ok(Attempt::Done(StepOutcome::Cancelled { task_id: task.id }));
            }
            Err(WeftError::Timeout(reason)) => {
                self.fail_task(task.id, &reason).await?;
                return Ok(Attempt::Failed { agent: None, reason });
            }
            Err(e) => return Err(e),
        };

        let key = task_key(&task.id);
        let dispatched = retry_on_conflict(|| {
            self.state.update::<Task, _>(&key, move |t| {
                if t.status != TaskStatus::Pending {
                    return Ok(false);
                }
                t.dispatch_to(agent)?;
                Ok(true)
            })
        })
        .await;

        let dispatched = match dispatched {
            Ok(updated) if updated.written => updated.value,
            Ok(_) => {
                self.release_agent(agent, task.id, None).await?;
                return Ok(Attempt::Reload);
            }
            Err(e) => {
                self.release_agent(agent, task.id, None).await?;
                return Err(e);
            }
        };

        let message = Message::direct(
            supervisor_address(&task.workflow_id),
            agent_address(&agent),
            MessagePayload::AssignTask {
                task_id: task.id,
                input: dispatched.input.clone(),
            },
        );
        if let Err(e) = self.bus.send(message) {
            let reason = format!("agent {agent} unreachable: {e}");
            self.update_agent(agent, |a| {
                a.current_task = None;
                a.status = AgentStatus::Error;
                true
            })
            .await?;
            self.fail_task(task.id, &reason).await?;
            return Ok(Attempt::Failed {
                agent: Some(agent),
                reason,
            });
        }

        debug!(agent_id = %agent, "task dispatched");
        self.supervise(&dispatched, cancel).await
    }

    async fn supervise(&self, task: &Task, cancel: &CancelSignal) -> Result<Attempt, WeftError> {
        let agent = task.assigned_agent;
        match self.await_task(task.id, task.deadline, cancel).await? {
            Wait::Terminal(done) => match done.status {
                TaskStatus::Completed => {
                    if let Some(agent) = agent {
                        self.release_agent(agent, task.id, None).await?;
                    }
                    Ok(Attempt::Done(StepOutcome::Completed {
                        task_id: task.id,
                        output: done.output.unwrap_or(Value::Null),
                    }))
                }
                TaskStatus::Cancelled => Ok(Attempt::Done(StepOutcome::Cancelled { task_id: task.id })),
                TaskStatus::Failed => {
                    if let Some(agent) = agent {
                        self.release_agent(agent, task.id, None).await?;
                    }
                    Ok(Attempt::Failed {
                        agent,
                        reason: done.error.unwrap_or_else(|| "task failed".into()),
                    })
                }
                _ => Ok(Attempt::Reload),
            },
            Wait::TimedOut => {
                let expired = self.expire_task(task.id).await?;
                if expired.status != TaskStatus::Failed {
                    return Ok(Attempt::Reload);
                }
                Ok(Attempt::Failed {
                    agent,
                    reason: expired.error.unwrap_or_else(|| "timed out".into()),
                })
            }
            Wait::Cancelled => {
                self.cancel_task(task.id, "workflow cancelled").await?;
                Ok(Attempt::Done(StepOutcome::Cancelled { task_id: task.id }))
            }
        }
    }

    /// Reserve an idle, listening agent with the task's capability, waiting
    /// up to the configured agent wait timeout. Agents other than `avoid`
    /// are preferred, then the least recently active.
    async fn acquire_agent(&self, task: &Task, avoid: Option<AgentId>, cancel: &CancelSignal) -> Result<AgentId, WeftError> {
        let mut cancel = cancel.clone();
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let mut changes = self.state.subscribe(format!("{AGENT_PREFIX}*"));
        let deadline = tokio::time::Instant::now() + self.config.agent_wait_timeout();

        loop {
            if cancel.is_cancelled() {
                return Err(WeftError::Cancelled);
            }

            let mut candidates: Vec<AgentState> = self
                .state
                .list::<AgentState>(AGENT_PREFIX)
                .await?
                .into_iter()
                .map(|v| v.value)
                .filter(|a| {
                    a.is_available()
                        && a.has_capability(&task.capability)
                        && self.bus.is_registered(&agent_address(&a.id))
                })
                .collect();
            candidates.sort_by_key(|a| (Some(a.id) == avoid, a.last_activity));

            for agent in candidates {
                if self.claim_agent(agent.id, task.id).await? {
                    return Ok(agent.id);
                }
            }

            trace!(capability = %task.capability, "no idle agent, waiting");
            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => return Err(WeftError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(WeftError::Timeout(format!(
                        "no idle agent with capability '{}' within {}ms",
                        task.capability, self.config.agent_wait_timeout_ms
                    )));
                }
                _ = changes.next() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Versioned change to an agent record, retried once on conflict.
    /// `f` returns whether to write. Emits an agent status event on write.
    pub async fn update_agent<F>(&self, agent_id: AgentId, f: F) -> Result<Option<AgentState>, WeftError>
    where
        F: Fn(&mut AgentState) -> bool,
    {
        let key = agent_key(&agent_id);
        for attempt in 0..2 {
            let Versioned { mut value, version } = self.state.load::<AgentState>(&key).await?;
            let previous = value.status;
            if !f(&mut value) {
                return Ok(None);
            }
            value.touch();
            match self.state.save(&key, &value, version).await {
                Ok(_) => {
                    self.events.agent_status(agent_id, value.status, Some(previous));
                    return Ok(Some(value));
                }
                Err(e) if e.is_conflict() && attempt == 0 => {
                    debug!(agent_id = %agent_id, "agent record changed, retrying once");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// `idle → busy` for `task_id`. False if the agent is taken or gone.
    pub async fn claim_agent(&self, agent_id: AgentId, task_id: TaskId) -> Result<bool, WeftError> {
        let claimed = self
            .update_agent(agent_id, |a| {
                if !a.is_available() {
                    return false;
                }
                a.status = AgentStatus::Busy;
                a.current_task = Some(task_id);
                true
            })
            .await;
        match claimed {
            Ok(agent) => Ok(agent.is_some()),
            Err(e) if e.is_conflict() => Ok(false),
            Err(WeftError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Return an agent to idle if it is still holding `task_id`.
    pub async fn release_agent(&self, agent_id: AgentId, task_id: TaskId, success: Option<bool>) -> Result<(), WeftError> {
        let released = self
            .update_agent(agent_id, |a| {
                if a.current_task != Some(task_id) {
                    return false;
                }
                a.current_task = None;
                if matches!(a.status, AgentStatus::Busy | AgentStatus::Running) {
                    a.status = AgentStatus::Idle;
                }
                if let Some(ok) = success {
                    a.record_outcome(ok);
                }
                true
            })
            .await;
        match released {
            Ok(_) | Err(WeftError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `dispatched → running`, called by the agent that received the task.
    /// `None` if the task is no longer waiting for this agent.
    pub async fn mark_running(&self, task_id: TaskId, agent_id: AgentId) -> Result<Option<Task>, WeftError> {
        let key = task_key(&task_id);
        let updated = retry_on_conflict(|| {
            self.state.update::<Task, _>(&key, move |t| {
                if t.assigned_agent != Some(agent_id) || t.status != TaskStatus::Dispatched {
                    return Ok(false);
                }
                t.transition(TaskStatus::Running)?;
                Ok(true)
            })
        })
        .await?;
        if !updated.written {
            return Ok(None);
        }

        self.update_agent(agent_id, |a| {
            if a.current_task != Some(task_id) {
                return false;
            }
            a.status = AgentStatus::Running;
            true
        })
        .await?;
        Ok(Some(updated.value))
    }

    /// Apply an agent's completion report.
    ///
    /// Accepted only from the assigned agent while the task is dispatched or
    /// running; anything else is discarded. The reporting agent is released
    /// either way.
    #[instrument(skip_all, fields(task_id = %report.task_id, agent_id = %report.agent_id))]
    pub async fn record_report(&self, report: &TaskReport) -> Result<ReportDisposition, WeftError> {
        let key = task_key(&report.task_id);
        let updated = retry_on_conflict(|| {
            self.state.update::<Task, _>(&key, move |t| {
                if t.assigned_agent != Some(report.agent_id)
                    || !matches!(t.status, TaskStatus::Dispatched | TaskStatus::Running)
                {
                    return Ok(false);
                }
                match &report.outcome {
                    TaskOutcome::Completed(output) => t.complete(output.clone())?,
                    TaskOutcome::Failed(reason) => t.fail(reason.clone())?,
                }
                Ok(true)
            })
        })
        .await?;

        let success = updated.written.then(|| report.outcome.is_success());
        self.release_agent(report.agent_id, report.task_id, success).await?;

        if updated.written {
            debug!(status = %updated.value.status, "report accepted");
            Ok(ReportDisposition::Accepted)
        } else {
            warn!(status = %updated.value.status, "discarding report for task no longer awaiting this agent");
            Ok(ReportDisposition::Discarded)
        }
    }

    /// Fail a non-terminal task. Returns the task as stored afterwards.
    pub async fn fail_task(&self, task_id: TaskId, reason: &str) -> Result<Task, WeftError> {
        let key = task_key(&task_id);
        let updated = retry_on_conflict(|| {
            self.state.update::<Task, _>(&key, move |t| {
                if t.is_terminal() {
                    return Ok(false);
                }
                t.fail(reason)?;
                Ok(true)
            })
        })
        .await?;
        Ok(updated.value)
    }

    /// Fail a dispatched or running task whose deadline passed.
    ///
    /// The agent keeps its reservation, since its handler may still be
    /// running: it is asked to stop and goes back to idle once it gives the
    /// task up or reports late. An agent with no mailbox is freed here.
    pub async fn expire_task(&self, task_id: TaskId) -> Result<Task, WeftError> {
        let key = task_key(&task_id);
        let updated = retry_on_conflict(|| {
            self.state.update::<Task, _>(&key, move |t| {
                if !matches!(t.status, TaskStatus::Dispatched | TaskStatus::Running) {
                    return Ok(false);
                }
                let reason = format!("timed out after {}ms", t.timeout_ms);
                t.fail(reason)?;
                Ok(true)
            })
        })
        .await?;
        if !updated.written {
            return Ok(updated.value);
        }

        warn!(task_id = %task_id, "task timed out");
        if let Some(agent) = updated.value.assigned_agent {
            self.charge_timeout(agent, task_id).await?;
            let message = Message::direct(
                supervisor_address(&updated.value.workflow_id),
                agent_address(&agent),
                MessagePayload::CancelTask { task_id },
            )
            .with_priority(MessagePriority::Urgent);
            if self.bus.send(message).is_err() {
                self.release_agent(agent, task_id, None).await?;
            }
        }
        Ok(updated.value)
    }

    /// Count a timeout against the agent still holding `task_id`.
    async fn charge_timeout(&self, agent_id: AgentId, task_id: TaskId) -> Result<(), WeftError> {
        let charged = self
            .update_agent(agent_id, |a| {
                if a.current_task != Some(task_id) {
                    return false;
                }
                a.record_outcome(false);
                true
            })
            .await;
        match charged {
            Ok(_) | Err(WeftError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Mark a task cancelled and ask its agent, if any, to stop.
    ///
    /// The request is not assumed to be honored immediately; the agent
    /// releases itself when it stops. Returns false if the task was already
    /// terminal.
    pub async fn cancel_task(&self, task_id: TaskId, reason: &str) -> Result<bool, WeftError> {
        let key = task_key(&task_id);
        let updated = retry_on_conflict(|| {
            self.state.update::<Task, _>(&key, move |t| {
                if t.is_terminal() {
                    return Ok(false);
                }
                t.cancel(reason)?;
                Ok(true)
            })
        })
        .await?;
        if !updated.written {
            return Ok(false);
        }

        if let Some(agent) = updated.value.assigned_agent {
            let message = Message::direct(
                supervisor_address(&updated.value.workflow_id),
                agent_address(&agent),
                MessagePayload::CancelTask { task_id },
            )
            .with_priority(MessagePriority::Urgent);
            if self.bus.send(message).is_err() {
                // nobody to stop; free the reservation ourselves
                self.release_agent(agent, task_id, None).await?;
            }
        }
        debug!(task_id = %task_id, %reason, "task cancelled");
        Ok(true)
    }

    /// Wait for a task to reach a terminal status, its deadline to pass, or
    /// `cancel` to fire. Woken by change notifications, with a backoff
    /// re-read as the fallback.
    pub async fn await_task(
        &self,
        task_id: TaskId,
        deadline: Option<DateTime<Utc>>,
        cancel: &CancelSignal,
    ) -> Result<Wait, WeftError> {
        let key = task_key(&task_id);
        let mut changes = self.state.subscribe(key.clone());
        let mut cancel = cancel.clone();
        let mut backoff = Backoff::new(self.config.backoff.clone());

        let remaining = match deadline {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            None => self.config.task_timeout(),
        };
        let timeout = tokio::time::sleep(remaining);
        tokio::pin!(timeout);

        loop {
            let task = self.state.load::<Task>(&key).await?.value;
            if task.is_terminal() {
                return Ok(Wait::Terminal(task));
            }

            tokio::select! {
                _ = &mut timeout => return Ok(Wait::TimedOut),
                _ = cancel.cancelled() => return Ok(Wait::Cancelled),
                _ = changes.next() => backoff.reset(),
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    /// Wait for a workflow to reach a terminal status.
    pub async fn await_workflow(&self, workflow_id: WorkflowId, cancel: &CancelSignal) -> Result<WorkflowState, WeftError> {
        let key = workflow_key(&workflow_id);
        let mut changes = self.state.subscribe(key.clone());
        let mut cancel = cancel.clone();
        let mut backoff = Backoff::new(self.config.backoff.clone());

        loop {
            let workflow = self.state.load::<WorkflowState>(&key).await?.value;
            if workflow.is_terminal() {
                return Ok(workflow);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(WeftError::Cancelled),
                _ = changes.next() => backoff.reset(),
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
    }

    /// Swarm claim: a version-matched write of `assigned_agent`. Exactly one
    /// of several concurrent claimers wins; losers should look for other work.
    pub async fn claim_task(&self, task_id: TaskId, agent_id: AgentId) -> Result<Claim, WeftError> {
        let key = task_key(&task_id);
        let Versioned { value: mut task, version } = self.state.load::<Task>(&key).await?;
        if !task.claimable || task.status != TaskStatus::Pending || task.assigned_agent.is_some() {
            return Ok(Claim::Lost);
        }

        task.dispatch_to(agent_id)?;
        match self.state.save(&key, &task, version).await {
            Ok(_) => {
                info!(task_id = %task_id, agent_id = %agent_id, "claimed swarm task");
                Ok(Claim::Won(task))
            }
            Err(e) if e.is_conflict() => {
                debug!(task_id = %task_id, agent_id = %agent_id, "lost claim race");
                Ok(Claim::Lost)
            }
            Err(e) => Err(e),
        }
    }

    /// Claimable pending tasks an agent with `capabilities` could take.
    pub async fn unclaimed_tasks(&self, capabilities: &[String]) -> Result<Vec<Task>, WeftError> {
        let mut tasks: Vec<Task> = self
            .state
            .list::<Task>(TASK_PREFIX)
            .await?
            .into_iter()
            .map(|v| v.value)
            .filter(|t| {
                t.claimable
                    && t.status == TaskStatus::Pending
                    && t.assigned_agent.is_none()
                    && (t.capability.is_empty() || capabilities.contains(&t.capability))
            })
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    /// Post a claimable task on the swarm topic. Returns how many agents
    /// heard it.
    pub fn announce(&self, task: &Task) -> usize {
        let message = Message::topic(
            supervisor_address(&task.workflow_id),
            SWARM_TOPIC,
            MessagePayload::WorkAvailable {
                workflow_id: task.workflow_id,
                task_id: task.id,
                capability: task.capability.clone(),
            },
        );
        match self.bus.send(message) {
            Ok(Delivery::Broadcast { recipients }) => recipients,
            _ => 0,
        }
    }
}

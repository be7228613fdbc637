//! Main orchestrator - the inbound surface of the core
//!
//! Accepts operations from the transport layer (directly or through a
//! [`WeftChannel`]), spawns one supervisor per submitted workflow, keeps the
//! agent registry and relays events outward.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::{AgentHandle, AgentWorker, TaskHandler};
use crate::bus::{agent_address, supervisor_address, BusStats, Message, MessageBus, MessagePayload, MessagePriority, Subscription};
use crate::channel::{ChannelPair, EventSink, WeftChannel};
use crate::config::OrchestratorConfig;
use crate::dispatch::{CancelSignal, Dispatcher, ReportDisposition};
use crate::error::WeftError;
use crate::hierarchy::{WorkflowHierarchy, WorkflowTree};
use crate::model::{AgentState, Task, TaskReport, WorkflowDefinition, WorkflowState};
use crate::protocol::{AgentId, AgentStatus, Event, NotificationLevel, Op, TaskId, TaskStatus, WorkflowId, WorkflowStatus};
use crate::state::{
    agent_key, retry_on_conflict, task_key, workflow_key, StateManager, AGENT_PREFIX, TASK_PREFIX, WORKFLOW_PREFIX,
};
use crate::store::open_store;
use crate::supervisor::spawn_supervisor;

const SENDER: &str = "orchestrator";

/// Per-agent line of a [`HealthReport`].
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub name: String,
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub current_task: Option<TaskId>,
    pub connected: bool,
}

/// Point-in-time view of the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub backend: &'static str,
    pub degraded: bool,
    pub agents_by_status: BTreeMap<String, usize>,
    /// Pending tasks no agent has taken yet.
    pub queued_tasks: usize,
    pub active_workflows: usize,
    pub agents: Vec<AgentSummary>,
    pub bus: BusStats,
}

/// The weft orchestrator
pub struct Orchestrator {
    dispatcher: Dispatcher,
    /// Supervisors started by this process
    supervisors: RwLock<HashMap<WorkflowId, JoinHandle<Result<WorkflowStatus, WeftError>>>>,
    /// In-process agent workers
    workers: RwLock<HashMap<AgentId, AgentHandle>>,
    op_rx: mpsc::UnboundedReceiver<Op>,
    events: EventSink,
}

impl Orchestrator {
    /// Open the configured store and build an orchestrator around it.
    pub fn new(config: OrchestratorConfig, channels: ChannelPair) -> Self {
        let state = StateManager::new(open_store(&config.store), config.change_capacity);
        Self::with_state(config, state, channels)
    }

    /// Create an orchestrator and return a channel for communication
    pub fn with_channel(config: OrchestratorConfig) -> (Self, WeftChannel) {
        let (channel, pair) = WeftChannel::new();
        (Self::new(config, pair), channel)
    }

    pub fn with_state(config: OrchestratorConfig, state: StateManager, channels: ChannelPair) -> Self {
        let events = EventSink::new(channels.event_tx);
        let dispatcher = Dispatcher::new(state, MessageBus::new(), events.clone(), Arc::new(config));
        let orchestrator = Self {
            dispatcher,
            supervisors: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            op_rx: channels.op_rx,
            events,
        };
        orchestrator.watch_degraded();
        orchestrator
    }

    /// Relay the store's degraded signal as a notification.
    fn watch_degraded(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime, degraded-mode watcher not started");
            return;
        };
        let mut signal = self.dispatcher.state().degraded_signal();
        let events = self.events.clone();
        runtime.spawn(async move {
            loop {
                let reason = signal.borrow_and_update().clone();
                if let Some(reason) = reason {
                    warn!(%reason, "state store degraded to memory; state will not survive a restart");
                    events.notify(
                        NotificationLevel::Warning,
                        format!("state store degraded to memory: {reason}"),
                    );
                    return;
                }
                if signal.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> &StateManager {
        self.dispatcher.state()
    }

    pub fn bus(&self) -> &MessageBus {
        self.dispatcher.bus()
    }

    /// Run the orchestrator op loop
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<(), WeftError> {
        info!(backend = self.state().backend(), "starting weft orchestrator");

        while let Some(op) = self.op_rx.recv().await {
            let sub_id = *op.sub_id();
            if let Err(e) = self.handle_op(op).await {
                error!(error = %e, %sub_id, "error handling operation");
                self.events.emit(Event::OpFailed {
                    sub_id,
                    error: e.to_string(),
                });
            }
        }

        self.shutdown().await;
        info!("weft orchestrator stopped");
        Ok(())
    }

    async fn handle_op(&self, op: Op) -> Result<(), WeftError> {
        match op {
            Op::SubmitWorkflow {
                sub_id,
                definition,
                input,
            } => {
                let workflow_id = self.submit_workflow(definition, input).await?;
                self.events.emit(Event::WorkflowSubmitted { sub_id, workflow_id });
            }
            Op::RegisterAgent {
                sub_id,
                name,
                capabilities,
            } => {
                let agent_id = self.register_agent(name, capabilities).await?;
                self.events.emit(Event::AgentRegistered { sub_id, agent_id });
            }
            Op::DeregisterAgent { agent_id, .. } => self.deregister_agent(agent_id).await?,
            Op::ReportTaskResult { report, .. } => {
                self.report_task_result(&report).await?;
            }
            Op::CancelWorkflow {
                workflow_id, reason, ..
            } => {
                let reason = reason.unwrap_or_else(|| "cancelled by request".to_string());
                self.cancel_workflow(workflow_id, &reason).await?;
            }
        }
        Ok(())
    }

    /// Record a new agent. It becomes eligible for work once its mailbox is
    /// connected, either by [`connect_agent`](Self::connect_agent) or by
    /// spawning an in-process worker.
    pub async fn register_agent(&self, name: impl Into<String>, capabilities: Vec<String>) -> Result<AgentId, WeftError> {
        let agent = AgentState::new(name, capabilities);
        self.state().create(&agent_key(&agent.id), &agent).await?;
        self.events.agent_status(agent.id, agent.status, None);
        info!(agent_id = %agent.id, name = %agent.name, capabilities = ?agent.capabilities, "agent registered");
        Ok(agent.id)
    }

    /// Open the mailbox of an externally hosted agent and mark it idle.
    pub async fn connect_agent(&self, agent_id: AgentId) -> Result<Subscription, WeftError> {
        self.dispatcher
            .update_agent(agent_id, |a| {
                if a.status != AgentStatus::Offline {
                    return false;
                }
                a.status = AgentStatus::Idle;
                a.current_task = None;
                true
            })
            .await?;
        Ok(self.bus().subscribe(agent_address(&agent_id)))
    }

    /// Register an agent and run it in-process with `handler`.
    pub async fn spawn_agent(
        &self,
        name: impl Into<String>,
        capabilities: Vec<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<AgentId, WeftError> {
        let agent_id = self.register_agent(name, capabilities.clone()).await?;
        let handle = AgentWorker::new(self.dispatcher.clone(), agent_id, capabilities, handler).spawn();
        self.workers.write().insert(agent_id, handle);
        Ok(agent_id)
    }

    /// Mark an agent offline and disconnect it. A task it was running times
    /// out and is retried elsewhere.
    pub async fn deregister_agent(&self, agent_id: AgentId) -> Result<(), WeftError> {
        let worker = self.workers.write().remove(&agent_id);
        if let Some(worker) = worker {
            worker.stop().await;
        }
        self.bus().unsubscribe(&agent_address(&agent_id));
        self.dispatcher
            .update_agent(agent_id, |a| {
                a.status = AgentStatus::Offline;
                a.current_task = None;
                true
            })
            .await?;
        info!(agent_id = %agent_id, "agent deregistered");
        Ok(())
    }

    /// Validate, persist and start a workflow.
    #[instrument(skip_all, fields(name = %definition.name, topology = %definition.topology))]
    pub async fn submit_workflow(&self, definition: WorkflowDefinition, input: Value) -> Result<WorkflowId, WeftError> {
        definition.validate()?;
        let workflow = WorkflowState::new(definition, input);
        let workflow_id = workflow.id;
        self.state().create(&workflow_key(&workflow_id), &workflow).await?;
        self.events.workflow_status(workflow_id, workflow.status, None);

        let handle = spawn_supervisor(self.dispatcher.clone(), workflow_id);
        let mut supervisors = self.supervisors.write();
        supervisors.retain(|_, h| !h.is_finished());
        supervisors.insert(workflow_id, handle);
        info!(workflow_id = %workflow_id, "workflow submitted");
        Ok(workflow_id)
    }

    /// Apply a task result from an externally hosted agent.
    pub async fn report_task_result(&self, report: &TaskReport) -> Result<ReportDisposition, WeftError> {
        self.dispatcher.record_report(report).await
    }

    /// Ask a workflow and everything it delegated to stop.
    ///
    /// Live supervisors are asked over the bus; workflows nobody is driving
    /// are cancelled here directly.
    pub async fn cancel_workflow(&self, workflow_id: WorkflowId, reason: &str) -> Result<(), WeftError> {
        let workflows = self.list_workflows().await?;
        let hierarchy = WorkflowHierarchy::from_workflows(workflows.iter());
        if !hierarchy.contains(&workflow_id) {
            return Err(WeftError::NotFound(workflow_key(&workflow_id)));
        }

        let mut targets = vec![workflow_id];
        targets.extend(hierarchy.descendants(&workflow_id));
        for id in targets {
            let Some(workflow) = workflows.iter().find(|w| w.id == id) else {
                continue;
            };
            if workflow.is_terminal() {
                continue;
            }

            let message = Message::direct(
                SENDER,
                supervisor_address(&id),
                MessagePayload::CancelWorkflow {
                    workflow_id: id,
                    reason: reason.to_string(),
                },
            )
            .with_priority(MessagePriority::Urgent);
            match self.bus().send(message) {
                Ok(_) => info!(workflow_id = %id, %reason, "cancellation requested"),
                Err(e) => {
                    debug!(workflow_id = %id, error = %e, "no live supervisor, cancelling directly");
                    self.adopt_cancel(id, reason).await?;
                }
            }
        }
        Ok(())
    }

    async fn adopt_cancel(&self, workflow_id: WorkflowId, reason: &str) -> Result<(), WeftError> {
        for task in self.workflow_tasks(workflow_id).await? {
            if !task.is_terminal() {
                self.dispatcher.cancel_task(task.id, reason).await?;
            }
        }

        let key = workflow_key(&workflow_id);
        let updated = retry_on_conflict(|| {
            self.state().update::<WorkflowState, _>(&key, |w| {
                if w.is_terminal() {
                    return Ok(false);
                }
                w.details.insert("cancel_reason".into(), Value::String(reason.to_string()));
                w.set_status(WorkflowStatus::Cancelled)?;
                Ok(true)
            })
        })
        .await?;
        if updated.written {
            self.events
                .workflow_status(workflow_id, WorkflowStatus::Cancelled, None);
            info!(workflow_id = %workflow_id, %reason, "workflow cancelled");
        }
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowState, WeftError> {
        Ok(self.state().load(&workflow_key(&workflow_id)).await?.value)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowState>, WeftError> {
        Ok(self
            .state()
            .list::<WorkflowState>(WORKFLOW_PREFIX)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub async fn get_agent(&self, agent_id: AgentId) -> Result<AgentState, WeftError> {
        Ok(self.state().load(&agent_key(&agent_id)).await?.value)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentState>, WeftError> {
        Ok(self
            .state()
            .list::<AgentState>(AGENT_PREFIX)
            .await?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, WeftError> {
        Ok(self.state().load(&task_key(&task_id)).await?.value)
    }

    /// Every task created for `workflow_id`, fork children included.
    pub async fn workflow_tasks(&self, workflow_id: WorkflowId) -> Result<Vec<Task>, WeftError> {
        let mut tasks: Vec<Task> = self
            .state()
            .list::<Task>(TASK_PREFIX)
            .await?
            .into_iter()
            .map(|v| v.value)
            .filter(|t| t.workflow_id == workflow_id)
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    pub async fn workflow_tree(&self, workflow_id: WorkflowId) -> Result<WorkflowTree, WeftError> {
        let workflows = self.list_workflows().await?;
        WorkflowHierarchy::from_workflows(workflows.iter())
            .to_tree(&workflow_id)
            .ok_or_else(|| WeftError::NotFound(workflow_key(&workflow_id)))
    }

    /// Suspend until the workflow is terminal.
    pub async fn wait_for_workflow(&self, workflow_id: WorkflowId) -> Result<WorkflowState, WeftError> {
        self.dispatcher
            .await_workflow(workflow_id, &CancelSignal::never())
            .await
    }

    pub async fn health_report(&self) -> Result<HealthReport, WeftError> {
        let agents = self.list_agents().await?;
        let tasks = self.state().list::<Task>(TASK_PREFIX).await?;
        let workflows = self.list_workflows().await?;

        let mut agents_by_status = BTreeMap::new();
        for agent in &agents {
            *agents_by_status.entry(agent.status.as_str().to_string()).or_insert(0) += 1;
        }

        let summaries = agents
            .into_iter()
            .map(|a| AgentSummary {
                connected: self.bus().is_registered(&agent_address(&a.id)),
                id: a.id,
                name: a.name,
                status: a.status,
                capabilities: a.capabilities,
                current_task: a.current_task,
            })
            .collect();

        Ok(HealthReport {
            backend: self.state().backend(),
            degraded: self.state().is_degraded(),
            agents_by_status,
            queued_tasks: tasks
                .iter()
                .filter(|t| t.value.status == TaskStatus::Pending && t.value.assigned_agent.is_none())
                .count(),
            active_workflows: workflows.iter().filter(|w| !w.is_terminal()).count(),
            agents: summaries,
            bus: self.bus().stats(),
        })
    }

    /// Resume workflows left unfinished by a previous process.
    ///
    /// Tasks that were in flight are failed with "orchestrator restarted";
    /// top-level workflows get a new supervisor that re-dispatches their
    /// current step, while child workflows are failed so their parent
    /// re-delegates. Agents without a live mailbox are marked offline.
    /// Refuses to run on a degraded store.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<WorkflowId>, WeftError> {
        self.state().ensure_durable()?;
        const RESTARTED: &str = "orchestrator restarted";

        for agent in self.list_agents().await? {
            if agent.status != AgentStatus::Offline && !self.bus().is_registered(&agent_address(&agent.id)) {
                self.dispatcher
                    .update_agent(agent.id, |a| {
                        a.status = AgentStatus::Offline;
                        a.current_task = None;
                        true
                    })
                    .await?;
            }
        }

        let live: Vec<WorkflowId> = self
            .supervisors
            .read()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(id, _)| *id)
            .collect();

        let mut resumed = Vec::new();
        for workflow in self.list_workflows().await? {
            if workflow.is_terminal() || live.contains(&workflow.id) {
                continue;
            }

            for task in self.workflow_tasks(workflow.id).await? {
                if !task.is_terminal() {
                    self.dispatcher.fail_task(task.id, RESTARTED).await?;
                }
            }

            if workflow.parent.is_some() {
                let key = workflow_key(&workflow.id);
                retry_on_conflict(|| {
                    self.state().update::<WorkflowState, _>(&key, |w| {
                        if w.is_terminal() {
                            return Ok(false);
                        }
                        w.record_failure(RESTARTED, None, None);
                        w.set_status(WorkflowStatus::Failed)?;
                        Ok(true)
                    })
                })
                .await?;
                continue;
            }

            let handle = spawn_supervisor(self.dispatcher.clone(), workflow.id);
            self.supervisors.write().insert(workflow.id, handle);
            info!(workflow_id = %workflow.id, status = %workflow.status, "resumed workflow");
            resumed.push(workflow.id);
        }

        if !resumed.is_empty() {
            self.events.notify(
                NotificationLevel::Info,
                format!("resumed {} unfinished workflow(s)", resumed.len()),
            );
        }
        Ok(resumed)
    }

    /// Stop in-process workers and abandon running supervisors. Persisted
    /// state is left as is for [`recover`](Self::recover).
    pub async fn shutdown(&self) {
        let workers: Vec<AgentHandle> = self.workers.write().drain().map(|(_, h)| h).collect();
        for worker in workers {
            worker.stop().await;
        }
        for (workflow_id, handle) in self.supervisors.write().drain() {
            if !handle.is_finished() {
                debug!(%workflow_id, "abandoning supervisor");
                handle.abort();
                self.bus().unsubscribe(&supervisor_address(&workflow_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{handler_fn, TaskContext};
    use crate::model::StepDefinition;
    use crate::protocol::TopologyKind;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            task_timeout_ms: 2_000,
            agent_wait_timeout_ms: 1_000,
            ..OrchestratorConfig::default()
        }
    }

    fn linear(capability: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("one-step", TopologyKind::Linear).step(StepDefinition::task("only", capability))
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let (orchestrator, _channel) = Orchestrator::with_channel(config());
        assert_eq!(orchestrator.state().backend(), "memory");
        assert!(orchestrator.list_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_definition() {
        let (orchestrator, _channel) = Orchestrator::with_channel(config());
        let empty = WorkflowDefinition::new("empty", TopologyKind::Linear);
        let err = orchestrator.submit_workflow(empty, Value::Null).await.unwrap_err();
        assert!(matches!(err, WeftError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let (orchestrator, channel) = Orchestrator::with_channel(config());
        let agent_id = orchestrator
            .register_agent("external", vec!["search".into()])
            .await
            .unwrap();
        assert_eq!(orchestrator.get_agent(agent_id).await.unwrap().status, AgentStatus::Idle);
        assert!(matches!(channel.recv().await, Some(Event::AgentStatusChanged { previous: None, .. })));

        assert_ok!(orchestrator.deregister_agent(agent_id).await);
        assert_eq!(orchestrator.get_agent(agent_id).await.unwrap().status, AgentStatus::Offline);

        let _mailbox = orchestrator.connect_agent(agent_id).await.unwrap();
        assert_eq!(orchestrator.get_agent(agent_id).await.unwrap().status, AgentStatus::Idle);
        assert!(orchestrator.bus().is_registered(&agent_address(&agent_id)));
    }

    #[tokio::test]
    async fn test_external_agent_reports_through_orchestrator() {
        let (orchestrator, _channel) = Orchestrator::with_channel(config());
        let agent_id = orchestrator.register_agent("remote", vec!["x".into()]).await.unwrap();
        let mut mailbox = orchestrator.bus().subscribe(agent_address(&agent_id));

        let workflow_id = orchestrator.submit_workflow(linear("x"), json!(41)).await.unwrap();
        let assigned = mailbox.recv().await.unwrap();
        let MessagePayload::AssignTask { task_id, input } = assigned.payload else {
            panic!("expected an assignment");
        };
        assert_eq!(input, json!(41));

        let report = TaskReport::completed(task_id, agent_id, json!(42));
        assert_eq!(
            orchestrator.report_task_result(&report).await.unwrap(),
            ReportDisposition::Accepted
        );

        let done = orchestrator.wait_for_workflow(workflow_id).await.unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.output, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_cancel_unknown_workflow_is_not_found() {
        let (orchestrator, _channel) = Orchestrator::with_channel(config());
        let err = orchestrator.cancel_workflow(WorkflowId::new(), "x").await.unwrap_err();
        assert!(matches!(err, WeftError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_orphaned_workflow_directly() {
        let (orchestrator, _channel) = Orchestrator::with_channel(config());
        // persisted but never picked up by a supervisor
        let workflow = WorkflowState::new(linear("x"), Value::Null);
        orchestrator
            .state()
            .create(&workflow_key(&workflow.id), &workflow)
            .await
            .unwrap();

        orchestrator.cancel_workflow(workflow.id, "operator").await.unwrap();
        let stored = orchestrator.get_workflow(workflow.id).await.unwrap();
        assert_eq!(stored.status, WorkflowStatus::Cancelled);
        assert_eq!(stored.details["cancel_reason"], "operator");
    }

    #[tokio::test]
    async fn test_health_report() {
        let (orchestrator, _channel) = Orchestrator::with_channel(config());
        orchestrator.register_agent("idle", vec!["a".into()]).await.unwrap();
        orchestrator
            .spawn_agent("worker", vec!["b".into()], handler_fn(|ctx: TaskContext| async move { Ok(ctx.input) }))
            .await
            .unwrap();

        let report = orchestrator.health_report().await.unwrap();
        assert!(!report.degraded);
        assert_eq!(report.agents.len(), 2);
        assert_eq!(report.agents_by_status["idle"], 2);
        assert_eq!(report.agents.iter().filter(|a| a.connected).count(), 1);
        assert_eq!(report.queued_tasks, 0);
    }

    #[tokio::test]
    async fn test_op_loop_reports_failures() {
        let (orchestrator, channel) = Orchestrator::with_channel(config());
        let runner = tokio::spawn(orchestrator.run());

        channel
            .send(Op::submit_workflow(WorkflowDefinition::new("bad", TopologyKind::Linear), Value::Null))
            .unwrap();
        loop {
            match channel.recv().await {
                Some(Event::OpFailed { error, .. }) => {
                    assert!(error.contains("no steps"));
                    break;
                }
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }

        drop(channel);
        runner.await.unwrap().unwrap();
    }
}

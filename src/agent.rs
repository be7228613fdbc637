//! Agent worker - executes tasks on behalf of a registered agent
//!
//! A worker owns the agent's bus mailbox. It runs tasks pushed to it by
//! supervisors, claims swarm work announced on the swarm topic, and reports
//! outcomes back through the dispatcher. On startup it also scans for
//! unclaimed swarm work it may have missed, since topics do not replay.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::bus::{agent_address, Message, MessagePayload, Subscription, PRESENCE_TOPIC, SWARM_TOPIC};
use crate::dispatch::{CancelHandle, CancelSignal, Claim, Dispatcher};
use crate::error::WeftError;
use crate::model::{Task, TaskReport};
use crate::protocol::{AgentId, TaskId, WorkflowId};

/// What an agent receives for one task.
#[derive(Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    pub workflow_id: WorkflowId,
    pub step_id: String,
    pub agent_id: AgentId,
    pub input: Value,
    cancel: CancelSignal,
}

impl TaskContext {
    /// Checked by long-running handlers at safe points.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }
}

/// The work an agent does.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

/// Adapter for closures.
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// A running agent
pub struct AgentWorker {
    /// Agent this worker acts for; the record must already be registered.
    pub id: AgentId,
    pub capabilities: Vec<String>,
    handler: Arc<dyn TaskHandler>,
    dispatcher: Dispatcher,
    /// Assignments that arrived while a task was running.
    deferred: Mutex<VecDeque<Message>>,
}

impl AgentWorker {
    pub fn new(dispatcher: Dispatcher, id: AgentId, capabilities: Vec<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            id,
            capabilities,
            handler,
            dispatcher,
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub fn can_handle(&self, capability: &str) -> bool {
        capability.is_empty() || self.capabilities.iter().any(|c| c == capability)
    }

    /// Subscribe to the bus and start the worker loop.
    ///
    /// The mailbox is registered before this returns, so the agent is
    /// immediately eligible for dispatch.
    pub fn spawn(self) -> AgentHandle {
        let bus = self.dispatcher.bus();
        let address = agent_address(&self.id);
        let inbox = bus.subscribe(address.clone());
        let work = bus.subscribe_topic(SWARM_TOPIC, address);

        let stop = CancelHandle::new();
        let worker = Arc::new(self);
        let join = tokio::spawn(worker.clone().run(inbox, work, stop.signal()));
        AgentHandle { worker, stop, join }
    }

    #[instrument(skip_all, fields(agent_id = %self.id))]
    async fn run(self: Arc<Self>, mut inbox: Subscription, mut work: Subscription, mut stop: CancelSignal) {
        info!(capabilities = ?self.capabilities, "agent worker started");
        let announce = Message::topic(
            agent_address(&self.id),
            PRESENCE_TOPIC,
            MessagePayload::AgentAvailable {
                agent_id: self.id,
                capabilities: self.capabilities.clone(),
            },
        );
        let _ = self.dispatcher.bus().send(announce);

        self.drain_unclaimed(&mut inbox, &mut stop).await;

        loop {
            let deferred = self.deferred.lock().pop_front();
            if let Some(msg) = deferred {
                if stop.is_cancelled() {
                    break;
                }
                self.on_direct(msg, &mut inbox, &mut stop).await;
                continue;
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                msg = inbox.recv() => match msg {
                    Some(msg) => self.on_direct(msg, &mut inbox, &mut stop).await,
                    None => break,
                },
                msg = work.recv() => match msg {
                    Some(msg) => self.on_work(msg, &mut inbox, &mut stop).await,
                    None => break,
                },
            }
        }

        self.dispatcher.bus().unsubscribe(&agent_address(&self.id));
        info!("agent worker stopped");
    }

    async fn on_direct(&self, msg: Message, inbox: &mut Subscription, stop: &mut CancelSignal) {
        match msg.payload {
            MessagePayload::AssignTask { task_id, .. } => self.execute(task_id, inbox, stop).await,
            MessagePayload::CancelTask { task_id } => {
                debug!(%task_id, "cancel for a task this agent is not running");
            }
            other => trace!(payload = ?other, "ignoring direct message"),
        }
    }

    async fn on_work(&self, msg: Message, inbox: &mut Subscription, stop: &mut CancelSignal) {
        if let MessagePayload::WorkAvailable { task_id, capability, .. } = msg.payload {
            if !self.can_handle(&capability) {
                return;
            }
            if let Some(task) = self.try_claim(task_id).await {
                self.execute(task.id, inbox, stop).await;
            }
            // lost or done: look for anything else left unclaimed
            self.drain_unclaimed(inbox, stop).await;
        }
    }

    /// Claim and run unclaimed swarm tasks until none are left.
    async fn drain_unclaimed(&self, inbox: &mut Subscription, stop: &mut CancelSignal) {
        while !stop.is_cancelled() {
            let tasks = match self.dispatcher.unclaimed_tasks(&self.capabilities).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(error = %e, "could not scan for unclaimed work");
                    return;
                }
            };

            let mut claimed = None;
            for task in tasks {
                if let Some(task) = self.try_claim(task.id).await {
                    claimed = Some(task);
                    break;
                }
            }
            match claimed {
                Some(task) => self.execute(task.id, inbox, stop).await,
                None => return,
            }
        }
    }

    /// Reserve ourselves, then race for the task. Losing releases the
    /// reservation.
    async fn try_claim(&self, task_id: TaskId) -> Option<Task> {
        match self.dispatcher.claim_agent(self.id, task_id).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!(error = %e, "could not reserve agent");
                return None;
            }
        }

        let claim = self.dispatcher.claim_task(task_id, self.id).await;
        match claim {
            Ok(Claim::Won(task)) => Some(task),
            Ok(Claim::Lost) | Err(_) => {
                if let Err(e) = claim {
                    warn!(%task_id, error = %e, "claim failed");
                }
                self.release(task_id).await;
                None
            }
        }
    }

    async fn release(&self, task_id: TaskId) {
        if let Err(e) = self.dispatcher.release_agent(self.id, task_id, None).await {
            error!(%task_id, error = %e, "failed to release agent");
        }
    }

    /// Run one task to completion, cancellation or worker shutdown.
    #[instrument(skip(self, inbox, stop))]
    async fn execute(&self, task_id: TaskId, inbox: &mut Subscription, stop: &mut CancelSignal) {
        let task = match self.dispatcher.mark_running(task_id, self.id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("assignment no longer valid");
                self.release(task_id).await;
                return;
            }
            Err(e) => {
                error!(error = %e, "could not start task");
                self.release(task_id).await;
                return;
            }
        };

        let cancel = CancelHandle::new();
        let ctx = TaskContext {
            task_id,
            workflow_id: task.workflow_id,
            step_id: task.step_id.clone(),
            agent_id: self.id,
            input: task.input.clone(),
            cancel: cancel.signal(),
        };

        debug!(step = %task.step_id, "executing task");
        let mut work = self.handler.handle(ctx);
        let result = loop {
            tokio::select! {
                result = &mut work => break Some(result),
                _ = stop.cancelled() => {
                    cancel.cancel();
                    break Some(Err(anyhow::anyhow!("agent stopped")));
                }
                msg = inbox.recv() => match msg {
                    Some(msg) => {
                        if msg.payload == (MessagePayload::CancelTask { task_id }) {
                            info!("task cancelled by supervisor");
                            cancel.cancel();
                            break None;
                        }
                        if matches!(msg.payload, MessagePayload::AssignTask { .. }) {
                            debug!(message_id = %msg.id, "busy, deferring assignment");
                            self.deferred.lock().push_back(msg);
                        } else {
                            trace!(payload = ?msg.payload, "ignoring direct message while busy");
                        }
                    }
                    None => {
                        cancel.cancel();
                        break None;
                    }
                },
            }
        };
        drop(work);

        let report = match result {
            Some(Ok(output)) => TaskReport::completed(task_id, self.id, output),
            Some(Err(e)) => TaskReport::failed(task_id, self.id, format!("{e:#}")),
            None => {
                self.release(task_id).await;
                return;
            }
        };
        if let Err(e) = self.report(&report).await {
            error!(error = %e, "failed to record report");
        }
    }

    async fn report(&self, report: &TaskReport) -> Result<(), WeftError> {
        let disposition = self.dispatcher.record_report(report).await?;
        debug!(?disposition, "reported");
        Ok(())
    }
}

/// Handle to a spawned worker
pub struct AgentHandle {
    worker: Arc<AgentWorker>,
    stop: CancelHandle,
    join: JoinHandle<()>,
}

impl AgentHandle {
    pub fn id(&self) -> AgentId {
        self.worker.id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the worker loop and wait for it to exit. A task in progress is
    /// reported as failed.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.join.await {
            error!(agent_id = %self.worker.id, error = %e, "agent worker panicked");
        }
    }
}

impl std::ops::Deref for AgentHandle {
    type Target = AgentWorker;

    fn deref(&self) -> &Self::Target {
        &self.worker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::backoff::BackoffConfig;
    use crate::bus::MessageBus;
    use crate::channel::EventSink;
    use crate::config::OrchestratorConfig;
    use crate::model::AgentState;
    use crate::protocol::{AgentStatus, TaskStatus};
    use crate::state::{agent_key, StateManager};

    fn dispatcher() -> Dispatcher {
        let config = OrchestratorConfig {
            task_timeout_ms: 5_000,
            agent_wait_timeout_ms: 1_000,
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

    async fn register(d: &Dispatcher, caps: &[&str]) -> AgentState {
        let state = AgentState::new("worker", caps.iter().map(|c| c.to_string()).collect());
        d.state().create(&agent_key(&state.id), &state).await.unwrap();
        state
    }

    fn worker(d: &Dispatcher, state: &AgentState, handler: Arc<dyn TaskHandler>) -> AgentHandle {
        AgentWorker::new(d.clone(), state.id, state.capabilities.clone(), handler).spawn()
    }

    async fn wait_for_status(d: &Dispatcher, task_id: TaskId, status: TaskStatus) -> Task {
        for _ in 0..200 {
            let task = d.load_task(task_id).await.unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached {status}");
    }

    #[test]
    fn test_can_handle() {
        let d = dispatcher();
        let w = AgentWorker::new(
            d,
            AgentId::new(),
            vec!["search".into()],
            handler_fn(|_| async { Ok(Value::Null) }),
        );
        assert!(w.can_handle("search"));
        assert!(w.can_handle(""));
        assert!(!w.can_handle("write"));
    }

    #[tokio::test]
    async fn test_worker_runs_assigned_task() {
        let d = dispatcher();
        let state = register(&d, &["upper"]).await;
        let _handle = worker(
            &d,
            &state,
            handler_fn(|ctx: TaskContext| async move {
                let text = ctx.input.as_str().unwrap_or_default().to_uppercase();
                Ok(json!(text))
            }),
        );

        let task = Task::new(WorkflowId::new(), "s", "upper", json!("hello")).with_timeout_ms(2_000);
        d.create_task(&task).await.unwrap();
        let outcome = d.run_task(task.id, &CancelSignal::never()).await.unwrap();

        assert_eq!(
            outcome,
            crate::dispatch::StepOutcome::Completed {
                task_id: task.id,
                output: json!("HELLO")
            }
        );
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_as_failure() {
        let d = dispatcher();
        let state = register(&d, &["x"]).await;
        let _handle = worker(&d, &state, handler_fn(|_| async { anyhow::bail!("model refused") }));

        let task = Task::new(WorkflowId::new(), "s", "x", Value::Null).with_timeout_ms(2_000);
        d.create_task(&task).await.unwrap();
        let outcome = d.run_task(task.id, &CancelSignal::never()).await.unwrap();

        match outcome {
            crate::dispatch::StepOutcome::Failed { reason, .. } => assert!(reason.contains("model refused")),
            other => panic!("unexpected {other:?}"),
        }
        let agent = d.state().load::<AgentState>(&agent_key(&state.id)).await.unwrap().value;
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.metrics["tasks_failed"], json!(1));
    }

    #[tokio::test]
    async fn test_cancel_request_stops_handler_and_releases_agent() {
        let d = dispatcher();
        let state = register(&d, &["slow"]).await;
        let _handle = worker(
            &d,
            &state,
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        );

        let task = Task::new(WorkflowId::new(), "s", "slow", Value::Null).with_timeout_ms(60_000);
        d.create_task(&task).await.unwrap();

        let cancel = CancelHandle::new();
        let runner = {
            let d = d.clone();
            let signal = cancel.signal();
            tokio::spawn(async move { d.run_task(task.id, &signal).await })
        };

        wait_for_status(&d, task.id, TaskStatus::Running).await;
        cancel.cancel();
        runner.await.unwrap().unwrap();

        for _ in 0..200 {
            let agent = d.state().load::<AgentState>(&agent_key(&state.id)).await.unwrap().value;
            if agent.status == AgentStatus::Idle {
                assert!(agent.current_task.is_none());
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent was never released");
    }

    fn sleepy() -> Arc<dyn TaskHandler> {
        handler_fn(|ctx: TaskContext| async move {
            let ms = ctx.input.get("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ctx.input)
        })
    }

    #[tokio::test]
    async fn test_timed_out_agent_is_reused_once_free() {
        let d = dispatcher();
        let state = register(&d, &["x"]).await;
        let _handle = worker(&d, &state, sleepy());

        let slow = Task::new(WorkflowId::new(), "s", "x", json!({"sleep_ms": 600})).with_timeout_ms(100);
        d.create_task(&slow).await.unwrap();
        let outcome = d.run_task(slow.id, &CancelSignal::never()).await.unwrap();
        assert!(matches!(outcome, crate::dispatch::StepOutcome::Failed { ref reason, .. } if reason.contains("timed out")));

        let quick = Task::new(WorkflowId::new(), "s", "x", json!({"n": 2})).with_timeout_ms(1_500);
        d.create_task(&quick).await.unwrap();
        let outcome = d.run_task(quick.id, &CancelSignal::never()).await.unwrap();
        assert_eq!(
            outcome,
            crate::dispatch::StepOutcome::Completed {
                task_id: quick.id,
                output: json!({"n": 2})
            }
        );

        let agent = d.state().load::<AgentState>(&agent_key(&state.id)).await.unwrap().value;
        assert_eq!(agent.metrics["tasks_failed"], json!(1));
        assert_eq!(agent.metrics["tasks_completed"], json!(1));
    }

    #[tokio::test]
    async fn test_assignment_while_busy_is_deferred() {
        let d = dispatcher();
        let state = register(&d, &["x"]).await;
        let _handle = worker(&d, &state, sleepy());

        let first = Task::new(WorkflowId::new(), "s", "x", json!({"sleep_ms": 200})).with_timeout_ms(5_000);
        d.create_task(&first).await.unwrap();
        let runner = {
            let d = d.clone();
            tokio::spawn(async move { d.run_task(first.id, &CancelSignal::never()).await })
        };
        wait_for_status(&d, first.id, TaskStatus::Running).await;

        // pushed straight at the busy agent
        let second = Task::new(WorkflowId::new(), "s", "x", json!("second")).with_timeout_ms(5_000);
        d.create_task(&second).await.unwrap();
        d.state()
            .update::<Task, _>(&crate::state::task_key(&second.id), |t| {
                t.dispatch_to(state.id)?;
                Ok(true)
            })
            .await
            .unwrap();
        let assign = Message::direct(
            "test",
            agent_address(&state.id),
            MessagePayload::AssignTask {
                task_id: second.id,
                input: json!("second"),
            },
        );
        d.bus().send(assign).unwrap();

        runner.await.unwrap().unwrap();
        let done = wait_for_status(&d, second.id, TaskStatus::Completed).await;
        assert_eq!(done.output, Some(json!("second")));
    }

    #[tokio::test]
    async fn test_worker_claims_announced_work() {
        let d = dispatcher();
        let state = register(&d, &["crawl"]).await;
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let _handle = worker(
            &d,
            &state,
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("crawled"))
                }
            }),
        );

        let task = Task::new(WorkflowId::new(), "s", "crawl", Value::Null).claimable();
        d.create_task(&task).await.unwrap();
        d.announce(&task);

        let done = wait_for_status(&d, task.id, TaskStatus::Completed).await;
        assert_eq!(done.assigned_agent, Some(state.id));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_picks_up_work_posted_before_it_started() {
        let d = dispatcher();
        let task = Task::new(WorkflowId::new(), "s", "crawl", Value::Null).claimable();
        d.create_task(&task).await.unwrap();
        // nobody is listening yet
        assert_eq!(d.announce(&task), 0);

        let state = register(&d, &["crawl"]).await;
        let _handle = worker(&d, &state, handler_fn(|_| async { Ok(json!(1)) }));

        wait_for_status(&d, task.id, TaskStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let d = dispatcher();
        let state = register(&d, &["x"]).await;
        let handle = worker(&d, &state, handler_fn(|_| async { Ok(Value::Null) }));
        let address = agent_address(&handle.id());
        assert!(d.bus().is_registered(&address));

        handle.stop().await;
        assert!(!d.bus().is_registered(&address));
    }
}

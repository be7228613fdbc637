//! Persistent records and workflow definitions
//!
//! Everything here is plain data that round-trips through the state store as
//! JSON. Status changes go through the helper methods so the transition rules
//! in [`protocol`](crate::protocol) are enforced in one place.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::WeftError;
use crate::predicate::Predicate;
use crate::protocol::{AgentId, AgentStatus, TaskId, TaskStatus, TopologyKind, WorkflowId, WorkflowStatus};

/// Persisted view of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: AgentId,
    pub name: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_task: Option<TaskId>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub metrics: Map<String, Value>,
}

impl AgentState {
    pub fn new(name: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            capabilities,
            status: AgentStatus::Idle,
            current_task: None,
            last_activity: Utc::now(),
            metrics: Map::new(),
        }
    }

    /// An empty capability matches any agent.
    pub fn has_capability(&self, capability: &str) -> bool {
        capability.is_empty() || self.capabilities.iter().any(|c| c == capability)
    }

    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Bump the completion counters kept in `metrics`.
    pub fn record_outcome(&mut self, success: bool) {
        let key = if success { "tasks_completed" } else { "tasks_failed" };
        let count = self.metrics.get(key).and_then(Value::as_u64).unwrap_or(0);
        self.metrics.insert(key.to_string(), Value::from(count + 1));
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub workflow_id: WorkflowId,
    pub step_id: String,
    pub capability: String,
    pub assigned_agent: Option<AgentId>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    /// Set when the task is handed to an agent.
    pub deadline: Option<DateTime<Utc>>,
    /// Fork parent, for child tasks created by the parallel engine.
    pub parent: Option<TaskId>,
    /// Whether agents may claim this task themselves (swarm).
    #[serde(default)]
    pub claimable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        workflow_id: WorkflowId,
        step_id: impl Into<String>,
        capability: impl Into<String>,
        input: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            workflow_id,
            step_id: step_id.into(),
            capability: capability.into(),
            assigned_agent: None,
            input,
            output: None,
            error: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: 0,
            timeout_ms: 30_000,
            deadline: None,
            parent: None,
            claimable: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn claimable(mut self) -> Self {
        self.claimable = true;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting backwards moves.
    ///
    /// Use [`retry`](Self::retry) for `failed → pending`.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), WeftError> {
        if next == TaskStatus::Pending || !self.status.can_transition_to(next) {
            return Err(WeftError::InvalidTransition {
                entity: format!("task {}", self.id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Hand the task to `agent` and start its timeout clock.
    pub fn dispatch_to(&mut self, agent: AgentId) -> Result<(), WeftError> {
        self.transition(TaskStatus::Dispatched)?;
        self.assigned_agent = Some(agent);
        self.deadline = Some(Utc::now() + Duration::milliseconds(self.timeout_ms as i64));
        Ok(())
    }

    pub fn complete(&mut self, output: Value) -> Result<(), WeftError> {
        self.transition(TaskStatus::Completed)?;
        self.output = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), WeftError> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), WeftError> {
        self.transition(TaskStatus::Cancelled)?;
        self.error = Some(reason.into());
        Ok(())
    }

    pub fn can_retry(&self) -> bool {
        self.status == TaskStatus::Failed && self.retry_count < self.max_retries
    }

    /// `failed → pending`, clearing the previous assignment.
    pub fn retry(&mut self) -> Result<(), WeftError> {
        if !self.can_retry() {
            return Err(WeftError::InvalidTransition {
                entity: format!("task {} (retry {}/{})", self.id, self.retry_count, self.max_retries),
                from: self.status.to_string(),
                to: TaskStatus::Pending.to_string(),
            });
        }
        self.status = TaskStatus::Pending;
        self.retry_count += 1;
        self.assigned_agent = None;
        self.deadline = None;
        self.error = None;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, TaskStatus::Dispatched | TaskStatus::Running)
            && self.deadline.is_some_and(|d| d <= now)
    }
}

/// How an agent finished a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }
}

/// Completion report sent by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn completed(task_id: TaskId, agent_id: AgentId, output: Value) -> Self {
        Self {
            task_id,
            agent_id,
            outcome: TaskOutcome::Completed(output),
        }
    }

    pub fn failed(task_id: TaskId, agent_id: AgentId, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            agent_id,
            outcome: TaskOutcome::Failed(reason.into()),
        }
    }
}

/// Join policy for a fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPolicy {
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default = "default_min_successes")]
    pub min_successes: usize,
}

fn default_min_successes() -> usize {
    1
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            fail_fast: false,
            min_successes: 1,
        }
    }
}

impl JoinPolicy {
    pub fn fail_fast() -> Self {
        Self {
            fail_fast: true,
            min_successes: 1,
        }
    }

    pub fn tolerate(min_successes: usize) -> Self {
        Self {
            fail_fast: false,
            min_successes,
        }
    }

    /// Successes needed for the parent to complete; never below one.
    pub fn required(&self) -> usize {
        self.min_successes.max(1)
    }
}

/// One branch of a fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub capability: String,
    #[serde(default)]
    pub input: Value,
}

impl BranchSpec {
    pub fn new(capability: impl Into<String>, input: Value) -> Self {
        Self {
            capability: capability.into(),
            input,
        }
    }
}

/// What a step does when it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Dispatch one task to an agent with `capability`.
    Task {
        capability: String,
        /// Fixed input; when absent the previous step's output is used.
        #[serde(default)]
        input: Option<Value>,
    },
    /// Fork `branches` and join them under `join`.
    Parallel {
        branches: Vec<BranchSpec>,
        #[serde(default)]
        join: JoinPolicy,
    },
    /// Delegate to a child workflow.
    SubWorkflow { definition: Box<WorkflowDefinition> },
}

/// A guarded edge out of a conditional step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub when: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Explicit successor.
    #[serde(default)]
    pub next: Option<String>,
    /// Conditional edges, evaluated in order; first match wins.
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Taken when every route evaluates to false.
    #[serde(default)]
    pub otherwise: Option<String>,
    /// Taken when no route matches, including unknown evaluations.
    #[serde(default)]
    pub fallback: Option<String>,
}

impl StepDefinition {
    pub fn task(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            StepKind::Task {
                capability: capability.into(),
                input: None,
            },
        )
    }

    pub fn parallel(id: impl Into<String>, branches: Vec<BranchSpec>, join: JoinPolicy) -> Self {
        Self::with_kind(id, StepKind::Parallel { branches, join })
    }

    pub fn sub_workflow(id: impl Into<String>, definition: WorkflowDefinition) -> Self {
        Self::with_kind(
            id,
            StepKind::SubWorkflow {
                definition: Box::new(definition),
            },
        )
    }

    fn with_kind(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            next: None,
            routes: Vec::new(),
            otherwise: None,
            fallback: None,
        }
    }

    pub fn with_input(mut self, value: Value) -> Self {
        if let StepKind::Task { input, .. } = &mut self.kind {
            *input = Some(value);
        }
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn route(mut self, when: impl Into<String>, to: impl Into<String>) -> Self {
        self.routes.push(Route {
            when: when.into(),
            to: to.into(),
        });
        self
    }

    pub fn otherwise(mut self, to: impl Into<String>) -> Self {
        self.otherwise = Some(to.into());
        self
    }

    pub fn fallback(mut self, to: impl Into<String>) -> Self {
        self.fallback = Some(to.into());
        self
    }

    fn targets(&self) -> impl Iterator<Item = &str> {
        self.next
            .iter()
            .chain(self.otherwise.iter())
            .chain(self.fallback.iter())
            .map(String::as_str)
            .chain(self.routes.iter().map(|r| r.to.as_str()))
    }
}

/// A submitted workflow's shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub topology: TopologyKind,
    pub steps: Vec<StepDefinition>,
    /// Overrides the orchestrator's default retry limit.
    #[serde(default)]
    pub retry_limit: Option<u32>,
    /// Overrides the orchestrator's default task timeout.
    #[serde(default)]
    pub task_timeout_ms: Option<u64>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, topology: TopologyKind) -> Self {
        Self {
            name: name.into(),
            topology,
            steps: Vec::new(),
            retry_limit: None,
            task_timeout_ms: None,
        }
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn with_task_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.task_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn get_step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn entry(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    /// The step that follows `id` in declaration order.
    pub fn following(&self, id: &str) -> Option<&StepDefinition> {
        let pos = self.steps.iter().position(|s| s.id == id)?;
        self.steps.get(pos + 1)
    }

    /// Reject definitions that could never run to completion.
    pub fn validate(&self) -> Result<(), WeftError> {
        let invalid = |msg: String| Err(WeftError::InvalidWorkflow(format!("{}: {msg}", self.name)));

        if self.steps.is_empty() {
            return invalid("workflow has no steps".into());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.is_empty() {
                return invalid("step id must not be empty".into());
            }
            if !seen.insert(step.id.as_str()) {
                return invalid(format!("duplicate step id '{}'", step.id));
            }
        }

        for step in &self.steps {
            for target in step.targets() {
                if !seen.contains(target) {
                    return invalid(format!("step '{}' points at unknown step '{target}'", step.id));
                }
            }
            for route in &step.routes {
                Predicate::parse(&route.when)?;
            }
            if !step.routes.is_empty() && self.topology != TopologyKind::Conditional {
                return invalid(format!(
                    "step '{}' declares routes but the topology is {}",
                    step.id, self.topology
                ));
            }

            match &step.kind {
                StepKind::Task { .. } => {}
                StepKind::Parallel { branches, join } => {
                    if self.topology == TopologyKind::Swarm {
                        return invalid(format!("swarm step '{}' must be a task", step.id));
                    }
                    if branches.is_empty() {
                        return invalid(format!("parallel step '{}' has no branches", step.id));
                    }
                    if join.required() > branches.len() {
                        return invalid(format!(
                            "parallel step '{}' needs {} successes from {} branches",
                            step.id,
                            join.required(),
                            branches.len()
                        ));
                    }
                }
                StepKind::SubWorkflow { definition } => {
                    if self.topology != TopologyKind::Hierarchical {
                        return invalid(format!(
                            "sub-workflow step '{}' requires hierarchical topology",
                            step.id
                        ));
                    }
                    definition.validate()?;
                }
            }
        }

        Ok(())
    }
}

/// Where a child workflow reports back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
}

/// Persisted workflow instance, owned by exactly one supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub definition: WorkflowDefinition,
    pub input: Value,
    pub status: WorkflowStatus,
    /// Steps with outstanding work.
    pub current_steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub step_outputs: BTreeMap<String, Value>,
    /// Most recently finished step; the cursor topology policies advance from.
    #[serde(default)]
    pub last_step: Option<String>,
    pub last_output: Option<Value>,
    pub output: Option<Value>,
    pub tasks: Vec<TaskId>,
    pub progress: f64,
    /// Free-form details: failure cause, routing history.
    pub details: Map<String, Value>,
    pub parent: Option<ParentLink>,
    pub children: Vec<WorkflowId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn new(definition: WorkflowDefinition, input: Value) -> Self {
        Self {
            id: WorkflowId::new(),
            definition,
            input,
            status: WorkflowStatus::Created,
            current_steps: Vec::new(),
            completed_steps: Vec::new(),
            step_outputs: BTreeMap::new(),
            last_step: None,
            last_output: None,
            output: None,
            tasks: Vec::new(),
            progress: 0.0,
            details: Map::new(),
            parent: None,
            children: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn topology(&self) -> TopologyKind {
        self.definition.topology
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status change; same-status writes are no-ops.
    pub fn set_status(&mut self, next: WorkflowStatus) -> Result<(), WeftError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(WeftError::InvalidTransition {
                entity: format!("workflow {}", self.id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == WorkflowStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
            self.current_steps.clear();
            if next == WorkflowStatus::Completed {
                self.progress = 1.0;
            }
        }
        self.status = next;
        Ok(())
    }

    /// Progress never decreases.
    pub fn set_progress(&mut self, progress: f64) {
        self.progress = self.progress.max(progress.clamp(0.0, 1.0));
    }

    /// Record a finished step and its output.
    pub fn complete_step(&mut self, step_id: &str, output: Value) {
        self.current_steps.retain(|s| s != step_id);
        if !self.completed_steps.iter().any(|s| s == step_id) {
            self.completed_steps.push(step_id.to_string());
        }
        self.step_outputs.insert(step_id.to_string(), output.clone());
        self.last_step = Some(step_id.to_string());
        self.last_output = Some(output);
        let total = self.definition.steps.len().max(1);
        self.set_progress(self.completed_steps.len() as f64 / total as f64);
    }

    /// Input for `step`: its fixed input, else the previous output, else the
    /// workflow input.
    pub fn input_for(&self, step: &StepDefinition) -> Value {
        if let StepKind::Task { input: Some(fixed), .. } = &step.kind {
            return fixed.clone();
        }
        self.last_output.clone().unwrap_or_else(|| self.input.clone())
    }

    pub fn record_failure(&mut self, reason: &str, step_id: Option<&str>, task_id: Option<TaskId>) {
        self.details.insert("error".into(), Value::String(reason.to_string()));
        if let Some(step) = step_id {
            self.details.insert("failed_step".into(), Value::String(step.to_string()));
        }
        if let Some(task) = task_id {
            self.details.insert("failed_task".into(), Value::String(task.to_string()));
        }
    }

    pub fn routing_history(&self) -> Vec<Value> {
        self.details
            .get("routing_history")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_routing_decision(&mut self, decision: Value) {
        let entry = self
            .details
            .entry("routing_history")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(decision);
        }
    }

    pub fn retry_limit(&self, default: u32) -> u32 {
        self.definition.retry_limit.unwrap_or(default)
    }

    pub fn task_timeout_ms(&self, default: u64) -> u64 {
        self.definition.task_timeout_ms.unwrap_or(default)
    }
}

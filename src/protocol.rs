//! Protocol types shared by every layer: identifiers, status enums, the
//! inbound operations a transport submits and the outbound events it relays.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{TaskReport, WorkflowDefinition};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_id!(
    /// Stable identity of a registered agent.
    AgentId
);
define_id!(
    /// Identity of a unit of work.
    TaskId
);
define_id!(
    /// Identity of a submitted workflow instance.
    WorkflowId
);
define_id!(
    /// Identity of a message on the bus.
    MessageId
);
define_id!(
    /// Correlates an inbound [`Op`] with the events it produces.
    SubmissionId
);

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    /// Reserved for a task that has been dispatched but not started.
    Busy,
    /// Executing a task.
    Running,
    Error,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Running => "running",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a task.
///
/// Statuses only move forward through `pending → dispatched → running →
/// {completed | failed | cancelled}`. The single exception is the retry
/// transition `failed → pending`, which is bounded by the task's retry limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Dispatched => 1,
            Self::Running => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// `failed → pending` is reported as legal here; the retry bound is
    /// enforced by [`Task::retry`](crate::model::Task::retry).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if *self == TaskStatus::Failed && next == TaskStatus::Pending {
            return true;
        }
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a workflow, driven by its supervisor.
///
/// `created → running ⇄ waiting → {completed | failed | cancelled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    /// A dispatched task, fork or child workflow is outstanding.
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Created, Running) => true,
            (Running, Waiting) | (Waiting, Running) => true,
            (Created | Running | Waiting, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of step sequencing for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    Linear,
    Conditional,
    Hierarchical,
    Swarm,
}

impl fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Linear => "linear",
            Self::Conditional => "conditional",
            Self::Hierarchical => "hierarchical",
            Self::Swarm => "swarm",
        };
        f.write_str(s)
    }
}

/// Severity of a system notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Operations submitted to the orchestrator by the transport layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    SubmitWorkflow {
        sub_id: SubmissionId,
        definition: WorkflowDefinition,
        #[serde(default)]
        input: serde_json::Value,
    },
    RegisterAgent {
        sub_id: SubmissionId,
        name: String,
        capabilities: Vec<String>,
    },
    DeregisterAgent {
        sub_id: SubmissionId,
        agent_id: AgentId,
    },
    ReportTaskResult {
        sub_id: SubmissionId,
        report: TaskReport,
    },
    CancelWorkflow {
        sub_id: SubmissionId,
        workflow_id: WorkflowId,
        reason: Option<String>,
    },
}

impl Op {
    pub fn sub_id(&self) -> &SubmissionId {
        match self {
            Op::SubmitWorkflow { sub_id, .. }
            | Op::RegisterAgent { sub_id, .. }
            | Op::DeregisterAgent { sub_id, .. }
            | Op::ReportTaskResult { sub_id, .. }
            | Op::CancelWorkflow { sub_id, .. } => sub_id,
        }
    }

    pub fn submit_workflow(definition: WorkflowDefinition, input: serde_json::Value) -> Self {
        Op::SubmitWorkflow {
            sub_id: SubmissionId::new(),
            definition,
            input,
        }
    }

    pub fn register_agent(name: impl Into<String>, capabilities: Vec<String>) -> Self {
        Op::RegisterAgent {
            sub_id: SubmissionId::new(),
            name: name.into(),
            capabilities,
        }
    }

    pub fn cancel_workflow(workflow_id: WorkflowId, reason: Option<String>) -> Self {
        Op::CancelWorkflow {
            sub_id: SubmissionId::new(),
            workflow_id,
            reason,
        }
    }
}

/// Events emitted by the core for the transport/UI layer to relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    WorkflowSubmitted {
        sub_id: SubmissionId,
        workflow_id: WorkflowId,
    },
    AgentRegistered {
        sub_id: SubmissionId,
        agent_id: AgentId,
    },
    WorkflowStatusChanged {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        previous: Option<WorkflowStatus>,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        workflow_id: WorkflowId,
        step_id: String,
        task_id: Option<TaskId>,
        timestamp: DateTime<Utc>,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
        previous: Option<AgentStatus>,
        timestamp: DateTime<Utc>,
    },
    Notification {
        level: NotificationLevel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// An [`Op`] could not be applied.
    OpFailed {
        sub_id: SubmissionId,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_moves_forward_only() {
        use TaskStatus::*;

        assert!(Pending.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Dispatched.can_transition_to(Failed));

        assert!(!Running.can_transition_to(Dispatched));
        assert!(!Dispatched.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn test_failed_may_return_to_pending() {
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Running));
    }

    #[test]
    fn test_workflow_status_machine() {
        use WorkflowStatus::*;

        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Running));
        assert!(Waiting.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Created.can_transition_to(Waiting));
    }

    #[test]
    fn test_id_roundtrip_through_display() {
        let id = WorkflowId::new();
        let parsed: WorkflowId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::Notification {
            level: NotificationLevel::Warning,
            message: "store degraded".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["level"], "warning");
    }
}

//! # Weft
//!
//! Multi-agent workflow orchestration.
//!
//! A workflow is a set of steps executed by capability-matched agents under
//! a topology (linear, conditional, hierarchical or swarm). Each running
//! workflow has one supervisor; all shared state goes through a versioned
//! store with compare-and-set writes, and agents talk to supervisors and to
//! each other over an in-process message bus.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            ORCHESTRATOR                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐               │
//! │  │  Op loop     │  │Agent registry│  │ Health/Recov │               │
//! │  └──────────────┘  └──────────────┘  └──────────────┘               │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │ one per workflow
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │ Supervisor  │     │ Supervisor  │     │ Supervisor  │
//!   │  (linear)   │     │ (hierarchy) │────▶│   (child)   │
//!   └──────┬──────┘     └──────┬──────┘     └──────┬──────┘
//!          │   dispatch / fork-join / swarm claims │
//!     ┌────┴────┐         ┌────┴────┐         ┌────┴────┐
//!     ▼    ▼    ▼         ▼    ▼    ▼         ▼    ▼    ▼
//!   ┌───┐┌───┐┌───┐     ┌───┐┌───┐┌───┐     ┌───┐┌───┐┌───┐
//!   │A1 ││A2 ││A3 │     │A4 ││A5 ││A6 │     │A7 ││A8 ││A9 │
//!   └───┘└───┘└───┘     └───┘└───┘└───┘     └───┘└───┘└───┘
//!          ▲                                           ▲
//!          └──────── message bus · state store ────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: a worker advertising capabilities; runs one task at a time
//! - **Supervisor**: drives one workflow through its topology
//! - **State store**: versioned records, memory or sled, with change feeds
//! - **Message bus**: direct mailboxes and topics, at-most-once delivery

pub mod agent;
pub mod backoff;
pub mod bus;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hierarchy;
pub mod model;
pub mod orchestrator;
pub mod parallel;
pub mod predicate;
pub mod protocol;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod topology;

pub use agent::{handler_fn, AgentHandle, AgentWorker, TaskContext, TaskHandler};
pub use bus::{Message, MessageBus, MessagePayload, MessagePriority, Subscription};
pub use channel::{ChannelPair, EventSink, WeftChannel};
pub use config::{OrchestratorConfig, StoreConfig};
pub use dispatch::{CancelHandle, CancelSignal, Dispatcher, ReportDisposition, StepOutcome};
pub use error::WeftError;
pub use hierarchy::{WorkflowHierarchy, WorkflowTree};
pub use orchestrator::{HealthReport, Orchestrator};
pub use parallel::{ForkJoin, JoinOutcome};
pub use state::StateManager;

// Re-export commonly used model and protocol types
pub use model::{
    AgentState, BranchSpec, JoinPolicy, StepDefinition, Task, TaskOutcome, TaskReport, WorkflowDefinition,
    WorkflowState,
};
pub use protocol::{
    AgentId, AgentStatus, Event, NotificationLevel, Op, SubmissionId, TaskId, TaskStatus, TopologyKind, WorkflowId,
    WorkflowStatus,
};

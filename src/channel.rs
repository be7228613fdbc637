//! Communication channels between the orchestrator and its transport layer

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};

use crate::protocol::{AgentId, AgentStatus, Event, NotificationLevel, Op, WorkflowId, WorkflowStatus};

/// Channel pair for orchestrator communication
pub struct ChannelPair {
    /// Receiver for operations
    pub op_rx: mpsc::UnboundedReceiver<Op>,
    /// Sender for events
    pub event_tx: mpsc::UnboundedSender<Event>,
}

/// Client-side channel for communicating with the orchestrator
#[derive(Clone)]
pub struct WeftChannel {
    op_tx: mpsc::UnboundedSender<Op>,
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>,
}

impl WeftChannel {
    /// Create a new channel pair
    ///
    /// Returns the client channel and the orchestrator channel pair
    pub fn new() -> (Self, ChannelPair) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let channel = Self {
            op_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
        };

        (channel, ChannelPair { op_rx, event_tx })
    }

    /// Send an operation to the orchestrator
    pub fn send(&self, op: Op) -> Result<(), ChannelError> {
        self.op_tx.send(op).map_err(|_| ChannelError::Closed)
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<Event> {
        self.event_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Wait for the next event
    pub async fn recv(&self) -> Option<Event> {
        self.event_rx.lock().await.recv().await
    }

    /// Check if the channel is closed
    pub fn is_closed(&self) -> bool {
        self.op_tx.is_closed()
    }
}

/// Channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,
}

/// Outbound event emitter shared by the orchestrator, supervisors and agents.
///
/// Sending never fails from the caller's point of view: with no transport
/// attached, events are dropped.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<Event>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink with nobody listening.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn workflow_status(&self, workflow_id: WorkflowId, status: WorkflowStatus, previous: Option<WorkflowStatus>) {
        self.emit(Event::WorkflowStatusChanged {
            workflow_id,
            status,
            previous,
            timestamp: Utc::now(),
        });
    }

    pub fn agent_status(&self, agent_id: AgentId, status: AgentStatus, previous: Option<AgentStatus>) {
        if previous == Some(status) {
            return;
        }
        self.emit(Event::AgentStatusChanged {
            agent_id,
            status,
            previous,
            timestamp: Utc::now(),
        });
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.emit(Event::Notification {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubmissionId;

    #[test]
    fn test_channel_creation() {
        let (channel, _pair) = WeftChannel::new();
        assert!(!channel.is_closed());
    }

    #[test]
    fn test_send_op() {
        let (channel, mut pair) = WeftChannel::new();

        let op = Op::cancel_workflow(WorkflowId::new(), None);
        channel.send(op).unwrap();

        assert!(pair.op_rx.try_recv().is_ok());
    }

    #[test]
    fn test_send_after_orchestrator_gone() {
        let (channel, pair) = WeftChannel::new();
        drop(pair);
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send(Op::cancel_workflow(WorkflowId::new(), None)),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_receive_event() {
        let (channel, pair) = WeftChannel::new();

        pair.event_tx
            .send(Event::OpFailed {
                sub_id: SubmissionId::new(),
                error: "test".to_string(),
            })
            .unwrap();

        assert!(channel.recv().await.is_some());
        assert!(channel.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_event_sink() {
        let (channel, pair) = WeftChannel::new();
        let sink = EventSink::new(pair.event_tx);

        let agent = AgentId::new();
        sink.agent_status(agent, AgentStatus::Busy, Some(AgentStatus::Idle));
        // unchanged status is not an event
        sink.agent_status(agent, AgentStatus::Busy, Some(AgentStatus::Busy));
        sink.notify(NotificationLevel::Info, "hello");

        assert!(matches!(channel.recv().await, Some(Event::AgentStatusChanged { .. })));
        assert!(matches!(channel.recv().await, Some(Event::Notification { .. })));
        assert!(channel.try_recv().is_none());

        EventSink::detached().notify(NotificationLevel::Error, "nobody hears this");
    }
}

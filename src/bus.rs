//! Message bus
//!
//! Point-to-point and topic messaging between agents and supervisors.
//!
//! Delivery is at-most-once. A direct message goes to the mailbox currently
//! registered at its address, or fails with [`BusError::RecipientUnknown`].
//! Topic messages fan out to the subscribers present at send time; nothing is
//! replayed to later subscribers.
//!
//! Priority is honored at the receiving end: a subscription hands out the
//! most urgent message it has queued, but never reorders two messages from
//! the same sender.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::model::TaskReport;
use crate::protocol::{AgentId, MessageId, TaskId, WorkflowId};

/// Topic on which swarm supervisors post claimable work.
pub const SWARM_TOPIC: &str = "swarm";
/// Topic on which agents announce availability.
pub const PRESENCE_TOPIC: &str = "presence";

/// Bus address of a workflow's supervisor.
pub fn supervisor_address(workflow_id: &WorkflowId) -> String {
    format!("supervisor:{workflow_id}")
}

/// Bus address of an agent.
pub fn agent_address(agent_id: &AgentId) -> String {
    agent_id.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no subscriber at '{0}'")]
    RecipientUnknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "address", rename_all = "snake_case")]
pub enum Recipient {
    Direct(String),
    Topic(String),
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Direct(address) => write!(f, "{address}"),
            Recipient::Topic(topic) => write!(f, "#{topic}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// What a message carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    AssignTask {
        task_id: TaskId,
        input: Value,
    },
    /// Request that an agent stop work on a task.
    CancelTask {
        task_id: TaskId,
    },
    /// Request that a supervisor cancel its workflow.
    CancelWorkflow {
        workflow_id: WorkflowId,
        reason: String,
    },
    WorkAvailable {
        workflow_id: WorkflowId,
        task_id: TaskId,
        capability: String,
    },
    AgentAvailable {
        agent_id: AgentId,
        capabilities: Vec<String>,
    },
    Report(TaskReport),
    Data(Value),
}

/// An immutable envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: String,
    pub recipient: Recipient,
    pub payload: MessagePayload,
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<MessageId>,
}

impl Message {
    pub fn direct(sender: impl Into<String>, recipient: impl Into<String>, payload: MessagePayload) -> Self {
        Self::build(sender.into(), Recipient::Direct(recipient.into()), payload)
    }

    pub fn topic(sender: impl Into<String>, topic: impl Into<String>, payload: MessagePayload) -> Self {
        Self::build(sender.into(), Recipient::Topic(topic.into()), payload)
    }

    fn build(sender: String, recipient: Recipient, payload: MessagePayload) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            recipient,
            payload,
            priority: MessagePriority::Normal,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: MessageId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// A direct reply to this message's sender, in the same conversation.
    pub fn reply(&self, sender: impl Into<String>, payload: MessagePayload) -> Self {
        Message::direct(sender, self.sender.clone(), payload)
            .with_priority(self.priority)
            .with_correlation(self.correlation_id.unwrap_or(self.id))
    }
}

/// Snapshot of bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub sent: u64,
    pub delivered: u64,
    pub undeliverable: u64,
    pub broadcasts: u64,
    pub mailboxes: usize,
    pub topic_subscribers: usize,
}

/// Result of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Number of topic subscribers that received a copy; may be zero.
    Broadcast { recipients: usize },
}

struct TopicSubscriber {
    owner: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    undeliverable: AtomicU64,
    broadcasts: AtomicU64,
}

#[derive(Default)]
struct BusInner {
    mailboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>,
    topics: RwLock<HashMap<String, Vec<TopicSubscriber>>>,
    counters: Counters,
}

/// Receiving end of a mailbox or topic subscription.
///
/// Among the messages already queued, the highest priority is received
/// first. Messages from the same sender keep their send order whatever
/// their priority.
pub struct Subscription {
    address: String,
    rx: mpsc::UnboundedReceiver<Message>,
    pending: VecDeque<Message>,
}

impl Subscription {
    fn new(address: String, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            address,
            rx,
            pending: VecDeque::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn recv(&mut self) -> Option<Message> {
        if self.pending.is_empty() {
            let first = self.rx.recv().await?;
            self.pending.push_back(first);
        }
        self.drain();
        self.pop_next()
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.drain();
        self.pop_next()
    }

    pub fn into_stream(self) -> impl Stream<Item = Message> {
        stream::unfold(self, |mut sub| async move { sub.recv().await.map(|m| (m, sub)) })
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            self.pending.push_back(msg);
        }
    }

    /// Only the oldest pending message of each sender is eligible.
    fn pop_next(&mut self) -> Option<Message> {
        let mut seen = HashSet::new();
        let mut best: Option<(usize, MessagePriority)> = None;
        for (i, msg) in self.pending.iter().enumerate() {
            if !seen.insert(msg.sender.as_str()) {
                continue;
            }
            if best.map_or(true, |(_, priority)| msg.priority > priority) {
                best = Some((i, msg.priority));
            }
        }
        let (index, priority) = best?;
        if index > 0 {
            trace!(address = %self.address, ?priority, "delivering ahead of queued messages");
        }
        self.pending.remove(index)
    }
}

/// Shared message bus handle.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox at `address`, replacing any previous one.
    ///
    /// Calling this again after a reconnect restarts delivery; messages sent
    /// in between are lost.
    pub fn subscribe(&self, address: impl Into<String>) -> Subscription {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.mailboxes.write().insert(address.clone(), tx).is_some() {
            debug!(%address, "replaced existing mailbox");
        }
        Subscription::new(address, rx)
    }

    /// Join `topic` on behalf of `owner`. A subscriber does not receive its
    /// own broadcasts.
    pub fn subscribe_topic(&self, topic: impl Into<String>, owner: impl Into<String>) -> Subscription {
        let topic = topic.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topics
            .write()
            .entry(topic.clone())
            .or_default()
            .push(TopicSubscriber { owner: owner.into(), tx });
        Subscription::new(topic, rx)
    }

    pub fn unsubscribe(&self, address: &str) {
        self.inner.mailboxes.write().remove(address);
    }

    pub fn is_registered(&self, address: &str) -> bool {
        self.inner
            .mailboxes
            .read()
            .get(address)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn send(&self, message: Message) -> Result<Delivery, BusError> {
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        match message.recipient.clone() {
            Recipient::Direct(address) => self.deliver(&address, message),
            Recipient::Topic(topic) => Ok(self.broadcast(&topic, message)),
        }
    }

    fn deliver(&self, address: &str, message: Message) -> Result<Delivery, BusError> {
        let tx = self.inner.mailboxes.read().get(address).cloned();
        let Some(tx) = tx else {
            return Err(self.undeliverable(address, &message));
        };

        if tx.send(message.clone()).is_err() {
            // receiver dropped without unsubscribing
            let mut mailboxes = self.inner.mailboxes.write();
            if mailboxes.get(address).is_some_and(|current| current.same_channel(&tx)) {
                mailboxes.remove(address);
            }
            drop(mailboxes);
            return Err(self.undeliverable(address, &message));
        }

        trace!(message_id = %message.id, %address, "delivered");
        self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(Delivery::Delivered)
    }

    fn broadcast(&self, topic: &str, message: Message) -> Delivery {
        self.inner.counters.broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.inner.topics.write();
        let Some(subscribers) = topics.get_mut(topic) else {
            debug!(%topic, message_id = %message.id, "broadcast with no subscribers");
            return Delivery::Broadcast { recipients: 0 };
        };

        subscribers.retain(|s| !s.tx.is_closed());
        let mut recipients = 0;
        for subscriber in subscribers.iter().filter(|s| s.owner != message.sender) {
            if subscriber.tx.send(message.clone()).is_ok() {
                recipients += 1;
            }
        }
        self.inner
            .counters
            .delivered
            .fetch_add(recipients as u64, Ordering::Relaxed);
        Delivery::Broadcast { recipients }
    }

    fn undeliverable(&self, address: &str, message: &Message) -> BusError {
        self.inner.counters.undeliverable.fetch_add(1, Ordering::Relaxed);
        warn!(%address, message_id = %message.id, sender = %message.sender, "message undeliverable");
        BusError::RecipientUnknown(address.to_string())
    }

    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            sent: counters.sent.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            undeliverable: counters.undeliverable.load(Ordering::Relaxed),
            broadcasts: counters.broadcasts.load(Ordering::Relaxed),
            mailboxes: self.inner.mailboxes.read().len(),
            topic_subscribers: self.inner.topics.read().values().map(Vec::len).sum(),
        }
    }
}

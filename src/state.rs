//! State manager
//!
//! Typed, versioned access to agent, task and workflow records on top of a
//! [`ResilientStore`], plus change notification. Every successful write is
//! published to subscribers whose key pattern matches; a subscriber that falls
//! behind loses the oldest notifications and is expected to re-read.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, instrument, warn};

use crate::error::WeftError;
use crate::protocol::{AgentId, TaskId, WorkflowId};
use crate::store::{ResilientStore, StateStore, VersionedValue};

pub const AGENT_PREFIX: &str = "agent:";
pub const TASK_PREFIX: &str = "task:";
pub const WORKFLOW_PREFIX: &str = "workflow:";

pub fn agent_key(id: &AgentId) -> String {
    format!("{AGENT_PREFIX}{id}")
}

pub fn task_key(id: &TaskId) -> String {
    format!("{TASK_PREFIX}{id}")
}

pub fn workflow_key(id: &WorkflowId) -> String {
    format!("{WORKFLOW_PREFIX}{id}")
}

/// A decoded record and the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Result of [`StateManager::update`].
#[derive(Debug, Clone)]
pub struct Updated<T> {
    pub value: T,
    pub version: u64,
    /// False when the closure declined to write.
    pub written: bool,
}

/// Notification of a committed write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    pub version: u64,
    pub value: Value,
    pub timestamp: DateTime<Utc>,
}

/// Key filter for subscriptions: exact key, `prefix*`, or `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern(String);

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn matches(&self, key: &str) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => self.0 == key,
        }
    }
}

/// Stream of changes for one pattern.
pub struct ChangeStream {
    pattern: KeyPattern,
    rx: broadcast::Receiver<ChangeEvent>,
    source: broadcast::Sender<ChangeEvent>,
}

impl ChangeStream {
    /// Next matching change. `None` once the manager is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.pattern.matches(&event.key) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(pattern = %self.pattern.0, skipped, "change subscriber lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drop anything buffered and continue from the current write position.
    pub fn resubscribe(&mut self) {
        self.rx = self.source.subscribe();
    }

    pub fn into_stream(self) -> impl Stream<Item = ChangeEvent> {
        stream::unfold(self, |mut changes| async move {
            changes.next().await.map(|event| (event, changes))
        })
    }
}

/// Shared handle to persisted orchestration state.
#[derive(Clone)]
pub struct StateManager {
    store: Arc<ResilientStore>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl StateManager {
    pub fn new(store: ResilientStore, change_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(change_capacity.max(1));
        Self {
            store: Arc::new(store),
            changes,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(ResilientStore::memory_only(), 1024)
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn is_degraded(&self) -> bool {
        self.store.is_degraded()
    }

    pub fn degraded_signal(&self) -> watch::Receiver<Option<String>> {
        self.store.degraded_signal()
    }

    /// Fail with [`WeftError::DegradedMode`] if the durable backend is gone.
    pub fn ensure_durable(&self) -> Result<(), WeftError> {
        match self.store.degraded_reason() {
            Some(reason) if self.store.is_degraded() => Err(WeftError::DegradedMode(reason)),
            _ => Ok(()),
        }
    }

    pub async fn try_get(&self, key: &str) -> Result<Option<VersionedValue>, WeftError> {
        Ok(self.store.get(key).await?)
    }

    pub async fn get(&self, key: &str) -> Result<VersionedValue, WeftError> {
        self.try_get(key)
            .await?
            .ok_or_else(|| WeftError::NotFound(key.to_string()))
    }

    /// Versioned write. Never retried here; a conflict is returned to the
    /// caller, who must re-read before trying again.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn put(&self, key: &str, value: Value, expected_version: u64) -> Result<u64, WeftError> {
        let version = self.store.put(key, value.clone(), expected_version).await?;
        let event = ChangeEvent {
            key: key.to_string(),
            version,
            value,
            timestamp: Utc::now(),
        };
        // no subscribers is fine
        let _ = self.changes.send(event);
        Ok(version)
    }

    /// Delete a record, for external purging of terminal records.
    pub async fn purge(&self, key: &str, expected_version: u64) -> Result<(), WeftError> {
        self.store.remove(key, expected_version).await?;
        debug!(key, "purged record");
        Ok(())
    }

    pub fn subscribe(&self, pattern: impl Into<String>) -> ChangeStream {
        ChangeStream {
            pattern: KeyPattern::new(pattern),
            rx: self.changes.subscribe(),
            source: self.changes.clone(),
        }
    }

    pub async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Versioned<T>, WeftError> {
        let record = self.get(key).await?;
        Ok(Versioned {
            value: serde_json::from_value(record.value)?,
            version: record.version,
        })
    }

    pub async fn save<T: Serialize>(&self, key: &str, value: &T, expected_version: u64) -> Result<u64, WeftError> {
        self.put(key, serde_json::to_value(value)?, expected_version).await
    }

    /// Write a record that must not exist yet.
    pub async fn create<T: Serialize>(&self, key: &str, value: &T) -> Result<u64, WeftError> {
        self.save(key, value, 0).await
    }

    /// Read, let `f` mutate, write back at the read version.
    ///
    /// `f` returns whether to write; returning `false` leaves the record
    /// untouched. Single attempt: a concurrent writer produces
    /// [`WeftError::VersionConflict`].
    pub async fn update<T, F>(&self, key: &str, f: F) -> Result<Updated<T>, WeftError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> Result<bool, WeftError>,
    {
        let Versioned { mut value, version } = self.load::<T>(key).await?;
        if !f(&mut value)? {
            return Ok(Updated {
                value,
                version,
                written: false,
            });
        }
        let version = self.save(key, &value, version).await?;
        Ok(Updated {
            value,
            version,
            written: true,
        })
    }

    /// Every record under `prefix`, decoded.
    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<Versioned<T>>, WeftError> {
        let records = self.store.scan(prefix).await?;
        let mut out = Vec::with_capacity(records.len());
        for (key, record) in records {
            match serde_json::from_value(record.value) {
                Ok(value) => out.push(Versioned {
                    value,
                    version: record.version,
                }),
                Err(e) => warn!(%key, error = %e, "skipping undecodable record"),
            }
        }
        Ok(out)
    }
}

/// Run `op` once more if it fails with a version conflict.
///
/// For routine dispatch races only; `op` must re-read what it writes.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, WeftError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, WeftError>>,
{
    match op().await {
        Err(e) if e.is_conflict() => {
            debug!(error = %e, "version conflict, retrying once");
            op().await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[test]
    fn test_key_pattern() {
        assert!(KeyPattern::new("*").matches("task:1"));
        assert!(KeyPattern::new("task:*").matches("task:1"));
        assert!(!KeyPattern::new("task:*").matches("agent:1"));
        assert!(KeyPattern::new("task:1").matches("task:1"));
        assert!(!KeyPattern::new("task:1").matches("task:12"));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let state = StateManager::in_memory();
        assert!(matches!(state.get("task:x").await, Err(WeftError::NotFound(_))));
        assert!(state.try_get("task:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_publishes_change() {
        let state = StateManager::in_memory();
        let mut changes = state.subscribe("task:*");

        state.put("agent:a", json!(0), 0).await.unwrap();
        state.put("task:a", json!({"n": 1}), 0).await.unwrap();

        let event = changes.next().await.unwrap();
        assert_eq!(event.key, "task:a");
        assert_eq!(event.version, 1);
    }

    #[tokio::test]
    async fn test_conflicting_writers_exactly_one_wins() {
        let state = StateManager::in_memory();
        state.put("task:t", json!({"owner": null}), 0).await.unwrap();

        let a = state.clone();
        let b = state.clone();
        let (ra, rb) = tokio::join!(
            a.put("task:t", json!({"owner": "a"}), 1),
            b.put("task:t", json!({"owner": "b"}), 1),
        );

        assert!(ra.is_ok() ^ rb.is_ok());
        let loser = if ra.is_err() { ra } else { rb };
        assert!(matches!(loser, Err(WeftError::VersionConflict { .. })));
        assert_eq!(state.get("task:t").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_update_skips_write_when_declined() {
        let state = StateManager::in_memory();
        state.create("agent:a", &json!({"status": "idle"})).await.unwrap();

        let updated = state
            .update::<Value, _>("agent:a", |_| Ok(false))
            .await
            .unwrap();
        assert!(!updated.written);
        assert_eq!(updated.version, 1);

        let updated = state
            .update::<Value, _>("agent:a", |v| {
                v["status"] = json!("busy");
                Ok(true)
            })
            .await
            .unwrap();
        assert!(updated.written);
        assert_eq!(updated.version, 2);
        assert_eq!(state.get("agent:a").await.unwrap().value["status"], "busy");
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let state = StateManager::in_memory();
        assert_ok!(state.create("agent:a", &json!(1)).await);
        assert_ok!(state.create("agent:b", &json!(2)).await);
        assert_ok!(state.create("task:c", &json!(3)).await);

        let agents = state.list::<Value>(AGENT_PREFIX).await.unwrap();
        assert_eq!(agents.len(), 2);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_runs_twice_at_most() {
        let state = StateManager::in_memory();
        state.create("k", &json!(0)).await.unwrap();

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry_on_conflict(|| {
            let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let state = state.clone();
            async move {
                // first attempt uses a stale version
                let expected = if n == 0 { 0 } else { 1 };
                state.put("k", json!(n), expected).await
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_keeps_receiving() {
        let state = StateManager::new(ResilientStore::memory_only(), 2);
        let mut changes = state.subscribe("*");

        for i in 0..5u64 {
            state.put(&format!("task:{i}"), json!(i), 0).await.unwrap();
        }

        let event = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap();
        // oldest notifications were dropped
        assert_ne!(event.key, "task:0");
    }

    #[tokio::test]
    async fn test_change_stream_adapter() {
        use futures::StreamExt;

        let state = StateManager::in_memory();
        let stream = state.subscribe("workflow:*").into_stream();
        tokio::pin!(stream);

        state.put("workflow:w", json!({"status": "running"}), 0).await.unwrap();
        let event = stream.next().await.unwrap();
        assert_eq!(event.value["status"], "running");
    }
}

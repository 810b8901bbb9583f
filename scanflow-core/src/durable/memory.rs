//! In-process backend for the durable substrate.
//!
//! Backs tests and single-process deployments. Every trait contract matches
//! the Postgres backend, including the conditional event append, idempotent
//! signal delivery and global queue ceilings, so workflows behave the same
//! against either.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};
use tokio::sync::{Mutex, Notify};

use crate::error::{Result, ScanflowError};

use super::{
    config::QueueConfig,
    events::{EventLog, WorkflowEvent},
    record::{InsertOutcome, NewWorkflow, WorkflowId, WorkflowRecord, WorkflowStatus},
    signal::{Signal, SignalBus},
    store::WorkflowStore,
};

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    signal_arrived: Notify,
}

#[derive(Debug, Default)]
struct MemoryState {
    workflows: HashMap<WorkflowId, WorkflowRecord>,
    /// Insertion order, used for FIFO claims.
    order: Vec<WorkflowId>,
    events: HashMap<WorkflowId, Vec<WorkflowEvent>>,
    mailboxes: HashMap<(WorkflowId, String), Vec<Signal>>,
    idempotency_keys: HashSet<String>,
    next_signal_id: u64,
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryStore");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("workflows", &state.workflows.len())
                    .field("mailboxes", &state.mailboxes.len())
                    .field("next_signal_id", &state.next_signal_id);
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every workflow record, in insertion order.
    pub async fn workflows(&self) -> Vec<WorkflowRecord> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.workflows.get(id).cloned())
            .collect()
    }

    /// Number of signals ever delivered to `(workflow_id, topic)`.
    pub async fn signal_count(&self, workflow_id: &WorkflowId, topic: &str) -> usize {
        let state = self.state.lock().await;
        state
            .mailboxes
            .get(&(workflow_id.clone(), topic.to_string()))
            .map(Vec::len)
            .unwrap_or_default()
    }

    fn owned_running<'a>(
        state: &'a mut MemoryState,
        id: &WorkflowId,
        executor_id: &str,
    ) -> Result<&'a mut WorkflowRecord> {
        let record = state
            .workflows
            .get_mut(id)
            .ok_or_else(|| ScanflowError::NotFound(format!("workflow {id}")))?;
        if record.status != WorkflowStatus::Running
            || record.lease_owner.as_deref() != Some(executor_id)
        {
            return Err(ScanflowError::Fenced(format!(
                "workflow {id} is not leased by {executor_id}"
            )));
        }
        Ok(record)
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn insert_workflow(&self, new: NewWorkflow) -> Result<InsertOutcome> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.workflows.get(&new.id) {
            return Ok(InsertOutcome {
                record: existing.clone(),
                created: false,
            });
        }
        let record = WorkflowRecord::new(new);
        state.order.push(record.id.clone());
        state.workflows.insert(record.id.clone(), record.clone());
        Ok(InsertOutcome {
            record,
            created: true,
        })
    }

    async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<WorkflowRecord>> {
        Ok(self.state.lock().await.workflows.get(id).cloned())
    }

    async fn claim_next(
        &self,
        queue: &QueueConfig,
        executor_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<Option<WorkflowRecord>> {
        let mut state = self.state.lock().await;

        if let Some(limit) = queue.concurrency {
            let running = state
                .workflows
                .values()
                .filter(|w| w.queue == queue.name && w.status == WorkflowStatus::Running)
                .count();
            if running >= limit {
                return Ok(None);
            }
        }

        let next = state.order.iter().find(|id| {
            state
                .workflows
                .get(*id)
                .is_some_and(|w| w.queue == queue.name && w.status == WorkflowStatus::Enqueued)
        });
        let Some(id) = next.cloned() else {
            return Ok(None);
        };

        let now = Utc::now();
        let record = state
            .workflows
            .get_mut(&id)
            .ok_or_else(|| ScanflowError::Internal(format!("workflow {id} vanished")))?;
        record.status = WorkflowStatus::Running;
        record.lease_owner = Some(executor_id.to_string());
        record.lease_expires_at = Some(now + lease_ttl);
        record.attempts = record.attempts.saturating_add(1);
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    async fn renew_lease(
        &self,
        id: &WorkflowId,
        executor_id: &str,
        lease_ttl: chrono::Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match Self::owned_running(&mut state, id, executor_id) {
            Ok(record) => {
                let now = Utc::now();
                record.lease_expires_at = Some(now + lease_ttl);
                record.updated_at = now;
                Ok(true)
            }
            Err(ScanflowError::Fenced(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn complete_workflow(
        &self,
        id: &WorkflowId,
        executor_id: &str,
        output: Value,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = Self::owned_running(&mut state, id, executor_id)?;
        record.status = WorkflowStatus::Succeeded;
        record.output = Some(output);
        record.lease_owner = None;
        record.lease_expires_at = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_workflow(&self, id: &WorkflowId, executor_id: &str, error: String) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = Self::owned_running(&mut state, id, executor_id)?;
        record.status = WorkflowStatus::Failed;
        record.error = Some(error);
        record.lease_owner = None;
        record.lease_expires_at = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn expire_leases(&self) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut resurrected = 0u64;
        for record in state.workflows.values_mut() {
            let expired = record.status == WorkflowStatus::Running
                && record.lease_expires_at.is_some_and(|at| at < now);
            if expired {
                record.status = WorkflowStatus::Enqueued;
                record.lease_owner = None;
                record.lease_expires_at = None;
                record.updated_at = now;
                resurrected += 1;
            }
        }
        Ok(resurrected)
    }

    async fn release_executor_leases(&self, executor_id: &str) -> Result<u64> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut released = 0u64;
        for record in state.workflows.values_mut() {
            if record.status == WorkflowStatus::Running
                && record.lease_owner.as_deref() == Some(executor_id)
            {
                record.status = WorkflowStatus::Enqueued;
                record.lease_owner = None;
                record.lease_expires_at = None;
                record.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl EventLog for InMemoryStore {
    async fn load_events(&self, workflow_id: &WorkflowId) -> Result<Vec<WorkflowEvent>> {
        let state = self.state.lock().await;
        Ok(state.events.get(workflow_id).cloned().unwrap_or_default())
    }

    async fn append_event(&self, workflow_id: &WorkflowId, event: WorkflowEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        let history = state.events.entry(workflow_id.clone()).or_default();
        if event.seq != history.len() as u64 {
            return Err(ScanflowError::Fenced(format!(
                "workflow {workflow_id}: seq {} is not the next slot ({})",
                event.seq,
                history.len()
            )));
        }
        history.push(event);
        Ok(())
    }
}

#[async_trait]
impl SignalBus for InMemoryStore {
    async fn send(
        &self,
        destination: &WorkflowId,
        topic: &str,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(key) = idempotency_key {
                if !state.idempotency_keys.insert(key.to_string()) {
                    return Ok(());
                }
            }
            state.next_signal_id += 1;
            let signal = Signal {
                id: state.next_signal_id,
                topic: topic.to_string(),
                payload,
                sent_at: Utc::now(),
            };
            state
                .mailboxes
                .entry((destination.clone(), topic.to_string()))
                .or_default()
                .push(signal);
        }
        self.signal_arrived.notify_waiters();
        Ok(())
    }

    async fn next_signal(
        &self,
        workflow_id: &WorkflowId,
        topic: &str,
        after: u64,
        timeout: Duration,
    ) -> Result<Option<Signal>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let key = (workflow_id.clone(), topic.to_string());
        loop {
            // Register interest before checking so a send between the check
            // and the wait still wakes us.
            let notified = self.signal_arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                let found = state
                    .mailboxes
                    .get(&key)
                    .and_then(|signals| signals.iter().find(|s| s.id > after))
                    .cloned();
                if found.is_some() {
                    return Ok(found);
                }
            }

            if timeout.is_zero() || tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::events::EventKind;
    use serde_json::json;

    fn new_workflow(id: &str, queue: &str) -> NewWorkflow {
        NewWorkflow {
            id: WorkflowId::from(id),
            name: "test".to_string(),
            queue: queue.to_string(),
            input: json!(null),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent_on_workflow_id() {
        let store = InMemoryStore::new();
        let first = store.insert_workflow(new_workflow("a", "q")).await.unwrap();
        let second = store.insert_workflow(new_workflow("a", "q")).await.unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(store.workflows().await.len(), 1);
    }

    #[tokio::test]
    async fn claim_honours_global_concurrency() {
        let store = InMemoryStore::new();
        for id in ["a", "b", "c"] {
            store.insert_workflow(new_workflow(id, "q")).await.unwrap();
        }
        let queue = QueueConfig::new("q", 8).with_concurrency(2);
        let ttl = chrono::Duration::seconds(30);

        let a = store.claim_next(&queue, "w1", ttl).await.unwrap();
        let b = store.claim_next(&queue, "w2", ttl).await.unwrap();
        let c = store.claim_next(&queue, "w3", ttl).await.unwrap();
        assert_eq!(a.map(|r| r.id), Some(WorkflowId::from("a")));
        assert_eq!(b.map(|r| r.id), Some(WorkflowId::from("b")));
        assert!(c.is_none(), "third claim must wait for a free slot");

        store
            .complete_workflow(&WorkflowId::from("a"), "w1", json!(1))
            .await
            .unwrap();
        let c = store.claim_next(&queue, "w3", ttl).await.unwrap();
        assert_eq!(c.map(|r| r.id), Some(WorkflowId::from("c")));
    }

    #[tokio::test]
    async fn completion_requires_lease_ownership() {
        let store = InMemoryStore::new();
        store.insert_workflow(new_workflow("a", "q")).await.unwrap();
        let queue = QueueConfig::new("q", 1);
        store
            .claim_next(&queue, "w1", chrono::Duration::seconds(30))
            .await
            .unwrap();

        let err = store
            .complete_workflow(&WorkflowId::from("a"), "w2", json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanflowError::Fenced(_)));
    }

    #[tokio::test]
    async fn expired_leases_are_requeued() {
        let store = InMemoryStore::new();
        store.insert_workflow(new_workflow("a", "q")).await.unwrap();
        let queue = QueueConfig::new("q", 1);
        store
            .claim_next(&queue, "w1", chrono::Duration::seconds(-1))
            .await
            .unwrap();

        assert_eq!(store.expire_leases().await.unwrap(), 1);
        let record = store.get_workflow(&WorkflowId::from("a")).await.unwrap().unwrap();
        assert_eq!(record.status, WorkflowStatus::Enqueued);
        assert!(record.lease_owner.is_none());
    }

    #[tokio::test]
    async fn append_rejects_occupied_slots() {
        let store = InMemoryStore::new();
        let id = WorkflowId::from("a");
        let event = || {
            WorkflowEvent::new(0, EventKind::ClockRead { at: Utc::now() })
        };
        store.append_event(&id, event()).await.unwrap();
        let err = store.append_event(&id, event()).await.unwrap_err();
        assert!(matches!(err, ScanflowError::Fenced(_)));
    }

    #[tokio::test]
    async fn duplicate_idempotency_keys_are_absorbed() {
        let store = InMemoryStore::new();
        let id = WorkflowId::from("a");
        store.send(&id, "t", json!(1), Some("k")).await.unwrap();
        store.send(&id, "t", json!(1), Some("k")).await.unwrap();
        store.send(&id, "t", json!(2), None).await.unwrap();
        assert_eq!(store.signal_count(&id, "t").await, 2);
    }

    #[tokio::test]
    async fn next_signal_resumes_after_cursor() {
        let store = InMemoryStore::new();
        let id = WorkflowId::from("a");
        store.send(&id, "t", json!("one"), None).await.unwrap();
        store.send(&id, "t", json!("two"), None).await.unwrap();

        let first = store
            .next_signal(&id, "t", 0, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let second = store
            .next_signal(&id, "t", first.id, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, json!("one"));
        assert_eq!(second.payload, json!("two"));
        assert!(
            store
                .next_signal(&id, "t", second.id, Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_receive_wakes_on_send() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let id = WorkflowId::from("a");

        let sender = {
            let store = std::sync::Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                store.send(&id, "t", json!("late"), None).await.unwrap();
            })
        };

        let started = tokio::time::Instant::now();
        let signal = store
            .next_signal(&id, "t", 0, Duration::from_secs(60))
            .await
            .unwrap();
        sender.await.unwrap();

        assert_eq!(signal.map(|s| s.payload), Some(json!("late")));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_receive_times_out() {
        let store = InMemoryStore::new();
        let started = tokio::time::Instant::now();
        let signal = store
            .next_signal(&WorkflowId::from("a"), "t", 0, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(signal.is_none());
        assert!(started.elapsed() >= Duration::from_secs(60));
    }
}

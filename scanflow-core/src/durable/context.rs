//! Replay-aware execution context handed to every workflow run.
//!
//! Each externally visible action (step, clock read, signal send/receive)
//! occupies one slot in the instance's event log. On a fresh run the action
//! executes and its result is appended; after a crash the history is loaded
//! and the same slots are answered from the log, in order, until execution
//! reaches the first unrecorded slot and continues live.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::error::{Result, ScanflowError};

use super::{
    codec,
    config::RetryConfig,
    events::{EventKind, EventLog, WorkflowEvent},
    record::WorkflowId,
    signal::SignalBus,
    store::DurableStore,
};

pub struct WorkflowContext {
    workflow_id: WorkflowId,
    store: Arc<dyn DurableStore>,
    history: Vec<WorkflowEvent>,
    next_seq: u64,
    /// Highest signal id consumed per topic.
    cursors: HashMap<String, u64>,
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &self.workflow_id)
            .field("history_len", &self.history.len())
            .field("next_seq", &self.next_seq)
            .field("cursors", &self.cursors)
            .finish()
    }
}

impl WorkflowContext {
    /// Load the persisted history of `workflow_id` and position the context at
    /// its first slot.
    pub async fn load(workflow_id: WorkflowId, store: Arc<dyn DurableStore>) -> Result<Self> {
        let mut history = store.load_events(&workflow_id).await?;
        history.sort_by_key(|event| event.seq);
        if let Some((idx, event)) = history
            .iter()
            .enumerate()
            .find(|(idx, event)| event.seq != *idx as u64)
        {
            return Err(ScanflowError::Internal(format!(
                "workflow {workflow_id}: history gap at slot {idx} (found seq {})",
                event.seq
            )));
        }
        if !history.is_empty() {
            debug!(workflow_id = %workflow_id, events = history.len(), "replaying workflow history");
        }
        Ok(Self {
            workflow_id,
            store,
            history,
            next_seq: 0,
            cursors: HashMap::new(),
        })
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.workflow_id
    }

    /// True while the context is still answering slots from the log.
    pub fn is_replaying(&self) -> bool {
        (self.next_seq as usize) < self.history.len()
    }

    /// Run `f` once and checkpoint its output. No retries: a failure is
    /// recorded and re-raised verbatim on every later replay.
    pub async fn step<T, F, Fut>(&mut self, name: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(recorded) = self.replay_step(name)? {
            return recorded;
        }
        let outcome = f().await;
        self.record_step(name, outcome).await
    }

    /// Like [`Self::step`], but re-invokes `f` under `policy` while the error
    /// is transient. Only for steps whose side effects are idempotent.
    pub async fn step_with_retry<T, F, Fut>(
        &mut self,
        name: &str,
        policy: &RetryConfig,
        mut f: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(recorded) = self.replay_step(name)? {
            return recorded;
        }
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1u16;
        let outcome = loop {
            match f().await {
                Ok(value) => break Ok(value),
                Err(err) if attempt < max_attempts && err.is_transient() => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        workflow_id = %self.workflow_id,
                        step = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "step failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        };
        self.record_step(name, outcome).await
    }

    /// Wall-clock time, captured once and replayed verbatim afterwards.
    pub async fn now(&mut self) -> Result<DateTime<Utc>> {
        let seq = self.next_seq;
        if let Some(event) = self.history.get(seq as usize) {
            return match &event.kind {
                EventKind::ClockRead { at } => {
                    let at = *at;
                    self.next_seq += 1;
                    Ok(at)
                }
                other => Err(self.divergence(seq, "clock", other)),
            };
        }
        let at = Utc::now();
        self.append(EventKind::ClockRead { at }).await?;
        Ok(at)
    }

    /// Blocking receive on `topic` for at most `timeout`. `Ok(None)` means
    /// the wait expired with nothing delivered.
    ///
    /// A payload that cannot be decoded is still consumed (and logged); the
    /// decode error is returned so the caller can decide to skip it.
    pub async fn recv<T: DeserializeOwned>(
        &mut self,
        topic: &str,
        timeout: Duration,
    ) -> Result<Option<T>> {
        match self.recv_raw(topic, timeout).await? {
            Some(payload) => codec::decode(payload).map(Some),
            None => Ok(None),
        }
    }

    /// Non-blocking receive on `topic`.
    pub async fn try_recv<T: DeserializeOwned>(&mut self, topic: &str) -> Result<Option<T>> {
        self.recv(topic, Duration::ZERO).await
    }

    /// Fire-and-forget send. The idempotency key is derived from this
    /// instance's slot so a replayed send is absorbed by the bus.
    pub async fn send<T: Serialize + Sync>(
        &mut self,
        destination: &WorkflowId,
        topic: &str,
        payload: &T,
    ) -> Result<()> {
        let seq = self.next_seq;
        if let Some(event) = self.history.get(seq as usize) {
            return match &event.kind {
                EventKind::SignalSent {
                    destination: recorded_dest,
                    topic: recorded_topic,
                } if recorded_dest == destination && recorded_topic == topic => {
                    self.next_seq += 1;
                    Ok(())
                }
                other => Err(self.divergence(seq, &format!("send:{destination}:{topic}"), other)),
            };
        }
        let payload = codec::encode(payload)?;
        let idempotency_key = format!("{}:{seq}", self.workflow_id);
        self.store
            .send(destination, topic, payload, Some(&idempotency_key))
            .await?;
        self.append(EventKind::SignalSent {
            destination: destination.clone(),
            topic: topic.to_string(),
        })
        .await
    }

    async fn recv_raw(&mut self, topic: &str, timeout: Duration) -> Result<Option<Value>> {
        let seq = self.next_seq;
        if let Some(event) = self.history.get(seq as usize) {
            let (signal_id, payload) = match &event.kind {
                EventKind::SignalReceived {
                    topic: recorded_topic,
                    signal_id,
                    payload,
                } if recorded_topic == topic => (*signal_id, payload.clone()),
                other => return Err(self.divergence(seq, &format!("recv:{topic}"), other)),
            };
            if let Some(id) = signal_id {
                self.advance_cursor(topic, id);
            }
            self.next_seq += 1;
            return Ok(payload);
        }

        let after = self.cursors.get(topic).copied().unwrap_or(0);
        let signal = self
            .store
            .next_signal(&self.workflow_id, topic, after, timeout)
            .await?;
        let (signal_id, payload) = match signal {
            Some(signal) => (Some(signal.id), Some(signal.payload)),
            None => (None, None),
        };
        self.append(EventKind::SignalReceived {
            topic: topic.to_string(),
            signal_id,
            payload: payload.clone(),
        })
        .await?;
        if let Some(id) = signal_id {
            self.advance_cursor(topic, id);
        }
        Ok(payload)
    }

    fn replay_step<T: DeserializeOwned>(&mut self, name: &str) -> Result<Option<Result<T>>> {
        let seq = self.next_seq;
        let Some(event) = self.history.get(seq as usize) else {
            return Ok(None);
        };
        let replayed = match &event.kind {
            EventKind::StepCompleted {
                name: recorded,
                output,
            } if recorded == name => codec::decode(output.clone()),
            EventKind::StepFailed {
                name: recorded,
                error,
            } if recorded == name => Err(ScanflowError::StepFailed {
                step: name.to_string(),
                message: error.clone(),
            }),
            other => return Err(self.divergence(seq, &format!("step:{name}"), other)),
        };
        self.next_seq += 1;
        Ok(Some(replayed))
    }

    async fn record_step<T: Serialize>(&mut self, name: &str, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                let output = codec::encode(&value)?;
                self.append(EventKind::StepCompleted {
                    name: name.to_string(),
                    output,
                })
                .await?;
                Ok(value)
            }
            Err(err) => {
                self.append(EventKind::StepFailed {
                    name: name.to_string(),
                    error: err.to_string(),
                })
                .await?;
                Err(err)
            }
        }
    }

    async fn append(&mut self, kind: EventKind) -> Result<()> {
        let event = WorkflowEvent::new(self.next_seq, kind);
        self.store
            .append_event(&self.workflow_id, event.clone())
            .await?;
        self.history.push(event);
        self.next_seq += 1;
        Ok(())
    }

    fn advance_cursor(&mut self, topic: &str, signal_id: u64) {
        let cursor = self.cursors.entry(topic.to_string()).or_insert(0);
        *cursor = (*cursor).max(signal_id);
    }

    fn divergence(&self, seq: u64, expected: &str, found: &EventKind) -> ScanflowError {
        ScanflowError::NonDeterministic {
            workflow_id: self.workflow_id.to_string(),
            seq,
            expected: expected.to_string(),
            found: found.label(),
        }
    }
}

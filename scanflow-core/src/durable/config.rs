use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Queue that carries workflows started without an explicit queue.
pub const DIRECT_QUEUE: &str = "__direct";

/// Global knobs for one executor process.
///
/// All fields carry defaults so deployments only override what they tune.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Identity written into leases. Must be unique per live process.
    pub executor_id: String,
    /// Idle delay between queue polls when nothing was claimable (ms).
    pub poll_interval_ms: u64,
    /// Lease defaults (TTL, housekeeping cadence).
    pub lease: LeaseConfig,
    /// Per-process ceiling for workflows started without a queue.
    pub direct_worker_concurrency: usize,
    /// Polling cadence for stores without push delivery of signals (ms).
    pub recv_poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executor_id: format!("executor-{}", Uuid::now_v7()),
            poll_interval_ms: 250,
            lease: LeaseConfig::default(),
            direct_worker_concurrency: 16,
            recv_poll_interval_ms: 200,
        }
    }
}

impl RuntimeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recv_poll_interval(&self) -> Duration {
        Duration::from_millis(self.recv_poll_interval_ms)
    }

    pub fn direct_queue(&self) -> QueueConfig {
        QueueConfig {
            name: DIRECT_QUEUE.to_string(),
            worker_concurrency: self.direct_worker_concurrency.max(1),
            concurrency: None,
        }
    }
}

/// Named queue with two concurrency ceilings.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Maximum instances of this queue running inside one executor process.
    pub worker_concurrency: usize,
    /// Maximum instances of this queue running across every executor. `None`
    /// leaves only the per-process ceiling.
    #[serde(default)]
    pub concurrency: Option<usize>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, worker_concurrency: usize) -> Self {
        Self {
            name: name.into(),
            worker_concurrency,
            concurrency: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }
}

/// Lease/heartbeat tuning for running workflow instances.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Default TTL for workflow leases (seconds)
    pub lease_ttl_secs: i64,
    /// Housekeeping cadence for scanning expired leases (ms)
    pub housekeeper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 30,
            housekeeper_interval_ms: 15_000,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs.max(1))
    }

    /// Renew at half the TTL so one missed tick does not lose the lease.
    pub fn renew_every(&self) -> Duration {
        Duration::from_millis((self.lease_ttl_secs.max(1) as u64 * 1_000) / 2)
    }

    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms.max(1))
    }
}

/// Retry/backoff policy for steps whose side effects are safe to repeat.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            jitter_ratio: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Exponential delay before retry number `attempt` (1-based), capped at
    /// `backoff_max` and spread by `jitter_ratio`.
    pub fn delay_for(&self, attempt: u16) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        let base = self.backoff_base_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.backoff_max_ms);
        let jitter_span = (capped as f64 * f64::from(self.jitter_ratio.clamp(0.0, 1.0))) as u64;
        let jitter = if jitter_span > 0 {
            rand::rng().random_range(0..=jitter_span)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter).min(self.backoff_max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryConfig {
            max_attempts: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            jitter_ratio: 0.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(8), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryConfig {
            max_attempts: 5,
            backoff_base_ms: 800,
            backoff_max_ms: 1_000,
            jitter_ratio: 1.0,
        };
        for attempt in 1..5 {
            assert!(policy.delay_for(attempt) <= policy.backoff_max());
        }
    }

    #[test]
    fn direct_queue_has_no_global_ceiling() {
        let config = RuntimeConfig {
            direct_worker_concurrency: 0,
            ..RuntimeConfig::default()
        };
        let queue = config.direct_queue();
        assert_eq!(queue.name, DIRECT_QUEUE);
        assert_eq!(queue.worker_concurrency, 1);
        assert!(queue.concurrency.is_none());
    }
}

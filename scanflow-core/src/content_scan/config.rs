use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{
    durable::{QueueConfig, RetryConfig},
    error::{Result, ScanflowError},
};

/// Wait for the next batch while the producer may still be enqueueing.
pub const BATCH_RECV_TIMEOUT_SECONDS: u64 = 600;
/// Wait for the next batch once the producer has announced its total.
pub const POST_ALL_TRANSMITTED_TIMEOUT_SECONDS: u64 = 60;

pub const CONTENT_SCAN_QUEUE: &str = "content_scan";
pub const CONTENT_SCAN_WORKER_CONCURRENCY: usize = 2;
pub const CONTENT_SCAN_CONCURRENCY: usize = 4;

pub const BATCH_COMPLETE_TOPIC: &str = "batch_complete";
pub const ALL_TRANSMITTED_TOPIC: &str = "all_transmitted";

/// Tuning for the content-scan workflows.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentScanConfig {
    pub batch_recv_timeout_secs: u64,
    /// Must stay below `batch_recv_timeout_secs`.
    pub post_all_transmitted_timeout_secs: u64,
    /// Queue that carries batch workers.
    pub queue: QueueConfig,
    /// Applied to the scan-record lifecycle steps only.
    pub record_retry: RetryConfig,
}

impl Default for ContentScanConfig {
    fn default() -> Self {
        Self {
            batch_recv_timeout_secs: BATCH_RECV_TIMEOUT_SECONDS,
            post_all_transmitted_timeout_secs: POST_ALL_TRANSMITTED_TIMEOUT_SECONDS,
            queue: content_scan_queue(),
            record_retry: RetryConfig::default(),
        }
    }
}

impl ContentScanConfig {
    pub fn batch_recv_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_recv_timeout_secs)
    }

    pub fn post_all_transmitted_timeout(&self) -> Duration {
        Duration::from_secs(self.post_all_transmitted_timeout_secs)
    }

    /// Timeout for the next blocking `batch_complete` receive.
    pub fn recv_timeout(&self, total_known: bool) -> Duration {
        if total_known {
            self.post_all_transmitted_timeout()
        } else {
            self.batch_recv_timeout()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.post_all_transmitted_timeout_secs >= self.batch_recv_timeout_secs {
            return Err(ScanflowError::InvalidConfig(format!(
                "post_all_transmitted_timeout_secs ({}) must be shorter than batch_recv_timeout_secs ({})",
                self.post_all_transmitted_timeout_secs, self.batch_recv_timeout_secs
            )));
        }
        if self.queue.worker_concurrency == 0 {
            return Err(ScanflowError::InvalidConfig(
                "content scan queue worker_concurrency must be at least 1".into(),
            ));
        }
        if self.queue.concurrency == Some(0) {
            return Err(ScanflowError::InvalidConfig(
                "content scan queue concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// `content_scan`: two batch workers per process, four across the fleet.
pub fn content_scan_queue() -> QueueConfig {
    QueueConfig::new(CONTENT_SCAN_QUEUE, CONTENT_SCAN_WORKER_CONCURRENCY)
        .with_concurrency(CONTENT_SCAN_CONCURRENCY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_queue_contract() {
        let config = ContentScanConfig::default();
        assert_eq!(config.queue.name, "content_scan");
        assert_eq!(config.queue.worker_concurrency, 2);
        assert_eq!(config.queue.concurrency, Some(4));
        assert_eq!(config.recv_timeout(false), Duration::from_secs(600));
        assert_eq!(config.recv_timeout(true), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn post_notice_timeout_must_be_shorter() {
        let config = ContentScanConfig {
            post_all_transmitted_timeout_secs: 600,
            ..ContentScanConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ScanflowError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = ContentScanConfig::default();
        config.queue.concurrency = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ScanflowError::InvalidConfig(_))
        ));

        let mut config = ContentScanConfig::default();
        config.queue.worker_concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ScanflowError::InvalidConfig(_))
        ));
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: ContentScanConfig =
            serde_json::from_value(serde_json::json!({ "batch_recv_timeout_secs": 900 })).unwrap();
        assert_eq!(config.batch_recv_timeout_secs, 900);
        assert_eq!(config.post_all_transmitted_timeout_secs, 60);
        assert_eq!(config.queue.concurrency, Some(4));
    }
}

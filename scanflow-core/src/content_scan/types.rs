use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::ScanflowError;

/// Caller-supplied identity of one bulk scan. Doubles as the orchestrator's
/// workflow id and dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub Uuid);

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanId {
    pub fn new() -> Self {
        ScanId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Owning tenant of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityServerId(pub Uuid);

impl CommunityServerId {
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CommunityServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Detection kind applied to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Similarity,
    OpenaiModeration,
    ConversationFlashpoint,
}

impl ScanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanType::Similarity => "similarity",
            ScanType::OpenaiModeration => "openai_moderation",
            ScanType::ConversationFlashpoint => "conversation_flashpoint",
        }
    }
}

impl fmt::Display for ScanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanType {
    type Err = ScanflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "similarity" => Ok(ScanType::Similarity),
            "openai_moderation" => Ok(ScanType::OpenaiModeration),
            "conversation_flashpoint" => Ok(ScanType::ConversationFlashpoint),
            other => Err(ScanflowError::Internal(format!("unknown scan type '{other}'"))),
        }
    }
}

/// One message handed to the scanning service. Platform identifiers are kept
/// as the producer sent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub channel_id: String,
    pub community_server_id: String,
    pub content: String,
    pub author_id: String,
    pub author_username: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embed_content: Option<String>,
}

/// Outcome of one batch, carried on `batch_complete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub processed: u64,
    pub skipped: u64,
    pub errors: u64,
    pub flagged_count: u64,
    /// Filled in by the batch worker; scanners may omit it.
    #[serde(default)]
    pub batch_number: u32,
}

impl BatchResult {
    /// Messages this batch accounted for, one way or another.
    pub fn accounted(&self) -> u64 {
        self.processed
            .saturating_add(self.skipped)
            .saturating_add(self.errors)
    }
}

/// The producer's one-time declaration of how many messages it enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransmissionNotice {
    pub messages_scanned: u64,
}

/// Orchestrator-local accumulator. Addition is commutative, so arrival order
/// of batch results never matters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningTotals {
    pub processed_count: u64,
    pub skipped_count: u64,
    pub error_count: u64,
    pub flagged_count: u64,
    pub expected_total: Option<u64>,
}

impl RunningTotals {
    /// Counters come from an external scanner, so sums saturate instead of
    /// overflowing.
    pub fn absorb(&mut self, batch: &BatchResult) {
        self.processed_count = self.processed_count.saturating_add(batch.processed);
        self.skipped_count = self.skipped_count.saturating_add(batch.skipped);
        self.error_count = self.error_count.saturating_add(batch.errors);
        self.flagged_count = self.flagged_count.saturating_add(batch.flagged_count);
    }

    /// Fix `expected_total` from the first notice. Later notices are ignored;
    /// returns whether this one was taken.
    pub fn record_notice(&mut self, notice: &TransmissionNotice) -> bool {
        if self.expected_total.is_some() {
            return false;
        }
        self.expected_total = Some(notice.messages_scanned);
        true
    }

    pub fn accounted(&self) -> u64 {
        self.processed_count
            .saturating_add(self.skipped_count)
            .saturating_add(self.error_count)
    }

    /// Every announced message has been accounted for (trivially so for an
    /// empty scan).
    pub fn is_complete(&self) -> bool {
        self.expected_total
            .is_some_and(|expected| expected == 0 || self.accounted() >= expected)
    }

    pub fn messages_scanned(&self) -> u64 {
        self.expected_total.unwrap_or(0)
    }

    pub fn finalize_counts(&self) -> FinalizeCounts {
        FinalizeCounts {
            messages_scanned: self.messages_scanned(),
            processed_count: self.processed_count,
            skipped_count: self.skipped_count,
            error_count: self.error_count,
            flagged_count: self.flagged_count,
        }
    }
}

/// Counters written once when a scan is finalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeCounts {
    pub messages_scanned: u64,
    pub processed_count: u64,
    pub skipped_count: u64,
    pub error_count: u64,
    pub flagged_count: u64,
}

impl FinalizeCounts {
    /// FAILED only when messages were announced, none were processed and the
    /// errors cover the whole announced population.
    pub fn terminal_status(&self) -> ScanStatus {
        if self.messages_scanned > 0
            && self.processed_count == 0
            && self.error_count >= self.messages_scanned
        {
            ScanStatus::Failed
        } else {
            ScanStatus::Completed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::InProgress => "in_progress",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    /// Forward-only: pending -> in_progress -> completed | failed. A pending
    /// scan may also be finalized directly.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (ScanStatus::Pending, ScanStatus::InProgress)
                | (ScanStatus::Pending, ScanStatus::Completed)
                | (ScanStatus::Pending, ScanStatus::Failed)
                | (ScanStatus::InProgress, ScanStatus::Completed)
                | (ScanStatus::InProgress, ScanStatus::Failed)
        )
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = ScanflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "in_progress" => Ok(ScanStatus::InProgress),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            other => Err(ScanflowError::Internal(format!("unknown scan status '{other}'"))),
        }
    }
}

/// Terminal summary of a scan; also the orchestrator's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub messages_scanned: u64,
    pub messages_flagged: u64,
    pub messages_skipped: u64,
    pub total_errors: u64,
}

impl ScanOutcome {
    pub fn from_counts(status: ScanStatus, counts: &FinalizeCounts) -> Self {
        Self {
            status,
            messages_scanned: counts.messages_scanned,
            messages_flagged: counts.flagged_count,
            messages_skipped: counts.skipped_count,
            total_errors: counts.error_count,
        }
    }
}

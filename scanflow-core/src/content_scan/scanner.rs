use async_trait::async_trait;
#[cfg(feature = "http-scanner")]
use serde::Serialize;
#[cfg(feature = "http-scanner")]
use std::time::Duration;
#[cfg(feature = "http-scanner")]
use tracing::debug;

use crate::error::Result;
#[cfg(feature = "http-scanner")]
use crate::error::ScanflowError;

use super::types::{BatchResult, CommunityServerId, MessageRecord, ScanType};

/// Runs the detection kinds over one batch. Implementations may write caches
/// or flag records, so a call is not safe to repeat.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScanningService: Send + Sync {
    async fn scan_batch(
        &self,
        community_server_id: CommunityServerId,
        messages: Vec<MessageRecord>,
        scan_types: Vec<ScanType>,
    ) -> Result<BatchResult>;
}

#[cfg(feature = "http-scanner")]
#[derive(Debug, Serialize)]
struct ScanBatchRequest<'a> {
    community_server_id: CommunityServerId,
    messages: &'a [MessageRecord],
    scan_types: &'a [ScanType],
}

/// Delegates batches to the scanning API over HTTP.
#[cfg(feature = "http-scanner")]
#[derive(Debug, Clone)]
pub struct HttpScanningService {
    http_client: reqwest::Client,
    endpoint: url::Url,
}

#[cfg(feature = "http-scanner")]
impl HttpScanningService {
    pub fn new(endpoint: url::Url, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ScanflowError::Scanner(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http_client,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[cfg(feature = "http-scanner")]
#[async_trait]
impl ScanningService for HttpScanningService {
    async fn scan_batch(
        &self,
        community_server_id: CommunityServerId,
        messages: Vec<MessageRecord>,
        scan_types: Vec<ScanType>,
    ) -> Result<BatchResult> {
        let body = ScanBatchRequest {
            community_server_id,
            messages: &messages,
            scan_types: &scan_types,
        };
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ScanflowError::Scanner(format!("scan request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ScanflowError::Scanner(format!(
                "scanner returned {status}: {detail}"
            )));
        }

        let result: BatchResult = response
            .json()
            .await
            .map_err(|e| ScanflowError::Scanner(format!("invalid scanner response: {e}")))?;
        debug!(
            community_server_id = %community_server_id,
            messages = messages.len(),
            processed = result.processed,
            flagged = result.flagged_count,
            "scanner answered"
        );
        Ok(result)
    }
}

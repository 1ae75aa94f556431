use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::record::{AnonymizedRecord, BatchResponse, RecordBatch, RecordOutcome};

/// Transient delivery failures. The sync client retries all of them.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("collector returned status {0}")]
    Status(u16),

    #[error("collector answered {received} outcomes for {sent} records")]
    OutcomeMismatch { sent: usize, received: usize },

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Delivers record batches to the collector.
pub trait Transport: Send + Sync + 'static {
    /// Returns the transport name for logging.
    fn name(&self) -> &str;

    /// Sends `records` and returns the collector's outcomes. The caller
    /// treats a count that differs from `records.len()` as a failure.
    fn send(
        &self,
        records: &[AnonymizedRecord],
    ) -> impl Future<Output = Result<Vec<RecordOutcome>, TransportError>> + Send;
}

/// JSON-over-HTTP transport to `{collector}/v1/records`.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(collector_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/v1/records", collector_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, records: &[AnonymizedRecord]) -> Result<Vec<RecordOutcome>, TransportError> {
        let body = RecordBatch {
            records: records.to_vec(),
        };

        let resp = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = resp.status();
        if !status.is_success() {
            // Drain body for connection reuse.
            let _ = resp.bytes().await;
            return Err(TransportError::Status(status.as_u16()));
        }

        let parsed: BatchResponse = resp.json().await?;

        tracing::debug!(
            records = records.len(),
            endpoint = %self.endpoint,
            "delivered batch via HTTP",
        );

        Ok(parsed.outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_path() {
        let t = HttpTransport::new("http://collector:8000/", Duration::from_secs(1))
            .expect("client");
        assert_eq!(t.endpoint(), "http://collector:8000/v1/records");
        assert_eq!(t.name(), "http");
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_request_error() {
        let t = HttpTransport::new("http://127.0.0.1:1", Duration::from_millis(500))
            .expect("client");
        let err = t.send(&[]).await.unwrap_err();
        assert!(matches!(err, TransportError::Request(_)));
    }
}

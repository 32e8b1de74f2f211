//! Webhook client
//!
//! Posts JSON payloads to the configured endpoint. Payloads carry error
//! kind, file and context, never row data.

use anyhow::{Context, Result};
use fileloader_common::LoadError;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebhookPayload {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_load_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub detail: String,
}

impl WebhookPayload {
    pub fn file_error(
        source: &str,
        filename: &str,
        file_load_id: Option<i64>,
        err: &LoadError,
    ) -> Self {
        Self {
            event: "file_error".to_string(),
            source: Some(source.to_string()),
            filename: Some(filename.to_string()),
            file_load_id,
            error_kind: Some(err.kind().as_str().to_string()),
            detail: err.to_string(),
        }
    }

    pub fn internal(event: &str, filename: Option<&str>, detail: &str) -> Self {
        Self {
            event: event.to_string(),
            source: None,
            filename: filename.map(|f| f.to_string()),
            file_load_id: None,
            error_kind: None,
            detail: detail.to_string(),
        }
    }

    pub fn summary(succeeded: usize, failed: usize, unmatched: usize, details: &[String]) -> Self {
        Self {
            event: "run_summary".to_string(),
            source: None,
            filename: None,
            file_load_id: None,
            error_kind: None,
            detail: format!(
                "{succeeded} succeeded, {failed} failed, {unmatched} unmatched\n{}",
                details.join("\n")
            ),
        }
    }
}

#[derive(Clone)]
pub struct WebhookClient {
    url: String,
    client: reqwest::Client,
}

impl WebhookClient {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub async fn send(&self, payload: &WebhookPayload) -> Result<()> {
        debug!(event = %payload.event, "Posting webhook");
        self.client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .context("Webhook request failed")?
            .error_for_status()
            .context("Webhook endpoint returned an error status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/etl"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = WebhookClient::new(format!("{}/hooks/etl", server.uri()), 5).unwrap();
        let payload = WebhookPayload::internal("worker_panic", Some("orders.csv"), "boom");
        client.send(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = WebhookClient::new(server.uri(), 5).unwrap();
        let payload = WebhookPayload::internal("x", None, "y");
        assert!(client.send(&payload).await.is_err());
    }

    #[test]
    fn payloads_never_serialize_row_data() {
        let err = LoadError::ValidationThresholdExceeded {
            file: "orders.csv".into(),
            invalid: 3,
            threshold: 0,
        };
        let payload = WebhookPayload::file_error("orders", "orders.csv", Some(4), &err);
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("ValidationThresholdExceeded"));
        assert!(!json.contains("original_row"));
    }
}

//! HTTP backend sink
//!
//! POSTs each batch as a JSON array. Transport failures, timeouts, 408, 429
//! and 5xx are transient; any other non-2xx status is permanent (the backend
//! understood us and said no).

use async_trait::async_trait;
use reqwest::StatusCode;

use super::sink::{EventSink, SinkError};
use crate::config::HttpSinkConfig;
use crate::events::ProxyEvent;

pub struct HttpSink {
    client: reqwest::Client,
    config: HttpSinkConfig,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, config: HttpSinkConfig) -> Self {
        Self { client, config }
    }

    fn classify_status(status: StatusCode) -> Option<SinkError> {
        if status.is_success() {
            return None;
        }
        let err = anyhow::anyhow!("event backend returned {status}");
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            Some(SinkError::Transient(err))
        } else {
            Some(SinkError::Permanent(err))
        }
    }
}

#[async_trait]
impl EventSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, batch: &[ProxyEvent]) -> Result<(), SinkError> {
        let mut request = self.client.post(&self.config.url).json(batch);
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Transient(anyhow::anyhow!(e)))?;

        match Self::classify_status(response.status()) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

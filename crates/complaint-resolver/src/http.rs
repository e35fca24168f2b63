//! HTTP-backed stage capability.
//!
//! POSTs the typed request as JSON and expects `{"value": .., "confidence": ..}`
//! back. Status codes map onto the stage error taxonomy:
//!
//! | Response                  | StageError                    |
//! |---------------------------|-------------------------------|
//! | client timeout            | `Timeout`                     |
//! | connect / 429 / 5xx       | `ProviderError` (retriable)   |
//! | other 4xx                 | `InvalidInput`                |
//! | undecodable body          | `ProviderError` (retriable)   |

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;
use triage::StageError;

use crate::capability::{Scored, StageCapability};

pub struct HttpCapability<Req, Out> {
    name: String,
    url: String,
    client: reqwest::Client,
    _marker: PhantomData<fn(Req) -> Out>,
}

impl<Req, Out> HttpCapability<Req, Out> {
    pub fn new(name: &str, url: &str, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
            _marker: PhantomData,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Map a non-success status to a stage error.
pub fn status_error(status: StatusCode, body: &str) -> StageError {
    let message = format!("HTTP {status}: {}", truncate(body, 200));
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StageError::transient(message)
    } else if status.is_client_error() {
        StageError::InvalidInput(message)
    } else {
        StageError::permanent(message)
    }
}

fn transport_error(err: &reqwest::Error, timeout: Duration) -> StageError {
    if err.is_timeout() {
        StageError::Timeout(timeout.as_millis() as u64)
    } else if err.is_connect() || err.is_request() {
        StageError::transient(format!("transport: {err}"))
    } else {
        StageError::permanent(format!("transport: {err}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl<Req, Out> StageCapability for HttpCapability<Req, Out>
where
    Req: Clone + Serialize + Send + Sync + 'static,
    Out: Serialize + DeserializeOwned + Send + 'static,
{
    type Request = Req;
    type Output = Out;

    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: Req, timeout: Duration) -> Result<Scored<Out>, StageError> {
        debug!(capability = %self.name, url = %self.url, "Calling stage endpoint");
        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let scored: Scored<Out> = response
            .json()
            .await
            .map_err(|e| StageError::transient(format!("undecodable response: {e}")))?;
        Ok(Scored::new(scored.value, scored.confidence))
    }
}

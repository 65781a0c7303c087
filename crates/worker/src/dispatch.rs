// HTTP dispatch handler
// Decision: The unit of work runs behind an HTTP endpoint; the worker only
// forwards the entry and maps the response status to an outcome

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use docket_scheduler::{handler_fn, TaskQueueEntry, WorkError, WorkHandler, WorkResult};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest response body excerpt kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Body posted to the handler endpoint
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest<'a> {
    pub entry_id: Uuid,
    pub work_ref: &'a str,
    pub owner_id: &'a str,
    pub attempt: u32,
}

/// Forwards claimed entries to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: reqwest::Client,
    url: String,
}

impl HttpDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST the entry and classify the response
    pub async fn dispatch(&self, entry: &TaskQueueEntry) -> WorkResult {
        let body = DispatchRequest {
            entry_id: entry.id,
            work_ref: &entry.work_ref,
            owner_id: &entry.owner_id,
            attempt: entry.attempts,
        };

        let response = match self.client.post(&self.url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(entry_id = %entry.id, error = %e, "Handler request failed");
                return Err(WorkError::retryable(format!("request failed: {e}")));
            }
        };

        let status = response.status();
        if status.is_success() {
            debug!(entry_id = %entry.id, %status, "Handler succeeded");
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let message = format!("handler returned {status}: {}", truncate(&text, MAX_ERROR_BODY));
        if is_retryable_status(status) {
            Err(WorkError::Retryable(message))
        } else {
            Err(WorkError::Terminal(message))
        }
    }

    pub fn into_handler(self) -> WorkHandler {
        let dispatcher = Arc::new(self);
        handler_fn(move |entry| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch(&entry).await }
        })
    }
}

/// Client errors are permanent, except timeouts and rate limiting
fn is_retryable_status(status: StatusCode) -> bool {
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    !status.is_client_error()
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

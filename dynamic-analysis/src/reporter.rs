//! Completion signalling to the control plane
//!
//! After a run the worker POSTs `{"task_id", "status"}` to the control plane
//! callback. The backend may be restarting or overloaded, so retryable
//! failures are retried with exponential backoff.

use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ReportError;

/// Retry schedule for completion reports
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Wait after the first failed attempt; doubles after each further failure
    pub initial_wait: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_wait: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (0-indexed)
    pub fn wait_after(&self, attempt: u32) -> Duration {
        self.initial_wait.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Serialize)]
struct CompletionPayload<'a> {
    task_id: &'a str,
    status: &'a str,
}

/// Notifies the control plane that a task finished
pub struct CompletionReporter {
    task_id: String,
    api_url: String,
    auth_token: String,
    policy: RetryPolicy,
    http_client: Client,
}

impl CompletionReporter {
    /// An empty `task_id` makes every report a no-op
    pub fn new(task_id: impl Into<String>, api_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self::with_policy(task_id, api_url, auth_token, RetryPolicy::default())
    }

    pub fn with_policy(
        task_id: impl Into<String>,
        api_url: impl Into<String>,
        auth_token: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        let http_client = Client::builder()
            .timeout(policy.attempt_timeout)
            .user_agent(concat!("dynamic-analysis/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            task_id: task_id.into(),
            api_url: api_url.into(),
            auth_token: auth_token.into(),
            policy,
            http_client,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Report `status` for the task, retrying retryable failures.
    ///
    /// Rejections (4xx other than 429) are returned at once. Cancellation
    /// interrupts both waits and in-flight requests.
    pub async fn report_done(&self, status: &str, cancel: &CancellationToken) -> Result<(), ReportError> {
        if self.task_id.is_empty() {
            debug!("No task_id provided, skipping control plane notification");
            return Ok(());
        }

        let body = serde_json::to_vec(&CompletionPayload {
            task_id: &self.task_id,
            status,
        })?;

        for attempt in 0..self.policy.max_attempts {
            let sent = tokio::select! {
                sent = self.send(&body) => sent,
                _ = cancel.cancelled() => return Err(ReportError::Cancelled),
            };

            let err = match sent {
                Ok(()) => {
                    info!(task_id = %self.task_id, status, attempt = attempt + 1, "Successfully notified control plane");
                    return Ok(());
                }
                Err(e) if !e.is_retryable() => {
                    error!(task_id = %self.task_id, attempt = attempt + 1, "Control plane notification rejected: {}", e);
                    return Err(e);
                }
                Err(e) => e,
            };

            if attempt + 1 == self.policy.max_attempts {
                warn!(task_id = %self.task_id, attempt = attempt + 1, error = %err, "Control plane notification failed");
                break;
            }

            let wait = self.policy.wait_after(attempt);
            warn!(
                task_id = %self.task_id,
                attempt = attempt + 1,
                error = %err,
                next_retry_in = ?wait,
                "Control plane notification failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(ReportError::Cancelled),
            }
        }

        let err = ReportError::Exhausted {
            attempts: self.policy.max_attempts,
        };
        error!(task_id = %self.task_id, "{}", err);
        Err(err)
    }

    /// One POST attempt
    async fn send(&self, body: &[u8]) -> Result<(), ReportError> {
        let response = self
            .http_client
            .post(&self.api_url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {}", self.auth_token))
            .body(body.to_vec())
            .send()
            .await?;

        classify(response.status())
    }
}

fn classify(status: StatusCode) -> Result<(), ReportError> {
    let code = status.as_u16();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(ReportError::Retryable { status: code })
    } else if status.is_client_error() {
        Err(ReportError::Rejected { status: code })
    } else {
        Ok(())
    }
}

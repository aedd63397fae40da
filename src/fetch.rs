use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::tenant::TenantKey;
use crate::windows::DateWindow;

/// One Analytics report response: ordered column-header names plus rows of
/// positional cells. Cells stay untyped until normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularResult {
  pub columns: Vec<String>,
  pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchError {
  /// Worth retrying: rate limiting, server errors, transport failures.
  Transient { status: Option<u16>, message: String },
  /// Retrying cannot help: malformed/unsupported query, bad auth scope.
  Permanent { status: Option<u16>, message: String },
}

impl FetchError {
  pub fn transport(message: impl Into<String>) -> Self {
    FetchError::Transient {
      status: None,
      message: message.into(),
    }
  }

  /// Classifies a non-2xx Analytics response. 429 and 5xx are transient, as
  /// is a 403 whose body carries a quota/rate reason; every other 4xx is
  /// permanent.
  pub fn from_status(status: u16, message: String) -> Self {
    let rate_limited_403 = status == 403
      && (message.contains("quotaExceeded")
        || message.contains("rateLimitExceeded")
        || message.contains("userRateLimitExceeded"));

    if status == 429 || status >= 500 || rate_limited_403 {
      FetchError::Transient {
        status: Some(status),
        message,
      }
    } else {
      FetchError::Permanent {
        status: Some(status),
        message,
      }
    }
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, FetchError::Transient { .. })
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      FetchError::Transient { status, .. } | FetchError::Permanent { status, .. } => *status,
    }
  }
}

impl std::fmt::Display for FetchError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let (kind, status, message) = match self {
      FetchError::Transient { status, message } => ("transient", status, message),
      FetchError::Permanent { status, message } => ("permanent", status, message),
    };
    match status {
      Some(code) => write!(f, "{kind} fetch error (status {code}): {message}"),
      None => write!(f, "{kind} fetch error: {message}"),
    }
  }
}

impl std::error::Error for FetchError {}

/// Executes one bounded-window report query against the external API.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
  async fn execute(
    &self,
    tenant: &TenantKey,
    window: DateWindow,
    dimensions: &str,
    metrics: &str,
  ) -> Result<TabularResult, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    RetryPolicy {
      max_attempts: 3,
      base_delay: Duration::from_millis(500),
    }
  }
}

impl RetryPolicy {
  /// Delay before retry number `attempt` (1-based), doubling each time.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
  }
}

/// Runs one window query with bounded retries. Only transient failures are
/// retried; a permanent failure or retry exhaustion returns the last error
/// so the caller can record the window as skipped.
pub async fn fetch_window_with_retry(
  executor: &dyn QueryExecutor,
  tenant: &TenantKey,
  window: DateWindow,
  dimensions: &str,
  metrics: &str,
  retry: &RetryPolicy,
) -> Result<TabularResult, FetchError> {
  let max_attempts = retry.max_attempts.max(1);

  let mut attempt = 0u32;
  loop {
    attempt += 1;
    match executor.execute(tenant, window, dimensions, metrics).await {
      Ok(result) => return Ok(result),
      Err(err) if err.is_transient() && attempt < max_attempts => {
        tracing::warn!(
          window = %window,
          attempt,
          error = %err,
          "transient fetch failure, retrying"
        );
        tokio::time::sleep(retry.delay_for(attempt)).await;
      }
      Err(err) => return Err(err),
    }
  }
}

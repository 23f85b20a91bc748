//! Error taxonomy for the write pipeline.
//!
//! Storage and setup code returns `color_eyre::Result`; the types here exist
//! where callers need to branch on the kind of failure.

/// Failure of a single network call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  /// Could not reach the server at all.
  #[error("network error: {0}")]
  Network(String),

  /// The request did not complete within the configured timeout.
  #[error("request timed out after {0:?}")]
  Timeout(std::time::Duration),

  /// The server answered with a non-success status.
  #[error("server returned HTTP {status}: {message}")]
  Status { status: u16, message: String },

  /// The response body could not be decoded.
  #[error("invalid response: {0}")]
  InvalidResponse(String),
}

impl FetchError {
  /// Whether retrying the same request later may succeed.
  ///
  /// Client errors are final except for request timeout and rate limiting.
  pub fn is_retryable(&self) -> bool {
    match self {
      FetchError::Network(_) | FetchError::Timeout(_) => true,
      FetchError::Status { status, .. } => !is_terminal_status(*status),
      FetchError::InvalidResponse(_) => true,
    }
  }
}

/// Whether an HTTP status marks a write as permanently rejected.
pub fn is_terminal_status(status: u16) -> bool {
  (400..500).contains(&status) && status != 408 && status != 429
}

/// Outcome delivered to the caller of a submitted write when it does not succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
  /// The write could not be sent yet; it stays queued and will be retried.
  #[error("transient failure: {0}")]
  Transient(String),

  /// The write was rejected for good. Its queue entry stays `failed`.
  #[error("write {id} failed permanently after {attempts} attempt(s): {reason}")]
  Terminal {
    id: String,
    attempts: u32,
    reason: String,
  },

  /// The engine shut down before the write resolved. The write is still in
  /// the durable queue and will be picked up on the next start.
  #[error("sync engine closed before write {0} resolved")]
  Closed(String),

  /// The durable queue could not be read or written.
  #[error("storage error: {0}")]
  Storage(String),
}

impl SyncError {
  /// Whether the caller can expect the write to eventually go through.
  pub fn is_recoverable(&self) -> bool {
    matches!(self, SyncError::Transient(_) | SyncError::Closed(_))
  }
}

impl From<color_eyre::Report> for SyncError {
  fn from(e: color_eyre::Report) -> Self {
    SyncError::Storage(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_terminal_statuses() {
    assert!(is_terminal_status(400));
    assert!(is_terminal_status(422));
    assert!(!is_terminal_status(408));
    assert!(!is_terminal_status(429));
    assert!(!is_terminal_status(500));
    assert!(!is_terminal_status(200));
  }

  #[test]
  fn test_fetch_error_retryable() {
    assert!(FetchError::Network("reset".into()).is_retryable());
    assert!(FetchError::Status {
      status: 503,
      message: String::new()
    }
    .is_retryable());
    assert!(!FetchError::Status {
      status: 409,
      message: String::new()
    }
    .is_retryable());
  }

  #[test]
  fn test_closed_is_recoverable() {
    assert!(SyncError::Closed("abc".into()).is_recoverable());
    assert!(!SyncError::Terminal {
      id: "abc".into(),
      attempts: 3,
      reason: "nope".into()
    }
    .is_recoverable());
  }
}

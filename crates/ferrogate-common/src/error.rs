use std::fmt;

/// Stable, wire-visible error taxonomy shared by every component of the core.
///
/// Unlike the leaf `thiserror` enums in each crate, `Kind` is not allowed to grow
/// free-form variants behind `#[from]` conversions: callers match on it, so every
/// new failure mode must be mapped onto one of these before it leaves the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RequestCancelled,
    DeadlineExceeded,
    InvalidRequest,
    AuthFailed,
    RateLimited,
    ProviderTransport,
    ProviderUnretryable,
    NoKeyAvailable,
    WorkerQueueFull,
    PluginRejected,
    PluginFault,
    MCPFault,
    InternalFault,
}

impl ErrorKind {
    /// Only these two kinds are ever retried, and only when the adapter also
    /// marked the underlying failure `retryable`.
    pub fn retry_eligible(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::ProviderTransport)
    }
}

/// The core's cross-cutting error envelope (`Err` in the data model).
#[derive(Debug, Clone)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub provider_raw: Option<String>,
    pub retryable: bool,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            provider_raw: None,
            retryable: false,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn provider_raw(mut self, raw: impl Into<String>) -> Self {
        self.provider_raw = Some(raw.into());
        self
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::RequestCancelled, "request cancelled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::DeadlineExceeded, "deadline exceeded")
    }

    pub fn no_key_available(provider: &str) -> Self {
        Self::new(
            ErrorKind::NoKeyAvailable,
            format!("no eligible key for provider {provider}"),
        )
    }

    pub fn worker_queue_full(provider: &str) -> Self {
        Self::new(
            ErrorKind::WorkerQueueFull,
            format!("worker queue full for provider {provider}"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalFault, message)
    }

    pub fn plugin_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PluginFault, message)
    }

    pub fn mcp_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MCPFault, message)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limited_and_transport_are_retry_eligible() {
        assert!(ErrorKind::RateLimited.retry_eligible());
        assert!(ErrorKind::ProviderTransport.retry_eligible());
        assert!(!ErrorKind::ProviderUnretryable.retry_eligible());
        assert!(!ErrorKind::InvalidRequest.retry_eligible());
    }

    #[test]
    fn builders_set_expected_fields() {
        let err = CoreError::new(ErrorKind::RateLimited, "too fast")
            .retryable(true)
            .status_code(429);
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retryable);
        assert_eq!(err.status_code, Some(429));
    }
}

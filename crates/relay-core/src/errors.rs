use std::time::Duration;

/// Typed error hierarchy for a single backend call.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    // Fatal: surfaced without retry
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("backend overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    NetworkError(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::ServerError { .. } | Self::Overloaded | Self::NetworkError(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::MalformedResponse(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MalformedResponse(_) => "malformed_response",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            408 => Self::NetworkError(format!("request timeout: {body}")),
            429 => Self::RateLimited { retry_after: None },
            503 | 529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BackendError::RateLimited { retry_after: None }.is_retryable());
        assert!(BackendError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(BackendError::Overloaded.is_retryable());
        assert!(BackendError::NetworkError("tcp reset".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(BackendError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(BackendError::InvalidRequest("bad schema".into()).is_fatal());
        assert!(BackendError::MalformedResponse("no id".into()).is_fatal());
        assert!(!BackendError::InvalidRequest("bad".into()).is_retryable());
    }

    #[test]
    fn operational_errors_are_neither() {
        let timeout = BackendError::Timeout(Duration::from_secs(30));
        assert!(!timeout.is_retryable());
        assert!(!timeout.is_fatal());
        assert!(!BackendError::Cancelled.is_retryable());
        assert!(!BackendError::Cancelled.is_fatal());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = BackendError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(5)));
        assert_eq!(BackendError::Overloaded.suggested_delay(), None);
    }

    #[test]
    fn from_status_mapping() {
        assert!(BackendError::from_status(401, "unauthorized".into()).is_fatal());
        assert!(BackendError::from_status(400, "bad".into()).is_fatal());
        assert!(matches!(
            BackendError::from_status(429, String::new()),
            BackendError::RateLimited { .. }
        ));
        assert!(matches!(BackendError::from_status(503, String::new()), BackendError::Overloaded));
        assert!(matches!(
            BackendError::from_status(502, "gateway".into()),
            BackendError::ServerError { status: 502, .. }
        ));
        assert!(BackendError::from_status(408, String::new()).is_retryable());
        assert!(BackendError::from_status(302, String::new()).is_fatal());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(BackendError::Overloaded.error_kind(), "overloaded");
        assert_eq!(BackendError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            BackendError::RateLimited { retry_after: None }.error_kind(),
            "rate_limited"
        );
    }
}

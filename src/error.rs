use crate::config::ConfigError;

/// Boxed source error carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error type surfaced by the streaming engine and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        code: Option<String>,
        kind: Option<String>,
    },
    #[error("Stream cancelled")]
    Cancelled,
}

impl StreamError {
    /// Wrap any transport-level error, keeping it as the error source.
    pub fn transport<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        StreamError::Transport(err.into())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamError::Cancelled)
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Config(_) | StreamError::Transport(_) => ErrorCategory::ServerError,
            StreamError::Upstream { status, .. } => category_from_upstream_status(*status),
            StreamError::Protocol { code, kind, .. } => {
                category_from_vendor_error(code.as_deref(), kind.as_deref())
            }
            StreamError::Cancelled => ErrorCategory::Cancelled,
        }
    }
}

impl From<ConfigError> for StreamError {
    fn from(err: ConfigError) -> Self {
        StreamError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::Transport(Box::new(err))
    }
}

/// Broad error category, used by callers to decide on retry or reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    Authentication,
    Permission,
    RateLimit,
    ServerError,
    Cancelled,
    Unknown,
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400 | 404 | 422 => ErrorCategory::InvalidRequest,
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Permission,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServerError,
        _ => ErrorCategory::Unknown,
    }
}

/// Map a vendor error `code`/`type` pair found inside a stream frame.
///
/// Numeric codes are treated as HTTP statuses; string codes are matched by
/// substring since vendors spell them differently (`rate_limit_exceeded`,
/// `rate_limit_error`, `RateLimited`, ...).
#[must_use]
pub fn category_from_vendor_error(code: Option<&str>, kind: Option<&str>) -> ErrorCategory {
    if let Some(status) = code.and_then(|code| code.parse::<u16>().ok()) {
        return category_from_upstream_status(status);
    }

    for label in [code, kind].into_iter().flatten() {
        let label = label.to_ascii_lowercase();
        if label.contains("rate") || label.contains("quota") || label.contains("overloaded") {
            return ErrorCategory::RateLimit;
        }
        if label.contains("auth") || label.contains("api_key") {
            return ErrorCategory::Authentication;
        }
        if label.contains("permission") || label.contains("forbidden") {
            return ErrorCategory::Permission;
        }
        if label.contains("invalid") || label.contains("context_length") {
            return ErrorCategory::InvalidRequest;
        }
        if label.contains("server") || label.contains("internal") {
            return ErrorCategory::ServerError;
        }
    }
    ErrorCategory::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_from_status() {
        assert_eq!(category_from_upstream_status(429), ErrorCategory::RateLimit);
        assert_eq!(
            category_from_upstream_status(401),
            ErrorCategory::Authentication
        );
        assert_eq!(category_from_upstream_status(502), ErrorCategory::ServerError);
        assert_eq!(category_from_upstream_status(302), ErrorCategory::Unknown);
    }

    #[test]
    fn test_category_from_vendor_code_and_type() {
        assert_eq!(
            category_from_vendor_error(Some("rate_limit_exceeded"), None),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            category_from_vendor_error(None, Some("invalid_request_error")),
            ErrorCategory::InvalidRequest
        );
        assert_eq!(
            category_from_vendor_error(Some("503"), Some("whatever")),
            ErrorCategory::ServerError
        );
        assert_eq!(category_from_vendor_error(None, None), ErrorCategory::Unknown);
    }

    #[test]
    fn test_protocol_error_category_and_display() {
        let err = StreamError::Protocol {
            message: "rate limited".to_string(),
            code: None,
            kind: Some("rate_limit_error".to_string()),
        };
        assert_eq!(err.category(), ErrorCategory::RateLimit);
        assert_eq!(err.to_string(), "Protocol error: rate limited");
    }

    #[test]
    fn test_transport_error_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = StreamError::transport(io);
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "reset by peer");
        assert!(!err.is_cancelled());
        assert!(StreamError::Cancelled.is_cancelled());
    }
}

use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

pub(crate) const RETRY_MAX_ATTEMPTS: u32 = 2;
pub(crate) const RETRY_BACKOFF_BASE_MS: u64 = 100;
pub(crate) const RETRY_BACKOFF_MAX_MS: u64 = 1_000;
pub(crate) const RETRY_AFTER_MAX_SECS: u64 = 30;

/// Statuses that signal a transient overload before any stream byte was sent.
#[inline]
pub(crate) fn should_retry_upstream_status(status: http::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 503 | 529)
}

/// Whether a failed send is worth repeating. Only failures that happen before
/// a response arrives reach this check, so no stream content is duplicated.
pub(crate) fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    should_retry_transport_message(&error_chain_message(err))
}

#[inline]
pub(crate) fn should_retry_transport_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 7] = [
        b"timed out",
        b"connection reset",
        b"connection aborted",
        b"broken pipe",
        b"connection refused",
        b"unexpected eof",
        b"connection closed before message completed",
    ];
    let haystack = message.as_bytes();
    NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

/// Display text of an error and all of its sources, joined with `": "`.
pub(crate) fn error_chain_message(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }

    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

#[inline]
pub(crate) fn retry_backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.min(10);
    let multiplier = 1_u64 << shift;
    Duration::from_millis(
        RETRY_BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(RETRY_BACKOFF_MAX_MS),
    )
}

/// Delay before retrying a retriable status: `Retry-After` when present,
/// exponential backoff otherwise.
#[inline]
pub(crate) fn retry_delay(headers: &http::HeaderMap, attempt: u32) -> Duration {
    parse_retry_after_delay(headers).unwrap_or_else(|| retry_backoff_delay(attempt))
}

/// `Retry-After` as delta-seconds or an HTTP date, capped at
/// [`RETRY_AFTER_MAX_SECS`].
pub(crate) fn parse_retry_after_delay(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds.min(RETRY_AFTER_MAX_SECS)));
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    let delay = target.duration_since(SystemTime::now()).unwrap_or_default();
    Some(delay.min(Duration::from_secs(RETRY_AFTER_MAX_SECS)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_upstream_status() {
        assert!(should_retry_upstream_status(
            http::StatusCode::TOO_MANY_REQUESTS
        ));
        assert!(should_retry_upstream_status(
            http::StatusCode::SERVICE_UNAVAILABLE
        ));
        assert!(should_retry_upstream_status(
            http::StatusCode::from_u16(529).unwrap()
        ));
        assert!(!should_retry_upstream_status(http::StatusCode::BAD_REQUEST));
        assert!(!should_retry_upstream_status(
            http::StatusCode::INTERNAL_SERVER_ERROR
        ));
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("5"));
        assert_eq!(
            parse_retry_after_delay(&headers),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_parse_retry_after_is_capped() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("3600"));
        assert_eq!(
            parse_retry_after_delay(&headers),
            Some(Duration::from_secs(RETRY_AFTER_MAX_SECS))
        );
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let target = SystemTime::now() + Duration::from_secs(2);
        let mut headers = http::HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            http::HeaderValue::from_str(&httpdate::fmt_http_date(target)).unwrap(),
        );
        let delay = parse_retry_after_delay(&headers).unwrap();
        assert!(delay <= Duration::from_secs(RETRY_AFTER_MAX_SECS));
    }

    #[test]
    fn test_parse_retry_after_invalid() {
        let mut headers = http::HeaderMap::new();
        headers.insert(RETRY_AFTER, http::HeaderValue::from_static("not-a-delay"));
        assert!(parse_retry_after_delay(&headers).is_none());
    }

    #[test]
    fn test_retry_delay_falls_back_to_backoff() {
        let headers = http::HeaderMap::new();
        assert_eq!(retry_delay(&headers, 0), Duration::from_millis(100));
        assert_eq!(retry_delay(&headers, 1), Duration::from_millis(200));
        assert_eq!(
            retry_backoff_delay(20),
            Duration::from_millis(RETRY_BACKOFF_MAX_MS)
        );
    }

    #[test]
    fn test_should_retry_transport_message() {
        assert!(should_retry_transport_message("Connection reset by peer (os error 104)"));
        assert!(should_retry_transport_message("operation timed out"));
        assert!(!should_retry_transport_message("invalid certificate"));
    }

    #[test]
    fn test_error_chain_message_includes_sources() {
        #[derive(Debug, thiserror::Error)]
        #[error("request failed")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::other("broken pipe"));
        let message = error_chain_message(&err);
        assert_eq!(message, "request failed: broken pipe");
        assert!(should_retry_transport_message(&message));
    }
}

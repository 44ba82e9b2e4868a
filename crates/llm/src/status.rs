//! Mapping of HTTP outcomes onto the provider failure taxonomy.

use std::time::Duration;

use pipeline::{ProviderError, TokenUsage};

/// Longest error body excerpt carried into an error message.
const BODY_EXCERPT: usize = 300;

/// Classifies a non-success HTTP status.
///
/// 401/403 are authentication failures, 429 is a rate limit (honouring
/// `retry-after`), and 408, 409, 5xx and Anthropic's 529 "overloaded" are
/// transient. Any other status means the request itself was wrong, which no
/// retry can fix, and is reported as a malformed exchange.
pub(crate) fn classify_status(status: u16, retry_after: Option<&str>, body: &str) -> ProviderError {
    let detail = excerpt(body);
    match status {
        401 | 403 => ProviderError::Authentication(format!("HTTP {status}: {detail}")),
        429 => ProviderError::RateLimited {
            retry_after: retry_after.and_then(parse_retry_after),
        },
        408 | 409 | 500..=599 => ProviderError::Transient(format!("HTTP {status}: {detail}")),
        _ => ProviderError::MalformedResponse {
            message: format!("HTTP {status}: {detail}"),
            usage: TokenUsage::default(),
        },
    }
}

/// Parses a `retry-after` header given in (possibly fractional) seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

/// Maps a transport-level failure. `timeout` is the configured request
/// timeout, reported when the client gave up waiting.
pub(crate) fn transport_error(err: &reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Transient(err.to_string())
    }
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    match body.char_indices().nth(BODY_EXCERPT) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

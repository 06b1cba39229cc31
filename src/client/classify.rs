//! Mapping raw HTTP outcomes onto [`Error`] variants.
//!
//! This is the only place status codes are interpreted; callers above it see classified
//! errors and their retryable flag.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;

use super::RequestKind;
use crate::Error;

pub(crate) const FORBIDDEN_SCOPE_HINT: &str = "re-authenticate with full scope";

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Longest server-requested wait that is honored. Larger hints are clamped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Obsolete HTTP-date forms still accepted by HTTP/1.1 recipients.
const RFC_850_FORMAT: &str = "%A, %d-%b-%y %H:%M:%S GMT";
const ASCTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Parse a `Retry-After` value given as delta-seconds or as an HTTP-date.
///
/// Dates may use the IMF-fixdate, RFC 850 or asctime forms. Returns `None` for empty,
/// unparseable, zero or past values, and clamps the rest to [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let seconds = match value.parse::<u64>() {
        Ok(seconds) => seconds,
        Err(_) => {
            let date = parse_http_date(value)?;
            let delta = (date - chrono::Utc::now()).num_seconds();
            u64::try_from(delta).ok()?
        }
    };
    (seconds > 0).then(|| Duration::from_secs(seconds).min(MAX_RETRY_AFTER))
}

fn parse_http_date(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(value) {
        return Some(date.with_timezone(&chrono::Utc));
    }
    [RFC_850_FORMAT, ASCTIME_FORMAT]
        .iter()
        .find_map(|format| chrono::NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

pub(crate) fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

/// Classify an unsuccessful status. `body` is the (already size-bounded) error body.
pub(crate) fn classify_status(
    status: u16,
    headers: &HeaderMap,
    body: &[u8],
    kind: RequestKind,
    url: &str,
    max_message_bytes: usize,
) -> Error {
    match status {
        401 => Error::auth("Authentication failed"),
        403 => Error::Forbidden {
            message: "Access denied".to_string(),
            hint: kind
                .is_mutation()
                .then(|| FORBIDDEN_SCOPE_HINT.to_string()),
        },
        404 => Error::NotFound(url.to_string()),
        429 => Error::RateLimit {
            retry_after: retry_after_header(headers),
        },
        502..=504 => Error::Gateway {
            status,
            retry_after: retry_after_header(headers),
        },
        500..=599 => Error::Server {
            status,
            message: error_message(body, max_message_bytes)
                .unwrap_or_else(|| format!("Server error ({})", status)),
        },
        _ => Error::Api {
            status,
            message: error_message(body, max_message_bytes)
                .unwrap_or_else(|| format!("Request failed (HTTP {})", status)),
        },
    }
}

fn error_message(body: &[u8], max_bytes: usize) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
    parsed
        .error
        .filter(|s| !s.is_empty())
        .or(parsed.message.filter(|s| !s.is_empty()))
        .map(|msg| truncate(&msg, max_bytes))
}

/// Truncate to at most `max_bytes`, ending in `...` when shortened.
pub(crate) fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let (budget, suffix) = if max_bytes <= 3 {
        (max_bytes, "")
    } else {
        (max_bytes - 3, "...")
    };
    let mut end = budget;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], suffix)
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn classify(status: u16, body: &[u8], kind: RequestKind) -> Error {
        classify_status(status, &HeaderMap::new(), body, kind, "https://x/1.json", 500)
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("0"), None);
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(120);
        let header = future.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let parsed = parse_retry_after(&header).unwrap();
        assert!(parsed > Duration::from_secs(100) && parsed <= Duration::from_secs(120));

        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_parse_retry_after_obsolete_date_forms() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(120);
        for format in [RFC_850_FORMAT, ASCTIME_FORMAT] {
            let header = future.format(format).to_string();
            let parsed = parse_retry_after(&header).unwrap();
            assert!(parsed > Duration::from_secs(100) && parsed <= Duration::from_secs(120));
        }

        assert_eq!(parse_retry_after("Sunday, 06-Nov-94 08:49:37 GMT"), None);
        assert_eq!(parse_retry_after("Sun Nov  6 08:49:37 1994"), None);
    }

    #[test]
    fn test_parse_retry_after_clamps_huge_hints() {
        assert_eq!(
            parse_retry_after("18446744073709551615"),
            Some(MAX_RETRY_AFTER)
        );
        assert_eq!(parse_retry_after("7200"), Some(MAX_RETRY_AFTER));

        let far = chrono::Utc::now() + chrono::Duration::days(365);
        let header = far.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        assert_eq!(parse_retry_after(&header), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify(401, b"", RequestKind::Read), Error::Auth { .. }));
        assert!(matches!(classify(404, b"", RequestKind::Read), Error::NotFound(_)));
        assert!(matches!(
            classify(500, b"", RequestKind::Read),
            Error::Server { status: 500, .. }
        ));
        assert!(matches!(
            classify(507, b"", RequestKind::Read),
            Error::Server { status: 507, .. }
        ));
        for status in [502, 503, 504] {
            let err = classify(status, b"", RequestKind::Read);
            assert!(matches!(err, Error::Gateway { .. }));
            assert!(err.is_retryable());
        }
        assert!(matches!(
            classify(422, b"", RequestKind::Read),
            Error::Api { status: 422, .. }
        ));
    }

    #[test]
    fn test_forbidden_hint_only_on_mutation() {
        match classify(403, b"", RequestKind::Mutation) {
            Error::Forbidden { hint, .. } => assert_eq!(hint.as_deref(), Some(FORBIDDEN_SCOPE_HINT)),
            other => panic!("unexpected {other:?}"),
        }
        match classify(403, b"", RequestKind::Read) {
            Error::Forbidden { hint, .. } => assert!(hint.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        let err = classify_status(429, &headers, b"", RequestKind::Read, "u", 500);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn test_error_body_message_is_truncated() {
        let long = "x".repeat(1000);
        let body = serde_json::json!({ "error": long }).to_string();
        match classify_status(422, &HeaderMap::new(), body.as_bytes(), RequestKind::Read, "u", 20) {
            Error::Api { message, .. } => {
                assert_eq!(message.len(), 20);
                assert!(message.ends_with("..."));
            }
            other => panic!("unexpected {other:?}"),
        }

        let body = br#"{"message":"Name can't be blank"}"#;
        match classify(422, body, RequestKind::Mutation) {
            Error::Api { message, .. } => assert_eq!(message, "Name can't be blank"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo wörld", 6), "hé...");
        assert_eq!(truncate("héllo", 5), "h...");
        assert_eq!(truncate("abcdef", 2), "ab");
    }
}

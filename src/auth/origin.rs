//! Origin normalization and endpoint security checks.

use url::{Host, Url};

use crate::{Error, Result};

/// Normalize a URL to its origin: `scheme://host[:port]`, lower-cased, default port
/// dropped. Credentials are partitioned by this value.
pub fn origin_of(url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| Error::usage(format!("invalid URL '{}': {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(Error::usage(format!("unsupported URL scheme: {}", other))),
    }
    if parsed.host().is_none() {
        return Err(Error::usage(format!("URL has no host: {}", url)));
    }
    Ok(parsed.origin().ascii_serialization())
}

/// Loopback hosts: `localhost`, `*.localhost`, `127.0.0.0/8` and `::1`.
pub fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.');
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Parse `url` and require HTTPS unless it points at a loopback host.
pub fn require_secure_endpoint(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|e| Error::usage(format!("invalid URL '{}': {}", url, e)))?;
    if parsed.scheme() == "https" || (parsed.scheme() == "http" && is_loopback(&parsed)) {
        Ok(parsed)
    } else {
        Err(Error::usage(format!("URL must use HTTPS: {}", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_normalization() {
        assert_eq!(
            origin_of("https://API.Example.com:443/v1/x?y=1").unwrap(),
            "https://api.example.com"
        );
        assert_eq!(
            origin_of("http://example.com:80/").unwrap(),
            "http://example.com"
        );
        assert_eq!(
            origin_of("https://example.com:8443/a").unwrap(),
            "https://example.com:8443"
        );
        assert_ne!(
            origin_of("https://a.example.com").unwrap(),
            origin_of("https://b.example.com").unwrap()
        );
    }

    #[test]
    fn test_origin_rejects_non_http() {
        assert!(origin_of("ftp://example.com").is_err());
        assert!(origin_of("not a url").is_err());
    }

    #[test]
    fn test_secure_endpoint() {
        assert!(require_secure_endpoint("https://auth.example.com/token").is_ok());
        assert!(require_secure_endpoint("http://localhost:3000/token").is_ok());
        assert!(require_secure_endpoint("http://127.0.0.1:9/token").is_ok());
        assert!(require_secure_endpoint("http://[::1]/token").is_ok());
        assert!(require_secure_endpoint("http://app.localhost/token").is_ok());
        assert!(require_secure_endpoint("http://auth.example.com/token").is_err());
        assert!(require_secure_endpoint("http://localhost.evil.com/token").is_err());
    }
}

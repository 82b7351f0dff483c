//! Parsers for the `proxy.yaml` mapping-key mini-DSL.
//!
//! A mapping key either describes an upstream to proxy to (port, host:port,
//! `[https]` prefix, optional path suffix, bracketed IPv6) or a local
//! directory to publish as a static site (`.`- or `/`-prefixed, optional
//! `:PORT` suffix). Both parsers are pure; [`parse_upstream`] is total and
//! never fails.

use anyhow::{bail, Result};

/// A backend server a routing key resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// `http` or `https`.
    pub scheme: String,
    /// IP address (v4 or v6, unbracketed) or hostname.
    pub host: String,
    /// Port, kept as written. Never empty.
    pub port: String,
    /// Optional path prefix including the leading `/`.
    pub path: String,
}

impl Upstream {
    fn new(scheme: &str, host: &str, port: &str, path: &str) -> Self {
        Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port: port.to_string(),
            path: path.to_string(),
        }
    }

    /// `host:port` with IPv6 hosts re-bracketed, as nginx expects.
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `scheme://host:port[/path]`, the form shown in the domain summary.
    pub fn display_target(&self) -> String {
        format!("{}://{}{}", self.scheme, self.addr(), self.path)
    }
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Parse a routing key into an [`Upstream`]. Total: every input produces a
/// structurally complete upstream; callers may validate further.
///
/// Recognized shapes:
/// - `1234` → `http://127.0.0.1:1234`
/// - `192.168.31.6:1234` / `example.local:8080` → direct host:port
/// - `192.168.31.6:1234/api` → host:port plus path prefix `/api`
/// - `[::1]:9000` → bracketed IPv6
/// - `[https]192.168.50.2:1234` → https scheme
/// - `[https]www.example.com` → https, default port 443
/// - `www.example.com` → http, default port 80
/// - a trailing `:` (historical YAML-key artifact) is stripped first
pub fn parse_upstream(key: &str) -> Upstream {
    let mut key = key.strip_suffix(':').unwrap_or(key);

    let scheme = if let Some(rest) = key.strip_prefix("[https]") {
        key = rest;
        "https"
    } else {
        "http"
    };

    // Split off a path suffix. A slash at position 0 is not a path split
    // (that shape is a static-site key, handled elsewhere).
    let mut path = "";
    if let Some(slash) = key.find('/') {
        if slash > 0 {
            path = &key[slash..];
            key = &key[..slash];
        }
    }

    // Bracketed IPv6: [host]:port
    if key.starts_with('[') {
        if let Some(close) = key.find(']') {
            if close + 1 < key.len() && key.as_bytes()[close + 1] == b':' {
                return Upstream::new(scheme, &key[1..close], &key[close + 2..], path);
            }
        }
    }

    if let Some(last_colon) = key.rfind(':') {
        let host = &key[..last_colon];
        let port = &key[last_colon + 1..];

        // ":8080" is a plain port; multiple unbracketed colons means a
        // malformed IPv6 written without brackets, treated as a plain port.
        if key.matches(':').count() > 1 {
            return Upstream::new(scheme, "127.0.0.1", key, path);
        }
        let default_port = if scheme == "https" { "443" } else { "80" };
        let port = if port.is_empty() { default_port } else { port };
        if host.is_empty() {
            return Upstream::new(scheme, "127.0.0.1", port, path);
        }
        return Upstream::new(scheme, host, port, path);
    }

    if is_numeric(key) {
        return Upstream::new(scheme, "127.0.0.1", key, path);
    }

    // Bare hostname: scheme default port. An empty key (e.g. a lone
    // "[https]" or ":") still yields a complete upstream.
    let default_port = if scheme == "https" { "443" } else { "80" };
    let host = if key.is_empty() { "127.0.0.1" } else { key };
    Upstream::new(scheme, host, default_port, path)
}

/// A routing key that publishes a local directory over HTTP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticSiteSpec {
    /// Directory to serve, as written (relative paths stay relative).
    pub dir: String,
    /// Explicit port, when the key carried a `:PORT` suffix.
    pub port: Option<u16>,
}

/// Recognize a static-site mapping key.
///
/// Returns `Ok(None)` when the key is not directory-shaped (does not start
/// with `.` or `/`), `Ok(Some(spec))` for a valid static-site key, and an
/// error for a directory-shaped key with an unusable port or empty path.
pub fn parse_static_site_key(key: &str) -> Result<Option<StaticSiteSpec>> {
    let k = key.trim().trim_end_matches(':').trim();
    if k.is_empty() || !(k.starts_with('.') || k.starts_with('/')) {
        return Ok(None);
    }

    if let Some(idx) = k.rfind(':') {
        if idx > 0 && idx < k.len() - 1 {
            let port_part = &k[idx + 1..];
            if is_numeric(port_part) {
                let port: u32 = port_part
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid static site port {:?}", port_part))?;
                if port == 0 || port > 65535 {
                    bail!("invalid static site port {}", port);
                }
                let dir = k[..idx].trim();
                if dir.is_empty() {
                    bail!("invalid static site path: empty");
                }
                return Ok(Some(StaticSiteSpec {
                    dir: dir.to_string(),
                    port: Some(port as u16),
                }));
            }
        }
    }

    Ok(Some(StaticSiteSpec {
        dir: k.to_string(),
        port: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn up(scheme: &str, host: &str, port: &str, path: &str) -> Upstream {
        Upstream::new(scheme, host, port, path)
    }

    #[test]
    fn test_parse_upstream_forms() {
        let cases = [
            ("1234", up("http", "127.0.0.1", "1234", "")),
            ("192.168.31.6:1234", up("http", "192.168.31.6", "1234", "")),
            (
                "192.168.31.6:1234/api",
                up("http", "192.168.31.6", "1234", "/api"),
            ),
            ("[::1]:9000", up("http", "::1", "9000", "")),
            (
                "example-server.local:8080",
                up("http", "example-server.local", "8080", ""),
            ),
            (
                "[https]192.168.50.2:1234",
                up("https", "192.168.50.2", "1234", ""),
            ),
            (
                "[https]www.example.com",
                up("https", "www.example.com", "443", ""),
            ),
            ("www.example.com", up("http", "www.example.com", "80", "")),
            // Trailing colon from YAML keys like "192.168.31.6:1234:".
            ("1234:", up("http", "127.0.0.1", "1234", "")),
            (
                "192.168.31.6:1234:",
                up("http", "192.168.31.6", "1234", ""),
            ),
            // Plain port written with a leading colon.
            (":8080", up("http", "127.0.0.1", "8080", "")),
            // Unbracketed IPv6 is malformed; kept total by treating the
            // whole key as a port.
            ("::1:9000", up("http", "127.0.0.1", "::1:9000", "")),
            (
                "[2001:db8::1]:3000",
                up("http", "2001:db8::1", "3000", ""),
            ),
            (
                "[https]secure.example.com:8443/v1",
                up("https", "secure.example.com", "8443", "/v1"),
            ),
        ];
        for (input, want) in cases {
            assert_eq!(parse_upstream(input), want, "input {:?}", input);
        }
    }

    #[test]
    fn test_parse_upstream_is_total() {
        for input in ["", ":", "::", "///", "[", "[]", "[https]", "a:b:c:d", "\u{1F980}"] {
            let u = parse_upstream(input);
            assert!(u.scheme == "http" || u.scheme == "https");
            assert!(!u.host.is_empty(), "empty host for {:?}", input);
            assert!(!u.port.is_empty(), "empty port for {:?}", input);
        }
    }

    #[test]
    fn test_addr_brackets_ipv6() {
        assert_eq!(parse_upstream("[2001:db8::1]:3000").addr(), "[2001:db8::1]:3000");
        assert_eq!(parse_upstream("10.0.0.1:80").addr(), "10.0.0.1:80");
    }

    #[test]
    fn test_parse_static_site_key() {
        assert_eq!(parse_static_site_key("1234").unwrap(), None);
        assert_eq!(parse_static_site_key("example.com:80").unwrap(), None);

        assert_eq!(
            parse_static_site_key("./site").unwrap(),
            Some(StaticSiteSpec {
                dir: "./site".to_string(),
                port: None
            })
        );
        assert_eq!(
            parse_static_site_key("/var/www/html:8080").unwrap(),
            Some(StaticSiteSpec {
                dir: "/var/www/html".to_string(),
                port: Some(8080)
            })
        );
        // Trailing colon artifact.
        assert_eq!(
            parse_static_site_key("./site:").unwrap(),
            Some(StaticSiteSpec {
                dir: "./site".to_string(),
                port: None
            })
        );
        // Non-numeric suffix is part of the directory name.
        assert_eq!(
            parse_static_site_key("./site:abc").unwrap(),
            Some(StaticSiteSpec {
                dir: "./site:abc".to_string(),
                port: None
            })
        );

        assert!(parse_static_site_key("/www:0").is_err());
        assert!(parse_static_site_key("/www:70000").is_err());
    }
}

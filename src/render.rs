//! Deterministic rendering of the effective nginx configuration.
//!
//! Pure text generation: `(routing, certs, cors, listen ports, dummy pair)`
//! in, one `nginx.conf` string out. No clocks, no filesystem access, so
//! the same inputs always produce byte-identical output and the result can
//! be written into a runtime snapshot before activation.

use crate::certs::CertMap;
use crate::config::{split_domain_path, CorsConfig, RoutingTable};
use crate::summary::domain_order;
use crate::upstream::{parse_upstream, Upstream};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Listen ports emitted into the rendered config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenPorts {
    pub http: String,
    pub https: String,
}

impl ListenPorts {
    /// Read `SSL_NGINX_HTTP_PORT` / `SSL_NGINX_HTTPS_PORT`, defaulting to
    /// 80 / 443.
    pub fn from_env() -> Self {
        let read = |name: &str, default: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self {
            http: read("SSL_NGINX_HTTP_PORT", "80"),
            https: read("SSL_NGINX_HTTPS_PORT", "443"),
        }
    }
}

impl Default for ListenPorts {
    fn default() -> Self {
        Self {
            http: "80".to_string(),
            https: "443".to_string(),
        }
    }
}

/// Everything the renderer needs, assembled by the orchestrator.
pub struct RenderInputs<'a> {
    /// Effective routing table (static-site keys already rewritten).
    pub ports: &'a RoutingTable,
    /// Base host → materialized certificate (paths inside `current/`).
    pub certs: &'a CertMap,
    pub cors: &'a BTreeMap<String, CorsConfig>,
    pub listen: ListenPorts,
    /// Self-signed pair backing the HTTPS fallback server.
    pub dummy_cert: PathBuf,
    pub dummy_key: PathBuf,
}

struct Route {
    upstream: Upstream,
    /// Location path (`""` for the root route).
    path: String,
}

/// Render the full nginx configuration text.
pub fn generate_config(inputs: &RenderInputs<'_>) -> String {
    let mut out = String::new();

    out.push_str(BASE_CONFIG);

    // Fallback for hosts (and strays) hitting the HTTPS port without a
    // matching TLS virtual host: redirect them back to HTTP instead of
    // serving a handshake error on an unrelated certificate.
    let _ = write!(
        out,
        r#"    # Default HTTPS server - redirect to HTTP for invalid/missing certificates
    server {{
        listen {https_port} ssl default_server;
        server_name _;

        # Dummy self-signed certificate
        ssl_certificate {dummy_cert};
        ssl_certificate_key {dummy_key};

        ssl_protocols TLSv1.2 TLSv1.3;
        ssl_ciphers HIGH:!aNULL:!MD5;

        location / {{
            return 301 http://$host$request_uri;
        }}
    }}

"#,
        https_port = inputs.listen.https,
        dummy_cert = inputs.dummy_cert.display(),
        dummy_key = inputs.dummy_key.display(),
    );

    // Group routes by base host.
    let mut host_routes: BTreeMap<String, Vec<Route>> = BTreeMap::new();
    for (key, domain_paths) in inputs.ports {
        let upstream = parse_upstream(key);
        for domain_path in domain_paths {
            let (host, path) = split_domain_path(domain_path);
            let host = host.trim().to_lowercase();
            if host.is_empty() {
                continue;
            }
            host_routes.entry(host).or_default().push(Route {
                upstream: upstream.clone(),
                path: path.to_string(),
            });
        }
    }

    let mut hosts: Vec<&String> = host_routes.keys().collect();
    hosts.sort_by(|a, b| domain_order(a.as_str(), b.as_str()));

    for host in hosts {
        let routes = &host_routes[host];
        let cors = cors_for_host(inputs.cors, host);

        let mut ordered: Vec<&Route> = routes.iter().collect();
        // Longest prefix first so nginx location matching picks the most
        // specific route; lexicographic within equal lengths keeps the
        // output stable.
        ordered.sort_by(|a, b| {
            b.path
                .len()
                .cmp(&a.path.len())
                .then_with(|| a.path.cmp(&b.path))
        });

        match inputs.certs.get(host) {
            Some(cert) => {
                // HTTP side: permanent redirect to HTTPS.
                let _ = write!(
                    out,
                    r#"    # HTTP to HTTPS redirect for {host}
    server {{
        listen {http_port};
        server_name {host};

        location / {{
            return 301 https://$host$request_uri;
        }}
    }}

"#,
                    host = host,
                    http_port = inputs.listen.http,
                );

                let _ = write!(
                    out,
                    r#"    # HTTPS server block for {host}
    server {{
        listen {https_port} ssl;
        server_name {host};
        ssl_certificate {cert};
        ssl_certificate_key {key};

        ssl_protocols TLSv1.2 TLSv1.3;
        ssl_ciphers HIGH:!aNULL:!MD5;
        ssl_prefer_server_ciphers on;

"#,
                    host = host,
                    https_port = inputs.listen.https,
                    cert = cert.cert_path.display(),
                    key = cert.key_path.display(),
                );
                for route in &ordered {
                    write_location(&mut out, route, cors, true);
                }
                out.push_str("    }\n\n");
            }
            None => {
                let _ = write!(
                    out,
                    r#"    # HTTP server block for {host} (no SSL)
    server {{
        listen {http_port};
        server_name {host};

"#,
                    host = host,
                    http_port = inputs.listen.http,
                );
                for route in &ordered {
                    write_location(&mut out, route, cors, false);
                }
                out.push_str("    }\n\n");
            }
        }
    }

    out.push_str("}\n");
    out
}

const BASE_CONFIG: &str = r#"user nginx;
worker_processes auto;
error_log /var/log/nginx/error.log warn;
pid /var/run/nginx.pid;

events {
    worker_connections 1024;
}

http {
    include /etc/nginx/mime.types;
    default_type application/octet-stream;

    log_format main '$remote_addr - $remote_user [$time_local] "$request" '
                    '$status $body_bytes_sent "$http_referer" '
                    '"$http_user_agent" "$http_x_forwarded_for"';

    access_log /var/log/nginx/access.log main;

    sendfile on;
    tcp_nopush on;
    tcp_nodelay on;
    keepalive_timeout 65;
    types_hash_max_size 2048;

    # Enable HTTP/2
    http2 on;

    # Allow large file uploads
    client_max_body_size 100M;

    # Proxy buffer settings
    proxy_buffering on;
    proxy_buffer_size 4k;
    proxy_buffers 8 4k;
    proxy_busy_buffers_size 8k;

"#;

/// Emit the location block(s) for one route. A non-root path gets an
/// exact-match redirect onto the trailing-slash form first, and the proxied
/// location strips the prefix by ending both location and upstream target
/// with `/`.
fn write_location(out: &mut String, route: &Route, cors: Option<&CorsConfig>, tls: bool) {
    let trimmed = route.path.trim_end_matches('/');
    let location = if trimmed.is_empty() {
        "/".to_string()
    } else {
        let _ = write!(
            out,
            r#"        location = {trimmed} {{
            return 301 $scheme://$host{trimmed}/;
        }}

"#,
        );
        format!("{trimmed}/")
    };
    let proxy_pass = upstream_target(&route.upstream);

    let secure_cookie = if tls {
        "\n            # Set Secure flag for cookies when using HTTPS\n            proxy_cookie_path / \"/; Secure\";\n"
    } else {
        ""
    };

    let _ = write!(
        out,
        r#"        location {location} {{
            proxy_pass {proxy_pass};
            proxy_http_version 1.1;

            # Standard proxy headers
            proxy_set_header Host $host;
            proxy_set_header X-Real-IP $remote_addr;
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
            proxy_set_header X-Forwarded-Host $http_host;
            proxy_set_header X-Forwarded-Proto $scheme;

            # WebSocket support
            proxy_set_header Upgrade $http_upgrade;
            proxy_set_header Connection "upgrade";
{secure_cookie}
            # Timeouts
            proxy_connect_timeout 60s;
            proxy_send_timeout 60s;
            proxy_read_timeout 60s;

{cors}
        }}

"#,
        cors = cors_headers(cors),
    );
}

/// Upstream target with the location prefix stripped: the configured
/// upstream path plus a trailing slash.
fn upstream_target(upstream: &Upstream) -> String {
    let base_path = upstream.path.trim_end_matches('/');
    format!("{}://{}{}/", upstream.scheme, upstream.addr(), base_path)
}

fn cors_for_host<'a>(
    cors: &'a BTreeMap<String, CorsConfig>,
    host: &str,
) -> Option<&'a CorsConfig> {
    cors.get(host).or_else(|| cors.get("*"))
}

const DEFAULT_ALLOW_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];
const DEFAULT_ALLOW_HEADERS: &[&str] = &[
    "DNT",
    "User-Agent",
    "X-Requested-With",
    "If-Modified-Since",
    "Cache-Control",
    "Content-Type",
    "Range",
    "Authorization",
];
const DEFAULT_EXPOSE_HEADERS: &[&str] = &["Content-Length", "Content-Range"];
const DEFAULT_MAX_AGE: u64 = 1728000; // 20 days

/// The CORS directives for one location, defaults applied, with the
/// OPTIONS preflight early-return.
fn cors_headers(config: Option<&CorsConfig>) -> String {
    let empty = CorsConfig::default();
    let config = config.unwrap_or(&empty);

    let allow_origin = if config.allow_origin.is_empty() {
        "*"
    } else {
        &config.allow_origin
    };
    let methods = if config.allow_methods.is_empty() {
        DEFAULT_ALLOW_METHODS.join(", ")
    } else {
        config.allow_methods.join(", ")
    };
    let headers = if config.allow_headers.is_empty() {
        DEFAULT_ALLOW_HEADERS.join(",")
    } else {
        config.allow_headers.join(",")
    };
    let expose = if config.expose_headers.is_empty() {
        DEFAULT_EXPOSE_HEADERS.join(",")
    } else {
        config.expose_headers.join(",")
    };
    let max_age = if config.max_age == 0 {
        DEFAULT_MAX_AGE
    } else {
        config.max_age
    };

    let mut out = String::new();
    out.push_str("            # CORS configuration\n");
    let _ = writeln!(
        out,
        "            add_header 'Access-Control-Allow-Origin' '{allow_origin}' always;"
    );
    let _ = writeln!(
        out,
        "            add_header 'Access-Control-Allow-Methods' '{methods}' always;"
    );
    let _ = writeln!(
        out,
        "            add_header 'Access-Control-Allow-Headers' '{headers}' always;"
    );
    let _ = writeln!(
        out,
        "            add_header 'Access-Control-Expose-Headers' '{expose}' always;"
    );
    if config.allow_credentials {
        out.push_str("            add_header 'Access-Control-Allow-Credentials' 'true' always;\n");
    }

    out.push_str("\n            # Handle OPTIONS preflight requests\n");
    out.push_str("            if ($request_method = 'OPTIONS') {\n");
    let _ = writeln!(
        out,
        "                add_header 'Access-Control-Allow-Origin' '{allow_origin}' always;"
    );
    let _ = writeln!(
        out,
        "                add_header 'Access-Control-Allow-Methods' '{methods}' always;"
    );
    let _ = writeln!(
        out,
        "                add_header 'Access-Control-Allow-Headers' '{headers}' always;"
    );
    if config.allow_credentials {
        out.push_str(
            "                add_header 'Access-Control-Allow-Credentials' 'true' always;\n",
        );
    }
    let _ = writeln!(
        out,
        "                add_header 'Access-Control-Max-Age' {max_age} always;"
    );
    out.push_str("                add_header 'Content-Type' 'text/plain; charset=utf-8';\n");
    out.push_str("                add_header 'Content-Length' 0;\n");
    out.push_str("                return 204;\n");
    out.push_str("            }");
    out
}

/// Where the dummy self-signed pair lives inside its directory. The
/// fallback server is unconditional, so the pair must exist before any
/// rendered config is tested.
pub fn dummy_pair_paths(dummy_dir: &Path) -> (PathBuf, PathBuf) {
    (dummy_dir.join("dummy.crt"), dummy_dir.join("dummy.key"))
}

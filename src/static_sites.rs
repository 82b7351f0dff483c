//! Directory-backed static sites.
//!
//! A routing key starting with `.` or `/` publishes a local directory over
//! HTTP on loopback. Each reload reconciles the running set against the
//! desired set: unchanged sites keep their listener (and auto-assigned
//! port), new sites bind before the proxy config is rendered, and the
//! outcome decides who survives: on success replaced servers stop, on
//! failure the newly bound ones do. The effective routing table handed to
//! the renderer has every directory key rewritten to its loopback port.

use crate::config::RoutingTable;
use crate::upstream::parse_static_site_key;
use anyhow::{anyhow, bail, Result};
use axum::Router;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

/// Auto-allocated ports start here.
const AUTO_PORT_START: u16 = 10000;

struct RunningSite {
    dir: PathBuf,
    port: u16,
    handle: JoinHandle<()>,
}

impl RunningSite {
    fn stop(&self) {
        self.handle.abort();
    }
}

/// Changes staged by [`StaticSiteSupervisor::prepare`], resolved by
/// `commit` or `rollback` depending on how the reload went.
pub struct PendingStaticSites {
    keep: HashSet<String>,
    added: HashMap<String, RunningSite>,
}

#[derive(Default)]
pub struct StaticSiteSupervisor {
    sites: Mutex<HashMap<String, RunningSite>>,
}

impl StaticSiteSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile running servers against the routing table and return the
    /// effective table (directory keys rewritten to ports) plus the
    /// pending change set. Per-mapping failures are logged and skip that
    /// mapping only.
    pub fn prepare(&self, ports: &RoutingTable) -> (RoutingTable, PendingStaticSites) {
        struct Desired {
            dir: PathBuf,
            port: Option<u16>,
            domains: Vec<String>,
        }

        let mut desired: HashMap<String, Desired> = HashMap::new();
        for (key, domains) in ports {
            match parse_static_site_key(key) {
                Ok(Some(spec)) => {
                    desired.insert(
                        key.clone(),
                        Desired {
                            dir: PathBuf::from(spec.dir),
                            port: spec.port,
                            domains: domains.clone(),
                        },
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    error!(key = %key, error = %e, "invalid static site mapping");
                }
            }
        }

        let mut sites = self.sites.lock();

        if desired.is_empty() {
            // Nothing desired: every currently-running site is obsolete,
            // but only a successful reload may stop it.
            return (
                ports.clone(),
                PendingStaticSites {
                    keep: HashSet::new(),
                    added: HashMap::new(),
                },
            );
        }

        // Keep running servers whose directory (and fixed port, if any)
        // still match; auto-port sites keep their assigned port to avoid
        // churn.
        let mut keep: HashSet<String> = HashSet::new();
        for (key, want) in &desired {
            if let Some(current) = sites.get(key) {
                let same_dir = clean_path(&current.dir) == clean_path(&want.dir);
                let port_ok = match want.port {
                    Some(p) => current.port == p,
                    None => true,
                };
                if same_dir && port_ok {
                    keep.insert(key.clone());
                }
            }
        }

        // Ports nobody may claim: kept servers, plain numeric routing
        // keys, and (progressively) every port bound below.
        let mut reserved: HashSet<u16> = HashSet::new();
        for key in &keep {
            reserved.insert(sites[key].port);
        }
        for key in ports.keys() {
            let trimmed = key.trim().trim_end_matches(':');
            if let Ok(p) = trimmed.parse::<u16>() {
                reserved.insert(p);
            }
        }

        // Fixed-port sites bind first so auto-allocation cannot steal
        // their ports.
        let mut added: HashMap<String, RunningSite> = HashMap::new();
        let mut start_order: Vec<&String> = desired
            .keys()
            .filter(|k| !keep.contains(*k))
            .collect();
        start_order.sort_by_key(|k| (desired[*k].port.is_none(), (*k).clone()));
        for key in start_order {
            let want = &desired[key];
            match start_site(key, want.dir.clone(), want.port, &reserved) {
                Ok(site) => {
                    reserved.insert(site.port);
                    added.insert(key.clone(), site);
                }
                Err(e) => {
                    error!(key = %key, error = %e, "static site failed to start, skipping mapping");
                }
            }
        }

        // Effective table: drop directory keys, re-add them as ports.
        let mut effective: RoutingTable = ports
            .iter()
            .filter(|(k, _)| !desired.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, want) in &desired {
            let port = if let Some(site) = added.get(key) {
                site.port
            } else if keep.contains(key) {
                sites[key].port
            } else {
                continue; // failed to start above
            };
            let port_key = port.to_string();
            if effective.contains_key(&port_key) {
                // Never silently merge two different destinations.
                error!(
                    key = %key,
                    port = port,
                    "static site port collides with an existing routing key, skipping"
                );
                if let Some(site) = added.remove(key) {
                    site.stop();
                }
                continue;
            }
            effective.insert(port_key, want.domains.clone());
        }

        (effective, PendingStaticSites { keep, added })
    }

    /// The reload succeeded: adopt the new servers and stop the ones no
    /// route references anymore.
    pub fn commit(&self, pending: PendingStaticSites) {
        let mut sites = self.sites.lock();
        let mut next: HashMap<String, RunningSite> = HashMap::new();

        for (key, site) in sites.drain() {
            if pending.keep.contains(&key) {
                next.insert(key, site);
            } else {
                info!(key = %key, port = site.port, "stopping retired static site");
                site.stop();
            }
        }
        for (key, site) in pending.added {
            next.insert(key, site);
        }
        *sites = next;
    }

    /// The reload failed: stop only the newly bound servers, leave the
    /// kept ones alone.
    pub fn rollback(&self, pending: PendingStaticSites) {
        for (key, site) in pending.added {
            info!(key = %key, port = site.port, "stopping static site after failed reload");
            site.stop();
        }
    }

    /// Stop everything. Used on shutdown.
    pub fn stop_all(&self) {
        let mut sites = self.sites.lock();
        for (_, site) in sites.drain() {
            site.stop();
        }
    }

    /// Port assigned to a mapping key, if its server is running.
    pub fn port_of(&self, key: &str) -> Option<u16> {
        self.sites.lock().get(key).map(|s| s.port)
    }
}

fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn start_site(
    key: &str,
    dir: PathBuf,
    fixed_port: Option<u16>,
    reserved: &HashSet<u16>,
) -> Result<RunningSite> {
    if !dir.is_dir() {
        bail!("path is not a directory: {}", dir.display());
    }

    let (listener, port) = match fixed_port {
        Some(port) => {
            if reserved.contains(&port) {
                bail!("port {port} is already reserved");
            }
            (bind_loopback(port)?, port)
        }
        None => {
            let mut found = None;
            for port in AUTO_PORT_START..=u16::MAX {
                if reserved.contains(&port) {
                    continue;
                }
                if let Ok(listener) = bind_loopback(port) {
                    found = Some((listener, port));
                    break;
                }
            }
            found.ok_or_else(|| anyhow!("no available port found from {AUTO_PORT_START}"))?
        }
    };

    listener.set_nonblocking(true)?;
    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    let app = Router::new()
        .fallback_service(ServeDir::new(&dir).append_index_html_on_directories(true));

    let serve_key = key.to_string();
    let handle = tokio::spawn(async move {
        info!(key = %serve_key, port = port, "static site enabled");
        if let Err(e) = axum::serve(tokio_listener, app).await {
            warn!(key = %serve_key, error = %e, "static site server stopped");
        }
    });

    Ok(RunningSite { dir, port, handle })
}

fn bind_loopback(port: u16) -> std::io::Result<StdTcpListener> {
    StdTcpListener::bind(("127.0.0.1", port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn table(entries: &[(&str, &[&str])]) -> RoutingTable {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    fn free_port() -> u16 {
        StdTcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_prepare_rewrites_directory_key_to_port() {
        let tmp = TempDir::new().unwrap();
        let site_dir = tmp.path().join("site");
        fs::create_dir_all(&site_dir).unwrap();
        fs::write(site_dir.join("index.html"), "<h1>hi</h1>").unwrap();

        let supervisor = StaticSiteSupervisor::new();
        let key = site_dir.to_string_lossy().into_owned();
        let ports = table(&[(key.as_str(), &["site.example.com"])]);

        let (effective, pending) = supervisor.prepare(&ports);
        assert!(!effective.contains_key(&key));
        let (port_key, domains) = effective.iter().next().expect("rewritten entry");
        let port: u16 = port_key.parse().expect("numeric key");
        assert!(port >= AUTO_PORT_START);
        assert_eq!(domains, &vec!["site.example.com".to_string()]);

        // The listener is live before commit.
        tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("listener is bound");

        supervisor.commit(pending);
        assert_eq!(supervisor.port_of(&key), Some(port));
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn test_prepare_keeps_auto_port_across_reloads() {
        let tmp = TempDir::new().unwrap();
        let site_dir = tmp.path().join("site");
        fs::create_dir_all(&site_dir).unwrap();

        let supervisor = StaticSiteSupervisor::new();
        let key = site_dir.to_string_lossy().into_owned();
        let ports = table(&[(key.as_str(), &["site.example.com"])]);

        let (_, pending) = supervisor.prepare(&ports);
        supervisor.commit(pending);
        let first = supervisor.port_of(&key).unwrap();

        let (effective, pending) = supervisor.prepare(&ports);
        assert!(pending.added.is_empty(), "unchanged site must be kept");
        supervisor.commit(pending);
        assert_eq!(supervisor.port_of(&key), Some(first));
        assert!(effective.contains_key(&first.to_string()));
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn test_rollback_stops_new_servers_only() {
        let tmp = TempDir::new().unwrap();
        let kept_dir = tmp.path().join("kept");
        let new_dir = tmp.path().join("new");
        fs::create_dir_all(&kept_dir).unwrap();
        fs::create_dir_all(&new_dir).unwrap();

        let supervisor = StaticSiteSupervisor::new();
        let kept_key = kept_dir.to_string_lossy().into_owned();
        let (_, pending) = supervisor.prepare(&table(&[(kept_key.as_str(), &["a.com"])]));
        supervisor.commit(pending);
        let kept_port = supervisor.port_of(&kept_key).unwrap();

        let new_key = new_dir.to_string_lossy().into_owned();
        let (_, pending) = supervisor.prepare(&table(&[
            (kept_key.as_str(), &["a.com"]),
            (new_key.as_str(), &["b.com"]),
        ]));
        supervisor.rollback(pending);

        // The kept listener survives the failed reload.
        tokio::net::TcpStream::connect(("127.0.0.1", kept_port))
            .await
            .expect("kept site still listening");
        assert_eq!(supervisor.port_of(&new_key), None);
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn test_explicit_port_is_used() {
        let tmp = TempDir::new().unwrap();
        let site_dir = tmp.path().join("site");
        fs::create_dir_all(&site_dir).unwrap();

        let port = free_port();
        let supervisor = StaticSiteSupervisor::new();
        let key = format!("{}:{port}", site_dir.to_string_lossy());
        let (effective, pending) = supervisor.prepare(&table(&[(key.as_str(), &["a.com"])]));
        assert!(effective.contains_key(&port.to_string()));
        supervisor.commit(pending);
        assert_eq!(supervisor.port_of(&key), Some(port));
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn test_missing_directory_skips_mapping() {
        let tmp = TempDir::new().unwrap();
        let supervisor = StaticSiteSupervisor::new();
        let key = tmp.path().join("does-not-exist").to_string_lossy().into_owned();
        let ports = table(&[(key.as_str(), &["a.com"]), ("1234", &["b.com"])]);

        let (effective, pending) = supervisor.prepare(&ports);
        // The broken mapping disappears; the healthy one survives.
        assert_eq!(effective.len(), 1);
        assert!(effective.contains_key("1234"));
        supervisor.commit(pending);
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn test_port_collision_with_numeric_key_skips_mapping() {
        let tmp = TempDir::new().unwrap();
        let site_dir = tmp.path().join("site");
        fs::create_dir_all(&site_dir).unwrap();

        let port = free_port();
        let supervisor = StaticSiteSupervisor::new();
        let key = format!("{}:{port}", site_dir.to_string_lossy());
        let port_str = port.to_string();
        let ports = table(&[
            (key.as_str(), &["a.com"]),
            (port_str.as_str(), &["b.com"]),
        ]);

        let (effective, pending) = supervisor.prepare(&ports);
        // The numeric key wins; the static mapping is dropped.
        assert_eq!(effective.get(&port_str).unwrap(), &vec!["b.com".to_string()]);
        supervisor.commit(pending);
        assert_eq!(supervisor.port_of(&key), None);
        supervisor.stop_all();
    }
}

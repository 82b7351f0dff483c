//! The runtime snapshot cache.
//!
//! Certificates referenced by the routing table are materialized under
//! `stage/<id>/certs/` with sanitized names, the rendered nginx.conf joins
//! them under `stage/<id>/nginx/`, and activation promotes the stage to
//! `current/` by rename. The proxy only ever reads `current/`, so editing
//! the user-owned TLS tree never disturbs a running configuration.

use crate::certs::{find_certificate, CertMap, Certificate};
use crate::config::{collect_base_hosts, RoutingTable};
use crate::fsutil;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub struct RuntimeCache {
    root: PathBuf,
}

impl RuntimeCache {
    pub fn new(runtime_dir: &Path) -> Result<Self> {
        Ok(Self {
            root: fsutil::absolutize(runtime_dir)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, snapshot_id: &str) -> PathBuf {
        self.root.join("stage").join(snapshot_id)
    }

    pub fn current_dir(&self) -> PathBuf {
        self.root.join("current")
    }

    pub fn old_dir(&self) -> PathBuf {
        self.root.join("old")
    }

    /// Copy the selected certificate for every base host the routing table
    /// references into the stage, and return the map the renderer should
    /// use: same hosts, but with paths pointing into the *future*
    /// `current/` directory so the rendered config survives the swap.
    pub fn stage_certificates(
        &self,
        snapshot_id: &str,
        ports: &RoutingTable,
        scanned: &CertMap,
    ) -> Result<CertMap> {
        let stage_dir = self.stage_dir(snapshot_id);
        let current_dir = self.current_dir();

        // Fresh stage.
        let _ = std::fs::remove_dir_all(&stage_dir);
        std::fs::create_dir_all(stage_dir.join("certs"))
            .with_context(|| format!("failed to create stage {}", stage_dir.display()))?;

        let mut active = CertMap::new();
        for host in collect_base_hosts(ports) {
            let Some(cert) = find_certificate(scanned, &host) else {
                continue;
            };
            if cert.key_path.as_os_str().is_empty() {
                continue;
            }

            let safe = sanitize_host_for_file_name(&host);
            let cert_ext = file_extension_or(&cert.cert_path, "pem");
            let key_ext = file_extension_or(&cert.key_path, "key");

            // The infixes keep cert and key distinct even when both source
            // files share a stem (e.g. both named foo.pem).
            let stage_cert_name = format!("{safe}.cert.{cert_ext}");
            let stage_key_name = format!("{safe}.key.{key_ext}");

            fsutil::copy_file(&cert.cert_path, &stage_dir.join("certs").join(&stage_cert_name))
                .with_context(|| format!("failed to copy cert for {host}"))?;
            fsutil::copy_file(&cert.key_path, &stage_dir.join("certs").join(&stage_key_name))
                .with_context(|| format!("failed to copy key for {host}"))?;

            active.insert(
                host,
                Certificate {
                    cert_path: current_dir.join("certs").join(stage_cert_name),
                    key_path: current_dir.join("certs").join(stage_key_name),
                    not_after: cert.not_after,
                },
            );
        }

        Ok(active)
    }

    /// Store the rendered proxy configuration inside the stage.
    pub fn write_nginx_conf(&self, snapshot_id: &str, nginx_conf: &str) -> Result<()> {
        let path = self.stage_dir(snapshot_id).join("nginx").join("nginx.conf");
        std::fs::create_dir_all(path.parent().expect("stage nginx dir has a parent"))?;
        std::fs::write(&path, nginx_conf)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Promote the stage to `current/` by rename. The previous `current/`
    /// is kept as `old/` for one generation; on a failed swap the previous
    /// `current/` is restored best-effort.
    pub fn activate(&self, snapshot_id: &str) -> Result<()> {
        let stage_dir = self.stage_dir(snapshot_id);
        let current_dir = self.current_dir();
        let old_dir = self.old_dir();
        std::fs::create_dir_all(&self.root)?;

        let _ = std::fs::remove_dir_all(&old_dir);
        let had_current = current_dir.exists();
        if had_current {
            std::fs::rename(&current_dir, &old_dir)
                .with_context(|| "failed to retire current runtime snapshot".to_string())?;
        }

        if !stage_dir.is_dir() {
            if had_current {
                let _ = std::fs::rename(&old_dir, &current_dir);
            }
            anyhow::bail!("runtime stage {} does not exist", stage_dir.display());
        }
        if let Err(e) = std::fs::rename(&stage_dir, &current_dir) {
            if had_current {
                let _ = std::fs::rename(&old_dir, &current_dir);
            }
            return Err(e).with_context(|| "failed to activate runtime snapshot".to_string());
        }
        Ok(())
    }
}

/// Map a host to a safe file stem: anything outside `[a-z0-9._-]` becomes
/// `_`.
pub fn sanitize_host_for_file_name(host: &str) -> String {
    let host = host.trim().to_lowercase();
    if host.is_empty() {
        return "unknown".to_string();
    }
    host.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

fn file_extension_or(path: &Path, default: &str) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .filter(|e| !e.is_empty())
        .unwrap_or_else(|| default.to_string())
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

    #[test]
    fn test_sanitize_host_for_file_name() {
        assert_eq!(sanitize_host_for_file_name("A.Example.COM"), "a.example.com");
        assert_eq!(sanitize_host_for_file_name("*.example.com"), "_.example.com");
        assert_eq!(sanitize_host_for_file_name("  "), "unknown");
        assert_eq!(sanitize_host_for_file_name("a_b-c.d"), "a_b-c.d");
    }

    #[test]
    fn test_stage_gives_distinct_names_for_shared_stem() {
        let tmp = TempDir::new().unwrap();
        let ssl = tmp.path().join("ssl");
        fs::create_dir_all(&ssl).unwrap();
        // Cert and key sharing one stem and extension.
        fs::write(ssl.join("foo.pem"), "CERT").unwrap();
        fs::write(ssl.join("foo.key.pem"), "KEY").unwrap();

        let mut scanned = CertMap::new();
        scanned.insert(
            "a.com".to_string(),
            Certificate {
                cert_path: ssl.join("foo.pem"),
                key_path: ssl.join("foo.key.pem"),
                not_after: 100,
            },
        );

        let cache = RuntimeCache::new(&tmp.path().join("runtime")).unwrap();
        let active = cache
            .stage_certificates("20240101T000000.000000000Z", &table(&[("1234", &["a.com"])]), &scanned)
            .unwrap();

        let stage_certs = cache.stage_dir("20240101T000000.000000000Z").join("certs");
        let names: Vec<String> = fs::read_dir(&stage_certs)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2, "got: {names:?}");
        assert!(names.contains(&"a.com.cert.pem".to_string()));
        assert!(names.contains(&"a.com.key.pem".to_string()));

        // The active map points into the future current/ directory.
        let cert = active.get("a.com").unwrap();
        assert!(cert.cert_path.starts_with(cache.current_dir()));
        assert!(cert.key_path.starts_with(cache.current_dir()));
    }

    #[test]
    fn test_stage_resolves_wildcards_to_base_host_names() {
        let tmp = TempDir::new().unwrap();
        let ssl = tmp.path().join("ssl");
        fs::create_dir_all(&ssl).unwrap();
        fs::write(ssl.join("wild.pem"), "CERT").unwrap();
        fs::write(ssl.join("wild.key"), "KEY").unwrap();

        let mut scanned = CertMap::new();
        scanned.insert(
            "*.example.com".to_string(),
            Certificate {
                cert_path: ssl.join("wild.pem"),
                key_path: ssl.join("wild.key"),
                not_after: 100,
            },
        );

        let cache = RuntimeCache::new(&tmp.path().join("runtime")).unwrap();
        let active = cache
            .stage_certificates("id1", &table(&[("1234", &["app.example.com"])]), &scanned)
            .unwrap();

        let cert = active.get("app.example.com").expect("wildcard matched");
        assert!(cert
            .cert_path
            .to_string_lossy()
            .contains("app.example.com.cert.pem"));
    }

    #[test]
    fn test_activate_rotates_current_to_old() {
        let tmp = TempDir::new().unwrap();
        let cache = RuntimeCache::new(&tmp.path().join("runtime")).unwrap();

        fs::create_dir_all(cache.stage_dir("id1")).unwrap();
        fs::write(cache.stage_dir("id1").join("marker"), "one").unwrap();
        cache.activate("id1").unwrap();
        assert_eq!(
            fs::read_to_string(cache.current_dir().join("marker")).unwrap(),
            "one"
        );
        assert!(!cache.old_dir().exists());

        fs::create_dir_all(cache.stage_dir("id2")).unwrap();
        fs::write(cache.stage_dir("id2").join("marker"), "two").unwrap();
        cache.activate("id2").unwrap();
        assert_eq!(
            fs::read_to_string(cache.current_dir().join("marker")).unwrap(),
            "two"
        );
        assert_eq!(
            fs::read_to_string(cache.old_dir().join("marker")).unwrap(),
            "one"
        );
        assert!(!cache.stage_dir("id2").exists());
    }

    #[test]
    fn test_activate_missing_stage_restores_previous_current() {
        let tmp = TempDir::new().unwrap();
        let cache = RuntimeCache::new(&tmp.path().join("runtime")).unwrap();

        fs::create_dir_all(cache.stage_dir("id1")).unwrap();
        fs::write(cache.stage_dir("id1").join("marker"), "one").unwrap();
        cache.activate("id1").unwrap();

        assert!(cache.activate("missing").is_err());
        assert_eq!(
            fs::read_to_string(cache.current_dir().join("marker")).unwrap(),
            "one"
        );
    }

    #[test]
    fn test_stage_then_activate_round_trip() {
        let tmp = TempDir::new().unwrap();
        let ssl = tmp.path().join("ssl");
        fs::create_dir_all(&ssl).unwrap();
        fs::write(ssl.join("a.pem"), "CERT-A").unwrap();
        fs::write(ssl.join("a.key"), "KEY-A").unwrap();

        let mut scanned = CertMap::new();
        scanned.insert(
            "a.com".to_string(),
            Certificate {
                cert_path: ssl.join("a.pem"),
                key_path: ssl.join("a.key"),
                not_after: 100,
            },
        );

        let cache = RuntimeCache::new(&tmp.path().join("runtime")).unwrap();
        let active = cache
            .stage_certificates("id1", &table(&[("1234", &["a.com"])]), &scanned)
            .unwrap();
        cache.write_nginx_conf("id1", "server {}\n").unwrap();
        cache.activate("id1").unwrap();

        // Every path the renderer saw now exists with the staged content.
        let cert = active.get("a.com").unwrap();
        assert_eq!(fs::read_to_string(&cert.cert_path).unwrap(), "CERT-A");
        assert_eq!(fs::read_to_string(&cert.key_path).unwrap(), "KEY-A");
        assert_eq!(
            fs::read_to_string(cache.current_dir().join("nginx/nginx.conf")).unwrap(),
            "server {}\n"
        );
    }
}

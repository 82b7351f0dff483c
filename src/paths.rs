//! Filesystem layout for the supervisor.
//!
//! All components receive their directories through [`Paths`] instead of
//! hard-coded constants, so tests can point the whole pipeline at a
//! temporary tree.

use std::path::{Path, PathBuf};

/// Name of the internal backup subtree under the configuration directory.
pub const BACKUP_DIR_NAME: &str = ".sslly-backups";
/// Name of the internal runtime-cache subtree under the configuration directory.
pub const RUNTIME_DIR_NAME: &str = ".sslly-runtime";

const EXAMPLE_DIR_DEFAULT: &str = "/etc/sslly/configs";

/// Resolved locations of everything the supervisor reads or writes.
#[derive(Debug, Clone)]
pub struct Paths {
    /// User-owned directory holding `proxy.yaml`, `cors.yaml`, `logs.yaml`.
    pub config_dir: PathBuf,
    /// User-owned directory holding TLS certificates and keys.
    pub ssl_dir: PathBuf,
    /// Internal runtime cache (`stage/`, `current/`, `old/`).
    pub runtime_dir: PathBuf,
    /// Internal backup root (`state.json`, `snapshots/`).
    pub backup_root: PathBuf,
    /// The rendered proxy configuration consumed by nginx.
    pub nginx_conf: PathBuf,
    /// The nginx executable. Tests substitute a stub script.
    pub nginx_binary: PathBuf,
    /// PID file written after the proxy child is spawned.
    pub nginx_pid_file: PathBuf,
    /// Directory holding example config files used to materialize missing
    /// optional configs.
    pub example_dir: PathBuf,
}

impl Paths {
    /// Production layout: relative `configs/` and `ssl/` mounts, system
    /// nginx. `SSLLY_EXAMPLE_DIR` overrides where example configs come from.
    pub fn production() -> Self {
        let config_dir = PathBuf::from("./configs");
        Self::new(
            config_dir,
            PathBuf::from("./ssl"),
            PathBuf::from("/etc/nginx/nginx.conf"),
            PathBuf::from("nginx"),
            PathBuf::from("/var/run/nginx.pid"),
        )
    }

    /// Build a layout rooted at explicit directories. The backup and runtime
    /// subtrees always live inside `config_dir`.
    pub fn new(
        config_dir: PathBuf,
        ssl_dir: PathBuf,
        nginx_conf: PathBuf,
        nginx_binary: PathBuf,
        nginx_pid_file: PathBuf,
    ) -> Self {
        let runtime_dir = config_dir.join(RUNTIME_DIR_NAME);
        let backup_root = config_dir.join(BACKUP_DIR_NAME);
        let example_dir = std::env::var_os("SSLLY_EXAMPLE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(EXAMPLE_DIR_DEFAULT));
        Self {
            config_dir,
            ssl_dir,
            runtime_dir,
            backup_root,
            nginx_conf,
            nginx_binary,
            nginx_pid_file,
            example_dir,
        }
    }

    /// Directory holding the dummy self-signed pair used by the HTTPS
    /// fallback server block.
    pub fn dummy_cert_dir(&self) -> PathBuf {
        self.runtime_dir.join("dummy")
    }
}

/// True when `path` lies inside one of the supervisor's internal subtrees.
/// Used to keep the watchers (and thus the reload loop) blind to our own
/// writes.
pub fn is_internal_path(path: &Path) -> bool {
    path.components().any(|c| {
        matches!(
            c.as_os_str().to_str(),
            Some(BACKUP_DIR_NAME) | Some(RUNTIME_DIR_NAME)
        )
    })
}

//! Crash-safe snapshot bookkeeping.
//!
//! A reload wraps its work in `begin` / `commit` (or `abort`). The state
//! file records which snapshot is in progress and which one last passed
//! the proxy's own checks; a process that dies between `begin` and
//! `commit` leaves the marker behind, and the next startup restores the
//! last-good snapshot. Restores only ever touch the runtime cache and the
//! rendered nginx.conf, never the user-owned `configs/` or `ssl/` trees.

use crate::fsutil;
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How many snapshot directories survive pruning, beyond last-good.
const KEEP_SNAPSHOTS: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct State {
    #[serde(rename = "lastGood", default)]
    last_good: String,
    #[serde(rename = "inProgress", default)]
    in_progress: String,
    #[serde(rename = "lastGoodAt", default, skip_serializing_if = "String::is_empty")]
    last_good_at: String,
    #[serde(rename = "inProgressAt", default, skip_serializing_if = "String::is_empty")]
    in_progress_at: String,
}

pub struct BackupManager {
    mu: Mutex<()>,
    backup_root: PathBuf,
    config_dir: PathBuf,
    ssl_dir: PathBuf,
    runtime_dir: PathBuf,
    nginx_conf: PathBuf,
}

impl BackupManager {
    pub fn new(
        backup_root: &Path,
        config_dir: &Path,
        ssl_dir: &Path,
        runtime_dir: &Path,
        nginx_conf: &Path,
    ) -> Result<Self> {
        let manager = Self {
            mu: Mutex::new(()),
            backup_root: fsutil::absolutize(backup_root)?,
            config_dir: fsutil::absolutize(config_dir)?,
            ssl_dir: fsutil::absolutize(ssl_dir)?,
            runtime_dir: fsutil::absolutize(runtime_dir)?,
            nginx_conf: nginx_conf.to_path_buf(),
        };
        std::fs::create_dir_all(manager.snapshots_dir())
            .context("failed to create backup snapshots directory")?;
        Ok(manager)
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.backup_root.join("snapshots")
    }

    fn state_path(&self) -> PathBuf {
        self.backup_root.join("state.json")
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.snapshots_dir().join(id)
    }

    /// Mark a new snapshot attempt as in progress and return its id. If
    /// the process dies before `commit`/`abort` clears the marker, the
    /// next start rolls back.
    pub fn begin(&self) -> Result<String> {
        let _guard = self.mu.lock();
        let mut state = self.read_state()?;

        let id = generate_snapshot_id();
        std::fs::create_dir_all(self.snapshot_path(&id))
            .context("failed to create snapshot directory")?;

        state.in_progress = id.clone();
        state.in_progress_at = rfc3339_now();
        self.write_state(&state)?;
        Ok(id)
    }

    /// Clear the in-progress marker (when it still names `id`) and remove
    /// the snapshot directory best-effort.
    pub fn abort(&self, id: &str) -> Result<()> {
        let _guard = self.mu.lock();
        let mut state = self.read_state()?;
        if state.in_progress == id {
            state.in_progress.clear();
            state.in_progress_at.clear();
            self.write_state(&state)?;
        }
        let _ = std::fs::remove_dir_all(self.snapshot_path(id));
        Ok(())
    }

    /// Capture the current configuration into the snapshot and promote it
    /// to last-good.
    pub fn commit(&self, id: &str) -> Result<()> {
        let _guard = self.mu.lock();
        let mut state = self.read_state()?;
        if state.in_progress != id {
            bail!("snapshot {id} is not in progress");
        }

        let snap_dir = self.snapshot_path(id);
        let config_dst = snap_dir.join("configs");
        let ssl_dst = snap_dir.join("ssl");
        let runtime_dst = snap_dir.join("runtime");
        let nginx_dst = snap_dir.join("nginx").join("nginx.conf");

        let _ = std::fs::remove_dir_all(&config_dst);
        let _ = std::fs::remove_dir_all(&ssl_dst);
        let _ = std::fs::remove_dir_all(&runtime_dst);
        let _ = std::fs::remove_dir_all(snap_dir.join("nginx"));

        // The backup root lives inside the config dir; never recurse into
        // our own snapshots.
        let backup_root = self.backup_root.clone();
        fsutil::copy_dir(
            &self.config_dir,
            &config_dst,
            Some(&|p: &Path| p == backup_root || fsutil::is_under(p, &backup_root)),
        )
        .context("failed to copy configs into snapshot")?;
        fsutil::copy_dir(&self.ssl_dir, &ssl_dst, None)
            .context("failed to copy ssl into snapshot")?;
        match fsutil::copy_dir(&self.runtime_dir, &runtime_dst, None) {
            Ok(()) => {}
            // The runtime dir may not exist on the very first run.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to copy runtime into snapshot"),
        }
        match fsutil::copy_file(&self.nginx_conf, &nginx_dst) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to copy nginx.conf into snapshot"),
        }

        state.last_good = id.to_string();
        state.last_good_at = rfc3339_now();
        state.in_progress.clear();
        state.in_progress_at.clear();
        self.write_state(&state)?;

        self.prune_snapshots(&state);
        Ok(())
    }

    /// Restore runtime cache and nginx.conf from the last-good snapshot.
    pub fn restore_last_good(&self) -> Result<()> {
        let _guard = self.mu.lock();
        let state = self.read_state()?;
        if state.last_good.is_empty() {
            bail!("no last-good snapshot available");
        }
        self.restore_snapshot(&state.last_good)
    }

    /// Detect a crash mid-reload (an in-progress marker left on disk) and
    /// restore last-good. Returns whether a restore happened. With no
    /// last-good to return to the marker is still cleared, so startup
    /// cannot loop forever.
    pub fn maybe_restore_after_crash(&self) -> Result<bool> {
        let _guard = self.mu.lock();
        let mut state = self.read_state()?;
        if state.in_progress.is_empty() {
            return Ok(false);
        }
        if state.last_good.is_empty() {
            state.in_progress.clear();
            state.in_progress_at.clear();
            self.write_state(&state)?;
            return Ok(false);
        }

        self.restore_snapshot(&state.last_good)?;
        state.in_progress.clear();
        state.in_progress_at.clear();
        self.write_state(&state)?;
        Ok(true)
    }

    /// The id of the last committed snapshot, if any.
    pub fn last_good(&self) -> Result<Option<String>> {
        let _guard = self.mu.lock();
        let state = self.read_state()?;
        Ok(Some(state.last_good).filter(|s| !s.is_empty()))
    }

    /// The id of the snapshot currently marked in progress, if any.
    pub fn in_progress(&self) -> Result<Option<String>> {
        let _guard = self.mu.lock();
        let state = self.read_state()?;
        Ok(Some(state.in_progress).filter(|s| !s.is_empty()))
    }

    fn restore_snapshot(&self, id: &str) -> Result<()> {
        let snap_dir = self.snapshot_path(id);
        let runtime_src = snap_dir.join("runtime");
        let nginx_src = snap_dir.join("nginx").join("nginx.conf");

        // Rollback is limited to the runtime cache and nginx.conf; the
        // user-owned configs/ and ssl/ trees are never written.
        fsutil::replace_dir_contents(&self.runtime_dir, &runtime_src)
            .context("failed to restore runtime cache")?;
        match fsutil::copy_file(&nginx_src, &self.nginx_conf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).context("failed to restore nginx.conf"),
        }
        Ok(())
    }

    /// Drop old snapshot directories, keeping the newest [`KEEP_SNAPSHOTS`]
    /// plus last-good. Best-effort.
    fn prune_snapshots(&self, state: &State) {
        let Ok(entries) = std::fs::read_dir(self.snapshots_dir()) else {
            return;
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        // Snapshot ids are UTC timestamps, so lexicographic order is
        // chronological.
        ids.sort();
        if ids.len() <= KEEP_SNAPSHOTS {
            return;
        }
        let cutoff = ids.len() - KEEP_SNAPSHOTS;
        for id in &ids[..cutoff] {
            if *id == state.last_good || *id == state.in_progress {
                continue;
            }
            debug!(id = %id, "pruning old snapshot");
            let _ = std::fs::remove_dir_all(self.snapshot_path(id));
        }
    }

    fn read_state(&self) -> Result<State> {
        match std::fs::read(self.state_path()) {
            Ok(data) => serde_json::from_slice(&data).context("failed to parse backup state"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(State::default()),
            Err(e) => Err(e).context("failed to read backup state"),
        }
    }

    fn write_state(&self, state: &State) -> Result<()> {
        let data = serde_json::to_vec_pretty(state).context("failed to marshal backup state")?;
        if let Err(e) = fsutil::write_file_atomic(&self.state_path(), &data) {
            warn!(error = %e, "failed to persist backup state");
            return Err(e);
        }
        Ok(())
    }
}

/// Snapshot ids are UTC timestamps with nanosecond precision, so they are
/// unique, monotonically increasing and sort chronologically.
pub fn generate_snapshot_id() -> String {
    let fmt = time::macros::format_description!(
        "[year][month][day]T[hour][minute][second].[subsecond digits:9]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&fmt)
        .expect("UTC timestamp always formats")
}

fn rfc3339_now() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

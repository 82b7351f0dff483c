//! Control of the external nginx process.
//!
//! The supervisor owns nginx as a foreground child: start spawns it with
//! `daemon off`, its stdout/stderr are pumped into the `nginx` log target,
//! and a graceful reload is a config test followed by SIGHUP to the
//! tracked PID. The orchestrator distinguishes a failed config test
//! (rollback) from a missing process (restart) through [`NginxError`].

use crate::logging::LogController;
use crate::paths::Paths;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum NginxError {
    /// `nginx -t` rejected the configuration; the payload is its combined
    /// output.
    #[error("nginx configuration test failed: {0}")]
    ConfigTest(String),
    /// No tracked nginx process; the orchestrator should start one
    /// instead of reloading.
    #[error("nginx process not found")]
    NotRunning,
    #[error("failed to signal nginx: {0}")]
    Signal(nix::Error),
    #[error("nginx i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct NginxManager {
    binary: PathBuf,
    conf_path: PathBuf,
    pid_file: PathBuf,
    settle_delay: Duration,
    log: Arc<LogController>,
    child: Mutex<Option<Child>>,
}

impl NginxManager {
    pub fn new(paths: &Paths, log: Arc<LogController>) -> Self {
        Self {
            binary: paths.nginx_binary.clone(),
            conf_path: paths.nginx_conf.clone(),
            pid_file: paths.nginx_pid_file.clone(),
            settle_delay: Duration::from_secs(2),
            log,
            child: Mutex::new(None),
        }
    }

    /// Shorten the post-spawn settle wait. Tests use this.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Spawn nginx in the foreground and track the child. Stale PID files
    /// are removed first; the fresh PID is recorded after a short settle
    /// wait.
    pub async fn start(&self) -> Result<(), NginxError> {
        info!("starting nginx");
        let _ = std::fs::remove_file(&self.pid_file);

        let mut child = Command::new(&self.binary)
            .arg("-g")
            .arg("daemon off;")
            .arg("-c")
            .arg(&self.conf_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_stdout(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_stderr(stderr, Arc::clone(&self.log)));
        }

        tokio::time::sleep(self.settle_delay).await;

        if let Some(pid) = child.id() {
            if let Err(e) = std::fs::write(&self.pid_file, format!("{pid}\n")) {
                warn!(error = %e, path = %self.pid_file.display(), "failed to write PID file");
            }
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Terminate the child. Idempotent.
    pub async fn stop(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            info!("stopping nginx");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Test the configuration, then ask the tracked process to reload
    /// gracefully via SIGHUP.
    pub async fn reload(&self) -> Result<(), NginxError> {
        info!("reloading nginx");
        self.config_test().await?;

        let guard = self.child.lock().await;
        let pid = guard
            .as_ref()
            .and_then(|child| child.id())
            .ok_or(NginxError::NotRunning)?;
        kill(Pid::from_raw(pid as i32), Signal::SIGHUP).map_err(NginxError::Signal)?;
        Ok(())
    }

    /// Re-run the config test; non-zero exit is unhealthy.
    pub async fn check_health(&self) -> Result<(), NginxError> {
        self.config_test().await
    }

    async fn config_test(&self) -> Result<(), NginxError> {
        let output = Command::new(&self.binary)
            .arg("-t")
            .arg("-c")
            .arg(&self.conf_path)
            .output()
            .await?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(NginxError::ConfigTest(combined.trim().to_string()));
        }
        Ok(())
    }
}

async fn pump_stdout(stdout: tokio::process::ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.is_empty() {
            info!(target: "nginx", "{line}");
        }
    }
}

async fn pump_stderr(stderr: tokio::process::ChildStderr, log: Arc<LogController>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        if log.nginx_stderr_is_warn() {
            warn!(target: "nginx", "{line}");
        } else {
            error!(target: "nginx", "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn stub_nginx(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("nginx-stub");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn manager_with(tmp: &TempDir, script: &str) -> NginxManager {
        let binary = stub_nginx(tmp.path(), script);
        let paths = Paths::new(
            tmp.path().join("configs"),
            tmp.path().join("ssl"),
            tmp.path().join("nginx.conf"),
            binary,
            tmp.path().join("nginx.pid"),
        );
        NginxManager::new(&paths, LogController::disabled())
            .with_settle_delay(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_check_health_passes_with_ok_config_test() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(&tmp, "#!/bin/sh\nexit 0\n");
        manager.check_health().await.unwrap();
    }

    #[tokio::test]
    async fn test_config_test_failure_carries_diagnostics() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(
            &tmp,
            "#!/bin/sh\necho 'nginx: [emerg] unknown directive' >&2\nexit 1\n",
        );
        let err = manager.check_health().await.unwrap_err();
        match err {
            NginxError::ConfigTest(output) => {
                assert!(output.contains("unknown directive"), "got: {output}");
            }
            other => panic!("expected ConfigTest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reload_without_process_is_not_running() {
        let tmp = TempDir::new().unwrap();
        let manager = manager_with(&tmp, "#!/bin/sh\nexit 0\n");
        let err = manager.reload().await.unwrap_err();
        assert!(matches!(err, NginxError::NotRunning));
    }

    #[tokio::test]
    async fn test_start_records_pid_and_stop_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        // `-t` invocations pass; the daemon invocation survives SIGHUP.
        let manager = manager_with(
            &tmp,
            "#!/bin/sh\nif [ \"$1\" = \"-t\" ]; then exit 0; fi\ntrap '' HUP\nsleep 60\n",
        );

        manager.start().await.unwrap();
        let pid: u32 = fs::read_to_string(tmp.path().join("nginx.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(pid > 0);

        // With a live process, reload signals instead of failing.
        manager.reload().await.unwrap();

        manager.stop().await;
        manager.stop().await;
    }
}

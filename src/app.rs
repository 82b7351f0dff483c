//! The reload orchestrator.
//!
//! Owns every component and drives the pipeline: watch → debounce → load →
//! prepare static sites → scan → stage → render → activate → proxy reload →
//! health check → commit. Reload bodies are serialized by one mutex; any
//! failure past the snapshot `begin` aborts it and restores the last-good
//! configuration, so the proxy keeps serving whatever last passed its own
//! config test.

use crate::backup::{generate_snapshot_id, BackupManager};
use crate::certs::{self, CertMap, ScanReport};
use crate::config::{self, Config, RoutingTable};
use crate::logging::LogController;
use crate::nginx::{NginxError, NginxManager};
use crate::paths::{is_internal_path, Paths};
use crate::render::{self, ListenPorts, RenderInputs};
use crate::runtime_cache::RuntimeCache;
use crate::static_sites::StaticSiteSupervisor;
use crate::summary::DomainSummary;
use crate::watcher::{PathFilter, PathWatcher};
use anyhow::{Context, Result};
use notify::EventKind;
use rcgen::{CertificateParams, KeyPair};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Quiet period after the last filesystem event before a reload runs.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(800);

#[derive(Default)]
struct ReloadState {
    /// Effective configuration of the last apply (static-site keys already
    /// rewritten to ports).
    config: Config,
    /// Base host → materialized certificate inside `current/`.
    active_certs: CertMap,
    report: ScanReport,
    /// In-memory copy of the last config text nginx accepted, the fallback
    /// when even the snapshot restore fails.
    last_good_conf: String,
}

pub struct App {
    paths: Paths,
    runtime: RuntimeCache,
    backup: BackupManager,
    nginx: NginxManager,
    static_sites: StaticSiteSupervisor,
    log: Arc<LogController>,
    state: Mutex<ReloadState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    reload_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<()>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// Build the application. Returns `Arc<Self>` because the watcher and
    /// debounce tasks each hold a reference.
    pub fn new(paths: Paths, log: Arc<LogController>) -> Result<Arc<Self>> {
        Self::with_nginx_settle_delay(paths, log, Duration::from_secs(2))
    }

    /// Like [`App::new`] with a custom post-spawn settle wait for the
    /// proxy. Tests shorten it.
    pub fn with_nginx_settle_delay(
        paths: Paths,
        log: Arc<LogController>,
        settle: Duration,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&paths.config_dir)
            .with_context(|| format!("failed to create {}", paths.config_dir.display()))?;
        std::fs::create_dir_all(&paths.ssl_dir)
            .with_context(|| format!("failed to create {}", paths.ssl_dir.display()))?;

        let runtime = RuntimeCache::new(&paths.runtime_dir)?;
        let backup = BackupManager::new(
            &paths.backup_root,
            &paths.config_dir,
            &paths.ssl_dir,
            &paths.runtime_dir,
            &paths.nginx_conf,
        )
        .context("failed to initialize backup manager")?;
        let nginx = NginxManager::new(&paths, Arc::clone(&log)).with_settle_delay(settle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            paths,
            runtime,
            backup,
            nginx,
            static_sites: StaticSiteSupervisor::new(),
            log,
            state: Mutex::new(ReloadState::default()),
            shutdown_tx,
            shutdown_rx,
            reload_tx: parking_lot::Mutex::new(None),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    pub fn backup(&self) -> &BackupManager {
        &self.backup
    }

    pub fn runtime(&self) -> &RuntimeCache {
        &self.runtime
    }

    /// Initial apply, proxy start, then watcher setup. Errors here are
    /// fatal (except missing certificates, which only degrade hosts to
    /// HTTP).
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        ensure_dummy_certificate(&self.paths.dummy_cert_dir())?;

        // A previous run that died mid-reload left its marker behind.
        if self
            .backup
            .maybe_restore_after_crash()
            .context("failed crash recovery restore")?
        {
            warn!("detected previous crash mid-reload; restored last known-good configuration");
        }

        let snapshot_id = match self.backup.begin() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to begin startup snapshot");
                None
            }
        };

        let mut state = self.state.lock().await;
        if let Err(e) = self
            .apply_configuration(&mut state, snapshot_id.as_deref())
            .await
        {
            self.abort_snapshot(snapshot_id.as_deref());
            return Err(e).context("initial setup failed");
        }

        if let Err(e) = self.nginx.start().await {
            self.abort_snapshot(snapshot_id.as_deref());
            return Err(e).context("failed to start nginx");
        }
        if let Err(e) = self.nginx.check_health().await {
            self.abort_snapshot(snapshot_id.as_deref());
            return Err(e).context("nginx health check failed after initial start");
        }

        if let Some(id) = &snapshot_id {
            if let Err(e) = self.backup.commit(id) {
                warn!(error = %e, "failed to commit startup snapshot");
            }
        }

        self.save_good_configuration(&mut state);
        self.log_summary(&state);
        drop(state);

        self.spawn_watchers()?;
        info!("application started successfully");
        Ok(())
    }

    /// Queue a reload request into the debounce window. Any number of
    /// calls within the window collapse into one reload.
    pub fn schedule_reload(&self) {
        if let Some(tx) = self.reload_tx.lock().as_ref() {
            let _ = tx.send(());
        }
    }

    /// One full reload body. Serialized by the state mutex; every failure
    /// path aborts the snapshot and rolls back.
    pub async fn handle_reload(&self) {
        let mut state = self.state.lock().await;
        info!("reloading configuration...");

        let snapshot_id = match self.backup.begin() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to begin reload snapshot");
                None
            }
        };

        // Kept so a failed attempt can fall back to describing what is
        // actually still being served.
        let previous = (
            state.config.clone(),
            state.active_certs.clone(),
            state.report.clone(),
        );

        if let Err(e) = self
            .apply_configuration(&mut state, snapshot_id.as_deref())
            .await
        {
            error!(error = %format!("{e:#}"), snapshot = ?snapshot_id, "failed to reload configuration");
            self.roll_back(&mut state, snapshot_id.as_deref(), previous).await;
            return;
        }

        if let Err(e) = self.reload_or_start_proxy().await {
            error!(error = %e, snapshot = ?snapshot_id, "failed to reload nginx");
            self.roll_back(&mut state, snapshot_id.as_deref(), previous).await;
            if let Err(e) = self.nginx.reload().await {
                error!(error = %e, "failed to restore nginx");
            }
            return;
        }

        if let Err(e) = self.nginx.check_health().await {
            error!(error = %e, snapshot = ?snapshot_id, "nginx health check failed after reload");
            self.roll_back(&mut state, snapshot_id.as_deref(), previous).await;
            if let Err(e) = self.nginx.reload().await {
                error!(error = %e, "failed to restore nginx");
            }
            return;
        }

        if let Some(id) = &snapshot_id {
            if let Err(e) = self.backup.commit(id) {
                warn!(error = %e, "failed to commit reload snapshot");
            }
        }

        self.save_good_configuration(&mut state);
        self.log_summary(&state);
        info!("configuration reloaded successfully");
    }

    /// Stop watchers, the debounce timer, static sites and the proxy. An
    /// in-flight reload is left to finish (or die with its in-progress
    /// marker intact, which the next start recovers).
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        *self.reload_tx.lock() = None;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;

        self.static_sites.stop_all();
        self.nginx.stop().await;
        info!("shutdown complete");
    }

    /// Load, prepare static sites, scan, stage, render, activate, write.
    /// Static servers bound for this attempt are stopped again when
    /// anything fails.
    async fn apply_configuration(
        &self,
        state: &mut ReloadState,
        snapshot_id: Option<&str>,
    ) -> Result<()> {
        let config = config::load(&self.paths.config_dir, &self.paths.example_dir)
            .context("failed to load config")?;

        let (effective_ports, pending) = self.static_sites.prepare(&config.ports);
        match self
            .apply_inner(state, &config, effective_ports, snapshot_id)
            .await
        {
            Ok(()) => {
                self.static_sites.commit(pending);
                Ok(())
            }
            Err(e) => {
                self.static_sites.rollback(pending);
                Err(e)
            }
        }
    }

    async fn apply_inner(
        &self,
        state: &mut ReloadState,
        config: &Config,
        effective_ports: RoutingTable,
        snapshot_id: Option<&str>,
    ) -> Result<()> {
        self.log.apply(&config.log);

        let (scanned, report) = certs::scan_certificates(&self.paths.ssl_dir)
            .context("failed to scan certificates")?;

        let generated;
        let id = match snapshot_id {
            Some(id) => id,
            None => {
                generated = generate_snapshot_id();
                &generated
            }
        };

        let active = self
            .runtime
            .stage_certificates(id, &effective_ports, &scanned)
            .context("failed to stage runtime certificates")?;

        let (dummy_cert, dummy_key) = render::dummy_pair_paths(&self.paths.dummy_cert_dir());
        let inputs = RenderInputs {
            ports: &effective_ports,
            certs: &active,
            cors: &config.cors,
            listen: ListenPorts::from_env(),
            dummy_cert,
            dummy_key,
        };
        let nginx_conf = render::generate_config(&inputs);

        self.runtime
            .write_nginx_conf(id, &nginx_conf)
            .context("failed to write runtime nginx.conf")?;
        self.runtime
            .activate(id)
            .context("failed to activate runtime snapshot")?;

        if let Some(parent) = self.paths.nginx_conf.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.paths.nginx_conf, &nginx_conf)
            .context("failed to write nginx config")?;

        state.config = Config {
            log: config.log.clone(),
            cors: config.cors.clone(),
            ports: effective_ports,
        };
        state.active_certs = active;
        state.report = report;

        info!("nginx configuration generated successfully");
        Ok(())
    }

    /// A reload against a vanished proxy process becomes a start.
    async fn reload_or_start_proxy(&self) -> Result<(), NginxError> {
        match self.nginx.reload().await {
            Err(NginxError::NotRunning) => {
                warn!("no tracked nginx process, starting one instead of reloading");
                self.nginx.start().await
            }
            other => other,
        }
    }

    /// Failure path of a reload: abort the snapshot, restore the on-disk
    /// last-good state, revert the in-memory view, and show what is still
    /// being served.
    async fn roll_back(
        &self,
        state: &mut ReloadState,
        snapshot_id: Option<&str>,
        previous: (Config, CertMap, ScanReport),
    ) {
        self.abort_snapshot(snapshot_id);
        self.restore_good_configuration(state).await;
        (state.config, state.active_certs, state.report) = previous;
        self.log_summary(state);
    }

    fn abort_snapshot(&self, snapshot_id: Option<&str>) {
        if let Some(id) = snapshot_id {
            if let Err(e) = self.backup.abort(id) {
                warn!(error = %e, snapshot = id, "failed to abort snapshot");
            }
        }
    }

    fn save_good_configuration(&self, state: &mut ReloadState) {
        match std::fs::read_to_string(&self.paths.nginx_conf) {
            Ok(conf) => state.last_good_conf = conf,
            Err(e) => warn!(error = %e, "failed to save good configuration"),
        }
    }

    /// Prefer the last-good snapshot (runtime cache + nginx.conf); fall
    /// back to the in-memory config text when even that fails.
    async fn restore_good_configuration(&self, state: &mut ReloadState) {
        match self.backup.restore_last_good() {
            Ok(()) => {
                info!("restored previous good configuration snapshot");
                self.save_good_configuration(state);
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to restore good snapshot");
            }
        }

        if state.last_good_conf.is_empty() {
            warn!("no good configuration to restore");
            return;
        }
        if let Err(e) = std::fs::write(&self.paths.nginx_conf, &state.last_good_conf) {
            error!(error = %e, "failed to restore good configuration");
        } else {
            info!("restored previous good configuration");
        }
    }

    fn log_summary(&self, state: &ReloadState) {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        DomainSummary::build(&state.config.ports, &state.active_certs, &state.report, now).log();
    }

    /// Start the two watcher consumers and the debounce task.
    fn spawn_watchers(self: &Arc<Self>) -> Result<()> {
        let filter: PathFilter = Arc::new(|p: &Path| !is_internal_path(p));

        let config_watcher = PathWatcher::new(&self.paths.config_dir, Some(Arc::clone(&filter)))
            .context("failed to create config watcher")?;
        let ssl_watcher = PathWatcher::new(&self.paths.ssl_dir, Some(filter))
            .context("failed to create ssl watcher")?;

        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        *self.reload_tx.lock() = Some(reload_tx);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(consume_watcher(
            config_watcher,
            "config",
            false,
            Arc::clone(self),
            self.shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(consume_watcher(
            ssl_watcher,
            "ssl",
            true,
            Arc::clone(self),
            self.shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(debounce_loop(
            Arc::clone(self),
            reload_rx,
            self.shutdown_rx.clone(),
        )));
        Ok(())
    }
}

/// Forward interesting watcher events into the debounce mailbox.
/// Removals only matter for the TLS tree (a deleted cert must downgrade
/// its host); config files are rewritten, not removed.
async fn consume_watcher(
    mut watcher: PathWatcher,
    label: &'static str,
    trigger_on_remove: bool,
    app: Arc<App>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut events_open = true;
    let mut errors_open = true;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    watcher.stop();
                    break;
                }
            }
            event = watcher.events.recv(), if events_open => {
                match event {
                    None => events_open = false,
                    Some(event) => {
                        let interesting = matches!(
                            event.kind,
                            EventKind::Create(_) | EventKind::Modify(_)
                        ) || (trigger_on_remove && matches!(event.kind, EventKind::Remove(_)));
                        if interesting {
                            debug!(watcher = label, paths = ?event.paths, "file changed");
                            app.schedule_reload();
                        }
                    }
                }
            }
            err = watcher.errors.recv(), if errors_open => {
                match err {
                    None => errors_open = false,
                    Some(e) => error!(watcher = label, error = %e, "watcher error"),
                }
            }
        }
        if !events_open && !errors_open {
            break;
        }
    }
}

/// Collapse bursts of reload requests: the first request arms the window,
/// every further request within it re-arms it, and one reload runs per
/// quiet window.
async fn debounce_loop(
    app: Arc<App>,
    mut reload_rx: mpsc::UnboundedReceiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    'outer: loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            tick = reload_rx.recv() => {
                if tick.is_none() {
                    break;
                }
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break 'outer;
                            }
                        }
                        more = reload_rx.recv() => {
                            if more.is_none() {
                                break 'outer;
                            }
                            // Window re-arms on the next loop iteration.
                        }
                        _ = tokio::time::sleep(DEBOUNCE_WINDOW) => {
                            app.handle_reload().await;
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Make sure the self-signed pair backing the HTTPS fallback server exists.
fn ensure_dummy_certificate(dir: &Path) -> Result<()> {
    let (cert_path, key_path) = render::dummy_pair_paths(dir);
    if cert_path.is_file() && key_path.is_file() {
        return Ok(());
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let params = CertificateParams::new(vec!["localhost".to_string()])
        .context("failed to build dummy certificate params")?;
    let key_pair = KeyPair::generate().context("failed to generate dummy key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign dummy certificate")?;

    std::fs::write(&cert_path, cert.pem()).context("failed to write dummy certificate")?;
    std::fs::write(&key_path, key_pair.serialize_pem()).context("failed to write dummy key")?;
    info!(cert = %cert_path.display(), "generated dummy fallback certificate");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_dummy_certificate_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("dummy");

        ensure_dummy_certificate(&dir).unwrap();
        let (cert_path, key_path) = render::dummy_pair_paths(&dir);
        let first = std::fs::read(&cert_path).unwrap();
        assert!(key_path.is_file());

        ensure_dummy_certificate(&dir).unwrap();
        assert_eq!(std::fs::read(&cert_path).unwrap(), first);
    }
}

//! Recursive directory watching.
//!
//! Wraps a platform watcher so that a directory and every current *and
//! future* subdirectory is observed. Raw OS events are forwarded by a
//! dedicated thread into bounded channels; a full event channel surfaces
//! as an error instead of a silent drop. An optional filter keeps
//! internal subtrees (backup and runtime caches) out of both registration
//! and delivery, so the supervisor's own writes never echo back as
//! change events. The watcher is a pure edge producer: debouncing and
//! interpretation happen downstream.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};
use walkdir::WalkDir;

/// Returns true when the path should be watched / delivered.
pub type PathFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

const EVENT_BUFFER: usize = 1024;
const ERROR_BUFFER: usize = 64;

enum RawMessage {
    Notify(notify::Result<Event>),
    Stop,
}

pub struct PathWatcher {
    /// Create/write/remove events, already filtered.
    pub events: mpsc::Receiver<Event>,
    /// Watcher errors, including buffer overflow.
    pub errors: mpsc::Receiver<notify::Error>,
    control: std::sync::mpsc::Sender<RawMessage>,
    forwarder: Option<std::thread::JoinHandle<()>>,
}

impl PathWatcher {
    /// Watch `root` recursively. `filter` (when given) is consulted with
    /// canonicalized directory paths during registration and with event
    /// paths on delivery.
    pub fn new(root: &Path, filter: Option<PathFilter>) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve watch root {}", root.display()))?;

        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<RawMessage>();
        let callback_tx = raw_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = callback_tx.send(RawMessage::Notify(res));
        })
        .context("failed to create filesystem watcher")?;

        register_tree(&mut watcher, &root, filter.as_ref())?;

        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (error_tx, errors) = mpsc::channel(ERROR_BUFFER);
        let forwarder = std::thread::spawn(move || {
            forward_loop(watcher, raw_rx, event_tx, error_tx, filter);
        });

        Ok(Self {
            events,
            errors,
            control: raw_tx,
            forwarder: Some(forwarder),
        })
    }

    /// Close the OS watcher and, once the forwarder has drained, both
    /// channels.
    pub fn stop(&mut self) {
        let _ = self.control.send(RawMessage::Stop);
        if let Some(handle) = self.forwarder.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Register `dir` and every subdirectory the filter accepts.
fn register_tree(
    watcher: &mut RecommendedWatcher,
    dir: &Path,
    filter: Option<&PathFilter>,
) -> Result<()> {
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry
            .path()
            .canonicalize()
            .unwrap_or_else(|_| entry.path().to_path_buf());
        if let Some(filter) = filter {
            if !filter(&path) {
                continue;
            }
        }
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", path.display()))?;
        debug!(dir = %path.display(), "watching directory");
    }
    Ok(())
}

fn forward_loop(
    mut watcher: RecommendedWatcher,
    raw_rx: std::sync::mpsc::Receiver<RawMessage>,
    event_tx: mpsc::Sender<Event>,
    error_tx: mpsc::Sender<notify::Error>,
    filter: Option<PathFilter>,
) {
    while let Ok(message) = raw_rx.recv() {
        let result = match message {
            RawMessage::Stop => break,
            RawMessage::Notify(result) => result,
        };
        match result {
            Ok(event) => {
                let paths: Vec<PathBuf> = event
                    .paths
                    .iter()
                    .filter(|p| filter.as_ref().map(|f| f(p.as_path())).unwrap_or(true))
                    .cloned()
                    .collect();
                if paths.is_empty() && !event.paths.is_empty() {
                    continue;
                }

                // New directories must be registered before anything
                // inside them changes.
                if matches!(event.kind, EventKind::Create(_)) {
                    for path in &paths {
                        if path.is_dir() {
                            if let Err(e) = register_tree(&mut watcher, path, filter.as_ref()) {
                                error!(error = %e, "failed to watch new directory");
                            }
                        }
                    }
                }

                let mut filtered = event.clone();
                filtered.paths = paths;
                if event_tx.try_send(filtered).is_err() {
                    // Either full (burst larger than the buffer) or the
                    // consumer is gone; surface the former.
                    let _ = error_tx.try_send(notify::Error::generic(
                        "event buffer overflow, change events were dropped",
                    ));
                }
            }
            Err(e) => {
                let _ = error_tx.try_send(e);
            }
        }
    }
    // Dropping the watcher here closes the OS handle; dropping the senders
    // closes both channels for the consumers.
    drop(watcher);
}

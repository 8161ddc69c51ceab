//! Raw filesystem event source.
//!
//! Bridges `notify` callbacks into debounced batches of classified
//! [`RawEvent`]s on a tokio channel. Classification here is purely
//! structural (which manifest or directory a path belongs to); deciding
//! what an event *means* for extensions is the router's job.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::{RwLock, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::app::loader::EXTENSION_CONFIG_FILE;

use super::debouncer::BatchDebouncer;
use super::error::WatchError;
use super::event::{RawEvent, RawEventKind};

/// Directory components that are never worth watching.
const IGNORED_COMPONENTS: &[&str] = &["node_modules", ".git", "dist", "generated"];

/// Editor droppings, never build input.
const IGNORED_SUFFIXES: &[&str] = &[".swp", ".swo", ".tmp", "~"];

/// How often the pump checks the debouncer for a releasable batch.
const FLUSH_INTERVAL_MS: u64 = 50;

/// Produces debounced batches of raw events for the controller.
///
/// The controller is the only consumer; after a reload it re-points the
/// source at the new snapshot's extension directories.
#[async_trait]
pub trait EventSource: Send {
    /// Start watching and return the batch channel. Called exactly once.
    async fn start(&mut self) -> Result<mpsc::Receiver<Vec<RawEvent>>, WatchError>;

    /// Replace the set of known extension directories.
    async fn update_extension_dirs(&mut self, dirs: Vec<PathBuf>);
}

/// Mutable classification state shared with the pump task.
struct SourceState {
    extension_dirs: Vec<PathBuf>,
    /// Per-directory `.gitignore` matchers; `None` when the directory has no
    /// ignore file.
    gitignores: HashMap<PathBuf, Option<Gitignore>>,
}

impl SourceState {
    fn new() -> Self {
        Self {
            extension_dirs: Vec::new(),
            gitignores: HashMap::new(),
        }
    }

    fn set_dirs(&mut self, dirs: Vec<PathBuf>) {
        for dir in &dirs {
            self.gitignores
                .entry(dir.clone())
                .or_insert_with(|| build_gitignore(dir));
        }
        self.gitignores.retain(|dir, _| dirs.contains(dir));
        self.extension_dirs = dirs;
    }

    fn add_dir(&mut self, dir: PathBuf) {
        if !self.extension_dirs.contains(&dir) {
            self.gitignores
                .entry(dir.clone())
                .or_insert_with(|| build_gitignore(&dir));
            self.extension_dirs.push(dir);
        }
    }

    fn remove_dir(&mut self, dir: &Path) {
        self.extension_dirs.retain(|d| d != dir);
        self.gitignores.remove(dir);
    }

    fn owning_dir(&self, path: &Path) -> Option<PathBuf> {
        self.extension_dirs
            .iter()
            .find(|dir| path.starts_with(dir))
            .cloned()
    }

    fn is_gitignored(&self, dir: &Path, path: &Path) -> bool {
        match self.gitignores.get(dir) {
            Some(Some(matcher)) => matcher.matched(path, path.is_dir()).is_ignore(),
            _ => false,
        }
    }
}

/// Build a `.gitignore` matcher for one extension directory, if it has one.
fn build_gitignore(dir: &Path) -> Option<Gitignore> {
    let gitignore_path = dir.join(".gitignore");
    if !gitignore_path.exists() {
        return None;
    }
    let mut builder = GitignoreBuilder::new(dir);
    let _ = builder.add(&gitignore_path);
    builder.build().ok()
}

/// Filesystem-backed event source built on `notify`.
pub struct FsEventSource {
    root: PathBuf,
    app_config_path: PathBuf,
    build_output_path: PathBuf,
    debounce_ms: u64,
    channel_capacity: usize,
    cancel: CancellationToken,
    state: Arc<RwLock<SourceState>>,
    /// Keep alive: dropping the watcher stops the OS notifications.
    _watcher: Option<notify::RecommendedWatcher>,
}

impl FsEventSource {
    pub fn new(
        root: PathBuf,
        app_config_path: PathBuf,
        build_output_path: PathBuf,
        debounce_ms: u64,
        channel_capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            root,
            app_config_path,
            build_output_path,
            debounce_ms,
            channel_capacity,
            cancel,
            state: Arc::new(RwLock::new(SourceState::new())),
            _watcher: None,
        }
    }
}

#[async_trait]
impl EventSource for FsEventSource {
    async fn start(&mut self) -> Result<mpsc::Receiver<Vec<RawEvent>>, WatchError> {
        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<Event>>(1024);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = raw_tx.blocking_send(res);
        })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        self._watcher = Some(watcher);

        let (batch_tx, batch_rx) = mpsc::channel(self.channel_capacity);

        let pump = EventPump {
            app_config_path: self.app_config_path.clone(),
            build_output_path: self.build_output_path.clone(),
            state: Arc::clone(&self.state),
            debouncer: BatchDebouncer::new(self.debounce_ms),
        };
        tokio::spawn(pump.run(raw_rx, batch_tx, self.cancel.clone()));

        crate::log_event!("watcher", "watching", "{}", self.root.display());
        Ok(batch_rx)
    }

    async fn update_extension_dirs(&mut self, dirs: Vec<PathBuf>) {
        crate::debug_event!("watcher", "tracking", "{} extension dirs", dirs.len());
        self.state.write().await.set_dirs(dirs);
    }
}

/// The task that turns notify callbacks into debounced batches.
struct EventPump {
    app_config_path: PathBuf,
    build_output_path: PathBuf,
    state: Arc<RwLock<SourceState>>,
    debouncer: BatchDebouncer,
}

impl EventPump {
    async fn run(
        mut self,
        mut raw_rx: mpsc::Receiver<notify::Result<Event>>,
        batch_tx: mpsc::Sender<Vec<RawEvent>>,
        cancel: CancellationToken,
    ) {
        loop {
            let flush = sleep(Duration::from_millis(FLUSH_INTERVAL_MS));
            tokio::pin!(flush);

            tokio::select! {
                _ = cancel.cancelled() => return,

                maybe = raw_rx.recv() => match maybe {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => tracing::error!("[watcher] file watch error: {e}"),
                    None => return,
                },

                _ = &mut flush => {
                    if let Some(batch) = self.debouncer.take_ready() {
                        if !batch.is_empty() && batch_tx.send(batch).await.is_err() {
                            // Controller is gone
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }

        for path in event.paths {
            if self.is_noise(&path) {
                continue;
            }
            if let Some((kind, path, dir)) = self.classify(path, &event.kind).await {
                crate::debug_event!("watcher", "raw", "{kind:?} {}", path.display());
                self.debouncer.record(kind, path, dir);
            }
        }
    }

    /// Map one path from a notify event onto a raw event, or drop it.
    async fn classify(
        &self,
        path: PathBuf,
        kind: &EventKind,
    ) -> Option<(RawEventKind, PathBuf, PathBuf)> {
        // Remove events and rename-as-modify both surface as a missing path
        let removed = matches!(kind, EventKind::Remove(_)) || !path.exists();

        if path == self.app_config_path {
            let kind = if removed {
                RawEventKind::AppConfigDeleted
            } else {
                RawEventKind::AppConfigUpdated
            };
            let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
            return Some((kind, path, dir));
        }

        let mut state = self.state.write().await;

        if path.file_name() == Some(OsStr::new(EXTENSION_CONFIG_FILE)) {
            let dir = path.parent()?.to_path_buf();
            if removed {
                // A deleted manifest deletes every extension in the folder
                state.remove_dir(&dir);
                return Some((RawEventKind::ExtensionFolderDeleted, dir.clone(), dir));
            }
            if !state.extension_dirs.contains(&dir) {
                // A manifest in an unknown directory is a new extension folder.
                // Track it immediately so files written right after classify
                // against it instead of being dropped.
                state.add_dir(dir.clone());
                return Some((RawEventKind::ExtensionFolderCreated, dir.clone(), dir));
            }
            return Some((RawEventKind::ExtensionsConfigUpdated, path, dir));
        }

        // The extension directory itself disappearing
        if removed && state.extension_dirs.contains(&path) {
            state.remove_dir(&path);
            let dir = path.clone();
            return Some((RawEventKind::ExtensionFolderDeleted, path, dir));
        }

        // Plain file: only meaningful under a known extension directory
        let dir = state.owning_dir(&path)?;
        if path == dir || state.is_gitignored(&dir, &path) {
            return None;
        }

        let kind = if removed {
            RawEventKind::FileDeleted
        } else if matches!(kind, EventKind::Create(_)) {
            RawEventKind::FileCreated
        } else {
            RawEventKind::FileUpdated
        };
        Some((kind, path, dir))
    }

    fn is_noise(&self, path: &Path) -> bool {
        if path.starts_with(&self.build_output_path) {
            return true;
        }
        if path
            .components()
            .any(|c| IGNORED_COMPONENTS.contains(&c.as_os_str().to_str().unwrap_or("")))
        {
            return true;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name == ".gitignore" || IGNORED_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    }
}

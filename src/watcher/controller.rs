//! The watcher controller: a long-lived actor that owns the current
//! application snapshot and the build context table.
//!
//! All state transitions happen inside [`WatcherController::run`], which
//! consumes batches from the event source one at a time. Serialization is
//! structural: there is exactly one consumer loop, so two reconcile+build
//! cycles can never be in flight concurrently and subscribers never observe
//! two competing "current snapshot" views.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::app::{AppLoader, AppSnapshot, LoadError, SnapshotDiff, diff};
use crate::build::{BuildBackend, BuildOrchestrator};

use super::error::WatchError;
use super::event::{BatchResult, ExtensionEvent, ExtensionEventKind, RawEvent, RawEventKind};
use super::router::{self, Routing};
use super::source::EventSource;

/// Lifecycle of the controller.
///
/// `Idle` until [`WatcherController::run`] is invoked, `Starting` during the
/// initial load and cold build, `Watching` in steady state, `Stopped`
/// terminally after cancellation or a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Starting,
    Watching,
    Stopped,
}

/// Builder for constructing a [`WatcherController`].
pub struct WatcherControllerBuilder {
    root: Option<PathBuf>,
    loader: Option<Arc<dyn AppLoader>>,
    backend: Option<Arc<dyn BuildBackend>>,
    source: Option<Box<dyn EventSource>>,
    build_output_path: Option<PathBuf>,
    cancel: CancellationToken,
    result_capacity: usize,
}

impl WatcherControllerBuilder {
    pub fn new() -> Self {
        Self {
            root: None,
            loader: None,
            backend: None,
            source: None,
            build_output_path: None,
            cancel: CancellationToken::new(),
            result_capacity: 128,
        }
    }

    /// Set the application root directory.
    pub fn root(mut self, root: PathBuf) -> Self {
        self.root = Some(root);
        self
    }

    /// Set the snapshot loader.
    pub fn loader(mut self, loader: Arc<dyn AppLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Set the build backend.
    pub fn backend(mut self, backend: Arc<dyn BuildBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the raw event source.
    pub fn source(mut self, source: impl EventSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Set the build artifact directory.
    pub fn build_output_path(mut self, path: PathBuf) -> Self {
        self.build_output_path = Some(path);
        self
    }

    /// Set the cancellation token threaded through every suspend point.
    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<WatcherController, WatchError> {
        let root = self.root.ok_or_else(|| WatchError::InitFailed {
            reason: "root directory is required".to_string(),
        })?;
        let loader = self.loader.ok_or_else(|| WatchError::InitFailed {
            reason: "loader is required".to_string(),
        })?;
        let backend = self.backend.ok_or_else(|| WatchError::InitFailed {
            reason: "build backend is required".to_string(),
        })?;
        let source = self.source.ok_or_else(|| WatchError::InitFailed {
            reason: "event source is required".to_string(),
        })?;

        let build_output_path = self
            .build_output_path
            .unwrap_or_else(|| root.join(".appwatch").join("dev-bundle"));

        let (results_tx, _) = broadcast::channel(self.result_capacity);
        let (ready_tx, _) = watch::channel(None);

        Ok(WatcherController {
            orchestrator: BuildOrchestrator::new(backend, build_output_path.clone()),
            root,
            loader,
            source,
            build_output_path,
            snapshot: Arc::new(AppSnapshot::default()),
            state: ControllerState::Idle,
            results_tx,
            ready_tx,
            cancel: self.cancel,
        })
    }
}

impl Default for WatcherControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WatcherController {
    root: PathBuf,
    loader: Arc<dyn AppLoader>,
    source: Box<dyn EventSource>,
    orchestrator: BuildOrchestrator,
    build_output_path: PathBuf,
    /// The one current snapshot, replaced atomically on reload.
    snapshot: Arc<AppSnapshot>,
    state: ControllerState,
    results_tx: broadcast::Sender<BatchResult>,
    ready_tx: watch::Sender<Option<BatchResult>>,
    cancel: CancellationToken,
}

impl WatcherController {
    pub fn builder() -> WatcherControllerBuilder {
        WatcherControllerBuilder::new()
    }

    /// Subscribe to batch results. Results arrive in the order their
    /// triggering batches were received.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchResult> {
        self.results_tx.subscribe()
    }

    /// Readiness channel: holds `None` until the initial cold build
    /// completes, then the initial batch result.
    pub fn ready(&self) -> watch::Receiver<Option<BatchResult>> {
        self.ready_tx.subscribe()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the controller until cancellation or a fatal error.
    ///
    /// Loads the initial snapshot, reconciles build contexts for every
    /// extension, performs a cold build of everything, signals readiness,
    /// then processes event batches strictly one at a time.
    pub async fn run(mut self) -> Result<(), WatchError> {
        if self.state != ControllerState::Idle {
            return Err(WatchError::AlreadyStarted);
        }
        self.state = ControllerState::Starting;
        let started = Instant::now();

        // A stale bundle from a previous session must not leak into this one
        let _ = tokio::fs::remove_dir_all(&self.build_output_path).await;
        if let Err(e) = tokio::fs::create_dir_all(&self.build_output_path).await {
            self.state = ControllerState::Stopped;
            return Err(WatchError::InitFailed {
                reason: format!("cannot create build output directory: {e}"),
            });
        }

        // Initial load failures are fatal; there is nothing to watch yet
        let snapshot = match self.loader.load(&self.root).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.state = ControllerState::Stopped;
                return Err(e.into());
            }
        };
        self.snapshot = Arc::new(snapshot);

        let initial_diff = SnapshotDiff {
            created: self.snapshot.extensions.clone(),
            ..Default::default()
        };
        self.orchestrator.reconcile_contexts(&initial_diff).await;

        // Cold build of everything before the first subscriber sees a result
        let initial_events: Vec<ExtensionEvent> = self
            .snapshot
            .extensions
            .iter()
            .map(|ext| ExtensionEvent::new(ExtensionEventKind::UpdatedSourceFile, ext.clone()))
            .collect();
        let initial_events = self.orchestrator.build(initial_events).await;

        if self.cancel.is_cancelled() {
            self.shutdown().await;
            return Ok(());
        }

        self.source
            .update_extension_dirs(self.snapshot.extension_dirs())
            .await;
        let mut batches = self.source.start().await?;

        self.ready_tx.send_replace(Some(BatchResult {
            snapshot: Arc::clone(&self.snapshot),
            extension_events: initial_events,
            triggering_path: self.root.clone(),
            batch_start: started,
            was_reloaded: false,
            error: None,
        }));
        crate::log_event!(
            "controller",
            "ready",
            "{} extensions built",
            self.snapshot.extensions.len()
        );

        self.state = ControllerState::Watching;
        let cancel = self.cancel.clone();

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = batches.recv() => match maybe {
                    Some(batch) => batch,
                    None => break,
                },
            };

            if batch.is_empty() {
                continue;
            }
            if let Err(e) = self.process_batch(batch).await {
                self.shutdown().await;
                return Err(e);
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Handle one batch end to end: route, reload or apply, rebuild, emit.
    async fn process_batch(&mut self, batch: Vec<RawEvent>) -> Result<(), WatchError> {
        let triggering_path = batch[0].path.clone();
        let batch_start = batch[0].batch_start;
        crate::debug_event!("controller", "batch", "{} raw events", batch.len());

        let (events, was_reloaded, error) =
            match router::classify(&batch, self.snapshot.as_ref()) {
                Routing::Fatal { path } => {
                    return Err(WatchError::AppConfigRemoved { path });
                }
                Routing::Reload { trigger } => match self.reload(&trigger).await {
                    Ok(events) => (events, true, None),
                    Err(e) => {
                        // The next write to the manifest re-triggers a reload,
                        // so a failed mid-session parse is not fatal.
                        tracing::warn!("[controller] reload failed, keeping snapshot: {e}");
                        (Vec::new(), false, Some(e.to_string()))
                    }
                },
                Routing::Direct { events } => {
                    self.apply_direct_deletions(&events).await;
                    (events, false, None)
                }
            };

        if events.is_empty() && error.is_none() {
            crate::debug_event!("controller", "batch affected no extensions");
        }

        let events = self.orchestrator.build(events).await;

        // A cancelled batch must not surface a partial result
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        self.emit(BatchResult {
            snapshot: Arc::clone(&self.snapshot),
            extension_events: events,
            triggering_path,
            batch_start,
            was_reloaded,
            error,
        });
        Ok(())
    }

    /// Reload the application and reconcile against the previous snapshot.
    ///
    /// An extension manifest change diffs only its own directory; anything
    /// else (new folder, app config change) diffs the whole application.
    async fn reload(&mut self, trigger: &RawEvent) -> Result<Vec<ExtensionEvent>, LoadError> {
        let new_snapshot = self.loader.load(&self.root).await?;

        let changes = if trigger.kind == RawEventKind::ExtensionsConfigUpdated {
            diff::diff_scoped(self.snapshot.as_ref(), &new_snapshot, &trigger.extension_dir)
        } else {
            diff::diff(self.snapshot.as_ref(), &new_snapshot)
        };

        self.snapshot = Arc::new(new_snapshot);
        self.source
            .update_extension_dirs(self.snapshot.extension_dirs())
            .await;
        self.orchestrator.reconcile_contexts(&changes).await;

        crate::log_event!(
            "controller",
            "reloaded",
            "{} created, {} updated, {} deleted",
            changes.created.len(),
            changes.updated.len(),
            changes.deleted.len()
        );
        Ok(diff_events(changes))
    }

    /// Apply direct deletions to produce the successor snapshot.
    async fn apply_direct_deletions(&mut self, events: &[ExtensionEvent]) {
        let deleted: Vec<_> = events
            .iter()
            .filter(|e| e.kind == ExtensionEventKind::Deleted)
            .map(|e| e.extension.clone())
            .collect();
        if deleted.is_empty() {
            return;
        }

        let deleted_uids: HashSet<String> =
            deleted.iter().map(|ext| ext.uid().to_string()).collect();
        self.snapshot = Arc::new(self.snapshot.without_uids(&deleted_uids));
        self.source
            .update_extension_dirs(self.snapshot.extension_dirs())
            .await;
        self.orchestrator
            .reconcile_contexts(&SnapshotDiff {
                deleted,
                ..Default::default()
            })
            .await;
    }

    fn emit(&self, result: BatchResult) {
        match self.results_tx.send(result) {
            Ok(count) => {
                crate::debug_event!("controller", "emitted", "batch result to {count} subscribers");
            }
            Err(_) => {
                crate::debug_event!("controller", "dropped", "no subscribers");
            }
        }
    }

    /// Terminal transition: tear down every build context and stop the
    /// event source. No further batch results are emitted.
    async fn shutdown(&mut self) {
        if self.state == ControllerState::Stopped {
            return;
        }
        self.state = ControllerState::Stopped;
        // Stops the source pump and any in-flight backend builds
        self.cancel.cancel();
        self.orchestrator.teardown_all().await;
        crate::log_event!("controller", "stopped");
    }
}

/// Translate a snapshot diff into extension events. A configuration change
/// is always build-relevant, so updates surface as `UpdatedSourceFile`.
fn diff_events(changes: SnapshotDiff) -> Vec<ExtensionEvent> {
    let mut events = Vec::with_capacity(
        changes.created.len() + changes.updated.len() + changes.deleted.len(),
    );
    for ext in changes.created {
        events.push(ExtensionEvent::new(ExtensionEventKind::Created, ext));
    }
    for ext in changes.updated {
        events.push(ExtensionEvent::new(ExtensionEventKind::UpdatedSourceFile, ext));
    }
    for ext in changes.deleted {
        events.push(ExtensionEvent::new(ExtensionEventKind::Deleted, ext));
    }
    events
}

//! Incremental build orchestration.
//!
//! The orchestrator owns one build context per buildable extension, keyed by
//! uid. Contexts appear when an extension is created (or first becomes
//! buildable), disappear when it is deleted, and survive everything else so
//! rebuilds stay incremental. The table is only ever touched from within a
//! serialized batch-processing step, so it needs no locking of its own.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::app::{ExtensionRecord, SnapshotDiff};
use crate::watcher::ExtensionEvent;

use super::backend::{BuildBackend, BuildOutcome, ContextHandle, artifact_dir};

/// Incremental state tracked for one buildable extension.
#[derive(Debug)]
struct BuildContext {
    handle: ContextHandle,
    last_outcome: Option<BuildOutcome>,
}

pub struct BuildOrchestrator {
    backend: Arc<dyn BuildBackend>,
    output_root: PathBuf,
    contexts: HashMap<String, BuildContext>,
}

impl BuildOrchestrator {
    pub fn new(backend: Arc<dyn BuildBackend>, output_root: PathBuf) -> Self {
        Self {
            backend,
            output_root,
            contexts: HashMap::new(),
        }
    }

    /// Bring the context table in line with a snapshot diff.
    ///
    /// Created (and updated) buildable extensions get a context if they lack
    /// one; an update that dropped the build command releases the context.
    /// Deleted extensions lose their context and their build artifacts.
    /// Teardown is idempotent: a uid without a context is a no-op.
    pub async fn reconcile_contexts(&mut self, diff: &SnapshotDiff) {
        for ext in diff.changed() {
            let uid = ext.uid();
            match (ext.is_buildable(), self.contexts.contains_key(uid)) {
                (true, false) => match self.backend.create_context(ext).await {
                    Ok(handle) => {
                        self.contexts.insert(
                            uid.to_string(),
                            BuildContext {
                                handle,
                                last_outcome: None,
                            },
                        );
                        crate::debug_event!("build", "context ready", "{}", ext.handle);
                    }
                    Err(e) => {
                        // Builds for this extension fall back to the cold path
                        tracing::warn!("[build] context creation failed for {}: {e}", ext.handle);
                    }
                },
                (false, true) => {
                    if let Some(context) = self.contexts.remove(uid) {
                        self.backend.destroy_context(context.handle).await;
                        crate::debug_event!("build", "context released", "{}", ext.handle);
                    }
                }
                _ => {}
            }
        }

        for ext in &diff.deleted {
            self.destroy_context_for(ext.uid()).await;
            self.remove_artifacts(ext.uid()).await;
        }
    }

    /// Destroy the context for `uid` if one exists. Idempotent.
    async fn destroy_context_for(&mut self, uid: &str) {
        if let Some(context) = self.contexts.remove(uid) {
            self.backend.destroy_context(context.handle).await;
            crate::debug_event!("build", "context destroyed", "{uid}");
        }
    }

    /// Remove any build artifacts for `uid`. Missing artifacts are a no-op.
    async fn remove_artifacts(&self, uid: &str) {
        let dir = artifact_dir(&self.output_root, uid);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => crate::debug_event!("build", "artifacts removed", "{}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("[build] failed to remove artifacts {}: {e}", dir.display()),
        }
    }

    /// Build every extension whose event requires it and attach outcomes.
    ///
    /// Builds for distinct extensions run concurrently. A failure is
    /// recorded on the extension's event and never aborts the batch: sibling
    /// extensions still build, and the next batch starts from clean state.
    /// Events that don't trigger builds pass through untouched.
    pub async fn build(&mut self, mut events: Vec<ExtensionEvent>) -> Vec<ExtensionEvent> {
        // One build per uid even when several events reference the extension
        let mut to_build: HashMap<String, ExtensionRecord> = HashMap::new();
        for event in events.iter().filter(|e| e.needs_build()) {
            if event.extension.is_buildable() {
                to_build
                    .entry(event.extension.uid().to_string())
                    .or_insert_with(|| event.extension.clone());
            }
        }

        if to_build.is_empty() {
            return events;
        }

        let mut join_set = JoinSet::new();
        for (uid, record) in to_build {
            let backend = Arc::clone(&self.backend);
            let context = self.contexts.get(&uid).map(|c| c.handle);
            join_set.spawn(async move {
                let outcome = match backend.build(&record, context).await {
                    Ok(_) => {
                        let mode = if context.is_some() { "rebuilt" } else { "built" };
                        crate::log_event!("build", mode, "{}", record.handle);
                        BuildOutcome::Ok
                    }
                    Err(e) => {
                        tracing::error!("[build] {} failed: {e}", record.handle);
                        BuildOutcome::Error {
                            message: e.to_string(),
                        }
                    }
                };
                (uid, outcome)
            });
        }

        let mut outcomes: HashMap<String, BuildOutcome> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((uid, outcome)) => {
                    outcomes.insert(uid, outcome);
                }
                Err(e) => {
                    tracing::error!("[build] build task failed to complete: {e}");
                }
            }
        }

        for event in events.iter_mut().filter(|e| e.needs_build()) {
            if let Some(outcome) = outcomes.get(event.extension.uid()) {
                event.build_outcome = Some(outcome.clone());
            }
        }
        for (uid, outcome) in outcomes {
            if let Some(context) = self.contexts.get_mut(&uid) {
                context.last_outcome = Some(outcome);
            }
        }

        events
    }

    /// Release every live context. Used on shutdown and cancellation.
    pub async fn teardown_all(&mut self) {
        let uids: Vec<String> = self.contexts.keys().cloned().collect();
        for uid in uids {
            self.destroy_context_for(&uid).await;
        }
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn has_context(&self, uid: &str) -> bool {
        self.contexts.contains_key(uid)
    }

    /// Outcome of the most recent build for `uid`, if any.
    pub fn last_outcome(&self, uid: &str) -> Option<&BuildOutcome> {
        self.contexts.get(uid).and_then(|c| c.last_outcome.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::backend::{BuildArtifactRef, BuildError};
    use crate::watcher::ExtensionEventKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Backend that records calls and fails on demand.
    struct RecordingBackend {
        next: AtomicU64,
        pub created: Mutex<Vec<String>>,
        pub destroyed: Mutex<Vec<u64>>,
        pub built: Mutex<Vec<(String, bool)>>,
        pub fail_uids: Vec<String>,
    }

    impl RecordingBackend {
        fn new() -> Self {
            Self {
                next: AtomicU64::new(1),
                created: Mutex::new(Vec::new()),
                destroyed: Mutex::new(Vec::new()),
                built: Mutex::new(Vec::new()),
                fail_uids: Vec::new(),
            }
        }

        fn failing_for(uids: &[&str]) -> Self {
            let mut backend = Self::new();
            backend.fail_uids = uids.iter().map(|s| s.to_string()).collect();
            backend
        }
    }

    #[async_trait]
    impl BuildBackend for RecordingBackend {
        async fn create_context(
            &self,
            extension: &ExtensionRecord,
        ) -> Result<ContextHandle, BuildError> {
            self.created.lock().unwrap().push(extension.uid().to_string());
            Ok(ContextHandle::new(self.next.fetch_add(1, Ordering::Relaxed)))
        }

        async fn destroy_context(&self, handle: ContextHandle) {
            self.destroyed.lock().unwrap().push(handle.value());
        }

        async fn build(
            &self,
            extension: &ExtensionRecord,
            context: Option<ContextHandle>,
        ) -> Result<BuildArtifactRef, BuildError> {
            self.built
                .lock()
                .unwrap()
                .push((extension.uid().to_string(), context.is_some()));
            if self.fail_uids.contains(&extension.uid().to_string()) {
                return Err(BuildError::CommandFailed {
                    status: "exit status: 1".to_string(),
                    stderr: "boom".to_string(),
                });
            }
            Ok(BuildArtifactRef {
                uid: extension.uid().to_string(),
                path: PathBuf::from("/out"),
            })
        }
    }

    fn buildable(uid: &str, dir: &str) -> ExtensionRecord {
        let mut ext = ExtensionRecord::new(uid, uid, dir, json!({}));
        ext.build_command = Some("make".to_string());
        ext
    }

    fn diff_created(extensions: Vec<ExtensionRecord>) -> SnapshotDiff {
        SnapshotDiff {
            created: extensions,
            ..Default::default()
        }
    }

    fn orchestrator(backend: RecordingBackend) -> (BuildOrchestrator, Arc<RecordingBackend>) {
        let backend = Arc::new(backend);
        (
            BuildOrchestrator::new(backend.clone(), PathBuf::from("/tmp/appwatch-test-out")),
            backend,
        )
    }

    #[tokio::test]
    async fn test_contexts_created_for_buildable_extensions_only() {
        let (mut orchestrator, backend) = orchestrator(RecordingBackend::new());

        let plain = ExtensionRecord::new("plain", "plain", "/x/plain", json!({}));
        let diff = diff_created(vec![buildable("a", "/x/a"), plain]);
        orchestrator.reconcile_contexts(&diff).await;

        assert_eq!(orchestrator.context_count(), 1);
        assert_eq!(backend.created.lock().unwrap().as_slice(), ["a"]);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let (mut orchestrator, backend) = orchestrator(RecordingBackend::new());

        let ext = buildable("a", "/x/a");
        orchestrator.reconcile_contexts(&diff_created(vec![ext.clone()])).await;
        assert_eq!(orchestrator.context_count(), 1);

        let deletion = SnapshotDiff {
            deleted: vec![ext.clone()],
            ..Default::default()
        };
        // Destroying twice, and once more for a uid that never existed
        orchestrator.reconcile_contexts(&deletion).await;
        orchestrator.reconcile_contexts(&deletion).await;
        let never_created = SnapshotDiff {
            deleted: vec![buildable("ghost", "/x/ghost")],
            ..Default::default()
        };
        orchestrator.reconcile_contexts(&never_created).await;

        assert_eq!(orchestrator.context_count(), 0);
        assert_eq!(backend.destroyed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_build_failure_is_isolated() {
        let (mut orchestrator, _backend) = orchestrator(RecordingBackend::failing_for(&["bad"]));

        let good = buildable("good", "/x/good");
        let bad = buildable("bad", "/x/bad");
        orchestrator
            .reconcile_contexts(&diff_created(vec![good.clone(), bad.clone()]))
            .await;

        let events = vec![
            ExtensionEvent::new(ExtensionEventKind::UpdatedSourceFile, good.clone()),
            ExtensionEvent::new(ExtensionEventKind::UpdatedSourceFile, bad.clone()),
        ];
        let events = orchestrator.build(events).await;

        let good_event = events.iter().find(|e| e.extension.uid() == "good").unwrap();
        let bad_event = events.iter().find(|e| e.extension.uid() == "bad").unwrap();
        assert_eq!(good_event.build_outcome, Some(BuildOutcome::Ok));
        assert!(matches!(
            bad_event.build_outcome,
            Some(BuildOutcome::Error { .. })
        ));

        // The failure does not poison later batches for the healthy sibling
        let events = orchestrator
            .build(vec![ExtensionEvent::new(
                ExtensionEventKind::UpdatedSourceFile,
                good,
            )])
            .await;
        assert_eq!(events[0].build_outcome, Some(BuildOutcome::Ok));
    }

    #[tokio::test]
    async fn test_incremental_path_used_when_context_exists() {
        let (mut orchestrator, backend) = orchestrator(RecordingBackend::new());

        let with_context = buildable("warm", "/x/warm");
        orchestrator
            .reconcile_contexts(&diff_created(vec![with_context.clone()]))
            .await;

        // "cold" never went through reconcile, so it has no context
        let cold = buildable("cold", "/x/cold");
        orchestrator
            .build(vec![
                ExtensionEvent::new(ExtensionEventKind::UpdatedSourceFile, with_context),
                ExtensionEvent::new(ExtensionEventKind::Created, cold),
            ])
            .await;

        let built = backend.built.lock().unwrap();
        let warm = built.iter().find(|(uid, _)| uid == "warm").unwrap();
        let cold = built.iter().find(|(uid, _)| uid == "cold").unwrap();
        assert!(warm.1, "context build should be incremental");
        assert!(!cold.1, "missing context should force a cold build");
    }

    #[tokio::test]
    async fn test_updated_and_deleted_events_pass_through() {
        let (mut orchestrator, backend) = orchestrator(RecordingBackend::new());

        let ext = buildable("a", "/x/a");
        let events = vec![
            ExtensionEvent::new(ExtensionEventKind::Updated, ext.clone()),
            ExtensionEvent::new(ExtensionEventKind::Deleted, ext),
        ];
        let events = orchestrator.build(events).await;

        assert!(events.iter().all(|e| e.build_outcome.is_none()));
        assert!(backend.built.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_build_per_uid_for_duplicate_events() {
        let (mut orchestrator, backend) = orchestrator(RecordingBackend::new());

        let ext = buildable("a", "/x/a");
        let events = vec![
            ExtensionEvent::new(ExtensionEventKind::UpdatedSourceFile, ext.clone()),
            ExtensionEvent::new(ExtensionEventKind::UpdatedSourceFile, ext),
        ];
        let events = orchestrator.build(events).await;

        assert_eq!(backend.built.lock().unwrap().len(), 1);
        // Both events still carry the outcome
        assert!(
            events
                .iter()
                .all(|e| e.build_outcome == Some(BuildOutcome::Ok))
        );
    }

    #[tokio::test]
    async fn test_update_dropping_build_command_releases_context() {
        let (mut orchestrator, _backend) = orchestrator(RecordingBackend::new());

        let ext = buildable("a", "/x/a");
        orchestrator.reconcile_contexts(&diff_created(vec![ext])).await;
        assert!(orchestrator.has_context("a"));

        let no_longer_buildable = ExtensionRecord::new("a", "a", "/x/a", json!({}));
        let update = SnapshotDiff {
            updated: vec![no_longer_buildable],
            ..Default::default()
        };
        orchestrator.reconcile_contexts(&update).await;
        assert!(!orchestrator.has_context("a"));
    }
}

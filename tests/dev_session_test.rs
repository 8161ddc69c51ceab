//! Full-stack dev session tests: real filesystem watcher, real manifest
//! loader, real command backend. Slower than the scripted controller tests,
//! so they only cover the happy paths end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use appwatch::build::CommandBackend;
use appwatch::watcher::{BatchResult, ExtensionEventKind, FsEventSource, WatcherController};
use appwatch::{BuildOutcome, ManifestLoader};

const RECV_TIMEOUT: Duration = Duration::from_secs(15);

fn write_app(root: &Path) {
    std::fs::write(
        root.join("app.toml"),
        "name = \"demo\"\nextension_directories = [\"extensions/*\"]\n",
    )
    .unwrap();
}

fn write_extension(root: &Path, name: &str) -> PathBuf {
    let dir = root.join("extensions").join(name);
    std::fs::create_dir_all(dir.join("src")).unwrap();
    std::fs::write(
        dir.join("extension.toml"),
        format!(
            r#"
[[extensions]]
handle = "{name}"
uid = "uid-{name}"

[extensions.build]
command = "echo built > \"$APPWATCH_OUT_DIR/out.txt\""
watch = ["src/**/*"]
"#
        ),
    )
    .unwrap();
    std::fs::write(dir.join("src/index.js"), "export default 1;\n").unwrap();
    dir
}

struct LiveSession {
    results: broadcast::Receiver<BatchResult>,
    ready: BatchResult,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), appwatch::WatchError>>,
}

/// Start a real dev session over `root` and wait for the initial build.
async fn start_session(root: &Path) -> LiveSession {
    let cancel = CancellationToken::new();
    let bundle = root.join(".appwatch/dev-bundle");

    let loader = Arc::new(ManifestLoader::new(
        "app.toml",
        vec!["extensions/*".to_string()],
    ));
    let backend = Arc::new(CommandBackend::new(bundle.clone(), cancel.clone()));
    let source = FsEventSource::new(
        root.to_path_buf(),
        root.join("app.toml"),
        bundle.clone(),
        100,
        64,
        cancel.clone(),
    );

    let controller = WatcherController::builder()
        .root(root.to_path_buf())
        .loader(loader)
        .backend(backend)
        .source(source)
        .build_output_path(bundle)
        .cancel(cancel.clone())
        .build()
        .unwrap();

    let results = controller.subscribe();
    let mut ready_rx = controller.ready();
    let handle = tokio::spawn(controller.run());

    tokio::time::timeout(RECV_TIMEOUT, ready_rx.changed())
        .await
        .expect("timed out waiting for ready")
        .expect("controller stopped before ready");
    let ready = ready_rx.borrow().clone().unwrap();

    LiveSession {
        results,
        ready,
        cancel,
        handle,
    }
}

async fn next_result(session: &mut LiveSession) -> BatchResult {
    tokio::time::timeout(RECV_TIMEOUT, session.results.recv())
        .await
        .expect("timed out waiting for batch result")
        .expect("result channel closed")
}

async fn finish(session: LiveSession) {
    session.cancel.cancel();
    session
        .handle
        .await
        .expect("watcher task panicked")
        .expect("dev session failed");
}

#[tokio::test]
async fn test_source_change_triggers_incremental_rebuild() {
    let tmp = tempfile::tempdir().unwrap();
    // The watcher reports canonical paths; the workspace root must match
    let root = tmp.path().canonicalize().unwrap();
    write_app(&root);
    let widget_dir = write_extension(&root, "widget");

    let mut session = start_session(&root).await;

    // Initial cold build produced an artifact
    assert_eq!(session.ready.extension_events.len(), 1);
    assert_eq!(
        session.ready.extension_events[0].build_outcome,
        Some(BuildOutcome::Ok)
    );

    // Touch a watched source file
    std::fs::write(widget_dir.join("src/index.js"), "export default 2;\n").unwrap();

    let result = next_result(&mut session).await;
    assert!(!result.was_reloaded);
    let event = result
        .extension_events
        .iter()
        .find(|e| e.extension.uid() == "uid-widget")
        .expect("no event for widget");
    assert_eq!(event.kind, ExtensionEventKind::UpdatedSourceFile);
    assert_eq!(event.build_outcome, Some(BuildOutcome::Ok));

    finish(session).await;
}

#[tokio::test]
async fn test_new_extension_folder_is_picked_up_via_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    write_app(&root);
    write_extension(&root, "widget");

    let mut session = start_session(&root).await;
    assert_eq!(session.ready.snapshot.extensions.len(), 1);

    // A whole new extension appears while watching
    write_extension(&root, "checkout");

    // Skip unrelated batches (the new folder's own file events) until the
    // reload that carries the created extension arrives
    let created = loop {
        let result = next_result(&mut session).await;
        if let Some(event) = result
            .extension_events
            .iter()
            .find(|e| e.kind == ExtensionEventKind::Created)
        {
            assert!(result.was_reloaded);
            assert_eq!(result.snapshot.extensions.len(), 2);
            break event.clone();
        }
    };

    assert_eq!(created.extension.uid(), "uid-checkout");
    assert_eq!(created.build_outcome, Some(BuildOutcome::Ok));

    finish(session).await;
}

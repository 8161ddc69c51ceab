pub mod app;
pub mod build;
pub mod config;
pub mod logging;
pub mod watcher;

pub use app::{AppLoader, AppSnapshot, ExtensionRecord, LoadError, ManifestLoader, SnapshotDiff};
pub use build::{BuildBackend, BuildError, BuildOrchestrator, BuildOutcome, CommandBackend};
pub use config::Settings;
pub use watcher::{
    BatchResult, ControllerState, EventSource, ExtensionEvent, ExtensionEventKind, FsEventSource,
    RawEvent, RawEventKind, WatchError, WatcherController,
};

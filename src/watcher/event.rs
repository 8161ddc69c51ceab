//! Event types flowing through the hot-reload pipeline.
//!
//! Raw filesystem events come in debounced batches from the event source.
//! The router and diff engine translate them into extension events, and the
//! controller packages one [`BatchResult`] per processed batch for
//! subscribers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::app::{AppSnapshot, ExtensionRecord};
use crate::build::BuildOutcome;

/// Kind of a raw filesystem event, as classified by the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEventKind {
    FileCreated,
    FileUpdated,
    FileDeleted,
    /// An extension manifest appeared in a previously unknown directory.
    ExtensionFolderCreated,
    /// An extension directory (or its manifest) disappeared.
    ExtensionFolderDeleted,
    /// An existing extension manifest changed.
    ExtensionsConfigUpdated,
    /// The application manifest changed.
    AppConfigUpdated,
    /// The application manifest disappeared. Fatal.
    AppConfigDeleted,
}

/// One raw filesystem event within a batch.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: RawEventKind,
    /// File that triggered the event.
    pub path: PathBuf,
    /// Extension directory the file falls under. Equals `path` for
    /// folder-level events.
    pub extension_dir: PathBuf,
    /// When the first event of the batch was observed.
    pub batch_start: Instant,
}

/// Kind of a domain-level extension event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionEventKind {
    Created,
    /// Metadata-only change: the file does not match the extension's
    /// watch patterns, so no rebuild is required.
    Updated,
    /// Build-relevant change (source file or configuration).
    UpdatedSourceFile,
    Deleted,
}

/// A semantically meaningful change to one extension.
#[derive(Debug, Clone)]
pub struct ExtensionEvent {
    pub kind: ExtensionEventKind,
    pub extension: ExtensionRecord,
    /// Set by the build orchestrator for events that triggered a build.
    pub build_outcome: Option<BuildOutcome>,
}

impl ExtensionEvent {
    pub fn new(kind: ExtensionEventKind, extension: ExtensionRecord) -> Self {
        Self {
            kind,
            extension,
            build_outcome: None,
        }
    }

    /// Whether this event triggers a (re)build.
    pub fn needs_build(&self) -> bool {
        matches!(
            self.kind,
            ExtensionEventKind::Created | ExtensionEventKind::UpdatedSourceFile
        )
    }
}

/// The result of processing one batch of raw events: the snapshot the events
/// were resolved against and the extension events they produced.
///
/// Subscribers must treat `extension_events` as a set; its order is
/// unspecified.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub snapshot: Arc<AppSnapshot>,
    pub extension_events: Vec<ExtensionEvent>,
    /// File that triggered the batch (first event's path).
    pub triggering_path: PathBuf,
    pub batch_start: Instant,
    pub was_reloaded: bool,
    /// Set when a mid-session reload failed; the previous snapshot stays
    /// current and the engine keeps watching.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_needs_build() {
        let ext = ExtensionRecord::new("u", "h", "/x", json!({}));

        let needs: Vec<bool> = [
            ExtensionEventKind::Created,
            ExtensionEventKind::Updated,
            ExtensionEventKind::UpdatedSourceFile,
            ExtensionEventKind::Deleted,
        ]
        .into_iter()
        .map(|kind| ExtensionEvent::new(kind, ext.clone()).needs_build())
        .collect();

        assert_eq!(needs, vec![true, false, true, false]);
    }
}

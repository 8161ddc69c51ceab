//! Classification and routing of raw event batches.
//!
//! A batch either forces a full application reload (new extensions may have
//! appeared, any extension's shape may have changed), is fatal (the
//! application manifest is gone), or translates directly into extension
//! events against the current snapshot without reloading.

use std::collections::HashSet;
use std::path::PathBuf;

use crate::app::AppSnapshot;

use super::event::{ExtensionEvent, ExtensionEventKind, RawEvent, RawEventKind};

/// How a batch of raw events must be handled.
#[derive(Debug)]
pub enum Routing {
    /// The application manifest disappeared. Short-circuits everything.
    Fatal { path: PathBuf },

    /// The batch requires a full reload; its remaining events are superseded
    /// by the post-reload diff. `trigger` is the first reload-forcing event.
    Reload { trigger: RawEvent },

    /// The batch resolves against the current snapshot without reloading.
    Direct { events: Vec<ExtensionEvent> },
}

/// Classify one debounced batch against the current snapshot.
///
/// Direct handlers run in the order events were received, except that
/// folder deletions apply first: a directory deleted anywhere in the batch
/// suppresses the batch's file events for its extensions (removing a
/// folder delivers both in one debounce window, in arbitrary order).
pub fn classify(batch: &[RawEvent], snapshot: &AppSnapshot) -> Routing {
    if let Some(event) = batch
        .iter()
        .find(|e| e.kind == RawEventKind::AppConfigDeleted)
    {
        return Routing::Fatal {
            path: event.path.clone(),
        };
    }

    if let Some(event) = batch.iter().find(|e| {
        matches!(
            e.kind,
            RawEventKind::ExtensionFolderCreated
                | RawEventKind::ExtensionsConfigUpdated
                | RawEventKind::AppConfigUpdated
        )
    }) {
        let superseded = batch.len() - 1;
        if superseded > 0 {
            crate::debug_event!("router", "reload", "supersedes {superseded} other events");
        }
        return Routing::Reload {
            trigger: event.clone(),
        };
    }

    let mut events = Vec::new();
    let mut deleted: HashSet<String> = HashSet::new();

    for raw in batch
        .iter()
        .filter(|e| e.kind == RawEventKind::ExtensionFolderDeleted)
    {
        // Every extension declared in the directory is gone, including
        // siblings sharing the same manifest.
        for ext in snapshot.extensions_in(&raw.extension_dir) {
            if deleted.insert(ext.uid().to_string()) {
                events.push(ExtensionEvent::new(ExtensionEventKind::Deleted, ext.clone()));
            }
        }
    }

    for raw in batch.iter().filter(|e| {
        matches!(
            e.kind,
            RawEventKind::FileCreated | RawEventKind::FileUpdated | RawEventKind::FileDeleted
        )
    }) {
        // One path fans out to every extension hosted by the directory,
        // each classified against its own watch patterns.
        for ext in snapshot.extensions_in(&raw.extension_dir) {
            if deleted.contains(ext.uid()) {
                continue;
            }
            let kind = if ext.is_build_relevant(&raw.path) {
                ExtensionEventKind::UpdatedSourceFile
            } else {
                ExtensionEventKind::Updated
            };
            events.push(ExtensionEvent::new(kind, ext.clone()));
        }
    }

    Routing::Direct { events }
}

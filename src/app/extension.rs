//! Extension records: the unit of the application model.
//!
//! A record is immutable. Reloading the application produces fresh records;
//! two records describe the same extension when their uids match.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One extension declared by the watched application.
///
/// Several records may share a `directory`: a single manifest can declare
/// multiple extensions. Within one snapshot the `uid` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionRecord {
    uid: String,

    /// Human-facing identifier from the manifest.
    pub handle: String,

    /// Directory owning this extension (contains its manifest).
    pub directory: PathBuf,

    /// The extension's manifest entry, kept opaque. Compared structurally,
    /// independent of key order.
    pub configuration: serde_json::Value,

    /// Glob patterns (relative to `directory`) for files that affect build
    /// output. Changes outside these patterns are metadata-only.
    pub watch_build_paths: Vec<String>,

    /// Shell command that builds this extension, if it is buildable.
    pub build_command: Option<String>,
}

impl ExtensionRecord {
    pub fn new(
        uid: impl Into<String>,
        handle: impl Into<String>,
        directory: impl Into<PathBuf>,
        configuration: serde_json::Value,
    ) -> Self {
        Self {
            uid: uid.into(),
            handle: handle.into(),
            directory: directory.into(),
            configuration,
            watch_build_paths: Vec::new(),
            build_command: None,
        }
    }

    /// Stable identity of this extension across snapshots.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Whether this extension produces build output.
    pub fn is_buildable(&self) -> bool {
        self.build_command.is_some()
    }

    /// Derive the uid for a manifest entry that does not declare one.
    ///
    /// The composite is stable for a given handle and directory, so records
    /// keep their identity across reloads as long as neither moves.
    pub fn derived_uid(handle: &str, directory: &Path) -> String {
        format!("{}@{}", handle, directory.display())
    }

    /// Whether a change to `path` affects this extension's build output.
    ///
    /// Paths outside `directory` never match. Records without watch patterns
    /// treat every file in their directory as build-relevant.
    pub fn is_build_relevant(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.directory) else {
            return false;
        };
        if self.watch_build_paths.is_empty() {
            return true;
        }
        self.watch_build_paths.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches_path(relative))
                .unwrap_or(false)
        })
    }
}

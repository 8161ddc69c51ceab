//! Immutable application snapshots.
//!
//! A snapshot is the full description of the application's extensions at one
//! point in time. The watcher controller holds exactly one current snapshot
//! and replaces it atomically on reload; nothing mutates a snapshot in place.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::app::ExtensionRecord;

#[derive(Debug, Clone, Default)]
pub struct AppSnapshot {
    pub extensions: Vec<ExtensionRecord>,
    /// Top-level application configuration, kept opaque.
    pub root_configuration: serde_json::Value,
}

impl AppSnapshot {
    pub fn new(extensions: Vec<ExtensionRecord>, root_configuration: serde_json::Value) -> Self {
        Self {
            extensions,
            root_configuration,
        }
    }

    /// All records owned by `directory`. A directory can host several
    /// extensions when its manifest declares more than one.
    pub fn extensions_in(&self, directory: &Path) -> Vec<&ExtensionRecord> {
        self.extensions
            .iter()
            .filter(|ext| ext.directory == directory)
            .collect()
    }

    pub fn by_uid(&self) -> HashMap<&str, &ExtensionRecord> {
        self.extensions.iter().map(|ext| (ext.uid(), ext)).collect()
    }

    pub fn contains_uid(&self, uid: &str) -> bool {
        self.extensions.iter().any(|ext| ext.uid() == uid)
    }

    /// Unique extension directories, in snapshot order.
    pub fn extension_dirs(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.extensions
            .iter()
            .filter(|ext| seen.insert(ext.directory.clone()))
            .map(|ext| ext.directory.clone())
            .collect()
    }

    /// Successor snapshot with the given uids removed. Used when a direct
    /// deletion is handled without a full reload.
    pub fn without_uids(&self, uids: &HashSet<String>) -> Self {
        Self {
            extensions: self
                .extensions
                .iter()
                .filter(|ext| !uids.contains(ext.uid()))
                .cloned()
                .collect(),
            root_configuration: self.root_configuration.clone(),
        }
    }
}

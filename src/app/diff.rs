//! Snapshot diffing.
//!
//! After a reload, the old and new application snapshots are reconciled into
//! created / deleted / updated extension sets, keyed strictly by uid.
//! Configuration changes are detected with structural equality, so key order
//! in the manifest never produces a false update.

use std::path::Path;

use crate::app::{AppSnapshot, ExtensionRecord};

/// The reconciliation of two snapshots.
///
/// `created` and `deleted` are disjoint by construction: a uid is in exactly
/// one of the three sets, or in none when its record is unchanged.
#[derive(Debug, Clone, Default)]
pub struct SnapshotDiff {
    /// Records in `new` whose uid is absent from `old`.
    pub created: Vec<ExtensionRecord>,
    /// Records in `old` whose uid is absent from `new`.
    pub deleted: Vec<ExtensionRecord>,
    /// Records present in both whose configuration changed (new version).
    pub updated: Vec<ExtensionRecord>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.updated.is_empty()
    }

    /// Records whose build context may need creating or refreshing.
    pub fn changed(&self) -> impl Iterator<Item = &ExtensionRecord> {
        self.created.iter().chain(self.updated.iter())
    }
}

/// Compare two snapshots by uid.
///
/// `directory` and `handle` drift on a stable uid is deliberately not
/// diffed: a record with an unchanged configuration counts as unchanged.
pub fn diff(old: &AppSnapshot, new: &AppSnapshot) -> SnapshotDiff {
    let old_by_uid = old.by_uid();
    let new_by_uid = new.by_uid();

    let mut result = SnapshotDiff::default();

    for ext in &new.extensions {
        match old_by_uid.get(ext.uid()) {
            None => result.created.push(ext.clone()),
            Some(previous) => {
                if previous.configuration != ext.configuration {
                    result.updated.push(ext.clone());
                }
            }
        }
    }

    for ext in &old.extensions {
        if !new_by_uid.contains_key(ext.uid()) {
            result.deleted.push(ext.clone());
        }
    }

    result
}

/// Diff restricted to records owned by `directory`.
///
/// Used after a single extension manifest changed: only extensions declared
/// in that directory can have appeared, disappeared, or changed shape, so
/// both sides are filtered before the regular algorithm runs.
pub fn diff_scoped(old: &AppSnapshot, new: &AppSnapshot, directory: &Path) -> SnapshotDiff {
    let scope = |snapshot: &AppSnapshot| AppSnapshot {
        extensions: snapshot
            .extensions
            .iter()
            .filter(|ext| ext.directory == directory)
            .cloned()
            .collect(),
        root_configuration: serde_json::Value::Null,
    };

    diff(&scope(old), &scope(new))
}

//! Application model: extension records, immutable snapshots, the manifest
//! loader, and the snapshot diff engine.

mod extension;
mod snapshot;

pub mod diff;
pub mod loader;

pub use diff::SnapshotDiff;
pub use extension::ExtensionRecord;
pub use loader::{AppLoader, LoadError, ManifestLoader};
pub use snapshot::AppSnapshot;

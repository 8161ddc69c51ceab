//! Application snapshot loading.
//!
//! The loader turns a workspace directory into an immutable [`AppSnapshot`]:
//! it parses the root application manifest, scans the configured extension
//! directory patterns for extension manifests, and materializes one
//! [`ExtensionRecord`] per declared extension. A single manifest may declare
//! several extensions; they share a directory but never a uid.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::app::{AppSnapshot, ExtensionRecord};

/// File name of a per-directory extension manifest.
pub const EXTENSION_CONFIG_FILE: &str = "extension.toml";

/// Default application manifest name at the workspace root.
pub const DEFAULT_APP_CONFIG_FILE: &str = "app.toml";

/// Errors from loading an application snapshot.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("application manifest not found at {path}")]
    AppConfigMissing { path: PathBuf },

    #[error("failed to parse application manifest {path}: {reason}")]
    AppConfigInvalid { path: PathBuf, reason: String },

    #[error("failed to parse extension manifest {path}: {reason}")]
    ManifestInvalid { path: PathBuf, reason: String },

    #[error("extension '{handle}' has invalid watch pattern '{pattern}': {reason}")]
    InvalidWatchPattern {
        handle: String,
        pattern: String,
        reason: String,
    },

    #[error("duplicate extension uid '{uid}' (declared by '{first}' and '{second}')")]
    DuplicateUid {
        uid: String,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Produces application snapshots from a root directory.
///
/// Invoked on startup and on every full reload. Implementations must be
/// side-effect free: each call returns a fresh snapshot.
#[async_trait]
pub trait AppLoader: Send + Sync {
    async fn load(&self, root: &Path) -> Result<AppSnapshot, LoadError>;
}

/// Loads snapshots from `app.toml` + per-directory `extension.toml` manifests.
pub struct ManifestLoader {
    app_config_file: String,
    extension_dir_patterns: Vec<String>,
}

impl ManifestLoader {
    pub fn new(app_config_file: impl Into<String>, extension_dir_patterns: Vec<String>) -> Self {
        Self {
            app_config_file: app_config_file.into(),
            extension_dir_patterns,
        }
    }

    /// Parse the root application manifest.
    fn load_root_configuration(&self, root: &Path) -> Result<serde_json::Value, LoadError> {
        let path = root.join(&self.app_config_file);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::AppConfigMissing { path });
            }
            Err(e) => return Err(e.into()),
        };

        let value: toml::Value =
            toml::from_str(&raw).map_err(|e| LoadError::AppConfigInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        serde_json::to_value(value).map_err(|e| LoadError::AppConfigInvalid {
            path,
            reason: e.to_string(),
        })
    }

    /// Directories that contain an extension manifest, in deterministic order.
    ///
    /// The root manifest's `extension_directories` overrides the configured
    /// patterns when present.
    fn discover_extension_dirs(
        &self,
        root: &Path,
        root_configuration: &serde_json::Value,
    ) -> Vec<PathBuf> {
        let patterns: Vec<String> = root_configuration
            .get("extension_directories")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_else(|| self.extension_dir_patterns.clone());

        let mut dirs = Vec::new();
        for pattern in &patterns {
            let full = root.join(pattern);
            let Ok(paths) = glob::glob(&full.to_string_lossy()) else {
                tracing::warn!("[loader] invalid extension directory pattern: {pattern}");
                continue;
            };
            for entry in paths.flatten() {
                if entry.is_dir() && entry.join(EXTENSION_CONFIG_FILE).is_file() {
                    dirs.push(entry);
                }
            }
        }
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Parse one extension manifest into records, one per declared extension.
    fn load_manifest(&self, directory: &Path) -> Result<Vec<ExtensionRecord>, LoadError> {
        let path = directory.join(EXTENSION_CONFIG_FILE);
        let raw = std::fs::read_to_string(&path)?;

        let manifest: toml::Value =
            toml::from_str(&raw).map_err(|e| LoadError::ManifestInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        let manifest =
            serde_json::to_value(manifest).map_err(|e| LoadError::ManifestInvalid {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        let entries = manifest
            .get("extensions")
            .and_then(|v| v.as_array())
            .ok_or_else(|| LoadError::ManifestInvalid {
                path: path.clone(),
                reason: "missing [[extensions]] table".to_string(),
            })?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            records.push(self.load_entry(directory, &path, entry)?);
        }
        Ok(records)
    }

    fn load_entry(
        &self,
        directory: &Path,
        manifest_path: &Path,
        entry: &serde_json::Value,
    ) -> Result<ExtensionRecord, LoadError> {
        let handle = entry
            .get("handle")
            .and_then(|v| v.as_str())
            .ok_or_else(|| LoadError::ManifestInvalid {
                path: manifest_path.to_path_buf(),
                reason: "extension entry is missing a handle".to_string(),
            })?
            .to_string();

        let uid = entry
            .get("uid")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ExtensionRecord::derived_uid(&handle, directory));

        let build_command = entry
            .get("build")
            .and_then(|b| b.get("command"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let watch_build_paths: Vec<String> = entry
            .get("build")
            .and_then(|b| b.get("watch"))
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|p| p.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        for pattern in &watch_build_paths {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(LoadError::InvalidWatchPattern {
                    handle,
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let mut record = ExtensionRecord::new(uid, handle, directory, entry.clone());
        record.watch_build_paths = watch_build_paths;
        record.build_command = build_command;
        Ok(record)
    }

    /// Every uid must be unique within one snapshot.
    fn check_unique_uids(extensions: &[ExtensionRecord]) -> Result<(), LoadError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for ext in extensions {
            if let Some(first) = seen.insert(ext.uid(), &ext.handle) {
                return Err(LoadError::DuplicateUid {
                    uid: ext.uid().to_string(),
                    first: first.to_string(),
                    second: ext.handle.clone(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AppLoader for ManifestLoader {
    async fn load(&self, root: &Path) -> Result<AppSnapshot, LoadError> {
        let root_configuration = self.load_root_configuration(root)?;

        let mut extensions = Vec::new();
        for dir in self.discover_extension_dirs(root, &root_configuration) {
            extensions.extend(self.load_manifest(&dir)?);
        }
        Self::check_unique_uids(&extensions)?;

        crate::debug_event!("loader", "loaded", "{} extensions", extensions.len());
        Ok(AppSnapshot::new(extensions, root_configuration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_app(root: &Path) {
        std::fs::write(root.join("app.toml"), "name = \"demo\"\n").unwrap();
    }

    fn write_extension(root: &Path, dir: &str, manifest: &str) -> PathBuf {
        let ext_dir = root.join("extensions").join(dir);
        std::fs::create_dir_all(&ext_dir).unwrap();
        std::fs::write(ext_dir.join(EXTENSION_CONFIG_FILE), manifest).unwrap();
        ext_dir
    }

    fn loader() -> ManifestLoader {
        ManifestLoader::new("app.toml", vec!["extensions/*".to_string()])
    }

    #[tokio::test]
    async fn test_load_single_extension() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(tmp.path());
        let dir = write_extension(
            tmp.path(),
            "checkout-ui",
            r#"
[[extensions]]
handle = "checkout-ui"
uid = "uid-checkout"

[extensions.build]
command = "npm run build"
watch = ["src/**/*"]
"#,
        );

        let snapshot = loader().load(tmp.path()).await.unwrap();
        assert_eq!(snapshot.extensions.len(), 1);

        let ext = &snapshot.extensions[0];
        assert_eq!(ext.uid(), "uid-checkout");
        assert_eq!(ext.handle, "checkout-ui");
        assert_eq!(ext.directory, dir);
        assert!(ext.is_buildable());
        assert_eq!(ext.watch_build_paths, vec!["src/**/*"]);
    }

    #[tokio::test]
    async fn test_manifest_declaring_two_extensions_shares_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(tmp.path());
        write_extension(
            tmp.path(),
            "bundle",
            r#"
[[extensions]]
handle = "widget-a"

[[extensions]]
handle = "widget-b"
"#,
        );

        let snapshot = loader().load(tmp.path()).await.unwrap();
        assert_eq!(snapshot.extensions.len(), 2);
        assert_eq!(snapshot.extension_dirs().len(), 1);
        // Derived uids differ even though the directory is shared
        assert_ne!(snapshot.extensions[0].uid(), snapshot.extensions[1].uid());
    }

    #[tokio::test]
    async fn test_missing_app_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = loader().load(tmp.path()).await.unwrap_err();
        assert!(matches!(err, LoadError::AppConfigMissing { .. }));
    }

    #[tokio::test]
    async fn test_unparsable_app_config_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("app.toml"), "not [valid toml").unwrap();
        let err = loader().load(tmp.path()).await.unwrap_err();
        assert!(matches!(err, LoadError::AppConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_uid_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(tmp.path());
        write_extension(
            tmp.path(),
            "dup",
            r#"
[[extensions]]
handle = "one"
uid = "same"

[[extensions]]
handle = "two"
uid = "same"
"#,
        );

        let err = loader().load(tmp.path()).await.unwrap_err();
        assert!(matches!(err, LoadError::DuplicateUid { .. }));
    }

    #[tokio::test]
    async fn test_directories_without_manifest_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        write_app(tmp.path());
        std::fs::create_dir_all(tmp.path().join("extensions/not-an-extension")).unwrap();

        let snapshot = loader().load(tmp.path()).await.unwrap();
        assert!(snapshot.extensions.is_empty());
    }
}

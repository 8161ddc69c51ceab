//! Build backend seam.
//!
//! The orchestrator never compiles anything itself: it drives a
//! [`BuildBackend`], which owns incremental compiler state (contexts) and
//! produces artifacts. The shipped backend shells out to each extension's
//! configured build command; tests substitute a recording mock.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::app::ExtensionRecord;

/// Opaque handle to incremental compiler state held by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(u64);

impl ContextHandle {
    /// Backends allocate handles; the orchestrator only stores them.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Reference to the build output produced for one extension.
#[derive(Debug, Clone)]
pub struct BuildArtifactRef {
    pub uid: String,
    pub path: PathBuf,
}

/// Errors from a single build invocation.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no build command configured for '{handle}'")]
    NotBuildable { handle: String },

    #[error("build command exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("failed to spawn build command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("build was cancelled")]
    Cancelled,
}

/// Outcome recorded on an extension event after a build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Ok,
    Error { message: String },
}

impl BuildOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, BuildOutcome::Ok)
    }
}

/// Compiles extensions and manages their incremental contexts.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Allocate incremental state for an extension. Called once when the
    /// extension first becomes buildable.
    async fn create_context(&self, extension: &ExtensionRecord)
    -> Result<ContextHandle, BuildError>;

    /// Release incremental state. Must tolerate handles it already released.
    async fn destroy_context(&self, handle: ContextHandle);

    /// Build one extension. `context` selects the incremental rebuild path;
    /// without it the build is cold.
    async fn build(
        &self,
        extension: &ExtensionRecord,
        context: Option<ContextHandle>,
    ) -> Result<BuildArtifactRef, BuildError>;
}

/// Artifact directory for one extension under the session's output root.
///
/// Uids can contain path separators (derived uids embed the directory), so
/// they are flattened into a single path component.
pub fn artifact_dir(output_root: &Path, uid: &str) -> PathBuf {
    let safe: String = uid
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    output_root.join(safe)
}

/// Backend that runs each extension's `build.command` through the shell.
///
/// The command runs with the extension directory as its working directory and
/// `APPWATCH_OUT_DIR` pointing at the artifact directory. Incremental and
/// cold builds are identical for this backend; the context only tracks that
/// the extension is part of the live session.
pub struct CommandBackend {
    output_root: PathBuf,
    cancel: CancellationToken,
    next_context: AtomicU64,
}

impl CommandBackend {
    pub fn new(output_root: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            output_root,
            cancel,
            next_context: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl BuildBackend for CommandBackend {
    async fn create_context(
        &self,
        extension: &ExtensionRecord,
    ) -> Result<ContextHandle, BuildError> {
        let handle = ContextHandle::new(self.next_context.fetch_add(1, Ordering::Relaxed));
        crate::debug_event!("build", "context created", "{}", extension.handle);
        Ok(handle)
    }

    async fn destroy_context(&self, handle: ContextHandle) {
        crate::debug_event!("build", "context destroyed", "#{}", handle.value());
    }

    async fn build(
        &self,
        extension: &ExtensionRecord,
        _context: Option<ContextHandle>,
    ) -> Result<BuildArtifactRef, BuildError> {
        let command = extension
            .build_command
            .as_deref()
            .ok_or_else(|| BuildError::NotBuildable {
                handle: extension.handle.clone(),
            })?;

        let out_dir = artifact_dir(&self.output_root, extension.uid());
        tokio::fs::create_dir_all(&out_dir).await?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&extension.directory)
            .env("APPWATCH_OUT_DIR", &out_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        // kill_on_drop reaps the child when the cancelled branch drops the
        // wait future
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = self.cancel.cancelled() => return Err(BuildError::Cancelled),
        };

        if output.status.success() {
            Ok(BuildArtifactRef {
                uid: extension.uid().to_string(),
                path: out_dir,
            })
        } else {
            Err(BuildError::CommandFailed {
                status: output.status.to_string(),
                stderr: tail(&String::from_utf8_lossy(&output.stderr), 2000),
            })
        }
    }
}

/// Keep only the last `max` bytes of build output, on a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.trim_end().to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn buildable(uid: &str, dir: &Path, command: &str) -> ExtensionRecord {
        let mut ext = ExtensionRecord::new(uid, uid, dir, json!({}));
        ext.build_command = Some(command.to_string());
        ext
    }

    #[test]
    fn test_artifact_dir_flattens_uid() {
        let dir = artifact_dir(Path::new("/out"), "widget@/app/extensions/widget");
        assert_eq!(dir, PathBuf::from("/out/widget__app_extensions_widget"));
    }

    #[tokio::test]
    async fn test_successful_command_build() {
        let tmp = tempfile::tempdir().unwrap();
        let ext_dir = tmp.path().join("ext");
        std::fs::create_dir_all(&ext_dir).unwrap();

        let backend = CommandBackend::new(tmp.path().join("out"), CancellationToken::new());
        let ext = buildable("u1", &ext_dir, "echo built > \"$APPWATCH_OUT_DIR/main.js\"");

        let artifact = backend.build(&ext, None).await.unwrap();
        assert!(artifact.path.join("main.js").exists());
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let ext_dir = tmp.path().join("ext");
        std::fs::create_dir_all(&ext_dir).unwrap();

        let backend = CommandBackend::new(tmp.path().join("out"), CancellationToken::new());
        let ext = buildable("u1", &ext_dir, "echo 'syntax error' >&2; exit 1");

        let err = backend.build(&ext, None).await.unwrap_err();
        match err {
            BuildError::CommandFailed { stderr, .. } => assert!(stderr.contains("syntax error")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_buildable_extension_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(tmp.path().join("out"), CancellationToken::new());
        let ext = ExtensionRecord::new("u1", "plain", tmp.path(), json!({}));

        let err = backend.build(&ext, None).await.unwrap_err();
        assert!(matches!(err, BuildError::NotBuildable { .. }));
    }
}

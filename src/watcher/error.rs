//! Error types for the watcher system.

use std::path::PathBuf;
use thiserror::Error;

use crate::app::LoadError;

/// Errors from watcher operations.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    /// The application manifest was deleted while watching. Unrecoverable:
    /// the dev session must stop.
    #[error("Application manifest was deleted: {path}")]
    AppConfigRemoved { path: PathBuf },

    /// The initial snapshot could not be loaded. Mid-session reload failures
    /// are not fatal and surface on the batch result instead.
    #[error("Failed to load application: {0}")]
    Load(#[from] LoadError),

    #[error("Watcher was started twice")]
    AlreadyStarted,

    #[error("Event channel closed unexpectedly")]
    ChannelClosed,
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::InitFailed {
            reason: e.to_string(),
        }
    }
}

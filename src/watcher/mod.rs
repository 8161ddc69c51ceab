//! The hot-reload watcher system.
//!
//! Raw filesystem events are debounced into batches, classified against the
//! current application snapshot, and turned into extension lifecycle events
//! that drive incremental builds.
//!
//! # Architecture
//!
//! ```text
//! FsEventSource (notify + BatchDebouncer)
//!       | Vec<RawEvent>
//!       v
//! WatcherController  -- owns the current AppSnapshot
//!       |                and serializes batch handling
//!       +-- router::classify  -> direct events | reload | fatal
//!       +-- app::diff         -> created/updated/deleted on reload
//!       +-- BuildOrchestrator -> per-extension contexts + builds
//!       |
//!       v
//! BatchResult broadcast to subscribers
//! ```

mod controller;
mod debouncer;
mod error;
mod event;
pub mod router;
mod source;

pub use controller::{ControllerState, WatcherController, WatcherControllerBuilder};
pub use debouncer::BatchDebouncer;
pub use error::WatchError;
pub use event::{BatchResult, ExtensionEvent, ExtensionEventKind, RawEvent, RawEventKind};
pub use router::Routing;
pub use source::{EventSource, FsEventSource};

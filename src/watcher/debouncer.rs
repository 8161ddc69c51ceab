//! Batch debouncing for raw filesystem events.
//!
//! A burst of writes (editor save, formatter, `npm install`) collapses into
//! one batch: events accumulate until the stream has been quiet for the
//! configured duration, then the whole batch is released at once.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::event::{RawEvent, RawEventKind};

/// Accumulates raw events and releases them as one batch per quiet period.
#[derive(Debug)]
pub struct BatchDebouncer {
    pending: Vec<RawEvent>,
    /// When the first event of the pending batch arrived.
    batch_start: Option<Instant>,
    /// When the most recent event arrived.
    last_event: Option<Instant>,
    /// How long the stream must be quiet before the batch is released.
    duration: Duration,
}

impl BatchDebouncer {
    /// Create a new debouncer with the given quiet period in milliseconds.
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            pending: Vec::new(),
            batch_start: None,
            last_event: None,
            duration: Duration::from_millis(debounce_ms),
        }
    }

    /// Record a raw event.
    ///
    /// Identical (kind, path) pairs within one pending batch are dropped;
    /// every event extends the quiet period.
    pub fn record(&mut self, kind: RawEventKind, path: PathBuf, extension_dir: PathBuf) {
        let now = Instant::now();
        self.last_event = Some(now);
        let batch_start = *self.batch_start.get_or_insert(now);

        if self
            .pending
            .iter()
            .any(|event| event.kind == kind && event.path == path)
        {
            return;
        }

        self.pending.push(RawEvent {
            kind,
            path,
            extension_dir,
            batch_start,
        });
    }

    /// Take the pending batch if the stream has been quiet long enough.
    ///
    /// Events keep their arrival order.
    pub fn take_ready(&mut self) -> Option<Vec<RawEvent>> {
        let last = self.last_event?;
        if last.elapsed() < self.duration {
            return None;
        }

        self.batch_start = None;
        self.last_event = None;
        Some(std::mem::take(&mut self.pending))
    }

    /// Check if there are any pending events.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

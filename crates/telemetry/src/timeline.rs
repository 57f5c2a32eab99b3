//! Append-only ride timeline: one writer, any number of readers.
//!
//! The writer takes the lock only to push; readers take it to clone a
//! snapshot or a tail. Each reader advances through the log with its own
//! cursor, woken by a `watch` length notifier.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use contracts::MetricSample;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct Shared {
    samples: RwLock<Vec<MetricSample>>,
    closed: AtomicBool,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Vec<MetricSample>> {
        self.samples.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create an empty timeline.
pub fn timeline() -> (TimelineWriter, TimelineReader) {
    let shared = Arc::new(Shared::default());
    let (len_tx, len_rx) = watch::channel(0);
    let writer = TimelineWriter {
        shared: shared.clone(),
        len_tx,
    };
    let reader = TimelineReader {
        shared,
        len_rx,
    };
    (writer, reader)
}

/// Sole appender. Dropping it closes the timeline.
#[derive(Debug)]
pub struct TimelineWriter {
    shared: Arc<Shared>,
    len_tx: watch::Sender<usize>,
}

impl TimelineWriter {
    /// Append one sample; returns the new length.
    pub fn push(&mut self, sample: MetricSample) -> usize {
        let len = {
            let mut samples = self
                .shared
                .samples
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            samples.push(sample);
            samples.len()
        };
        self.len_tx.send_replace(len);
        len
    }

    pub fn len(&self) -> usize {
        *self.len_tx.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reader(&self) -> TimelineReader {
        TimelineReader {
            shared: self.shared.clone(),
            len_rx: self.len_tx.subscribe(),
        }
    }
}

impl Drop for TimelineWriter {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

/// Read side of the timeline.
#[derive(Debug, Clone)]
pub struct TimelineReader {
    shared: Arc<Shared>,
    len_rx: watch::Receiver<usize>,
}

impl TimelineReader {
    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The writer is gone; no sample will be appended anymore.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Copy of every sample appended so far.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.shared.read().clone()
    }

    /// Snapshot plus a cursor positioned right after it, taken under one
    /// lock so no sample can fall between the two.
    pub fn snapshot_with_cursor(&self) -> (Vec<MetricSample>, TimelineCursor) {
        let mut changes = self.len_rx.clone();
        changes.borrow_and_update();
        let snapshot = self.shared.read().clone();
        let cursor = TimelineCursor {
            shared: self.shared.clone(),
            changes,
            position: snapshot.len(),
        };
        (snapshot, cursor)
    }

    /// Cursor starting at `position` (clamped to the current length).
    pub fn cursor_at(&self, position: usize) -> TimelineCursor {
        let mut changes = self.len_rx.clone();
        changes.borrow_and_update();
        TimelineCursor {
            shared: self.shared.clone(),
            changes,
            position: position.min(self.len()),
        }
    }

    /// Run `f` over the samples without cloning them.
    pub fn read<R>(&self, f: impl FnOnce(&[MetricSample]) -> R) -> R {
        f(&self.shared.read())
    }
}

/// Monotonic read position into the timeline.
#[derive(Debug)]
pub struct TimelineCursor {
    shared: Arc<Shared>,
    changes: watch::Receiver<usize>,
    position: usize,
}

impl TimelineCursor {
    pub fn position(&self) -> usize {
        self.position
    }

    /// Samples appended since the last call, in append order.
    ///
    /// Suspends while there are none. `None` once the writer is gone and
    /// everything has been read.
    pub async fn next_batch(&mut self) -> Option<Vec<MetricSample>> {
        loop {
            if let Some(batch) = self.take_tail() {
                return Some(batch);
            }
            if self.changes.changed().await.is_err() {
                return self.take_tail();
            }
        }
    }

    /// Non-suspending variant of [`next_batch`](Self::next_batch).
    pub fn try_next_batch(&mut self) -> Option<Vec<MetricSample>> {
        self.take_tail()
    }

    fn take_tail(&mut self) -> Option<Vec<MetricSample>> {
        let samples = self.shared.read();
        if samples.len() <= self.position {
            return None;
        }
        let batch = samples[self.position..].to_vec();
        self.position = samples.len();
        Some(batch)
    }
}

//! Distribution Service - join-time semantics for viewers
//!
//! A subscription yields, in order:
//!
//! ```text
//! hello {"ride": {...}}
//! replay samples (snapshot at subscribe time, chunked)
//! end-of-replay {"replay_end": N}
//! live samples (append order, at most once) until the ride ends
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use contracts::{MetricSample, RideInfo, TimeBase, WireFrame};
use telemetry::{TimelineCursor, TimelineReader};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

/// Distribution configuration
#[derive(Debug, Clone)]
pub struct DistributionConfig {
    /// Replay samples sent between yields
    pub replay_chunk_size: usize,
    /// Pause between replay chunks
    pub replay_yield: Duration,
    /// Clock of outgoing sample timestamps
    pub time_base: TimeBase,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            replay_chunk_size: 10,
            replay_yield: Duration::from_millis(10),
            time_base: TimeBase::Elapsed,
        }
    }
}

/// Hands out subscriptions over one ride timeline
#[derive(Debug)]
pub struct DistributionService {
    reader: TimelineReader,
    info: RideInfo,
    config: DistributionConfig,
    next_id: AtomicU64,
}

impl DistributionService {
    /// The configured time base overrides the one in `info`.
    pub fn new(reader: TimelineReader, info: RideInfo, config: DistributionConfig) -> Self {
        let info = RideInfo {
            time_base: config.time_base,
            ..info
        };
        Self {
            reader,
            info,
            config,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn ride_info(&self) -> &RideInfo {
        &self.info
    }

    pub fn timeline(&self) -> &TimelineReader {
        &self.reader
    }

    /// New viewer: replay everything so far, then follow the tail.
    #[instrument(name = "distribution_subscribe", skip(self))]
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (replay, cursor) = self.reader.snapshot_with_cursor();
        info!(viewer = id, replay = replay.len(), "viewer subscribed");

        Subscription {
            id,
            info: self.info,
            phase: SubscriptionPhase::Hello,
            replay_total: replay.len(),
            replay: replay.into(),
            cursor,
            pending: VecDeque::new(),
            chunk_size: self.config.replay_chunk_size.max(1),
            replay_yield: self.config.replay_yield,
            sent_in_chunk: 0,
            replay_started: None,
        }
    }
}

/// Where a subscription is in its frame sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    Hello,
    Replay,
    Live,
    Ended,
}

impl SubscriptionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionPhase::Hello => "hello",
            SubscriptionPhase::Replay => "replay",
            SubscriptionPhase::Live => "live",
            SubscriptionPhase::Ended => "ended",
        }
    }
}

/// One viewer's view of the timeline
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    info: RideInfo,
    phase: SubscriptionPhase,
    replay: VecDeque<MetricSample>,
    replay_total: usize,
    cursor: TimelineCursor,
    pending: VecDeque<MetricSample>,
    chunk_size: usize,
    replay_yield: Duration,
    sent_in_chunk: usize,
    replay_started: Option<Instant>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.phase
    }

    /// Number of samples in this viewer's replay
    pub fn replay_len(&self) -> usize {
        self.replay_total
    }

    /// Next frame for this viewer. `None` once the ride has ended and
    /// everything was delivered.
    ///
    /// Cancel-safe: a frame is only taken from the queue when returned.
    pub async fn next_frame(&mut self) -> Option<WireFrame> {
        match self.phase {
            SubscriptionPhase::Hello => {
                self.phase = SubscriptionPhase::Replay;
                self.replay_started = Some(Instant::now());
                Some(WireFrame::Hello { ride: self.info })
            }
            SubscriptionPhase::Replay => {
                if self.replay.is_empty() {
                    self.finish_replay();
                    return Some(WireFrame::ReplayEnd {
                        replay_end: self.replay_total,
                    });
                }
                if self.sent_in_chunk == self.chunk_size {
                    sleep(self.replay_yield).await;
                    self.sent_in_chunk = 0;
                }
                self.sent_in_chunk += 1;
                let sample = self.replay.pop_front()?;
                Some(self.to_wire(sample))
            }
            SubscriptionPhase::Live => {
                if self.pending.is_empty() {
                    match self.cursor.next_batch().await {
                        Some(batch) => self.pending.extend(batch),
                        None => {
                            debug!(viewer = self.id, "timeline closed");
                            self.phase = SubscriptionPhase::Ended;
                            return None;
                        }
                    }
                }
                let sample = self.pending.pop_front()?;
                Some(self.to_wire(sample))
            }
            SubscriptionPhase::Ended => None,
        }
    }

    fn finish_replay(&mut self) {
        self.phase = SubscriptionPhase::Live;
        let duration_ms = self
            .replay_started
            .map(|at| at.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or_default();
        observability::record_replay_completed(self.replay_total, duration_ms);
        debug!(viewer = self.id, samples = self.replay_total, duration_ms, "replay complete");
    }

    fn to_wire(&self, mut sample: MetricSample) -> WireFrame {
        sample.timestamp = self.info.to_wire(sample.timestamp);
        WireFrame::Sample(sample)
    }
}

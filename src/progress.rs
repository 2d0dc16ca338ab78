//! C9 — ordered, replayable progress-event stream.
//!
//! Publishes [`ProgressEvent`]s for a single plan in strictly increasing
//! `sequence` order, and keeps a bounded ring buffer of recent events so a
//! subscriber that reconnects after a gap can replay what it missed
//! instead of losing it outright. Grounded on the teacher's
//! `dashflow-observability` replay buffer: an in-memory `VecDeque` of
//! recent messages, hit/miss counters, and explicit handling for a
//! subscriber that falls behind (here: replay resumes from the oldest
//! sequence still buffered, and the caller is told how many events were
//! dropped rather than being handed a silent gap).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::types::{PlanId, ProgressEvent, ProgressEventKind};

/// Result of asking a [`ProgressStream`] to replay from a given sequence.
#[derive(Debug, Clone)]
pub struct ReplayResult {
    /// Events available to replay, in sequence order.
    pub events: Vec<ProgressEvent>,
    /// Number of events that existed but had already fallen out of the
    /// ring buffer by the time this replay was requested.
    pub dropped: u64,
}

/// Publishes and buffers progress events for one plan.
pub struct ProgressStream {
    plan_id: PlanId,
    start: Instant,
    next_sequence: AtomicU64,
    buffer: Mutex<VecDeque<ProgressEvent>>,
    capacity: usize,
    sender: broadcast::Sender<ProgressEvent>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProgressStream {
    /// Create a stream for a plan with the given replay-buffer capacity.
    pub fn new(plan_id: PlanId, capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            plan_id,
            start: Instant::now(),
            next_sequence: AtomicU64::new(0),
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sender,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Publish a new event, assigning it the next sequence number.
    ///
    /// Broadcasting to zero live subscribers is not an error: the ring
    /// buffer still retains the event for anyone who subscribes later.
    pub fn publish(&self, kind: ProgressEventKind) -> ProgressEvent {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let event = ProgressEvent {
            plan_id: self.plan_id,
            sequence,
            kind,
            elapsed: self.start.elapsed(),
        };

        {
            let mut buffer = self.buffer.lock();
            if buffer.len() == self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        // A broadcast send fails only when there are zero active
        // receivers, which is an expected, unremarkable state here.
        let _ = self.sender.send(event.clone());

        event
    }

    /// Subscribe to live events published from this point forward.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Replay every buffered event with `sequence >= from`, reporting how
    /// many earlier events had already been evicted from the buffer.
    pub fn replay_from(&self, from: u64) -> ReplayResult {
        let buffer = self.buffer.lock();
        let oldest_buffered = buffer.front().map(|e| e.sequence);

        let dropped = match oldest_buffered {
            Some(oldest) if oldest > from => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                oldest - from
            }
            Some(_) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                0
            }
            None => 0,
        };

        let events = buffer
            .iter()
            .filter(|e| e.sequence >= from)
            .cloned()
            .collect();

        ReplayResult { events, dropped }
    }

    /// Number of replay requests fully satisfied from the buffer.
    pub fn replay_hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of replay requests that had to report dropped events.
    pub fn replay_misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Wall-clock elapsed since the stream was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Subscribe as a single `async` iterator: buffered history with
    /// `sequence >= since_sequence` first, then the live tail, with no gap
    /// and no duplicate in between. This is the `subscribe(session_id,
    /// since_sequence?)` contract: a late joiner with `since_sequence = 0`
    /// gets the full history and then rides the live stream, exactly as a
    /// fresh subscriber would, without racing a publish that happens while
    /// the replay is being drained.
    pub fn subscribe_from(
        self: &Arc<Self>,
        since_sequence: u64,
    ) -> impl Stream<Item = ProgressEvent> + 'static {
        let this = Arc::clone(self);
        async_stream::stream! {
            // Subscribing before draining history closes the race: any
            // event published after this point is either already in the
            // replay (if publish finished before replay_from snapshotted
            // the buffer) or will arrive over `live`, never both.
            let mut live = this.sender.subscribe();
            let replay = this.replay_from(since_sequence);
            let mut last_seen = since_sequence.checked_sub(1);
            for event in replay.events {
                last_seen = Some(event.sequence);
                yield event;
            }
            loop {
                match live.recv().await {
                    Ok(event) => {
                        if last_seen.map_or(true, |seen| event.sequence > seen) {
                            last_seen = Some(event.sequence);
                            yield event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Fell behind the broadcast channel; the ring
                        // buffer is the source of truth for anything
                        // missed, so catch up from it and keep going. The
                        // lag itself is a control-plane fault, not a plan
                        // outcome, so it gets its own sequence number
                        // rather than being folded into the replay.
                        let sequence = this.next_sequence.fetch_add(1, Ordering::SeqCst);
                        yield ProgressEvent {
                            plan_id: this.plan_id,
                            sequence,
                            kind: ProgressEventKind::SystemError {
                                detail: format!(
                                    "subscriber lagged, skipped {skipped} broadcast event(s); catching up from replay buffer"
                                ),
                            },
                            elapsed: this.start.elapsed(),
                        };
                        last_seen = Some(sequence);
                        let catch_up = this.replay_from(last_seen.map_or(0, |s| s + 1));
                        for event in catch_up.events {
                            if last_seen.map_or(true, |seen| event.sequence > seen) {
                                last_seen = Some(event.sequence);
                                yield event;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

//! Priority-based outgoing queue.
//!
//! Every peer owns an [`OutgoingQueue`]. Messages are pulled by priority
//! (level 0 first) and FIFO within a level. A lower level that has waited
//! through `starvation_threshold` consecutive pulls of higher levels gets
//! the next pull; waiting lower levels take turns.
//!
//! Pulled messages are packed into frames of at most `max_batch_bytes`.
//! A frame is released at the next scheduler tick, or once `flush_delay`
//! has passed since the first queued message when a delay is configured.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

use cojson_core::{Clock, Priority};

use crate::codec::join_lines;
use crate::messages::limits;

/// Queue tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Ceiling for one outgoing frame.
    pub max_batch_bytes: usize,
    /// Hold the first message this long to collect a batch. Zero flushes
    /// at the next tick.
    pub flush_delay_ms: u64,
    /// Consecutive higher-level pulls a waiting lower level tolerates.
    pub starvation_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: limits::DEFAULT_MAX_BATCH_BYTES,
            flush_delay_ms: 0,
            starvation_threshold: 10,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Priority queue
// ─────────────────────────────────────────────────────────────────────────────

/// Eight FIFO levels with round-robin relief for starved lower levels.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    levels: Vec<VecDeque<T>>,
    starvation_threshold: u32,
    streak: u32,
    cursor: usize,
}

impl<T> PriorityQueue<T> {
    pub fn new(starvation_threshold: u32) -> Self {
        Self {
            levels: (0..Priority::LEVELS).map(|_| VecDeque::new()).collect(),
            starvation_threshold: starvation_threshold.max(1),
            streak: 0,
            cursor: 0,
        }
    }

    pub fn push(&mut self, priority: Priority, item: T) {
        self.levels[priority.index()].push_back(item);
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    /// The item the next `pull` returns.
    pub fn peek(&self) -> Option<&T> {
        let (level, _) = self.next_level()?;
        self.levels[level].front()
    }

    /// Remove the next item by priority.
    pub fn pull(&mut self) -> Option<(Priority, T)> {
        let (level, relief) = self.next_level()?;
        if relief {
            self.streak = 0;
            self.cursor = level + 1;
        } else if self.lower_waiting(level) {
            self.streak += 1;
        } else {
            self.streak = 0;
        }
        let item = self.levels[level].pop_front()?;
        Some((Priority::new(level as u8), item))
    }

    /// Remove everything, highest level first.
    pub fn drain(&mut self) -> Vec<T> {
        self.streak = 0;
        self.levels.iter_mut().flat_map(|level| level.drain(..)).collect()
    }

    fn lower_waiting(&self, level: usize) -> bool {
        self.levels[level + 1..].iter().any(|l| !l.is_empty())
    }

    /// Level to serve next, and whether it is starvation relief.
    fn next_level(&self) -> Option<(usize, bool)> {
        let top = self.levels.iter().position(|l| !l.is_empty())?;
        if self.streak < self.starvation_threshold || !self.lower_waiting(top) {
            return Some((top, false));
        }
        let waiting: Vec<usize> = (top + 1..Priority::LEVELS)
            .filter(|&l| !self.levels[l].is_empty())
            .collect();
        let level = waiting
            .iter()
            .copied()
            .find(|&l| l >= self.cursor)
            .or_else(|| waiting.first().copied())?;
        Some((level, true))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outgoing queue
// ─────────────────────────────────────────────────────────────────────────────

/// What became of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport.
    Sent,
    /// The peer closed first.
    Dropped,
}

struct Pending {
    line: Bytes,
    receipt: Option<oneshot::Sender<SendOutcome>>,
}

struct QueueState {
    queue: PriorityQueue<Pending>,
    queued_bytes: usize,
    first_queued_at: Option<i64>,
    closed: bool,
}

/// A frame ready for the transport.
pub struct Batch {
    pub frame: Bytes,
    pub messages: usize,
    receipts: Vec<oneshot::Sender<SendOutcome>>,
}

impl Batch {
    /// Resolve the send receipts of every message in the frame.
    pub fn complete(self, outcome: SendOutcome) {
        for receipt in self.receipts {
            let _ = receipt.send(outcome);
        }
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("bytes", &self.frame.len())
            .field("messages", &self.messages)
            .finish()
    }
}

/// Result of polling the queue.
#[derive(Debug)]
pub enum Poll {
    Ready(Batch),
    /// Messages are queued but held for batching this much longer.
    Wait(Duration),
    Empty,
    Closed,
}

/// A peer's outgoing queue, shared between the protocol (producer) and the
/// peer's writer task (consumer).
pub struct OutgoingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl OutgoingQueue {
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: PriorityQueue::new(config.starvation_threshold),
                queued_bytes: 0,
                first_queued_at: None,
                closed: false,
            }),
            notify: Notify::new(),
            config,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an encoded message. The receiver resolves once the message was
    /// written or dropped; it never errors on an ordinary close.
    pub fn push(&self, priority: Priority, line: Bytes) -> oneshot::Receiver<SendOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            let _ = tx.send(SendOutcome::Dropped);
            return rx;
        }
        if state.queue.is_empty() {
            state.first_queued_at = Some(self.clock.now_millis());
        }
        state.queued_bytes += line.len();
        state.queue.push(
            priority,
            Pending {
                line,
                receipt: Some(tx),
            },
        );
        drop(state);
        self.notify.notify_one();
        rx
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Take the next frame if one is due.
    pub fn poll_batch(&self) -> Poll {
        let mut state = self.lock();
        if state.queue.is_empty() {
            return if state.closed { Poll::Closed } else { Poll::Empty };
        }

        if self.config.flush_delay_ms > 0 && state.queued_bytes < self.config.max_batch_bytes {
            let waited = state
                .first_queued_at
                .map(|at| self.clock.now_millis().saturating_sub(at))
                .unwrap_or(0)
                .max(0) as u64;
            if waited < self.config.flush_delay_ms {
                return Poll::Wait(Duration::from_millis(self.config.flush_delay_ms - waited));
            }
        }

        let mut lines = Vec::new();
        let mut receipts = Vec::new();
        let mut size = 0usize;
        while let Some(next) = state.queue.peek() {
            let added = next.line.len() + usize::from(!lines.is_empty());
            if !lines.is_empty() && size + added > self.config.max_batch_bytes {
                break;
            }
            let Some((_, pending)) = state.queue.pull() else {
                break;
            };
            size += added;
            state.queued_bytes = state.queued_bytes.saturating_sub(pending.line.len());
            receipts.extend(pending.receipt);
            lines.push(pending.line);
        }
        state.first_queued_at = if state.queue.is_empty() {
            None
        } else {
            Some(self.clock.now_millis())
        };

        Poll::Ready(Batch {
            frame: join_lines(&lines),
            messages: lines.len(),
            receipts,
        })
    }

    /// Wait for the next frame. Returns `None` once the queue is closed and
    /// empty.
    pub async fn next_batch(&self) -> Option<Batch> {
        loop {
            match self.poll_batch() {
                Poll::Ready(batch) => return Some(batch),
                Poll::Closed => return None,
                Poll::Wait(delay) => tokio::time::sleep(delay).await,
                Poll::Empty => {
                    self.notify.notified().await;
                    // Let producers of the same tick add to the batch.
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Close the queue. Pending sends resolve as dropped.
    pub fn close(&self) {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.queued_bytes = 0;
            state.first_queued_at = None;
            state.queue.drain()
        };
        for pending in drained {
            if let Some(receipt) = pending.receipt {
                let _ = receipt.send(SendOutcome::Dropped);
            }
        }
        self.notify.notify_one();
    }
}

impl std::fmt::Debug for OutgoingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OutgoingQueue")
            .field("len", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_core::ManualClock;
    use proptest::prelude::*;

    fn queue(config: QueueConfig) -> (OutgoingQueue, Arc<ManualClock>) {
        let clock = ManualClock::new(0);
        (OutgoingQueue::new(config, clock.clone()), clock)
    }

    fn ready(poll: Poll) -> Batch {
        match poll {
            Poll::Ready(batch) => batch,
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[test]
    fn test_high_before_low_in_either_order() {
        for high_first in [true, false] {
            let mut q = PriorityQueue::new(10);
            if high_first {
                q.push(Priority::HIGH, "high");
                q.push(Priority::LOW, "low");
            } else {
                q.push(Priority::LOW, "low");
                q.push(Priority::HIGH, "high");
            }
            assert_eq!(q.pull(), Some((Priority::HIGH, "high")));
            assert_eq!(q.pull(), Some((Priority::LOW, "low")));
            assert_eq!(q.pull(), None);
        }
    }

    #[test]
    fn test_fifo_within_level() {
        let mut q = PriorityQueue::new(10);
        for i in 0..5 {
            q.push(Priority::MEDIUM, i);
        }
        let order: Vec<_> = std::iter::from_fn(|| q.pull().map(|(_, i)| i)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_anti_starvation_cycle() {
        let mut q = PriorityQueue::new(10);
        for i in 0..25 {
            q.push(Priority::HIGH, format!("h{i}"));
        }
        q.push(Priority::LOW, "low".to_string());

        // Ten HIGH pulls, then LOW gets its turn.
        for i in 0..10 {
            assert_eq!(q.pull().unwrap().1, format!("h{i}"));
        }
        assert_eq!(q.pull(), Some((Priority::LOW, "low".to_string())));
        assert_eq!(q.pull().unwrap().1, "h10");
    }

    #[test]
    fn test_relief_rotates_between_waiting_levels() {
        let mut q = PriorityQueue::new(2);
        for i in 0..10 {
            q.push(Priority::HIGH, format!("h{i}"));
        }
        q.push(Priority::MEDIUM, "m0".to_string());
        q.push(Priority::MEDIUM, "m1".to_string());
        q.push(Priority::LOW, "l0".to_string());

        let order: Vec<String> = std::iter::from_fn(|| q.pull().map(|(_, s)| s)).take(9).collect();
        assert_eq!(order, vec!["h0", "h1", "m0", "h2", "h3", "l0", "h4", "h5", "m1"]);
    }

    #[test]
    fn test_batch_respects_ceiling() {
        let (q, _) = queue(QueueConfig {
            max_batch_bytes: 10,
            ..QueueConfig::default()
        });
        q.push(Priority::MEDIUM, Bytes::from_static(b"aaaa"));
        q.push(Priority::MEDIUM, Bytes::from_static(b"bbbb"));
        q.push(Priority::MEDIUM, Bytes::from_static(b"cccc"));

        let first = ready(q.poll_batch());
        assert_eq!(&first.frame[..], b"aaaa\nbbbb");
        let second = ready(q.poll_batch());
        assert_eq!(&second.frame[..], b"cccc");
        assert!(matches!(q.poll_batch(), Poll::Empty));
    }

    #[test]
    fn test_oversized_message_goes_alone() {
        let (q, _) = queue(QueueConfig {
            max_batch_bytes: 4,
            ..QueueConfig::default()
        });
        q.push(Priority::HIGH, Bytes::from_static(b"0123456789"));
        assert_eq!(ready(q.poll_batch()).messages, 1);
    }

    #[test]
    fn test_flush_delay_uses_clock() {
        let (q, clock) = queue(QueueConfig {
            flush_delay_ms: 50,
            ..QueueConfig::default()
        });
        q.push(Priority::MEDIUM, Bytes::from_static(b"x"));
        assert!(matches!(q.poll_batch(), Poll::Wait(d) if d == Duration::from_millis(50)));

        clock.advance(20);
        q.push(Priority::MEDIUM, Bytes::from_static(b"y"));
        assert!(matches!(q.poll_batch(), Poll::Wait(d) if d == Duration::from_millis(30)));

        clock.advance(30);
        assert_eq!(&ready(q.poll_batch()).frame[..], b"x\ny");
    }

    #[tokio::test]
    async fn test_close_resolves_pending_sends() {
        let (q, _) = queue(QueueConfig::default());
        let pending = q.push(Priority::MEDIUM, Bytes::from_static(b"x"));
        q.close();

        assert_eq!(pending.await.unwrap(), SendOutcome::Dropped);
        assert!(matches!(q.poll_batch(), Poll::Closed));
        let late = q.push(Priority::HIGH, Bytes::from_static(b"y"));
        assert_eq!(late.await.unwrap(), SendOutcome::Dropped);
        assert!(q.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn test_completed_batch_resolves_sent() {
        let (q, _) = queue(QueueConfig::default());
        let receipt = q.push(Priority::HIGH, Bytes::from_static(b"x"));
        let batch = q.next_batch().await.unwrap();
        batch.complete(SendOutcome::Sent);
        assert_eq!(receipt.await.unwrap(), SendOutcome::Sent);
    }

    proptest! {
        /// Without starvation relief in play, pulls come out sorted by
        /// level and FIFO within a level.
        #[test]
        fn prop_pull_order_is_priority_then_fifo(
            levels in proptest::collection::vec(0u8..8, 1..40)
        ) {
            let mut q = PriorityQueue::new(u32::MAX);
            for (i, level) in levels.iter().enumerate() {
                q.push(Priority::new(*level), (*level, i));
            }
            let pulled: Vec<(u8, usize)> =
                std::iter::from_fn(|| q.pull().map(|(_, item)| item)).collect();
            let mut expected: Vec<(u8, usize)> =
                levels.iter().enumerate().map(|(i, l)| (*l, i)).collect();
            expected.sort();
            prop_assert_eq!(pulled, expected);
        }

        /// Every queued item is eventually pulled exactly once.
        #[test]
        fn prop_nothing_is_lost(
            levels in proptest::collection::vec(0u8..8, 0..60),
            threshold in 1u32..5
        ) {
            let mut q = PriorityQueue::new(threshold);
            for (i, level) in levels.iter().enumerate() {
                q.push(Priority::new(*level), i);
            }
            let mut pulled: Vec<usize> =
                std::iter::from_fn(|| q.pull().map(|(_, item)| item)).collect();
            pulled.sort();
            prop_assert_eq!(pulled, (0..levels.len()).collect::<Vec<_>>());
        }
    }
}

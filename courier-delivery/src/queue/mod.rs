//! Priority queue of messages awaiting delivery
//!
//! Requests are ordered by priority rank, then `scheduled_for`, then
//! `created_at`, then insertion sequence. Requests scheduled in the future
//! wait in a separate time-ordered heap and are promoted when a dequeue
//! finds them due. Cancelled or replaced entries are dropped lazily.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
    time::SystemTime,
};

use courier_common::{MessageId, MessageRequest, MessageStatus};
use parking_lot::Mutex;
use tokio::sync::Notify;

type ReadyKey = (u8, SystemTime, SystemTime, u64);

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<Reverse<ReadyKey>>,
    delayed: BinaryHeap<Reverse<(SystemTime, u64)>>,
    entries: HashMap<u64, MessageRequest>,
    index: HashMap<MessageId, u64>,
    next_seq: u64,
}

impl QueueState {
    fn promote_due(&mut self, now: SystemTime) {
        while let Some(Reverse((scheduled_for, seq))) = self.delayed.peek().copied()
            && scheduled_for <= now
        {
            self.delayed.pop();
            if let Some(entry) = self.entries.get(&seq) {
                self.ready.push(Reverse((
                    entry.priority.rank(),
                    entry.scheduled_for,
                    entry.created_at,
                    seq,
                )));
            }
        }
    }

    fn take(&mut self, seq: u64) -> Option<MessageRequest> {
        let entry = self.entries.remove(&seq)?;
        self.index.remove(&entry.id);
        Some(entry)
    }
}

/// Shared queue of pending messages
///
/// Cloning yields another handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct PriorityQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl PriorityQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a request, replacing any queued entry with the same id, and wake
    /// one idle worker
    pub fn enqueue(&self, request: MessageRequest) {
        {
            let mut state = self.state.lock();

            let seq = state.next_seq;
            state.next_seq += 1;

            if let Some(previous) = state.index.insert(request.id, seq) {
                state.entries.remove(&previous);
            }

            state.delayed.push(Reverse((request.scheduled_for, seq)));
            state.entries.insert(seq, request);
        }

        self.notify.notify_one();
    }

    /// Highest-priority request that is due and still pending
    pub fn dequeue_ready(&self) -> Option<MessageRequest> {
        self.dequeue_ready_at(SystemTime::now())
    }

    pub fn dequeue_ready_at(&self, now: SystemTime) -> Option<MessageRequest> {
        let mut state = self.state.lock();
        state.promote_due(now);

        while let Some(Reverse((_, _, _, seq))) = state.ready.pop() {
            let Some(entry) = state.take(seq) else {
                continue;
            };

            if entry.status == MessageStatus::Pending {
                return Some(entry);
            }
        }

        None
    }

    /// Remove a queued request, returning it if it was still queued
    pub fn cancel(&self, id: &MessageId) -> Option<MessageRequest> {
        let mut state = self.state.lock();
        let seq = state.index.get(id).copied()?;
        state.take(seq)
    }

    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.state.lock().index.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Earliest time at which some queued request is eligible
    ///
    /// A time in the past means something can be dequeued now.
    #[must_use]
    pub fn next_ready_at(&self) -> Option<SystemTime> {
        let mut state = self.state.lock();

        while let Some(Reverse((_, _, _, seq))) = state.ready.peek().copied() {
            if let Some(entry) = state.entries.get(&seq) {
                return Some(entry.scheduled_for);
            }
            state.ready.pop();
        }

        while let Some(Reverse((scheduled_for, seq))) = state.delayed.peek().copied() {
            if state.entries.contains_key(&seq) {
                return Some(scheduled_for);
            }
            state.delayed.pop();
        }

        None
    }

    /// Resolves when something was enqueued since the last wake-up
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

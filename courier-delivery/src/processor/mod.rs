//! Dispatcher orchestration
//!
//! A fixed pool of workers pulls ready messages off the [`PriorityQueue`]
//! and drives each through one attempt cycle. Workers stop claiming new work
//! on shutdown; an attempt already in flight completes and is recorded
//! before its worker exits.

pub(crate) mod persist;
pub mod process;
pub mod recover;

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime},
};

use courier_common::{
    ChannelKind, MessageId, MessageRequest, MessageStatus, Signal, internal,
    tracing::{debug, error, warn},
};
use courier_store::DeliveryStateStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, watch},
    task::JoinSet,
};

pub use recover::RecoveryReport;

use crate::{policy::RetryPolicy, queue::PriorityQueue, registry::ChannelRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Number of concurrent workers
    ///
    /// Default: 4
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Per-attempt send timeout (in milliseconds); a timeout counts as a
    /// transient failure
    ///
    /// Default: 30000 (30 seconds)
    #[serde(default = "defaults::send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Messages whose first attempt would happen this long after their
    /// scheduled time are expired instead (in seconds)
    ///
    /// Default: 86400 (24 hours)
    #[serde(default = "defaults::staleness_secs")]
    pub staleness_secs: u64,

    /// Longest an idle worker sleeps before looking at the queue again
    /// (in milliseconds)
    ///
    /// Default: 1000
    #[serde(default = "defaults::idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Attempts made for each store write before giving up on it
    ///
    /// Default: 5
    #[serde(default = "defaults::storage_retry_attempts")]
    pub storage_retry_attempts: u32,

    /// Base delay between store write retries (in milliseconds)
    ///
    /// Default: 50
    #[serde(default = "defaults::storage_retry_base_ms")]
    pub storage_retry_base_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            send_timeout_ms: defaults::send_timeout_ms(),
            staleness_secs: defaults::staleness_secs(),
            idle_poll_ms: defaults::idle_poll_ms(),
            storage_retry_attempts: defaults::storage_retry_attempts(),
            storage_retry_base_ms: defaults::storage_retry_base_ms(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub const fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    #[must_use]
    pub const fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    #[must_use]
    pub const fn storage_retry_base(&self) -> Duration {
        Duration::from_millis(self.storage_retry_base_ms)
    }
}

mod defaults {
    pub const fn workers() -> usize {
        4
    }

    pub const fn send_timeout_ms() -> u64 {
        30_000
    }

    pub const fn staleness_secs() -> u64 {
        86_400 // 24 hours
    }

    pub const fn idle_poll_ms() -> u64 {
        1_000
    }

    pub const fn storage_retry_attempts() -> u32 {
        5
    }

    pub const fn storage_retry_base_ms() -> u64 {
        50
    }
}

/// Published whenever a message reaches a terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryEvent {
    pub message_id: MessageId,
    pub recipient: String,
    pub status: MessageStatus,
    pub channel: Option<ChannelKind>,
    pub attempts: u32,
    pub error: Option<String>,
    pub user_id: Option<String>,
}

impl From<&MessageRequest> for DeliveryEvent {
    fn from(message: &MessageRequest) -> Self {
        Self {
            message_id: message.id,
            recipient: message.recipient.clone(),
            status: message.status,
            channel: message.last_channel_tried,
            attempts: message.attempt_count,
            error: message.last_error.clone(),
            user_id: message.user_id.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    pub(crate) config: DispatcherConfig,
    pub(crate) queue: PriorityQueue,
    pub(crate) registry: Arc<ChannelRegistry>,
    pub(crate) policy: RetryPolicy,
    pub(crate) store: Arc<dyn DeliveryStateStore>,
    pub(crate) events: broadcast::Sender<DeliveryEvent>,
    /// Messages that reached a terminal status the store has not taken yet
    settled: Mutex<HashMap<MessageId, MessageRequest>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<ChannelRegistry>,
        policy: RetryPolicy,
        store: Arc<dyn DeliveryStateStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);

        Self {
            config,
            queue: PriorityQueue::new(),
            registry,
            policy,
            store,
            events,
            settled: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    #[must_use]
    pub const fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Tell subscribers a message reached a terminal status
    pub(crate) fn publish(&self, message: &MessageRequest) {
        // No subscribers is fine
        let _ = self.events.send(DeliveryEvent::from(message));
    }

    /// Hold a settled message until the store accepts it
    pub(crate) fn hold_settled(&self, message: MessageRequest) {
        self.settled.lock().insert(message.id, message);
    }

    /// A settled message still waiting to be persisted
    pub(crate) fn held(&self, id: &MessageId) -> Option<MessageRequest> {
        self.settled.lock().get(id).cloned()
    }

    /// Try once more to persist every held message, announcing those the
    /// store accepts
    async fn flush_settled(&self) {
        let held: Vec<_> = self.settled.lock().drain().map(|(_, m)| m).collect();

        for message in held {
            match self.store.upsert(&message).await {
                Ok(()) => {
                    debug!(message_id = %message.id, "Persisted held message state");
                    self.publish(&message);
                }
                Err(e) => {
                    debug!(
                        message_id = %message.id,
                        error = %e,
                        "Store still rejecting write"
                    );
                    self.hold_settled(message);
                }
            }
        }
    }

    /// Run the worker pool until a shutdown signal arrives
    ///
    /// Returns once every worker has finished its current attempt.
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        internal!(
            "Dispatcher starting with {} workers",
            self.config.workers
        );

        let (stop, stopped) = watch::channel(false);

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers.max(1) {
            workers.spawn(Arc::clone(&self).run_worker(worker, stopped.clone()));
        }

        match shutdown.recv().await {
            Ok(Signal::Shutdown | Signal::Finalised) => {
                internal!("Dispatcher received shutdown signal");
            }
            Err(e) => {
                warn!(error = %e, "Dispatcher shutdown channel error");
            }
        }

        // Workers hold a receiver until they exit
        let _ = stop.send(true);

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Dispatcher worker terminated abnormally");
            }
        }

        self.flush_settled().await;
        let unsaved = self.settled.lock().len();
        if unsaved > 0 {
            error!(unsaved, "Stopping with settled messages the store did not accept");
        }

        internal!(
            "Dispatcher stopped with {} messages still queued",
            self.queue.len()
        );
    }

    async fn run_worker(self: Arc<Self>, worker: usize, mut stopped: watch::Receiver<bool>) {
        internal!(level = DEBUG, "Worker {worker} started");

        while !*stopped.borrow() {
            if let Some(message) = self.queue.dequeue_ready() {
                process::process_message(&self, message).await;
                continue;
            }

            self.flush_settled().await;

            let now = SystemTime::now();
            let idle_poll = self.config.idle_poll();
            let sleep_for = self
                .queue
                .next_ready_at()
                .map_or(idle_poll, |at| {
                    at.duration_since(now).unwrap_or_default().min(idle_poll)
                })
                .max(Duration::from_millis(1));

            tokio::select! {
                () = self.queue.changed() => {}
                () = tokio::time::sleep(sleep_for) => {}
                _ = stopped.changed() => {}
            }
        }

        internal!(level = DEBUG, "Worker {worker} stopped");
    }
}

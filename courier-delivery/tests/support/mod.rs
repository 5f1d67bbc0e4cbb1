#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use courier_common::{ChannelKind, FailureKind, Priority, Signal};
use courier_delivery::{
    ChannelConfig, ChannelSender, ChannelsConfig, DeliveryConfig, DeliveryEngine, RoutingTable,
    SendFailure, SendReceipt,
};
use courier_store::{StoreHandles, TestStateStore};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};

pub const WAIT: Duration = Duration::from_secs(5);

/// Sender that plays back a script of outcomes, then repeats `then`
#[derive(Debug)]
pub struct ScriptedSender {
    script: Mutex<VecDeque<Option<FailureKind>>>,
    then: Option<FailureKind>,
    sent: Mutex<Vec<(String, String)>>,
}

impl ScriptedSender {
    pub fn delivering() -> Arc<Self> {
        Self::scripted([], None)
    }

    pub fn failing(kind: FailureKind) -> Arc<Self> {
        Self::scripted([], Some(kind))
    }

    /// `None` in the script delivers, `Some(kind)` fails with `kind`
    pub fn scripted(
        script: impl IntoIterator<Item = Option<FailureKind>>,
        then: Option<FailureKind>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            then,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    async fn send(&self, recipient: &str, content: &str) -> Result<SendReceipt, SendFailure> {
        self.sent
            .lock()
            .push((recipient.to_string(), content.to_string()));

        let outcome = self.script.lock().pop_front().unwrap_or(self.then);
        match outcome {
            None => Ok(SendReceipt {
                cost: None,
                latency: Some(Duration::from_millis(20)),
            }),
            Some(kind) => Err(SendFailure::new(kind, format!("scripted {kind}"))),
        }
    }
}

/// Configuration with only `channels` enabled, all tiers routed to the
/// first of them, and delays short enough for tests
pub fn config(channels: &[ChannelKind]) -> DeliveryConfig {
    let mut config = DeliveryConfig {
        channels: ChannelsConfig {
            voice: None,
            sms: None,
            whatsapp: None,
            email: None,
        },
        ..DeliveryConfig::default()
    };

    for (rank, kind) in channels.iter().enumerate() {
        let channel = Some(ChannelConfig {
            reliability_rank: u32::try_from(rank).unwrap(),
            cost_per_message: 0.01,
            rate_limit_per_minute: 1_000,
        });

        match kind {
            ChannelKind::Voice => config.channels.voice = channel,
            ChannelKind::Sms => config.channels.sms = channel,
            ChannelKind::WhatsApp => config.channels.whatsapp = channel,
            ChannelKind::Email => config.channels.email = channel,
        }
    }

    let first = channels[0];
    config.routing = RoutingTable {
        critical: first,
        high: first,
        medium: first,
        low: first,
    };

    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 8;
    config.retry.jitter_factor = 0.0;
    config.dispatcher.idle_poll_ms = 10;
    config.dispatcher.storage_retry_base_ms = 1;
    config.dispatcher.send_timeout_ms = 1_000;

    config
}

pub fn senders(
    senders: &[(ChannelKind, Arc<ScriptedSender>)],
) -> HashMap<ChannelKind, Arc<dyn ChannelSender>> {
    senders
        .iter()
        .map(|(kind, sender)| (*kind, Arc::clone(sender) as Arc<dyn ChannelSender>))
        .collect()
}

pub fn engine(
    config: DeliveryConfig,
    channel_senders: &[(ChannelKind, Arc<ScriptedSender>)],
    store: &TestStateStore,
) -> Arc<DeliveryEngine> {
    Arc::new(
        DeliveryEngine::new(
            config,
            senders(channel_senders),
            StoreHandles::from_backend(store.clone()),
        )
        .expect("valid engine configuration"),
    )
}

/// A running engine; dropping the handle does not stop it, call `stop`
pub struct Running {
    pub engine: Arc<DeliveryEngine>,
    shutdown: broadcast::Sender<Signal>,
    task: JoinHandle<()>,
}

impl Running {
    pub fn start(engine: Arc<DeliveryEngine>) -> Self {
        let (shutdown, receiver) = broadcast::channel(4);
        let task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.serve(receiver).await })
        };

        Self {
            engine,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.send(Signal::Shutdown).unwrap();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("dispatcher did not stop")
            .unwrap();
    }
}

pub const fn all_priorities() -> [Priority; 4] {
    Priority::ALL
}

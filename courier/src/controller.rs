use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use courier_common::{
    ChannelKind, Signal,
    audit::{self, AuditConfig},
    internal, logging,
    tracing::{self, info},
};
use courier_delivery::{ChannelSender, DeliveryConfig, DeliveryEngine};
use courier_store::StoreConfig;
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::{batch, sender::simulated_senders};

/// The root of a `courier.config.ron` file
///
/// ```ron
/// Courier (
///     delivery: (
///         routing: (critical: voice, high: sms, medium: whatsapp, low: email),
///         retry: (max_retries: 3),
///     ),
///     store: (type: "File", path: "/var/lib/courier"),
///     audit: (redact_recipients: true),
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Courier {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    Ok(())
}

impl Courier {
    /// Read and validate a RON configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Self::from_ron(&content)
    }

    /// # Errors
    /// Returns an error if `content` does not parse or fails validation
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        let courier: Self = ron::from_str(content)?;
        courier.delivery.validate()?;
        Ok(courier)
    }

    /// Open the store and build the engine around `senders`
    ///
    /// # Errors
    /// Returns an error if the store cannot be opened or a configured
    /// channel has no sender
    pub fn into_engine(
        self,
        senders: HashMap<ChannelKind, Arc<dyn ChannelSender>>,
    ) -> anyhow::Result<DeliveryEngine> {
        audit::init(self.audit);

        let stores = self.store.into_stores()?;
        Ok(DeliveryEngine::new(self.delivery, senders, stores)?)
    }

    /// Run the engine until a shutdown signal, submitting `batch` first if
    /// one is given
    ///
    /// # Errors
    ///
    /// This function will return an error if the engine cannot be built,
    /// recovery fails, or the batch cannot be read.
    pub async fn run(self, batch: Option<&Path>) -> anyhow::Result<()> {
        logging::init();

        let senders = simulated_senders(&self.delivery.channels);
        let engine = Arc::new(self.into_engine(senders)?);

        internal!("Controller running");

        let recovered = engine.recover().await?;
        internal!(
            level = INFO,
            "Recovered {} queued, {} delivered, {} failed",
            recovered.requeued,
            recovered.delivered,
            recovered.failed
        );

        let serving = {
            let engine = Arc::clone(&engine);
            let receiver = SHUTDOWN_BROADCAST.subscribe();
            tokio::spawn(async move { engine.serve(receiver).await })
        };

        if let Some(path) = batch {
            let report = batch::submit(&engine, batch::load(path).await?).await;
            internal!(
                level = INFO,
                "Loaded batch {}: {} accepted, {} rejected",
                path.display(),
                report.accepted,
                report.rejected
            );
        }

        shutdown().await?;

        internal!("Shutting down...");

        tokio::select! {
            joined = serving => joined?,
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Forced shutdown with work still in flight");
            }
        }

        let snapshot = engine.metrics_snapshot().await?;
        info!(
            queue_depth = snapshot.queue_depth,
            success_rate = snapshot.success_rate,
            "Final delivery statistics"
        );

        Ok(())
    }
}

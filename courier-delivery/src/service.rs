//! The delivery engine: the surface callers submit to and query
//!
//! [`DeliveryEngine`] owns the dispatcher, the OTP verifier and handles to
//! the store. Everything a caller can do goes through it.

use std::{
    collections::HashMap,
    sync::Arc,
    time::SystemTime,
};

use courier_common::{
    ChannelKind, DeliveryAttempt, MessageId, MessageRequest, MessageStatus, MessageType,
    NewMessage, OtpCode, Priority, RawMessage, Signal, audit, incoming,
    tracing::{debug, warn},
};
use courier_store::{StoreHandles, TimeRange};
use tokio::sync::broadcast;

use crate::{
    channel::ChannelSender,
    config::DeliveryConfig,
    error::{ConfigError, DeliveryError, QueryError, SubmitError},
    metrics::MetricsSnapshot,
    otp::{OtpFailure, OtpVerifier, render_otp_content},
    processor::{DeliveryEvent, Dispatcher, RecoveryReport, persist},
    rate_limiter::{RateLimitStats, RateLimiter},
    registry::ChannelRegistry,
};

/// `last_error` of a message cancelled while still queued
pub const CANCELLED: &str = "cancelled";

/// What a purge removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub messages: usize,
    pub otps: usize,
}

#[derive(Debug)]
pub struct DeliveryEngine {
    dispatcher: Arc<Dispatcher>,
    otp: OtpVerifier,
    stores: StoreHandles,
}

impl DeliveryEngine {
    /// Validate `config` and wire the engine together
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a configured
    /// channel has no sender
    pub fn new(
        config: DeliveryConfig,
        senders: HashMap<ChannelKind, Arc<dyn ChannelSender>>,
        stores: StoreHandles,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(
            &config.rate_limit,
            config
                .channels
                .configured()
                .map(|(kind, channel)| (kind, channel.rate_limit_per_minute)),
        ));

        let registry = Arc::new(ChannelRegistry::new(
            &config.channels,
            config.routing,
            senders,
            limiter,
        )?);

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher,
            registry,
            config.retry,
            Arc::clone(&stores.messages),
        ));

        Ok(Self {
            dispatcher,
            otp: OtpVerifier::new(config.otp, Arc::clone(&stores.otps)),
            stores,
        })
    }

    /// Requeue whatever a previous run left unfinished
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or written
    pub async fn recover(&self) -> Result<RecoveryReport, DeliveryError> {
        self.dispatcher.recover().await
    }

    /// Run the dispatcher until shutdown
    pub async fn serve(&self, shutdown: broadcast::Receiver<Signal>) {
        Arc::clone(&self.dispatcher).serve(shutdown).await;
    }

    fn validate(&self, message: &NewMessage) -> Result<(), SubmitError> {
        if message.recipient.trim().is_empty() {
            return Err(SubmitError::InvalidRequest("recipient is empty".to_string()));
        }

        if message.message_type != MessageType::Otp && message.content.trim().is_empty() {
            return Err(SubmitError::InvalidRequest(format!(
                "content is empty for a {} message",
                message.message_type
            )));
        }

        if let Some(channel) = message.preferred_channel
            && !self.dispatcher.registry.is_configured(channel)
        {
            return Err(SubmitError::InvalidRequest(format!(
                "preferred channel {channel} is not configured"
            )));
        }

        if message.max_retries == Some(0) {
            return Err(SubmitError::InvalidRequest(
                "max_retries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Accept a message for delivery
    ///
    /// An otp message without content gets a freshly issued code as its
    /// content, superseding the recipient's previous code. The message that
    /// carried that code is cancelled once the new one is recorded.
    ///
    /// # Errors
    /// Returns [`SubmitError::InvalidRequest`] if the message is rejected, or
    /// a storage error if it could not be recorded. Nothing is queued in
    /// either case.
    pub async fn submit(&self, message: NewMessage) -> Result<MessageId, SubmitError> {
        self.validate(&message)?;

        let now = SystemTime::now();
        let mut request = MessageRequest::new(message, now);

        let issued = if request.message_type == MessageType::Otp
            && request.content.trim().is_empty()
        {
            let issued = self
                .otp
                .issue_at(&request.recipient, Some(request.id), now)
                .await?;
            request.content = render_otp_content(&issued.code.code, self.otp.ttl());
            Some(issued)
        } else {
            None
        };

        if let Err(e) = persist::save(&self.dispatcher, &request).await {
            if let Some(issued) = &issued
                && let Err(error) = self.otp.withdraw(issued).await
            {
                warn!(message_id = %request.id, %error, "Failed to withdraw unsent code");
            }
            return Err(e.into());
        }

        if let Some(previous) = issued.and_then(|issued| issued.superseded) {
            self.cancel_superseded(&previous).await;
        }

        incoming!(
            level = DEBUG,
            "Accepted {} message {} with priority {}",
            request.message_type,
            request.id,
            request.priority
        );
        audit::log_submission_accepted(
            &request.id.to_string(),
            &request.recipient,
            request.message_type.as_str(),
            request.priority.as_str(),
        );

        let id = request.id;
        self.dispatcher.queue.enqueue(request);
        Ok(id)
    }

    /// Accept a message in its loosely typed form
    ///
    /// # Errors
    /// As [`Self::submit`], plus [`SubmitError::InvalidRequest`] for an
    /// unrecognised type, priority or channel
    pub async fn submit_raw(&self, message: RawMessage) -> Result<MessageId, SubmitError> {
        self.submit(NewMessage::try_from(message)?).await
    }

    /// Submit each message in turn; one rejection does not stop the rest
    pub async fn submit_bulk(
        &self,
        messages: Vec<NewMessage>,
    ) -> Vec<Result<MessageId, SubmitError>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.submit(message).await);
        }
        results
    }

    /// Issue a one-time code to `recipient` and queue it at high priority
    ///
    /// # Errors
    /// As [`Self::submit`]
    pub async fn issue_otp(&self, recipient: &str) -> Result<MessageId, SubmitError> {
        self.submit(NewMessage::new(recipient, MessageType::Otp).priority(Priority::High))
            .await
    }

    /// Check and consume a one-time code
    ///
    /// # Errors
    /// Returns [`OtpFailure`] whatever the reason for rejection
    pub async fn verify_otp(&self, recipient: &str, code: &str) -> Result<(), OtpFailure> {
        self.otp.verify(recipient, code).await
    }

    /// # Errors
    /// Returns [`QueryError::NotFound`] for an unknown id
    pub async fn get_status(&self, id: &MessageId) -> Result<MessageRequest, QueryError> {
        if let Some(settled) = self.dispatcher.held(id) {
            return Ok(settled);
        }

        Ok(self.stores.messages.get(id).await?)
    }

    /// # Errors
    /// Returns [`QueryError::NotFound`] for an unknown id
    pub async fn attempts(&self, id: &MessageId) -> Result<Vec<DeliveryAttempt>, QueryError> {
        self.stores.messages.get(id).await?;
        Ok(self.stores.messages.attempts(id).await?)
    }

    /// # Errors
    /// Returns an error if the store cannot be read
    pub async fn query(
        &self,
        status: Option<MessageStatus>,
        range: TimeRange,
    ) -> Result<Vec<MessageRequest>, QueryError> {
        Ok(self.stores.messages.query(status, range).await?)
    }

    /// Withdraw a message that is still waiting in the queue
    ///
    /// Returns `false` if the message exists but is no longer queued: in
    /// flight attempts always run to completion.
    ///
    /// # Errors
    /// Returns [`QueryError::NotFound`] for an unknown id, or a storage
    /// error if the cancellation could not be recorded (the message then
    /// stays queued)
    pub async fn cancel(&self, id: &MessageId) -> Result<bool, QueryError> {
        let Some(queued) = self.dispatcher.queue.cancel(id) else {
            self.stores.messages.get(id).await?;
            return Ok(false);
        };

        let mut message = queued.clone();
        message.status = MessageStatus::Failed;
        message.last_error = Some(CANCELLED.to_string());
        message.next_channel = None;
        message.updated_at = SystemTime::now();

        if let Err(e) = persist::save(&self.dispatcher, &message).await {
            self.dispatcher.queue.enqueue(queued);
            return Err(e.into());
        }

        debug!(message_id = %id, "Cancelled queued message");
        audit::log_delivery_failure(
            &id.to_string(),
            &message.recipient,
            CANCELLED,
            message.attempt_count,
        );
        self.dispatcher.publish(&message);

        Ok(true)
    }

    async fn cancel_superseded(&self, previous: &OtpCode) {
        if previous.consumed {
            return;
        }

        if let Some(id) = previous.message_id
            && let Err(e) = self.cancel(&id).await
        {
            warn!(message_id = %id, error = %e, "Failed to cancel superseded code message");
        }
    }

    /// Statistics derived from the store
    ///
    /// # Errors
    /// Returns an error if the store cannot be read
    pub async fn metrics_snapshot(&self) -> Result<MetricsSnapshot, QueryError> {
        let messages = self.stores.messages.query(None, TimeRange::all()).await?;
        let attempts = self.stores.messages.attempts_between(TimeRange::all()).await?;

        Ok(MetricsSnapshot::from_records(
            self.dispatcher.queue.len(),
            &messages,
            &attempts,
        ))
    }

    /// Remove finished messages and codes issued before `cutoff`
    ///
    /// # Errors
    /// Returns an error if the store cannot be written
    pub async fn purge_before(&self, cutoff: SystemTime) -> Result<PurgeReport, QueryError> {
        let report = PurgeReport {
            messages: self.stores.messages.purge_before(cutoff).await?,
            otps: self.stores.otps.purge_codes_before(cutoff).await?,
        };

        debug!(
            messages = report.messages,
            otps = report.otps,
            "Purged old records"
        );
        Ok(report)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.dispatcher.subscribe()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.dispatcher.queue.len()
    }

    #[must_use]
    pub fn rate_limit_stats(&self, channel: ChannelKind) -> Option<RateLimitStats> {
        self.dispatcher.registry.limiter().stats(channel)
    }
}

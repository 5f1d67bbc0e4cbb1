//! One attempt cycle for a single message
//!
//! 1. Expire the message if it went stale before its first attempt
//! 2. Claim it (`pending` -> `in_flight`), persisted before any send
//! 3. Admit it on the first eligible channel with budget left
//! 4. Send with a timeout and log the attempt
//! 5. Apply the retry policy and persist the outcome

use std::time::{Duration, Instant, SystemTime};

use courier_common::{
    AttemptOutcome, ChannelKind, DeliveryAttempt, MessageRequest, MessageStatus, audit, outgoing,
    tracing::{debug, error, info, warn},
};

use crate::{
    channel::{Channel, SendFailure},
    error::DeliveryError,
    policy::RetryAction,
    processor::{Dispatcher, persist},
};

/// Shortest deferral when every channel is saturated
const MIN_DEFERRAL: Duration = Duration::from_millis(10);

pub async fn process_message(dispatcher: &Dispatcher, message: MessageRequest) {
    let now = SystemTime::now();

    if message.attempt_count == 0 {
        let overdue = message.overdue_by(now);
        if overdue > dispatcher.config.staleness() {
            expire(dispatcher, message, overdue, now).await;
            return;
        }
    }

    let mut claimed = message.clone();
    claimed.status = MessageStatus::InFlight;
    claimed.updated_at = now;

    if let Err(e) = persist::save(dispatcher, &claimed).await {
        error!(
            message_id = %message.id,
            error = %e,
            "Failed to claim message, returning it to the queue"
        );
        requeue_later(dispatcher, message, now);
        return;
    }

    let ranked = dispatcher.registry.ranked_channels(&claimed);
    let Some(channel) = admit(dispatcher, &claimed, &ranked) else {
        defer_or_exhaust(dispatcher, claimed, &ranked, now).await;
        return;
    };

    attempt(dispatcher, message, claimed, &channel, &ranked).await;
}

/// Whether `message` may be attempted on a channel, ignoring rate limits
///
/// A channel with budget qualifies, except the one the message has to fall
/// back from while some other ranked channel still has budget. That holds
/// even when the other channels are saturated, so the message waits for them
/// instead of going back to the channel that kept failing.
fn usable<'a>(
    dispatcher: &'a Dispatcher,
    message: &'a MessageRequest,
    ranked: &[ChannelKind],
) -> impl Fn(ChannelKind) -> bool + 'a {
    let policy = &dispatcher.policy;
    let avoid = policy.fallback_from(message).filter(|current| {
        ranked
            .iter()
            .any(|kind| kind != current && policy.has_budget(message, *kind))
    });

    move |kind| Some(kind) != avoid && policy.has_budget(message, kind)
}

/// First eligible channel that is usable and grants a rate-limit slot
fn admit(
    dispatcher: &Dispatcher,
    message: &MessageRequest,
    ranked: &[ChannelKind],
) -> Option<Channel> {
    let usable = usable(dispatcher, message, ranked);

    dispatcher
        .registry
        .eligible_channels(message)
        .into_iter()
        .filter(|channel| usable(channel.kind))
        .find(|channel| dispatcher.registry.limiter().try_admit(channel.kind))
}

async fn attempt(
    dispatcher: &Dispatcher,
    unclaimed: MessageRequest,
    mut message: MessageRequest,
    channel: &Channel,
    ranked: &[ChannelKind],
) {
    let number = message.attempt_count + 1;
    let recipient = message.recipient.as_str();
    let id = message.id.to_string();

    audit::log_delivery_attempt(&id, recipient, channel.kind.as_str(), number);
    outgoing!(
        level = DEBUG,
        "Sending {} via {} (attempt {number})",
        message.id,
        channel.kind
    );

    let timeout = dispatcher.config.send_timeout();
    let started = Instant::now();
    let send = channel.sender.send(recipient, &message.content);
    let result = tokio::time::timeout(timeout, send)
        .await
        .unwrap_or_else(|_| Err(SendFailure::timeout(timeout)));
    let elapsed = started.elapsed();

    let record = match &result {
        Ok(receipt) => DeliveryAttempt {
            message_id: message.id,
            attempt: number,
            channel: channel.kind,
            outcome: AttemptOutcome::Delivered,
            error: None,
            timestamp: SystemTime::now(),
            latency: receipt.latency.unwrap_or(elapsed),
            cost: Some(receipt.cost.unwrap_or(channel.config.cost_per_message)),
        },
        Err(failure) => DeliveryAttempt {
            message_id: message.id,
            attempt: number,
            channel: channel.kind,
            outcome: AttemptOutcome::Failed(failure.kind),
            error: Some(failure.to_string()),
            timestamp: SystemTime::now(),
            latency: elapsed,
            cost: None,
        },
    };

    match persist::append(dispatcher, &record).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(message_id = %message.id, attempt = number, "Attempt already logged");
        }
        Err(e) => {
            error!(
                message_id = %message.id,
                attempt = number,
                error = %e,
                "Failed to log attempt, message will be sent again"
            );
            requeue_later(dispatcher, unclaimed, record.timestamp);
            return;
        }
    }

    message.record_attempt(&record);
    let now = record.timestamp;
    message.updated_at = now;

    match result {
        Ok(_) => {
            message.status = MessageStatus::Delivered;
            message.delivered_at = Some(now);
            message.next_channel = None;

            info!(
                message_id = %message.id,
                channel = %channel.kind,
                attempt = number,
                "Message delivered"
            );
            audit::log_delivery_success(
                &id,
                &message.recipient,
                channel.kind.as_str(),
                number,
                record.latency.as_millis(),
            );
        }
        Err(failure) => {
            apply_failure(dispatcher, &mut message, failure, ranked, now);
        }
    }

    finish(dispatcher, message).await;
}

fn apply_failure(
    dispatcher: &Dispatcher,
    message: &mut MessageRequest,
    failure: SendFailure,
    ranked: &[ChannelKind],
    now: SystemTime,
) {
    let kind = failure.kind;
    let current = message.last_channel_tried;

    match dispatcher.policy.next_action(message, kind, ranked) {
        RetryAction::RetrySameChannel { after } => {
            reschedule(message, current, after, now);
        }
        RetryAction::RetryOtherChannel { channel, after } => {
            debug!(
                message_id = %message.id,
                from = ?current,
                to = %channel,
                "Falling back to another channel"
            );
            reschedule(message, Some(channel), after, now);
        }
        RetryAction::GiveUp => {
            let error = if kind.is_transient() {
                DeliveryError::ExhaustedRetries {
                    attempts: message.attempt_count,
                    last_error: failure.to_string(),
                }
            } else {
                DeliveryError::from(failure)
            };

            fail(message, &error);
        }
    }
}

fn reschedule(
    message: &mut MessageRequest,
    channel: Option<ChannelKind>,
    after: Duration,
    now: SystemTime,
) {
    message.status = MessageStatus::Pending;
    message.scheduled_for = now + after;
    message.next_channel = channel;

    debug!(
        message_id = %message.id,
        channel = ?channel,
        retry_in_ms = after.as_millis(),
        "Scheduled retry"
    );
}

fn fail(message: &mut MessageRequest, error: &DeliveryError) {
    message.status = MessageStatus::Failed;
    message.next_channel = None;
    message.last_error = Some(error.to_string());

    warn!(
        message_id = %message.id,
        attempts = message.attempt_count,
        error = %error,
        "Message failed"
    );
    audit::log_delivery_failure(
        &message.id.to_string(),
        &message.recipient,
        &error.to_string(),
        message.attempt_count,
    );
}

/// No channel could take the message right now
///
/// If some ranked channel still has budget the message waits for the
/// earliest slot on those channels, without recording an attempt.
async fn defer_or_exhaust(
    dispatcher: &Dispatcher,
    mut message: MessageRequest,
    ranked: &[ChannelKind],
    now: SystemTime,
) {
    let limiter = dispatcher.registry.limiter();
    let wait = {
        let usable = usable(dispatcher, &message, ranked);
        ranked
            .iter()
            .filter(|kind| usable(**kind))
            .map(|kind| limiter.wait_time(*kind))
            .min()
    };

    message.updated_at = now;

    if let Some(wait) = wait {
        let wait = wait.max(MIN_DEFERRAL);
        message.status = MessageStatus::Pending;
        message.scheduled_for = now + wait;

        debug!(
            message_id = %message.id,
            wait_ms = wait.as_millis(),
            "Every channel is rate limited, deferring"
        );
    } else {
        let error = DeliveryError::ExhaustedRetries {
            attempts: message.attempt_count,
            last_error: message
                .last_error
                .clone()
                .unwrap_or_else(|| "no channel with attempts remaining".to_string()),
        };
        fail(&mut message, &error);
    }

    finish(dispatcher, message).await;
}

async fn expire(
    dispatcher: &Dispatcher,
    mut message: MessageRequest,
    overdue: Duration,
    now: SystemTime,
) {
    let overdue_secs = overdue.as_secs();
    let error = DeliveryError::Expired { overdue_secs };

    message.status = MessageStatus::Expired;
    message.last_error = Some(error.to_string());
    message.updated_at = now;

    warn!(
        message_id = %message.id,
        overdue_secs,
        "Message expired before its first attempt"
    );
    audit::log_message_expired(&message.id.to_string(), &message.recipient, overdue_secs);

    finish(dispatcher, message).await;
}

/// Persist the outcome, then queue the message again or announce it
///
/// If the store keeps failing, a message still in progress goes back on
/// the queue and its next claim persists it. A settled message is held by
/// the dispatcher until a write goes through.
async fn finish(dispatcher: &Dispatcher, message: MessageRequest) {
    if let Err(e) = persist::save(dispatcher, &message).await {
        error!(
            message_id = %message.id,
            status = %message.status,
            error = %e,
            "Failed to persist message state"
        );

        if message.status.is_terminal() {
            dispatcher.hold_settled(message);
        } else {
            requeue_later(dispatcher, message, SystemTime::now());
        }
        return;
    }

    if message.status.is_terminal() {
        dispatcher.publish(&message);
    } else {
        dispatcher.queue.enqueue(message);
    }
}

fn requeue_later(dispatcher: &Dispatcher, mut message: MessageRequest, now: SystemTime) {
    message.status = MessageStatus::Pending;
    message.scheduled_for = message.scheduled_for.max(now + dispatcher.config.idle_poll());
    dispatcher.queue.enqueue(message);
}

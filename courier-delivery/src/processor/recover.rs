//! Startup reconciliation of unfinished messages
//!
//! A message left `pending` or `in_flight` by a previous run has its
//! counters rebuilt from the attempt log. A logged delivery or permanent
//! failure settles it without another send; anything else goes back on the
//! queue.

use courier_common::{AttemptOutcome, MessageStatus, internal, tracing::info};

use crate::{
    channel::SendFailure,
    error::DeliveryError,
    processor::{Dispatcher, persist},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl Dispatcher {
    /// Reconcile every unfinished message in the store with its attempt log
    ///
    /// Safe to run more than once; a second pass changes nothing.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or a record cannot be written
    pub async fn recover(&self) -> Result<RecoveryReport, DeliveryError> {
        let mut report = RecoveryReport::default();

        for mut message in self.store.unfinished().await? {
            let attempts = self.store.attempts(&message.id).await?;
            message.replay_attempts(&attempts);

            match attempts.last().map(|last| (last, last.outcome)) {
                Some((last, AttemptOutcome::Delivered)) => {
                    message.status = MessageStatus::Delivered;
                    message.delivered_at = Some(last.timestamp);
                    message.next_channel = None;
                    message.last_error = None;
                }
                Some((last, AttemptOutcome::Failed(kind))) if !kind.is_transient() => {
                    let failure = SendFailure::new(kind, last.error.clone().unwrap_or_default());
                    message.status = MessageStatus::Failed;
                    message.next_channel = None;
                    message.last_error = Some(DeliveryError::from(failure).to_string());
                }
                _ => message.status = MessageStatus::Pending,
            }

            persist::save(self, &message).await?;

            match message.status {
                MessageStatus::Delivered => {
                    report.delivered += 1;
                    self.publish(&message);
                }
                MessageStatus::Failed => {
                    report.failed += 1;
                    self.publish(&message);
                }
                _ => {
                    report.requeued += 1;
                    self.queue.enqueue(message);
                }
            }
        }

        if report == RecoveryReport::default() {
            internal!("Nothing to recover");
        } else {
            info!(
                requeued = report.requeued,
                delivered = report.delivered,
                failed = report.failed,
                "Recovered unfinished messages"
            );
        }

        Ok(report)
    }
}

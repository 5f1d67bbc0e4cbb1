#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::time::{Duration, SystemTime};

use courier_common::{
    AttemptOutcome, ChannelKind, DeliveryAttempt, FailureKind, MessageRequest, MessageStatus,
    MessageType, NewMessage, Priority,
};
use courier_delivery::{CANCELLED, RecoveryReport, SubmitError};
use courier_store::{DeliveryStateStore, OtpStore, TestStateStore};
use pretty_assertions::assert_eq;
use support::{Running, ScriptedSender, WAIT, config, engine};

const RECIPIENT: &str = "+447700900123";

/// Pull the six digit code back out of a rendered message
fn code_in(content: &str) -> String {
    content
        .split_whitespace()
        .map(|word| word.trim_end_matches('.'))
        .find(|word| word.len() == 6 && word.chars().all(|c| c.is_ascii_digit()))
        .expect("message carries a code")
        .to_string()
}

#[tokio::test]
async fn issued_code_is_delivered_and_verifies_once() {
    let store = TestStateStore::new();
    let sms = ScriptedSender::delivering();
    let running = Running::start(engine(
        config(&[ChannelKind::Sms]),
        &[(ChannelKind::Sms, sms.clone())],
        &store,
    ));

    let id = running.engine.issue_otp(RECIPIENT).await.unwrap();
    let message = store
        .wait_for_status(&id, MessageStatus::Delivered, WAIT)
        .await
        .unwrap();
    assert_eq!(message.message_type, MessageType::Otp);
    assert_eq!(message.priority, Priority::High);

    let (recipient, content) = sms.sent().pop().unwrap();
    assert_eq!(recipient, RECIPIENT);
    assert!(content.ends_with("It expires in 5 minutes."));

    let code = code_in(&content);
    assert!(running.engine.verify_otp(RECIPIENT, "not-it").await.is_err());
    running.engine.verify_otp(RECIPIENT, &code).await.unwrap();
    assert!(running.engine.verify_otp(RECIPIENT, &code).await.is_err());

    let stored = store.code_for(RECIPIENT).await.unwrap().unwrap();
    assert!(stored.consumed);
    assert_eq!(stored.message_id, Some(id));

    running.stop().await;
}

#[tokio::test]
async fn new_code_cancels_the_queued_one() {
    let store = TestStateStore::new();
    let engine = engine(
        config(&[ChannelKind::Sms]),
        &[(ChannelKind::Sms, ScriptedSender::delivering())],
        &store,
    );

    let first = engine.issue_otp(RECIPIENT).await.unwrap();
    let first_code = store.code_for(RECIPIENT).await.unwrap().unwrap();

    let second = engine.issue_otp(RECIPIENT).await.unwrap();
    let second_code = store.code_for(RECIPIENT).await.unwrap().unwrap();
    assert_eq!(second_code.message_id, Some(second));

    let cancelled = engine.get_status(&first).await.unwrap();
    assert_eq!(cancelled.status, MessageStatus::Failed);
    assert_eq!(cancelled.last_error.as_deref(), Some(CANCELLED));
    assert_eq!(engine.queue_len(), 1);

    if first_code.code != second_code.code {
        assert!(engine.verify_otp(RECIPIENT, &first_code.code).await.is_err());
    }
    engine.verify_otp(RECIPIENT, &second_code.code).await.unwrap();
}

#[tokio::test]
async fn unrecorded_code_leaves_the_previous_one_active() {
    let store = TestStateStore::new();
    let engine = engine(
        config(&[ChannelKind::Sms]),
        &[(ChannelKind::Sms, ScriptedSender::delivering())],
        &store,
    );

    let first = engine.issue_otp(RECIPIENT).await.unwrap();
    let first_code = store.code_for(RECIPIENT).await.unwrap().unwrap();

    store.fail_upserts_with_status(MessageStatus::Pending, 5);
    assert!(matches!(
        engine.issue_otp(RECIPIENT).await,
        Err(SubmitError::Storage(_))
    ));

    // The earlier message is untouched and its code still the active one
    assert_eq!(store.code_for(RECIPIENT).await.unwrap(), Some(first_code.clone()));
    assert_eq!(
        engine.get_status(&first).await.unwrap().status,
        MessageStatus::Pending
    );
    assert_eq!(engine.queue_len(), 1);

    engine.verify_otp(RECIPIENT, &first_code.code).await.unwrap();
}

#[tokio::test]
async fn unrecorded_first_code_is_revoked() {
    let store = TestStateStore::new();
    let engine = engine(
        config(&[ChannelKind::Sms]),
        &[(ChannelKind::Sms, ScriptedSender::delivering())],
        &store,
    );

    store.fail_upserts_with_status(MessageStatus::Pending, 5);
    assert!(engine.issue_otp(RECIPIENT).await.is_err());

    let code = store.code_for(RECIPIENT).await.unwrap().unwrap();
    assert!(code.consumed);
    assert!(engine.verify_otp(RECIPIENT, &code.code).await.is_err());
    assert_eq!(engine.queue_len(), 0);
}

#[tokio::test]
async fn explicit_otp_content_is_sent_as_is() {
    let store = TestStateStore::new();
    let engine = engine(
        config(&[ChannelKind::Sms]),
        &[(ChannelKind::Sms, ScriptedSender::delivering())],
        &store,
    );

    let id = engine
        .submit(NewMessage::new(RECIPIENT, MessageType::Otp).content("Your code is 424242"))
        .await
        .unwrap();

    assert_eq!(
        engine.get_status(&id).await.unwrap().content,
        "Your code is 424242"
    );
    assert!(store.code_for(RECIPIENT).await.unwrap().is_none());
}

fn in_flight(content: &str) -> MessageRequest {
    let mut message = MessageRequest::new(
        NewMessage::new(RECIPIENT, MessageType::Alert).content(content),
        SystemTime::now(),
    );
    message.status = MessageStatus::InFlight;
    message
}

fn attempt(message: &MessageRequest, outcome: AttemptOutcome) -> DeliveryAttempt {
    DeliveryAttempt {
        message_id: message.id,
        attempt: 1,
        channel: ChannelKind::Sms,
        outcome,
        error: None,
        timestamp: SystemTime::now(),
        latency: Duration::from_millis(20),
        cost: Some(0.01),
    }
}

#[tokio::test]
async fn recovery_finishes_what_the_log_settled() {
    let store = TestStateStore::new();

    let sent = in_flight("sent before the crash");
    store.upsert(&sent).await.unwrap();
    store
        .append_attempt(&attempt(&sent, AttemptOutcome::Delivered))
        .await
        .unwrap();

    let interrupted = in_flight("never attempted");
    store.upsert(&interrupted).await.unwrap();

    let sms = ScriptedSender::delivering();
    let engine = engine(
        config(&[ChannelKind::Sms]),
        &[(ChannelKind::Sms, sms.clone())],
        &store,
    );

    let report = engine.recover().await.unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            requeued: 1,
            delivered: 1,
            failed: 0,
        }
    );

    let recovered = engine.get_status(&sent.id).await.unwrap();
    assert_eq!(recovered.status, MessageStatus::Delivered);
    assert_eq!(recovered.attempt_count, 1);
    assert_eq!(engine.queue_len(), 1);

    // Running it again changes nothing
    let again = engine.recover().await.unwrap();
    assert_eq!(again.requeued, 1);
    assert_eq!(again.delivered, 0);
    assert_eq!(engine.queue_len(), 1);

    let running = Running::start(engine);
    store
        .wait_for_status(&interrupted.id, MessageStatus::Delivered, WAIT)
        .await
        .unwrap();

    assert_eq!(
        sms.sent(),
        vec![(RECIPIENT.to_string(), "never attempted".to_string())]
    );
    running.stop().await;
}

#[tokio::test]
async fn recovery_fails_permanently_rejected_messages() {
    let store = TestStateStore::new();

    let rejected = in_flight("bad number");
    store.upsert(&rejected).await.unwrap();
    let mut failure = attempt(
        &rejected,
        AttemptOutcome::Failed(FailureKind::InvalidRecipient),
    );
    failure.error = Some("no such number".to_string());
    store.append_attempt(&failure).await.unwrap();

    let engine = engine(
        config(&[ChannelKind::Sms]),
        &[(ChannelKind::Sms, ScriptedSender::delivering())],
        &store,
    );

    let report = engine.recover().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = engine.get_status(&rejected.id).await.unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);
    assert!(failed.last_error.unwrap().contains("no such number"));
    assert_eq!(engine.queue_len(), 0);
}

#[tokio::test]
async fn shutdown_leaves_future_work_queued() {
    let store = TestStateStore::new();
    let sms = ScriptedSender::delivering();
    let running = Running::start(engine(
        config(&[ChannelKind::Sms]),
        &[(ChannelKind::Sms, sms.clone())],
        &store,
    ));

    let later = SystemTime::now() + Duration::from_secs(3600);
    let id = running
        .engine
        .submit(
            NewMessage::new(RECIPIENT, MessageType::Reminder)
                .content("Dentist at 3")
                .scheduled_for(later),
        )
        .await
        .unwrap();

    let engine = running.engine.clone();
    running.stop().await;

    assert_eq!(sms.calls(), 0);
    assert_eq!(
        engine.get_status(&id).await.unwrap().status,
        MessageStatus::Pending
    );
}

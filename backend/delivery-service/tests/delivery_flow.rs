//! Routing of direct messages between the live stream and the job queue.

use std::sync::Arc;
use std::time::Duration;

use crypto_core::{Cipher, Envelope, InMemoryKeyStore, KeyStore, KeyStoreError, Keyring};
use delivery_service::{
    config::Config,
    jobs::{DeliveryJobHandler, Notifier, NotifyError},
    services::{DeliveryError, NOTIFICATIONS_QUEUE, SYSTEM_JOBS_TOPIC},
    AppState, DeliveryRoute,
};
use job_queue::{EnqueueOptions, InMemoryJobStore, JobState, OutcomeStatus};
use mockall::mock;
use tokio::sync::watch;
use uuid::Uuid;

mock! {
    pub Notifier {}

    #[async_trait::async_trait]
    impl Notifier for Notifier {
        async fn notify_offline(&self, envelope: &Envelope) -> Result<(), NotifyError>;
        async fn send_summary(&self, recipient_id: Uuid, window_hours: u32) -> Result<(), NotifyError>;
    }
}

fn app_state() -> AppState {
    AppState::new(
        Config::default(),
        Arc::new(InMemoryJobStore::new()),
        Arc::new(InMemoryKeyStore::new()),
        Keyring::generate(Uuid::new_v4()),
    )
}

/// Two principals with published keys.
async fn principals(state: &AppState) -> (Keyring, Keyring) {
    let alice = Keyring::generate(Uuid::new_v4());
    let bob = Keyring::generate(Uuid::new_v4());
    for keyring in [&alice, &bob] {
        state
            .keys
            .publish(keyring.principal_id(), keyring.public_key())
            .await
            .unwrap();
    }
    (alice, bob)
}

fn seal(from: &Keyring, to: &Keyring, text: &str) -> Envelope {
    from.seal(
        &Cipher::new(Config::default().kdf_context),
        to.principal_id(),
        &to.public_key(),
        text.as_bytes(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_online_recipient_receives_envelope_live() {
    let state = app_state();
    let (alice, bob) = principals(&state).await;
    let mut inbox = state
        .broker
        .subscribe(&delivery_service::services::inbox_topic(bob.principal_id()));

    let envelope = seal(&alice, &bob, "hi bob");
    let route = state.delivery.send_envelope(envelope.clone()).await.unwrap();
    assert_eq!(route, DeliveryRoute::Delivered { subscribers: 1 });

    let frame = inbox.next().await.unwrap();
    assert_eq!(frame.event_type, "direct_message");
    let received: Envelope = serde_json::from_value(frame.data).unwrap();
    assert_eq!(received, envelope);

    let cipher = Cipher::new(Config::default().kdf_context);
    let plaintext = bob.open(&cipher, &received, &alice.public_key()).unwrap();
    assert_eq!(plaintext, b"hi bob");

    assert_eq!(state.queue.stats(NOTIFICATIONS_QUEUE).await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_offline_recipient_is_notified_by_job() {
    let state = app_state();
    let (alice, bob) = principals(&state).await;

    let route = state
        .delivery
        .send_envelope(seal(&alice, &bob, "are you there?"))
        .await
        .unwrap();
    let DeliveryRoute::Queued { job_id } = route else {
        panic!("expected a queued delivery, got {route:?}");
    };

    let record = state.queue.get(job_id).await.unwrap();
    assert_eq!(record.kind, "notify_offline");
    assert_eq!(record.state, JobState::Pending);
    assert_eq!(record.queue_name, NOTIFICATIONS_QUEUE);

    let bob_id = bob.principal_id();
    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify_offline()
        .withf(move |envelope| envelope.recipient_id() == bob_id)
        .times(1)
        .returning(|_| Ok(()));
    let handler = DeliveryJobHandler::new(state.broker.clone(), Arc::new(notifier));

    let outcome = state
        .queue
        .process_next(NOTIFICATIONS_QUEUE, &handler)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(
        state.queue.get(job_id).await.unwrap().state,
        JobState::Completed
    );
}

#[tokio::test]
async fn test_recipient_online_by_job_time_skips_notifier() {
    let state = app_state();
    let (alice, bob) = principals(&state).await;

    let envelope = seal(&alice, &bob, "catch up");
    state.delivery.send_envelope(envelope.clone()).await.unwrap();

    // Bob connects before the worker gets to the job.
    let mut inbox = state
        .broker
        .subscribe(&delivery_service::services::inbox_topic(bob.principal_id()));

    let mut notifier = MockNotifier::new();
    notifier.expect_notify_offline().times(0);
    let handler = DeliveryJobHandler::new(state.broker.clone(), Arc::new(notifier));

    let outcome = state
        .queue
        .process_next(NOTIFICATIONS_QUEUE, &handler)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Completed);

    let frame = inbox.next().await.unwrap();
    let received: Envelope = serde_json::from_value(frame.data).unwrap();
    assert_eq!(received, envelope);
}

#[tokio::test]
async fn test_unknown_recipient_key_is_rejected() {
    let state = app_state();
    let alice = Keyring::generate(Uuid::new_v4());
    let stranger = Keyring::generate(Uuid::new_v4());
    state
        .keys
        .publish(alice.principal_id(), alice.public_key())
        .await
        .unwrap();

    let err = state
        .delivery
        .send_envelope(seal(&alice, &stranger, "hello?"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeliveryError::KeyStore(KeyStoreError::KeyMissing(id)) if id == stranger.principal_id()
    ));
    assert_eq!(state.queue.stats(NOTIFICATIONS_QUEUE).await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_system_message_opens_with_system_key() {
    let state = app_state();
    state.delivery.register_system_key().await.unwrap();
    let (_, bob) = principals(&state).await;

    let (envelope, route) = state
        .delivery
        .send_system_message(bob.principal_id(), b"your post was restored")
        .await
        .unwrap();
    assert!(matches!(route, DeliveryRoute::Queued { .. }));
    assert_eq!(envelope.sender_id(), state.delivery.system_principal());

    let system_public = state
        .keys
        .lookup(state.delivery.system_principal())
        .await
        .unwrap();
    let cipher = Cipher::new(Config::default().kdf_context);
    let plaintext = bob.open(&cipher, &envelope, &system_public).unwrap();
    assert_eq!(plaintext, b"your post was restored");
}

#[tokio::test]
async fn test_exhausted_job_is_republished_for_triage() {
    let state = app_state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = state.delivery.spawn_dead_letter_relay(shutdown_rx);
    let mut triage = state.broker.subscribe(SYSTEM_JOBS_TOPIC);

    let recipient = Uuid::new_v4();
    let job_id = state
        .delivery
        .enqueue_summary(recipient, 24, EnqueueOptions::default().with_max_attempts(1))
        .await
        .unwrap();

    let mut notifier = MockNotifier::new();
    notifier
        .expect_send_summary()
        .withf(move |id, hours| *id == recipient && *hours == 24)
        .times(1)
        .returning(|_, _| Err(NotifyError::Unavailable("smtp down".into())));
    let handler = DeliveryJobHandler::new(state.broker.clone(), Arc::new(notifier));

    let outcome = state
        .queue
        .process_next(NOTIFICATIONS_QUEUE, &handler)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.attempts_exceeded().is_some());

    let frame = tokio::time::timeout(Duration::from_secs(5), triage.next())
        .await
        .expect("dead-letter event published")
        .unwrap();
    assert_eq!(frame.event_type, "job_dead_lettered");
    assert_eq!(frame.data["jobId"], job_id.to_string());
    assert_eq!(frame.data["outcome"], "dead_lettered");
    assert!(frame.data["reason"].as_str().unwrap().contains("smtp down"));

    shutdown_tx.send(true).unwrap();
    relay.await.unwrap();
}

#[tokio::test]
async fn test_rejected_notification_dead_letters_without_retry() {
    let state = app_state();
    let (alice, bob) = principals(&state).await;

    let route = state
        .delivery
        .send_envelope(seal(&alice, &bob, "ping"))
        .await
        .unwrap();
    let DeliveryRoute::Queued { job_id } = route else {
        panic!("expected a queued delivery, got {route:?}");
    };
    assert!(state.queue.get(job_id).await.unwrap().max_attempts > 1);

    let mut notifier = MockNotifier::new();
    notifier
        .expect_notify_offline()
        .times(1)
        .returning(|_| Err(NotifyError::Rejected("device unregistered".into())));
    let handler = DeliveryJobHandler::new(state.broker.clone(), Arc::new(notifier));

    let outcome = state
        .queue
        .process_next(NOTIFICATIONS_QUEUE, &handler)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.attempts, 1);
    assert!(matches!(
        outcome.status,
        OutcomeStatus::DeadLettered { exhausted: false, .. }
    ));
    assert!(outcome.attempts_exceeded().is_none());

    let record = state.queue.get(job_id).await.unwrap();
    assert_eq!(record.state, JobState::DeadLettered);
    assert!(record.last_error.unwrap().contains("device unregistered"));

    // Nothing left to retry.
    assert!(state
        .queue
        .process_next(NOTIFICATIONS_QUEUE, &handler)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_moderation_events_fan_out_and_inbox_is_reserved() {
    let state = app_state();
    let mut first = state.broker.subscribe("moderation:thread.7");
    let mut second = state.broker.subscribe("moderation:thread.7");

    let delivered = state
        .delivery
        .publish_moderation_event(
            "moderation:thread.7",
            "post_hidden",
            serde_json::json!({ "postId": 99 }),
        )
        .unwrap();
    assert_eq!(delivered, 2);
    assert_eq!(first.next().await.unwrap().data["postId"], 99);
    assert_eq!(second.next().await.unwrap().data["postId"], 99);

    let inbox = delivery_service::services::inbox_topic(Uuid::new_v4());
    assert!(matches!(
        state
            .delivery
            .publish_moderation_event(&inbox, "post_hidden", serde_json::Value::Null),
        Err(DeliveryError::ReservedTopic(_))
    ));
}

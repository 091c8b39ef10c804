use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use notification_reconciler::notification::testing::{
    FixedClock, InMemoryEventRepository, InMemoryWebhookProvider,
};
use notification_reconciler::notification::{
    Channel, ChannelDeliveryStatus, ChannelType, DeliveryReason, DeliveryStatus,
    DeliveryStatusState, Event, EventType, HandlerConfig, Message, ProviderError, ReconcileError,
    Reconciler, Rule,
};
use serde_json::json;
use tracing::Span;
use uuid::Uuid;

// key: notification-reconcile-tests -> webhook delivery state machine

const NAMESPACE: &str = "acme";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

struct Harness {
    repo: Arc<InMemoryEventRepository>,
    provider: Arc<InMemoryWebhookProvider>,
    clock: Arc<FixedClock>,
    reconciler: Reconciler,
}

impl Harness {
    fn new(events: Vec<Event>) -> Self {
        Self::with_config(events, HandlerConfig::default())
    }

    fn with_config(events: Vec<Event>, config: HandlerConfig) -> Self {
        let repo = Arc::new(InMemoryEventRepository::new(events));
        let provider = Arc::new(InMemoryWebhookProvider::new());
        let clock = Arc::new(FixedClock::new(t0()));
        let reconciler = Reconciler::new(
            repo.clone(),
            provider.clone(),
            clock.clone(),
            config,
            Span::none(),
        );
        Self {
            repo,
            provider,
            clock,
            reconciler,
        }
    }
}

fn webhook_channel() -> Channel {
    Channel {
        id: Uuid::new_v4(),
        name: "billing-hook".to_string(),
        channel_type: ChannelType::Webhook,
    }
}

fn status(event_id: Uuid, channel_id: Uuid, state: DeliveryStatusState) -> DeliveryStatus {
    DeliveryStatus {
        namespace: NAMESPACE.to_string(),
        id: Uuid::new_v4(),
        event_id,
        channel_id,
        state,
        attempts: 0,
        next_attempt: None,
        reason: None,
        annotations: Default::default(),
        created_at: t0() - Duration::minutes(5),
        updated_at: t0() - Duration::minutes(5),
    }
}

/// One event routed to `channels`, with a status per `(channel index, state)`.
fn event(channels: Vec<Channel>, states: &[(usize, DeliveryStatusState)]) -> Event {
    let id = Uuid::new_v4();
    let delivery_status = states
        .iter()
        .map(|(index, state)| status(id, channels[*index].id, *state))
        .collect();
    Event {
        id,
        namespace: NAMESPACE.to_string(),
        event_type: EventType::BalanceThreshold,
        created_at: t0() - Duration::minutes(5),
        payload: json!({ "feature": "api-calls", "threshold": 80 }),
        rule: Rule {
            id: Uuid::new_v4(),
            namespace: NAMESPACE.to_string(),
            name: "usage alerts".to_string(),
            channels,
        },
        annotations: Default::default(),
        delivery_status,
    }
}

fn pending_event() -> Event {
    event(vec![webhook_channel()], &[(0, DeliveryStatusState::Pending)])
}

fn message_for(event: &Event, routes: Vec<ChannelDeliveryStatus>) -> Message {
    Message {
        id: format!("msg-{}", event.id),
        namespace: event.namespace.clone(),
        event_id: event.id,
        event_type: event.event_type,
        channels: event.rule.channels.iter().map(|channel| channel.id).collect(),
        annotations: Default::default(),
        delivery_status: Some(routes),
    }
}

fn route(channel_id: Uuid, state: DeliveryStatusState, attempts: u32) -> ChannelDeliveryStatus {
    ChannelDeliveryStatus {
        channel_id,
        state,
        attempts,
        next_attempt: None,
    }
}

#[tokio::test]
async fn pending_status_is_sent_and_mirrors_provider_routing() {
    let event = pending_event();
    let status_id = event.delivery_status[0].id;
    let channel_id = event.rule.channels[0].id;
    let harness = Harness::new(vec![event.clone()]);

    harness.reconciler.reconcile().await.unwrap();

    let sent = harness.provider.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].namespace, NAMESPACE);
    assert_eq!(sent[0].event_id, event.id);
    assert_eq!(sent[0].channels, vec![channel_id]);
    assert_eq!(sent[0].timestamp, event.created_at);
    assert_eq!(sent[0].payload["type"], "entitlements.balance.threshold");
    assert_eq!(sent[0].payload["data"]["threshold"], 80);

    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Sending);
    assert_eq!(updated.attempts, 1);
    assert_eq!(updated.reason, None);
}

#[tokio::test]
async fn second_pass_does_not_resend() {
    let event = pending_event();
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();
    harness.clock.advance(Duration::minutes(1));
    harness.reconciler.reconcile().await.unwrap();

    assert_eq!(harness.provider.sent().await.len(), 1);
    assert_eq!(harness.repo.updates().await.len(), 1);
}

#[tokio::test]
async fn unrouted_message_is_assumed_in_flight() {
    let event = pending_event();
    let status_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event]);
    harness.provider.route_sends_as(None).await;

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Sending);
    assert_eq!(updated.next_attempt, Some(t0() + Duration::seconds(15)));
}

#[tokio::test]
async fn existing_provider_message_is_mirrored_without_resending() {
    let event = pending_event();
    let status_id = event.delivery_status[0].id;
    let channel_id = event.rule.channels[0].id;
    let harness = Harness::new(vec![event.clone()]);
    harness
        .provider
        .insert_message(message_for(
            &event,
            vec![route(channel_id, DeliveryStatusState::Success, 2)],
        ))
        .await;

    harness.reconciler.reconcile().await.unwrap();

    assert!(harness.provider.sent().await.is_empty());
    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Success);
    assert_eq!(updated.attempts, 2);
}

#[tokio::test]
async fn provider_failure_is_reported_as_exhausted_attempts() {
    let event = pending_event();
    let status_id = event.delivery_status[0].id;
    let channel_id = event.rule.channels[0].id;
    let harness = Harness::new(vec![event.clone()]);
    harness
        .provider
        .insert_message(message_for(
            &event,
            vec![route(channel_id, DeliveryStatusState::Failed, 5)],
        ))
        .await;

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Failed);
    assert_eq!(updated.reason, Some(DeliveryReason::UserSendAttemptsExhausted));
    assert_eq!(updated.attempts, 5);
}

#[tokio::test]
async fn provider_annotations_overlay_local_ones() {
    let mut event = pending_event();
    event.delivery_status[0]
        .annotations
        .insert("local".to_string(), json!("kept"));
    let status_id = event.delivery_status[0].id;
    let channel_id = event.rule.channels[0].id;
    let harness = Harness::new(vec![event.clone()]);
    let mut message = message_for(&event, vec![route(channel_id, DeliveryStatusState::Sending, 1)]);
    message
        .annotations
        .insert("provider.message_id".to_string(), json!("msg-1"));
    harness.provider.insert_message(message).await;

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.annotations["local"], "kept");
    assert_eq!(updated.annotations["provider.message_id"], "msg-1");
}

#[tokio::test]
async fn pending_status_past_timeout_fails_without_sending() {
    let mut event = pending_event();
    event.delivery_status[0].created_at = t0() - Duration::hours(4);
    let status_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();

    assert!(harness.provider.sent().await.is_empty());
    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Failed);
    assert_eq!(updated.reason, Some(DeliveryReason::SystemDispatchExhausted));
    assert_eq!(updated.next_attempt, None);
}

#[tokio::test]
async fn backing_off_status_is_left_untouched() {
    let mut event = pending_event();
    event.delivery_status[0].next_attempt = Some(t0() + Duration::minutes(1));
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();

    assert!(harness.repo.updates().await.is_empty());
    assert_eq!(harness.provider.get_calls().await, 0);
    assert!(harness.provider.sent().await.is_empty());
}

#[tokio::test]
async fn back_off_elapses_with_the_clock() {
    let mut event = pending_event();
    event.delivery_status[0].next_attempt = Some(t0() + Duration::minutes(1));
    let status_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();
    assert!(harness.provider.sent().await.is_empty());

    harness.clock.advance(Duration::minutes(2));
    harness.reconciler.reconcile().await.unwrap();

    assert_eq!(harness.provider.sent().await.len(), 1);
    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Sending);
}

#[tokio::test]
async fn retryable_send_error_schedules_retry_after_hint() {
    let mut event = pending_event();
    event.delivery_status[0].attempts = 2;
    let status_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event]);
    harness
        .provider
        .fail_next_send(ProviderError::Retryable {
            message: "429 Too Many Requests".to_string(),
            retry_after: Some(StdDuration::from_secs(30)),
        })
        .await;

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Pending);
    assert_eq!(updated.reason, Some(DeliveryReason::SystemRecoverable));
    assert_eq!(updated.next_attempt, Some(t0() + Duration::seconds(30)));
    assert_eq!(updated.attempts, 2);
}

#[tokio::test]
async fn transport_error_backs_off_by_reconcile_interval() {
    let event = pending_event();
    let status_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event]);
    harness
        .provider
        .fail_next_send(ProviderError::Transport(anyhow::anyhow!("connection refused")))
        .await;

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Pending);
    assert_eq!(updated.reason, Some(DeliveryReason::SystemRecoverable));
    assert_eq!(updated.next_attempt, Some(t0() + Duration::seconds(15)));
}

#[tokio::test]
async fn message_not_ready_retries_on_next_pass() {
    let event = pending_event();
    let status_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event]);
    harness
        .provider
        .fail_next_send(ProviderError::MessageNotReady("still indexing".to_string()))
        .await;

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Pending);
    assert_eq!(updated.next_attempt, None);
    assert_eq!(updated.reason, None);
}

#[tokio::test]
async fn unrecoverable_send_error_fails_status() {
    let event = pending_event();
    let status_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event]);
    harness
        .provider
        .fail_next_send(ProviderError::Unrecoverable("endpoint disabled".to_string()))
        .await;

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(status_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Failed);
    assert_eq!(updated.reason, Some(DeliveryReason::SystemUnrecoverable));
}

#[tokio::test]
async fn statuses_are_processed_in_priority_order() {
    let channels = vec![webhook_channel(), webhook_channel(), webhook_channel()];
    let event = event(
        channels.clone(),
        &[
            (1, DeliveryStatusState::Sending),
            (0, DeliveryStatusState::Pending),
            (2, DeliveryStatusState::Failed),
        ],
    );
    let failed_id = event.delivery_status[2].id;
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();

    let updates = harness.repo.updates().await;
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].channel_id, channels[0].id);
    assert_eq!(updates[1].channel_id, channels[1].id);
    assert!(updates.iter().all(|update| update.id != failed_id));
    let failed = harness.repo.delivery_status(failed_id).await.unwrap();
    assert_eq!(failed.state, DeliveryStatusState::Failed);
    assert!(updates
        .iter()
        .all(|update| update.state == DeliveryStatusState::Sending && update.attempts == 1));
}

#[tokio::test]
async fn sending_only_event_waits_for_sending_pass() {
    let event = event(vec![webhook_channel()], &[(0, DeliveryStatusState::Sending)]);
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();

    assert_eq!(harness.provider.get_calls().await, 0);
    assert!(harness.repo.updates().await.is_empty());
}

#[tokio::test]
async fn sending_status_past_timeout_fails() {
    let channels = vec![webhook_channel(), webhook_channel()];
    let mut event = event(
        channels,
        &[
            (0, DeliveryStatusState::Pending),
            (1, DeliveryStatusState::Sending),
        ],
    );
    event.delivery_status[0].next_attempt = Some(t0() + Duration::minutes(10));
    event.delivery_status[1].created_at = t0() - Duration::hours(49);
    let sending_id = event.delivery_status[1].id;
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(sending_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Failed);
    assert_eq!(updated.reason, Some(DeliveryReason::UserSendAttemptsExhausted));
}

#[tokio::test]
async fn stuck_sending_status_returns_to_pending() {
    let channels = vec![webhook_channel(), webhook_channel(), webhook_channel()];
    let mut event = event(
        channels,
        &[
            (0, DeliveryStatusState::Pending),
            (1, DeliveryStatusState::Sending),
            (2, DeliveryStatusState::Sending),
        ],
    );
    event.delivery_status[0].next_attempt = Some(t0() + Duration::minutes(10));
    event.delivery_status[1].next_attempt = Some(t0() - Duration::minutes(61));
    event.delivery_status[2].next_attempt = Some(t0() - Duration::minutes(59));
    let stuck_id = event.delivery_status[1].id;
    let recent_id = event.delivery_status[2].id;
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();

    let stuck = harness.repo.delivery_status(stuck_id).await.unwrap();
    assert_eq!(stuck.state, DeliveryStatusState::Pending);
    assert_eq!(stuck.next_attempt, None);

    let recent = harness.repo.delivery_status(recent_id).await.unwrap();
    assert_eq!(recent.state, DeliveryStatusState::Sending);
    assert_eq!(harness.repo.updates().await.len(), 1);
}

#[tokio::test]
async fn missing_message_recovery_falls_back_to_last_update() {
    let channels = vec![webhook_channel(), webhook_channel()];
    let mut event = event(
        channels,
        &[
            (0, DeliveryStatusState::Sending),
            (1, DeliveryStatusState::Sending),
        ],
    );
    for status in &mut event.delivery_status {
        status.created_at = t0() - Duration::hours(2);
        status.next_attempt = None;
    }
    event.delivery_status[0].updated_at = t0() - Duration::minutes(61);
    event.delivery_status[1].updated_at = t0() - Duration::minutes(59);
    let stuck_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event.clone()]);

    harness
        .reconciler
        .reconcile_webhook_event(&event)
        .await
        .unwrap();

    let updates = harness.repo.updates().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, stuck_id);
    assert_eq!(updates[0].state, DeliveryStatusState::Pending);
    assert_eq!(updates[0].next_attempt, None);
}

#[tokio::test]
async fn sending_status_without_provider_route_fails() {
    let channels = vec![webhook_channel(), webhook_channel()];
    let mut event = event(
        channels.clone(),
        &[
            (0, DeliveryStatusState::Pending),
            (1, DeliveryStatusState::Sending),
        ],
    );
    event.delivery_status[0].next_attempt = Some(t0() + Duration::minutes(10));
    let sending_id = event.delivery_status[1].id;
    let harness = Harness::new(vec![event.clone()]);
    harness
        .provider
        .insert_message(message_for(
            &event,
            vec![route(channels[0].id, DeliveryStatusState::Sending, 1)],
        ))
        .await;

    harness.reconciler.reconcile().await.unwrap();

    let updated = harness.repo.delivery_status(sending_id).await.unwrap();
    assert_eq!(updated.state, DeliveryStatusState::Failed);
    assert_eq!(updated.reason, Some(DeliveryReason::SystemUnrecoverable));
}

#[tokio::test]
async fn resending_status_is_reported_as_unsupported() {
    let channels = vec![webhook_channel(), webhook_channel()];
    let event = event(
        channels,
        &[
            (0, DeliveryStatusState::Pending),
            (1, DeliveryStatusState::Resending),
        ],
    );
    let pending_id = event.delivery_status[0].id;
    let harness = Harness::new(vec![event]);

    let errors = harness.reconciler.reconcile().await.unwrap_err();

    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.iter().next(),
        Some(ReconcileError::UnsupportedState {
            state: DeliveryStatusState::Resending,
            ..
        })
    ));
    let pending = harness.repo.delivery_status(pending_id).await.unwrap();
    assert_eq!(pending.state, DeliveryStatusState::Sending);
}

#[tokio::test]
async fn provider_read_failure_is_surfaced() {
    let event = pending_event();
    let harness = Harness::new(vec![event]);
    harness
        .provider
        .fail_next_get(ProviderError::Transport(anyhow::anyhow!("dns failure")))
        .await;

    let errors = harness.reconciler.reconcile().await.unwrap_err();

    assert!(matches!(
        errors.iter().next(),
        Some(ReconcileError::GetMessage { .. })
    ));
    assert!(harness.provider.sent().await.is_empty());
    assert!(harness.repo.updates().await.is_empty());
}

#[tokio::test]
async fn persist_failure_does_not_stop_other_events() {
    let failing = pending_event();
    let healthy = pending_event();
    let healthy_id = healthy.delivery_status[0].id;
    let harness = Harness::new(vec![failing.clone(), healthy]);
    harness.repo.fail_updates_for(failing.id).await;

    let errors = harness.reconciler.reconcile().await.unwrap_err();

    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.iter().next(),
        Some(ReconcileError::Persist { event_id, .. }) if *event_id == failing.id
    ));
    let healthy = harness.repo.delivery_status(healthy_id).await.unwrap();
    assert_eq!(healthy.state, DeliveryStatusState::Sending);
    assert_eq!(harness.provider.sent().await.len(), 2);
}

#[tokio::test]
async fn listing_failure_is_returned() {
    let harness = Harness::new(vec![pending_event()]);
    harness.repo.fail_listing("connection reset").await;

    let errors = harness.reconciler.reconcile().await.unwrap_err();

    assert!(matches!(
        errors.iter().next(),
        Some(ReconcileError::ListEvents(_))
    ));
    assert!(errors.to_string().contains("connection reset"));
}

#[tokio::test]
async fn non_webhook_channels_are_skipped() {
    let email = Channel {
        id: Uuid::new_v4(),
        name: "ops-mail".to_string(),
        channel_type: ChannelType::Other("email".to_string()),
    };
    let event = event(vec![email], &[(0, DeliveryStatusState::Pending)]);
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();

    assert_eq!(harness.provider.get_calls().await, 0);
    assert!(harness.repo.updates().await.is_empty());
}

#[tokio::test]
async fn terminal_events_are_not_listed() {
    let event = event(vec![webhook_channel()], &[(0, DeliveryStatusState::Success)]);
    let harness = Harness::new(vec![event]);

    harness.reconciler.reconcile().await.unwrap();

    assert_eq!(harness.provider.get_calls().await, 0);
    assert!(harness.repo.updates().await.is_empty());
}

#[tokio::test]
async fn terminal_statuses_are_never_touched() {
    let channels = vec![webhook_channel(), webhook_channel()];
    let event = event(
        channels,
        &[
            (0, DeliveryStatusState::Success),
            (1, DeliveryStatusState::Failed),
        ],
    );
    let harness = Harness::new(vec![event.clone()]);

    harness.reconciler.reconcile_event(&event).await.unwrap();
    harness
        .reconciler
        .reconcile_webhook_event(&event)
        .await
        .unwrap();

    assert!(harness.repo.updates().await.is_empty());
    assert_eq!(harness.provider.get_calls().await, 0);
    assert!(harness.provider.sent().await.is_empty());
}

#[tokio::test]
async fn paged_pass_visits_every_event() {
    let events: Vec<Event> = (0..3).map(|_| pending_event()).collect();
    let config = HandlerConfig {
        page_size: Some(1),
        ..HandlerConfig::default()
    };
    let harness = Harness::with_config(events, config);

    harness.reconciler.reconcile().await.unwrap();

    assert_eq!(harness.provider.sent().await.len(), 3);
}

#[tokio::test]
async fn reconcile_event_handles_a_single_event() {
    let event = pending_event();
    let other = pending_event();
    let harness = Harness::new(vec![event.clone(), other.clone()]);

    harness.reconciler.reconcile_event(&event).await.unwrap();

    let sent = harness.provider.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event_id, event.id);
    let untouched = harness.repo.event(other.id).await.unwrap();
    assert_eq!(untouched.delivery_status[0].state, DeliveryStatusState::Pending);
}

#[tokio::test]
async fn repeated_sends_share_an_idempotency_key() {
    let event = pending_event();
    let harness = Harness::new(vec![event.clone()]);
    harness
        .provider
        .fail_next_send(ProviderError::Transport(anyhow::anyhow!("timeout")))
        .await;

    harness.reconciler.reconcile().await.unwrap();
    harness.clock.advance(Duration::seconds(16));
    harness.reconciler.reconcile().await.unwrap();

    let sent = harness.provider.sent().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].idempotency_key(), sent[1].idempotency_key());
}

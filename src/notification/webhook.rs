use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::filter::{filter_active, sort_by_priority};
use super::models::{
    ChannelType, DeliveryReason, DeliveryStatus, DeliveryStatusState, Event,
    UpdateEventDeliveryStatusInput,
};
use super::provider::{GetMessageInput, Message, SendMessageInput};
use super::reconcile::{to_chrono, ReconcileError, ReconcileErrors, Reconciler};

/// A sending status whose provider message cannot be found for this long is handed back to
/// the pending pass. Shorter gaps are treated as provider read lag.
pub const SENDING_STUCK_THRESHOLD_MINUTES: i64 = 60;

type Update = Option<UpdateEventDeliveryStatusInput>;

impl Reconciler {
    /// key: webhook-reconciler -> decide and persist the next state of every active webhook
    /// delivery status of one event
    pub async fn reconcile_webhook_event(&self, event: &Event) -> Result<(), ReconcileErrors> {
        let mut statuses = filter_active(event, &ChannelType::Webhook);
        if statuses.is_empty() {
            return Ok(());
        }
        sort_by_priority(&mut statuses);

        let mut errors = ReconcileErrors::default();
        for status in &statuses {
            let now = self.clock.now();
            if let Some(next_attempt) = status.next_attempt {
                if next_attempt > now {
                    debug!(
                        delivery_status_id = %status.id,
                        channel_id = %status.channel_id,
                        %next_attempt,
                        "delivery status is backing off"
                    );
                    continue;
                }
            }

            let decision = match status.state {
                DeliveryStatusState::Pending => self.reconcile_pending_status(event, status, now).await,
                DeliveryStatusState::Sending => self.reconcile_sending_status(event, status, now).await,
                DeliveryStatusState::Success | DeliveryStatusState::Failed => {
                    debug!(
                        delivery_status_id = %status.id,
                        state = %status.state,
                        "delivery status is terminal"
                    );
                    Ok(None)
                }
                state => Err(ReconcileError::UnsupportedState {
                    event_id: event.id,
                    delivery_status_id: status.id,
                    state,
                }),
            };

            let input = match decision {
                Ok(Some(input)) => input,
                Ok(None) => continue,
                Err(err) => {
                    errors.push(err);
                    continue;
                }
            };

            let next_state = input.state;
            match self.repo.update_event_delivery_status(input).await {
                Ok(updated) => info!(
                    delivery_status_id = %updated.id,
                    channel_id = %updated.channel_id,
                    from = %status.state,
                    to = %next_state,
                    attempts = updated.attempts,
                    reason = updated.reason.map(|reason| reason.as_str()),
                    "delivery status updated"
                ),
                Err(source) => errors.push(ReconcileError::Persist {
                    event_id: event.id,
                    delivery_status_id: status.id,
                    source,
                }),
            }
        }

        if !errors.is_empty() {
            error!(
                namespace = %event.namespace,
                event_id = %event.id,
                failures = errors.len(),
                errors = %errors,
                "failed to reconcile webhook delivery statuses"
            );
        }
        errors.into_result()
    }

    async fn reconcile_pending_status(
        &self,
        event: &Event,
        status: &DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<Update, ReconcileError> {
        if status.next_attempt.unwrap_or(now) - status.created_at
            > to_chrono(self.config.pending_timeout)
        {
            warn!(
                delivery_status_id = %status.id,
                channel_id = %status.channel_id,
                "delivery status never left pending, giving up"
            );
            return Ok(Some(failed(status, DeliveryReason::SystemDispatchExhausted)));
        }

        if let Some(message) = self.fetch_message(event).await? {
            return Ok(Some(self.mirror_message(status, &message, now)));
        }

        let input = SendMessageInput {
            namespace: event.namespace.clone(),
            event_id: event.id,
            event_type: event.event_type,
            channels: event
                .rule
                .channels
                .iter()
                .filter(|channel| channel.channel_type == ChannelType::Webhook)
                .map(|channel| channel.id)
                .collect(),
            payload: event.webhook_payload(),
            timestamp: event.created_at,
        };

        match self.provider.send_message(input).await {
            Ok(sent) => {
                // Re-read so the mirrored state reflects the provider's per-channel routing.
                let message = match self.fetch_message(event).await {
                    Ok(Some(message)) => message,
                    Ok(None) => sent,
                    Err(err) => {
                        warn!(?err, "failed to re-read webhook message after send");
                        sent
                    }
                };
                Ok(Some(self.mirror_message(status, &message, now)))
            }
            Err(err) if err.is_message_not_ready() => {
                debug!(?err, "webhook message not ready, retrying on next pass");
                let mut input = UpdateEventDeliveryStatusInput::from_status(status);
                input.state = DeliveryStatusState::Pending;
                input.next_attempt = None;
                Ok(Some(input))
            }
            Err(err) if err.is_unrecoverable() => {
                warn!(?err, "webhook provider rejected message permanently");
                Ok(Some(failed(status, DeliveryReason::SystemUnrecoverable)))
            }
            Err(err) => {
                let backoff = err
                    .retry_after()
                    .map(to_chrono)
                    .unwrap_or_else(|| to_chrono(self.config.reconcile_interval));
                warn!(?err, backoff_secs = backoff.num_seconds(), "failed to send webhook message");
                let mut input = UpdateEventDeliveryStatusInput::from_status(status);
                input.state = DeliveryStatusState::Pending;
                input.reason = Some(DeliveryReason::SystemRecoverable);
                input.next_attempt = Some(now + backoff);
                Ok(Some(input))
            }
        }
    }

    async fn reconcile_sending_status(
        &self,
        event: &Event,
        status: &DeliveryStatus,
        now: DateTime<Utc>,
    ) -> Result<Update, ReconcileError> {
        if status.next_attempt.unwrap_or(now) - status.created_at
            > to_chrono(self.config.sending_timeout)
        {
            warn!(
                delivery_status_id = %status.id,
                channel_id = %status.channel_id,
                "delivery status exhausted send attempts"
            );
            return Ok(Some(failed(status, DeliveryReason::UserSendAttemptsExhausted)));
        }

        let Some(message) = self.fetch_message(event).await? else {
            let since = status.next_attempt.unwrap_or(status.updated_at);
            if now - since > Duration::minutes(SENDING_STUCK_THRESHOLD_MINUTES) {
                info!(
                    delivery_status_id = %status.id,
                    channel_id = %status.channel_id,
                    %since,
                    "webhook message missing for sending status, returning it to pending"
                );
                let mut input = UpdateEventDeliveryStatusInput::from_status(status);
                input.state = DeliveryStatusState::Pending;
                input.next_attempt = None;
                return Ok(Some(input));
            }
            return Ok(None);
        };

        if message.delivery_status_for(status.channel_id).is_none() {
            warn!(
                delivery_status_id = %status.id,
                channel_id = %status.channel_id,
                message_id = %message.id,
                "webhook message has no route for channel"
            );
            return Ok(Some(failed(status, DeliveryReason::SystemUnrecoverable)));
        }

        Ok(Some(self.mirror_message(status, &message, now)))
    }

    async fn fetch_message(&self, event: &Event) -> Result<Option<Message>, ReconcileError> {
        let input = GetMessageInput {
            namespace: event.namespace.clone(),
            event_id: event.id,
            expand_delivery_status: true,
        };
        match self.provider.get_message(input).await {
            Ok(message) => Ok(Some(message)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(source) => Err(ReconcileError::GetMessage {
                event_id: event.id,
                source,
            }),
        }
    }

    /// Copies the provider's view of this channel onto the local status. Provider annotations
    /// overlay local ones. A message without an entry for the channel is assumed in flight.
    fn mirror_message(
        &self,
        status: &DeliveryStatus,
        message: &Message,
        now: DateTime<Utc>,
    ) -> UpdateEventDeliveryStatusInput {
        let mut input = UpdateEventDeliveryStatusInput::from_status(status);
        for (key, value) in &message.annotations {
            input.annotations.insert(key.clone(), value.clone());
        }

        match message.delivery_status_for(status.channel_id) {
            Some(channel) => {
                input.state = channel.state;
                input.attempts = channel.attempts;
                input.next_attempt = channel.next_attempt;
                input.reason = match channel.state {
                    DeliveryStatusState::Failed => Some(DeliveryReason::UserSendAttemptsExhausted),
                    _ => None,
                };
            }
            None => {
                input.state = DeliveryStatusState::Sending;
                input.next_attempt = Some(now + to_chrono(self.config.reconcile_interval));
                input.reason = None;
            }
        }
        input
    }
}

fn failed(status: &DeliveryStatus, reason: DeliveryReason) -> UpdateEventDeliveryStatusInput {
    let mut input = UpdateEventDeliveryStatusInput::from_status(status);
    input.state = DeliveryStatusState::Failed;
    input.reason = Some(reason);
    input.next_attempt = None;
    input
}

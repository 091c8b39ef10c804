use super::models::{ChannelType, DeliveryStatus, DeliveryStatusState, Event};

/// Non-terminal delivery statuses of `event` whose channel resolves in the event's rule
/// and has the given type. Statuses pointing at unknown channels are dropped.
pub fn filter_active(event: &Event, channel_type: &ChannelType) -> Vec<DeliveryStatus> {
    event
        .delivery_status
        .iter()
        .filter(|status| !status.state.is_terminal())
        .filter(|status| {
            event
                .rule
                .channel(status.channel_id)
                .map(|channel| &channel.channel_type == channel_type)
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Stable ascending sort by state priority.
pub fn sort_by_priority(statuses: &mut [DeliveryStatus]) {
    statuses.sort_by_key(|status| status.state.priority());
}

/// Distinct states present in `statuses`, in priority order.
pub fn delivery_status_states(statuses: &[DeliveryStatus]) -> Vec<DeliveryStatusState> {
    let mut states: Vec<DeliveryStatusState> = Vec::new();
    for status in statuses {
        if !states.contains(&status.state) {
            states.push(status.state);
        }
    }
    states.sort_by_key(|state| state.priority());
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::models::{Channel, EventType, Rule};
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn status(channel_id: Uuid, state: DeliveryStatusState) -> DeliveryStatus {
        let now = Utc::now();
        DeliveryStatus {
            namespace: "default".to_string(),
            id: Uuid::new_v4(),
            event_id: Uuid::nil(),
            channel_id,
            state,
            attempts: 0,
            next_attempt: None,
            reason: None,
            annotations: Default::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn event(channels: Vec<Channel>, statuses: Vec<DeliveryStatus>) -> Event {
        Event {
            id: Uuid::nil(),
            namespace: "default".to_string(),
            event_type: EventType::InvoiceCreated,
            created_at: Utc::now(),
            payload: json!({}),
            rule: Rule {
                id: Uuid::new_v4(),
                namespace: "default".to_string(),
                name: "invoices".to_string(),
                channels,
            },
            annotations: Default::default(),
            delivery_status: statuses,
        }
    }

    fn channel(channel_type: ChannelType) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            name: "hook".to_string(),
            channel_type,
        }
    }

    #[test]
    fn filter_drops_terminal_foreign_and_unknown_channels() {
        let webhook = channel(ChannelType::Webhook);
        let email = channel(ChannelType::Other("email".to_string()));
        let statuses = vec![
            status(webhook.id, DeliveryStatusState::Pending),
            status(webhook.id, DeliveryStatusState::Success),
            status(webhook.id, DeliveryStatusState::Failed),
            status(email.id, DeliveryStatusState::Pending),
            status(Uuid::new_v4(), DeliveryStatusState::Sending),
        ];
        let keep = statuses[0].id;
        let event = event(vec![webhook, email], statuses);

        let active = filter_active(&event, &ChannelType::Webhook);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, keep);
    }

    #[test]
    fn sort_is_stable_within_equal_priority() {
        let channel_id = Uuid::new_v4();
        let mut statuses = vec![
            status(channel_id, DeliveryStatusState::Sending),
            status(channel_id, DeliveryStatusState::Pending),
            status(channel_id, DeliveryStatusState::Failed),
            status(channel_id, DeliveryStatusState::Success),
            status(channel_id, DeliveryStatusState::Pending),
            status(channel_id, DeliveryStatusState::Resending),
        ];
        let failed = statuses[2].id;
        let success = statuses[3].id;
        let first_pending = statuses[1].id;
        let second_pending = statuses[4].id;

        sort_by_priority(&mut statuses);

        let states: Vec<_> = statuses.iter().map(|status| status.state).collect();
        assert_eq!(
            states,
            vec![
                DeliveryStatusState::Pending,
                DeliveryStatusState::Pending,
                DeliveryStatusState::Resending,
                DeliveryStatusState::Sending,
                DeliveryStatusState::Failed,
                DeliveryStatusState::Success,
            ]
        );
        assert_eq!(statuses[0].id, first_pending);
        assert_eq!(statuses[1].id, second_pending);
        assert_eq!(statuses[4].id, failed);
        assert_eq!(statuses[5].id, success);
    }

    #[test]
    fn distinct_states_follow_priority() {
        let channel_id = Uuid::new_v4();
        let statuses = vec![
            status(channel_id, DeliveryStatusState::Failed),
            status(channel_id, DeliveryStatusState::Sending),
            status(channel_id, DeliveryStatusState::Pending),
            status(channel_id, DeliveryStatusState::Sending),
        ];

        assert_eq!(
            delivery_status_states(&statuses),
            vec![
                DeliveryStatusState::Pending,
                DeliveryStatusState::Sending,
                DeliveryStatusState::Failed,
            ]
        );
    }
}

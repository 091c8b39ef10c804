use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::models::{
    Annotations, Channel, ChannelType, DeliveryReason, DeliveryStatus, DeliveryStatusState,
    Event, EventType, ListEventsInput, PagedResponse, Rule, UpdateEventDeliveryStatusInput,
};
use super::repository::{EventRepository, RepositoryError};

/// key: notification-event-store -> Postgres-backed event repository
#[derive(Clone)]
pub struct PgEventRepository {
    pool: PgPool,
}

impl PgEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn channels_by_rule(
        &self,
        rule_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<Channel>>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT rc.rule_id, c.id, c.name, c.channel_type
            FROM notification_rule_channels rc
            JOIN notification_channels c ON c.id = rc.channel_id
            WHERE rc.rule_id = ANY($1)
            ORDER BY c.created_at, c.id
            "#,
        )
        .bind(rule_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut channels: HashMap<Uuid, Vec<Channel>> = HashMap::new();
        for row in rows {
            let rule_id: Uuid = row.get("rule_id");
            let channel_type: String = row.get("channel_type");
            channels.entry(rule_id).or_default().push(Channel {
                id: row.get("id"),
                name: row.get("name"),
                channel_type: ChannelType::from_str(&channel_type),
            });
        }
        Ok(channels)
    }

    async fn statuses_by_event(
        &self,
        event_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<DeliveryStatus>>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT namespace, id, event_id, channel_id, state, reason, attempts,
                   next_attempt, annotations, created_at, updated_at
            FROM notification_event_delivery_status
            WHERE event_id = ANY($1)
            ORDER BY created_at, id
            "#,
        )
        .bind(event_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut statuses: HashMap<Uuid, Vec<DeliveryStatus>> = HashMap::new();
        for row in rows {
            let status = delivery_status_from_row(&row)?;
            statuses.entry(status.event_id).or_default().push(status);
        }
        Ok(statuses)
    }
}

#[async_trait]
impl EventRepository for PgEventRepository {
    async fn list_events(
        &self,
        input: ListEventsInput,
    ) -> Result<PagedResponse<Event>, RepositoryError> {
        let states: Vec<String> = input
            .delivery_status_states
            .iter()
            .map(|state| state.as_str().to_string())
            .collect();
        let limit: Option<i64> = if input.page.is_unbounded() {
            None
        } else {
            Some(i64::from(input.page.page_size))
        };
        let offset = i64::try_from(input.page.offset()).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT
                e.namespace,
                e.id,
                e.event_type,
                e.payload,
                e.annotations,
                e.created_at,
                r.id AS rule_id,
                r.namespace AS rule_namespace,
                r.name AS rule_name,
                COUNT(*) OVER () AS total_count
            FROM notification_events e
            JOIN notification_rules r ON r.id = e.rule_id
            WHERE (cardinality($1::text[]) = 0 OR e.namespace = ANY($1))
              AND (
                cardinality($2::text[]) = 0
                OR EXISTS (
                    SELECT 1 FROM notification_event_delivery_status s
                    WHERE s.event_id = e.id AND s.state = ANY($2)
                )
              )
            ORDER BY e.created_at, e.id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(&input.namespaces)
        .bind(&states)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total_count = rows
            .first()
            .map(|row| row.get::<i64, _>("total_count"))
            .unwrap_or(0);

        let rule_ids: Vec<Uuid> = rows.iter().map(|row| row.get("rule_id")).collect();
        let event_ids: Vec<Uuid> = rows.iter().map(|row| row.get("id")).collect();
        let channels = self.channels_by_rule(&rule_ids).await?;
        let mut statuses = self.statuses_by_event(&event_ids).await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: Uuid = row.get("id");
            let rule_id: Uuid = row.get("rule_id");
            let event_type: String = row.get("event_type");
            let event_type = EventType::from_str(&event_type)
                .ok_or_else(|| RepositoryError::Decode(format!("event type `{event_type}`")))?;
            let Json(annotations): Json<Annotations> = row.get("annotations");
            let payload: Value = row.get("payload");

            items.push(Event {
                id,
                namespace: row.get("namespace"),
                event_type,
                created_at: row.get("created_at"),
                payload,
                rule: Rule {
                    id: rule_id,
                    namespace: row.get("rule_namespace"),
                    name: row.get("rule_name"),
                    channels: channels.get(&rule_id).cloned().unwrap_or_default(),
                },
                annotations,
                delivery_status: statuses.remove(&id).unwrap_or_default(),
            });
        }

        Ok(PagedResponse {
            items,
            total_count: u64::try_from(total_count).unwrap_or_default(),
            page: input.page,
        })
    }

    async fn update_event_delivery_status(
        &self,
        input: UpdateEventDeliveryStatusInput,
    ) -> Result<DeliveryStatus, RepositoryError> {
        let row = sqlx::query(
            r#"
            UPDATE notification_event_delivery_status
            SET state = $3,
                reason = $4,
                attempts = $5,
                next_attempt = $6,
                annotations = $7,
                updated_at = NOW()
            WHERE namespace = $1 AND id = $2
            RETURNING namespace, id, event_id, channel_id, state, reason, attempts,
                      next_attempt, annotations, created_at, updated_at
            "#,
        )
        .bind(&input.namespace)
        .bind(input.id)
        .bind(input.state.as_str())
        .bind(input.reason.map(|reason| reason.as_str()))
        .bind(i32::try_from(input.attempts).unwrap_or(i32::MAX))
        .bind(input.next_attempt)
        .bind(Json(&input.annotations))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(RepositoryError::DeliveryStatusNotFound {
                namespace: input.namespace,
                id: input.id,
            });
        };
        delivery_status_from_row(&row)
    }
}

fn delivery_status_from_row(row: &PgRow) -> Result<DeliveryStatus, RepositoryError> {
    let state: String = row.get("state");
    let state = DeliveryStatusState::from_str(&state)
        .ok_or_else(|| RepositoryError::Decode(format!("delivery status state `{state}`")))?;
    let reason: Option<String> = row.get("reason");
    let reason = match reason {
        Some(reason) => Some(
            DeliveryReason::from_str(&reason)
                .ok_or_else(|| RepositoryError::Decode(format!("delivery reason `{reason}`")))?,
        ),
        None => None,
    };
    let attempts: i32 = row.get("attempts");
    let next_attempt: Option<DateTime<Utc>> = row.get("next_attempt");
    let Json(annotations): Json<Annotations> = row.get("annotations");

    Ok(DeliveryStatus {
        namespace: row.get("namespace"),
        id: row.get("id"),
        event_id: row.get("event_id"),
        channel_id: row.get("channel_id"),
        state,
        attempts: u32::try_from(attempts).unwrap_or_default(),
        next_attempt,
        reason,
        annotations,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

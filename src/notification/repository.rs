use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::models::{
    DeliveryStatus, Event, ListEventsInput, PagedResponse, UpdateEventDeliveryStatusInput,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("delivery status {id} not found in namespace {namespace}")]
    DeliveryStatusNotFound { namespace: String, id: Uuid },
    #[error("invalid stored value: {0}")]
    Decode(String),
    #[error("{0}")]
    Message(String),
}

/// key: notification-event-repository -> event listing and delivery status persistence
#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn list_events(
        &self,
        input: ListEventsInput,
    ) -> Result<PagedResponse<Event>, RepositoryError>;

    /// Applies one atomic update to a single delivery status.
    async fn update_event_delivery_status(
        &self,
        input: UpdateEventDeliveryStatusInput,
    ) -> Result<DeliveryStatus, RepositoryError>;
}

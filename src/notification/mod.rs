//! Notification delivery: reconciles every event's per-channel delivery status against the
//! webhook provider until each reaches a terminal state.

pub mod clock;
pub mod filter;
pub mod handler;
pub mod http_provider;
pub mod models;
pub mod postgres;
pub mod provider;
pub mod reconcile;
pub mod repository;
pub mod testing;
mod webhook;

pub use clock::{Clock, SystemClock};
pub use filter::{delivery_status_states, filter_active, sort_by_priority};
pub use handler::{Handler, HandlerConfig, HandlerError, SchedulerState};
pub use http_provider::HttpWebhookProvider;
pub use models::{
    Annotations, Channel, ChannelType, DeliveryReason, DeliveryStatus, DeliveryStatusState,
    Event, EventType, ListEventsInput, Page, PagedResponse, Rule, UpdateEventDeliveryStatusInput,
};
pub use postgres::PgEventRepository;
pub use provider::{
    ChannelDeliveryStatus, GetMessageInput, Message, ProviderError, SendMessageInput,
    WebhookProvider,
};
pub use reconcile::{ReconcileError, ReconcileErrors, Reconciler};
pub use repository::{EventRepository, RepositoryError};
pub use webhook::SENDING_STUCK_THRESHOLD_MINUTES;

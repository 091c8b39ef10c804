use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, debug_span, info_span, Instrument, Span};
use uuid::Uuid;

use super::clock::Clock;
use super::filter::delivery_status_states;
use super::handler::HandlerConfig;
use super::models::{ChannelType, DeliveryStatusState, Event, ListEventsInput, Page};
use super::provider::{ProviderError, WebhookProvider};
use super::repository::{EventRepository, RepositoryError};

/// key: notification-reconcile-error
/// One failed step of a reconciliation pass. Every variant names the event it belongs to.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("unsupported delivery status state {state} (event {event_id}, delivery status {delivery_status_id})")]
    UnsupportedState {
        event_id: Uuid,
        delivery_status_id: Uuid,
        state: DeliveryStatusState,
    },
    #[error("failed to fetch webhook message for event {event_id}: {source}")]
    GetMessage {
        event_id: Uuid,
        #[source]
        source: ProviderError,
    },
    #[error("failed to update delivery status {delivery_status_id} of event {event_id}: {source}")]
    Persist {
        event_id: Uuid,
        delivery_status_id: Uuid,
        #[source]
        source: RepositoryError,
    },
    #[error("failed to list events for reconciliation: {0}")]
    ListEvents(#[source] RepositoryError),
}

/// Errors collected across sibling statuses or events; none of them aborts the others.
#[derive(Debug, Default)]
pub struct ReconcileErrors(Vec<ReconcileError>);

impl ReconcileErrors {
    pub fn push(&mut self, error: ReconcileError) {
        self.0.push(error);
    }

    pub fn extend(&mut self, other: ReconcileErrors) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReconcileError> {
        self.0.iter()
    }

    pub fn into_result(self) -> Result<(), ReconcileErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<ReconcileError> for ReconcileErrors {
    fn from(error: ReconcileError) -> Self {
        Self(vec![error])
    }
}

impl fmt::Display for ReconcileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ReconcileErrors {}

/// key: notification-reconciler -> batch and per-event passes
/// Stateless between passes; every decision is re-derived from the repository snapshot and a
/// fresh provider read.
#[derive(Clone)]
pub struct Reconciler {
    pub(super) repo: Arc<dyn EventRepository>,
    pub(super) provider: Arc<dyn WebhookProvider>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: HandlerConfig,
    pub(super) span: Span,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn EventRepository>,
        provider: Arc<dyn WebhookProvider>,
        clock: Arc<dyn Clock>,
        config: HandlerConfig,
        span: Span,
    ) -> Self {
        Self {
            repo,
            provider,
            clock,
            config,
            span,
        }
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Reconciles every event that still has a pending or sending delivery status.
    pub async fn reconcile(&self) -> Result<(), ReconcileErrors> {
        let span = info_span!(parent: &self.span, "reconcile_batch");
        self.reconcile_batch().instrument(span).await
    }

    async fn reconcile_batch(&self) -> Result<(), ReconcileErrors> {
        let mut errors = ReconcileErrors::default();
        let mut page = match self.config.page_size {
            Some(size) => Page::new(1, size),
            None => Page::all(),
        };
        let mut processed: u64 = 0;

        loop {
            let response = match self
                .repo
                .list_events(ListEventsInput {
                    namespaces: Vec::new(),
                    delivery_status_states: vec![
                        DeliveryStatusState::Pending,
                        DeliveryStatusState::Sending,
                    ],
                    page,
                })
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    errors.push(ReconcileError::ListEvents(err));
                    break;
                }
            };

            let fetched = response.items.len();
            for event in &response.items {
                if let Err(event_errors) = self.reconcile_event(event).await {
                    errors.extend(event_errors);
                }
            }
            processed += fetched as u64;

            // Updated events can drop out of the filter and shift later pages; the next tick
            // picks up anything skipped here.
            if page.is_unbounded()
                || fetched < page.page_size as usize
                || processed >= response.total_count
            {
                break;
            }
            page = Page::new(page.page_number + 1, page.page_size);
        }

        debug!(
            events = processed,
            failures = errors.len(),
            "notification reconciliation pass finished"
        );
        errors.into_result()
    }

    /// Routes one event by the states of its delivery statuses, in priority order.
    pub async fn reconcile_event(&self, event: &Event) -> Result<(), ReconcileErrors> {
        let span = debug_span!(
            parent: &self.span,
            "reconcile_event",
            namespace = %event.namespace,
            event_id = %event.id,
            event_type = event.event_type.as_str(),
        );
        self.route_event(event).instrument(span).await
    }

    async fn route_event(&self, event: &Event) -> Result<(), ReconcileErrors> {
        let mut errors = ReconcileErrors::default();

        for state in delivery_status_states(&event.delivery_status) {
            let result = match state {
                DeliveryStatusState::Pending => self.reconcile_pending(event).await,
                DeliveryStatusState::Sending => self.reconcile_sending(event).await,
                DeliveryStatusState::Failed => self.reconcile_failed(event).await,
                DeliveryStatusState::Resending | DeliveryStatusState::Success => Ok(()),
            };
            if let Err(state_errors) = result {
                errors.extend(state_errors);
            }
        }

        errors.into_result()
    }

    async fn reconcile_pending(&self, event: &Event) -> Result<(), ReconcileErrors> {
        let mut channel_types: Vec<&ChannelType> = Vec::new();
        for channel in &event.rule.channels {
            if !channel_types.contains(&&channel.channel_type) {
                channel_types.push(&channel.channel_type);
            }
        }

        let mut errors = ReconcileErrors::default();
        for channel_type in channel_types {
            match channel_type {
                ChannelType::Webhook => {
                    if let Err(webhook_errors) = self.reconcile_webhook_event(event).await {
                        errors.extend(webhook_errors);
                    }
                }
                ChannelType::Other(kind) => {
                    debug!(channel_type = %kind, "no reconciler for channel type, skipping");
                }
            }
        }
        errors.into_result()
    }

    /// Extension point for events whose statuses are already with the provider. Those advance
    /// through the pending pass today.
    async fn reconcile_sending(&self, _event: &Event) -> Result<(), ReconcileErrors> {
        Ok(())
    }

    /// Extension point for re-driving failed deliveries.
    async fn reconcile_failed(&self, _event: &Event) -> Result<(), ReconcileErrors> {
        Ok(())
    }
}

/// Longest back-off or timeout honoured; keeps `now + duration` inside chrono's range.
const MAX_DURATION: std::time::Duration = std::time::Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_DURATION))
        .unwrap_or_else(|_| chrono::Duration::days(100 * 365))
}

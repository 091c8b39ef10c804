use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config;

use super::clock::{Clock, SystemClock};
use super::models::Event;
use super::provider::WebhookProvider;
use super::reconcile::{ReconcileErrors, Reconciler};
use super::repository::EventRepository;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(3 * 60 * 60);
pub const DEFAULT_SENDING_TIMEOUT: Duration = Duration::from_secs(48 * 60 * 60);
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// key: notification-handler-config
#[derive(Clone, Debug)]
pub struct HandlerConfig {
    /// Period of the background loop; also the default back-off after a transient send failure.
    pub reconcile_interval: Duration,
    pub pending_timeout: Duration,
    pub sending_timeout: Duration,
    /// Budget for one out-of-band `dispatch`.
    pub dispatch_timeout: Duration,
    /// `None` lists all outstanding events in one request.
    pub page_size: Option<u32>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            sending_timeout: DEFAULT_SENDING_TIMEOUT,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            page_size: None,
        }
    }
}

impl HandlerConfig {
    pub fn from_env() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(*config::NOTIFICATION_RECONCILE_INTERVAL_SECS),
            pending_timeout: Duration::from_secs(*config::NOTIFICATION_PENDING_TIMEOUT_SECS),
            sending_timeout: Duration::from_secs(*config::NOTIFICATION_SENDING_TIMEOUT_SECS),
            dispatch_timeout: Duration::from_secs(*config::NOTIFICATION_DISPATCH_TIMEOUT_SECS),
            page_size: *config::NOTIFICATION_RECONCILE_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("notification handler is already running")]
    AlreadyRunning,
    #[error("notification handler has been closed")]
    Closed,
    #[error("notification handler requires a tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

struct Lifecycle {
    stop: CancellationToken,
    state: Mutex<SchedulerState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Lifecycle {
    fn set_state(&self, next: SchedulerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn state(&self) -> SchedulerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// key: notification-handler -> periodic reconciliation plus eager per-event dispatch
#[derive(Clone)]
pub struct Handler {
    reconciler: Reconciler,
    lifecycle: Arc<Lifecycle>,
}

impl Handler {
    /// `span` is the parent of everything the handler logs.
    pub fn new(
        repo: Arc<dyn EventRepository>,
        provider: Arc<dyn WebhookProvider>,
        config: HandlerConfig,
        span: Span,
    ) -> Self {
        Self::with_clock(repo, provider, Arc::new(SystemClock), config, span)
    }

    pub fn with_clock(
        repo: Arc<dyn EventRepository>,
        provider: Arc<dyn WebhookProvider>,
        clock: Arc<dyn Clock>,
        config: HandlerConfig,
        span: Span,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(repo, provider, clock, config, span),
            lifecycle: Arc::new(Lifecycle {
                stop: CancellationToken::new(),
                state: Mutex::new(SchedulerState::Stopped),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn state(&self) -> SchedulerState {
        self.lifecycle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.stop.is_cancelled()
    }

    /// Resolves once the handler has been closed, explicitly or by a panicking tick.
    pub async fn stopped(&self) {
        self.lifecycle.stop.cancelled().await;
    }

    /// Synchronous batch pass, for administrative use and tests.
    pub async fn reconcile(&self) -> Result<(), ReconcileErrors> {
        self.reconciler.reconcile().await
    }

    /// Starts the periodic loop. A closed handler cannot be restarted.
    pub fn start(&self) -> Result<(), HandlerError> {
        let runtime = Handle::try_current()?;
        install_panic_hook();
        if self.is_closed() {
            return Err(HandlerError::Closed);
        }

        let mut state = self
            .lifecycle
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *state == SchedulerState::Running {
            return Err(HandlerError::AlreadyRunning);
        }
        *state = SchedulerState::Running;
        drop(state);

        let interval = self.reconciler.config().reconcile_interval;
        let span = info_span!(parent: &self.reconciler.span, "notification_reconcile_loop");
        let task = runtime.spawn(
            run_loop(self.reconciler.clone(), self.lifecycle.clone(), interval).instrument(span),
        );
        *self
            .lifecycle
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!(
            interval_secs = interval.as_secs_f64(),
            "notification reconciler started"
        );
        Ok(())
    }

    /// Signals the loop to stop. Safe to call any number of times, from any thread.
    pub fn close(&self) {
        if !self.lifecycle.stop.is_cancelled() {
            debug!("closing notification reconciler");
        }
        self.lifecycle.stop.cancel();
        self.lifecycle.set_state(SchedulerState::Stopped);
    }

    /// Closes the handler and waits for the loop task to exit.
    pub async fn shutdown(&self) {
        self.close();
        let task = self
            .lifecycle
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(?err, "notification reconcile loop ended abnormally");
            }
        }
    }

    /// Reconciles one freshly created event in the background without waiting for the next
    /// tick. Failures only surface in logs; the periodic loop retries regardless.
    pub fn dispatch(&self, event: Event) -> Result<(), HandlerError> {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(%err, event_id = %event.id, "cannot dispatch event outside a tokio runtime");
                return Ok(());
            }
        };

        install_panic_hook();
        let reconciler = self.reconciler.clone();
        let timeout = reconciler.config().dispatch_timeout;
        let span = info_span!(
            parent: &self.reconciler.span,
            "notification_dispatch",
            namespace = %event.namespace,
            event_id = %event.id,
        );

        runtime.spawn(
            async move {
                let work = AssertUnwindSafe(reconciler.reconcile_event(&event)).catch_unwind();
                match time::timeout(timeout, work).await {
                    Ok(Ok(Ok(()))) => debug!("dispatched event reconciled"),
                    Ok(Ok(Err(errors))) => {
                        warn!(errors = %errors, "eager reconciliation of event failed")
                    }
                    Ok(Err(panic)) => error!(
                        panic = %panic_message(panic.as_ref()),
                        backtrace = %take_panic_backtrace(),
                        "eager reconciliation of event panicked"
                    ),
                    Err(_) => warn!(
                        timeout_secs = timeout.as_secs_f64(),
                        "eager reconciliation of event timed out"
                    ),
                }
            }
            .instrument(span),
        );
        Ok(())
    }
}

async fn run_loop(reconciler: Reconciler, lifecycle: Arc<Lifecycle>, interval: Duration) {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = lifecycle.stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let tick = AssertUnwindSafe(reconciler.reconcile()).catch_unwind();
        let outcome = tokio::select! {
            _ = lifecycle.stop.cancelled() => break,
            outcome = tick => outcome,
        };

        match outcome {
            Ok(Ok(())) => debug!("notification reconcile tick finished"),
            Ok(Err(errors)) => warn!(
                failures = errors.len(),
                errors = %errors,
                "notification reconcile tick failed"
            ),
            Err(panic) => {
                error!(
                    panic = %panic_message(panic.as_ref()),
                    backtrace = %take_panic_backtrace(),
                    "notification reconcile tick panicked, stopping reconciler"
                );
                lifecycle.stop.cancel();
                break;
            }
        }
    }

    lifecycle.set_state(SchedulerState::Stopped);
    info!("notification reconciler stopped");
}

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = RefCell::new(None);
}

static PANIC_HOOK: Once = Once::new();

/// Chains a hook that records the backtrace of the panicking thread before unwinding starts,
/// so recovery points can log the panic site instead of their own frame.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

/// Backtrace recorded by the last panic on this thread. `catch_unwind` resumes on the thread
/// that panicked, so this is the trace of the panic just caught.
fn take_panic_backtrace() -> String {
    PANIC_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .map(|backtrace| backtrace.to_string())
        .unwrap_or_else(|| "unavailable".to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

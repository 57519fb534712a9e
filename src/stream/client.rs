//! Bot surface and the reconnecting stream worker.
//!
//! A [`Bot`] owns one background task that keeps the event stream open:
//! every stream attempt gets a fresh connection, line reader and idle
//! watchdog. Attempt failures are logged and retried while auto-reconnect is
//! enabled and the bot is still running; the last failure is surfaced exactly
//! once through [`Bot::err`] when the worker gives up.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use crate::api::{ApiClient, ApiError, ApiPaths};
use crate::retry::BackoffPolicy;
use crate::stream::dispatch::{
    DispatchContext, DispatchPolicy, HandlerError, HandlerTable, Router,
};
use crate::stream::error_chain;
use crate::stream::event::Event;
use crate::stream::internal::InternalRegistry;
use crate::stream::lines::{LineReader, DEFAULT_MAX_LINE_BYTES};
use crate::stream::watchdog::IdleWatchdog;

/// Failure of a stream attempt, or the terminal failure of a bot.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open event stream")]
    Connect(#[source] ApiError),

    #[error("event stream read failed")]
    Read(#[source] ApiError),

    /// The server closed the stream body.
    #[error("event stream ended")]
    Ended,

    /// No event was decoded within the idle window.
    #[error("event stream idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("event stream was shut down")]
    Cancelled,

    /// An internal or registered handler failed.
    #[error("handler for '{event_type}' failed")]
    Handler {
        event_type: String,
        #[source]
        source: HandlerError,
    },

    #[error("backlog fetch from {url} failed")]
    Backlog {
        url: String,
        #[source]
        source: ApiError,
    },
}

/// Default bot settings.
pub struct BotDefaults;

impl BotDefaults {
    pub const QUEUE_CAPACITY: usize = 100;
    pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_LINE_BYTES: usize = DEFAULT_MAX_LINE_BYTES;
}

/// Behaviour switches for a [`Bot`].
#[derive(Clone, Debug)]
pub struct BotOptions {
    /// Start a new stream attempt after a failure.
    pub auto_reconnect: bool,
    /// Also surface events consumed by built-in handlers (`idle`,
    /// `oob_include`).
    pub yield_internal_events: bool,
    /// Discard unhandled events while the queue is full instead of pausing
    /// the stream until the consumer catches up.
    pub drop_unhandled_events: bool,
    /// Capacity of the queue behind [`Bot::recv`].
    pub queue_capacity: usize,
    /// Longest tolerated silence on the stream.
    pub idle_timeout: Duration,
    /// Delay schedule between consecutive failed attempts.
    pub reconnect_backoff: BackoffPolicy,
    /// Longest accepted stream record.
    pub max_line_bytes: usize,
}

impl Default for BotOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            yield_internal_events: false,
            drop_unhandled_events: false,
            queue_capacity: BotDefaults::QUEUE_CAPACITY,
            idle_timeout: BotDefaults::IDLE_TIMEOUT,
            reconnect_backoff: BackoffPolicy::none(),
            max_line_bytes: BotDefaults::MAX_LINE_BYTES,
        }
    }
}

impl BotOptions {
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_yield_internal_events(mut self, yield_internal_events: bool) -> Self {
        self.yield_internal_events = yield_internal_events;
        self
    }

    pub fn with_drop_unhandled_events(mut self, drop_unhandled_events: bool) -> Self {
        self.drop_unhandled_events = drop_unhandled_events;
        self
    }

    /// Sets the queue capacity. Zero is raised to one.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, reconnect_backoff: BackoffPolicy) -> Self {
        self.reconnect_backoff = reconnect_backoff;
        self
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }
}

/// Collects handlers and options before the stream starts.
///
/// Handlers can only be registered here, so the table is fixed once
/// [`start`](Self::start) hands it to the worker.
pub struct BotBuilder {
    client: ApiClient,
    options: BotOptions,
    handlers: HandlerTable,
    internal: InternalRegistry,
}

impl BotBuilder {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            options: BotOptions::default(),
            handlers: HandlerTable::default(),
            internal: InternalRegistry::standard(),
        }
    }

    pub fn options(mut self, options: BotOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers `handler` for events of `event_type`.
    ///
    /// Handled events never reach the queue. Multiple handlers for one type
    /// run in registration order and the first error fails the stream
    /// attempt.
    pub fn on<F, Fut>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handlers.register(event_type, handler);
        self
    }

    #[cfg(test)]
    pub(crate) fn internal_handlers(mut self, internal: InternalRegistry) -> Self {
        self.internal = internal;
        self
    }

    /// Spawns the stream worker.
    ///
    /// The bot stops when `shutdown` is cancelled, when [`Bot::shutdown`] is
    /// called, or when the returned [`Bot`] is dropped. Must be called from
    /// within a tokio runtime.
    pub fn start(self, shutdown: CancellationToken) -> Result<Bot, ApiError> {
        self.client.ensure_session()?;

        let (queue_tx, queue_rx) = mpsc::channel(self.options.queue_capacity.max(1));
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let shutdown = shutdown.child_token();

        let policy = DispatchPolicy {
            yield_internal_events: self.options.yield_internal_events,
            drop_unhandled_events: self.options.drop_unhandled_events,
        };
        let supervisor = Supervisor {
            client: self.client.clone(),
            router: Router::new(self.internal, self.handlers, queue_tx, policy),
            options: self.options,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(supervisor.run(terminal_tx));

        Ok(Bot {
            client: self.client,
            events: queue_rx,
            terminal: Some(terminal_rx),
            shutdown: shutdown.clone(),
            _stop_on_drop: shutdown.drop_guard(),
        })
    }
}

/// Handle to a running event stream.
pub struct Bot {
    client: ApiClient,
    events: mpsc::Receiver<Event>,
    terminal: Option<oneshot::Receiver<StreamError>>,
    shutdown: CancellationToken,
    _stop_on_drop: DropGuard,
}

impl Bot {
    /// Receives the next event no handler claimed.
    ///
    /// Returns `None` once the worker has terminated and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// The queue of events no handler claimed.
    pub fn events(&mut self) -> &mut mpsc::Receiver<Event> {
        &mut self.events
    }

    /// Waits for the worker to terminate and returns the error that ended
    /// it. Yields the error once; later calls return `None`.
    pub async fn err(&mut self) -> Option<StreamError> {
        let terminal = self.terminal.as_mut()?;
        let result = terminal.await.ok();
        self.terminal = None;
        result
    }

    /// Stops the stream. Already queued events stay readable.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

struct Supervisor {
    client: ApiClient,
    router: Router,
    options: BotOptions,
    shutdown: CancellationToken,
}

struct AttemptOutcome {
    error: StreamError,
    events_seen: u64,
}

impl Supervisor {
    async fn run(self, terminal: oneshot::Sender<StreamError>) {
        let mut attempt: u64 = 0;
        let mut consecutive_failures: usize = 0;

        loop {
            attempt += 1;
            let lifetime = self.shutdown.child_token();
            let outcome = self.run_attempt(&lifetime).await;
            lifetime.cancel();

            let err = outcome.error;
            if self.shutdown.is_cancelled() || !self.options.auto_reconnect {
                terminate(terminal, err);
                return;
            }

            if outcome.events_seen > 0 {
                consecutive_failures = 0;
            }
            consecutive_failures += 1;
            let delay = self
                .options
                .reconnect_backoff
                .delay_for_attempt(consecutive_failures);

            warn!(
                event = "stream_attempt_failed",
                attempt,
                events_seen = outcome.events_seen,
                error = %error_chain(&err)
            );
            info!(
                event = "stream_reconnecting",
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64
            );

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => {
                        terminate(terminal, err);
                        return;
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn run_attempt(&self, lifetime: &CancellationToken) -> AttemptOutcome {
        let watchdog = IdleWatchdog::arm(self.options.idle_timeout, lifetime.clone());
        let mut events_seen = 0;

        let error = match self
            .read_until_failure(lifetime, &watchdog, &mut events_seen)
            .await
        {
            Ok(()) => StreamError::Ended,
            Err(StreamError::Cancelled) if watchdog.expired() => {
                StreamError::IdleTimeout(watchdog.window())
            }
            Err(err) => err,
        };

        AttemptOutcome { error, events_seen }
    }

    /// Reads and dispatches records until the attempt fails. `Ok` means the
    /// body ended cleanly.
    async fn read_until_failure(
        &self,
        lifetime: &CancellationToken,
        watchdog: &IdleWatchdog,
        events_seen: &mut u64,
    ) -> Result<(), StreamError> {
        let body = tokio::select! {
            biased;
            () = lifetime.cancelled() => return Err(StreamError::Cancelled),
            opened = self.client.open_stream(ApiPaths::STREAM) => {
                opened.map_err(StreamError::Connect)?
            }
        };
        info!(event = "stream_connected");

        let connection = self.client.downgrade();
        let ctx = DispatchContext {
            client: &self.client,
            connection: connection.clone(),
            lifetime,
            shutdown: &self.shutdown,
            watchdog,
            max_line_bytes: self.options.max_line_bytes,
        };
        let mut reader = LineReader::new(body).with_max_line_bytes(self.options.max_line_bytes);

        loop {
            let line = tokio::select! {
                biased;
                () = lifetime.cancelled() => return Err(StreamError::Cancelled),
                next = reader.next_line() => next.map_err(StreamError::Read)?,
            };
            let line = match line {
                Some(line) => line,
                None => return Ok(()),
            };
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let event = match Event::decode(&line, connection.clone(), false) {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        event = "stream_line_unparsable",
                        error = %error_chain(&err),
                        line_bytes = line.len()
                    );
                    continue;
                }
            };

            watchdog.reset();
            *events_seen += 1;
            self.router.dispatch(event, &ctx).await?;
        }
    }
}

fn terminate(terminal: oneshot::Sender<StreamError>, err: StreamError) {
    error!(event = "stream_terminated", error = %error_chain(&err));
    let _ = terminal.send(err);
}

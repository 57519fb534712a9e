//! Event routing between internal handlers, registered handlers and the
//! bounded output queue.
//!
//! Dispatch is strictly sequential: each handler is awaited before the next
//! one runs and before the next record is read. Wire order is therefore the
//! order handlers observe, and one slow handler stalls the whole stream.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{ApiClient, ConnectionRef};
use crate::stream::client::StreamError;
use crate::stream::event::Event;
use crate::stream::internal::InternalRegistry;
use crate::stream::watchdog::IdleWatchdog;

/// Error type returned by event handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a registered handler.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Registered handlers keyed by event type, in registration order.
#[derive(Clone, Default)]
pub(crate) struct HandlerTable {
    handlers: HashMap<String, Vec<Handler>>,
}

impl HandlerTable {
    pub(crate) fn register<F, Fut>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let boxed: Handler = Arc::new(move |event| handler(event).boxed());
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(boxed);
    }

    fn handlers_for(&self, event_type: &str) -> &[Handler] {
        self.handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// What a stream attempt lends to dispatch.
pub(crate) struct DispatchContext<'a> {
    pub(crate) client: &'a ApiClient,
    /// Stamped onto events produced during dispatch.
    pub(crate) connection: ConnectionRef,
    /// Lifetime of the current stream attempt.
    pub(crate) lifetime: &'a CancellationToken,
    /// Outer lifetime of the bot.
    pub(crate) shutdown: &'a CancellationToken,
    /// Idle timer of the current attempt; reset by every decoded record.
    pub(crate) watchdog: &'a IdleWatchdog,
    pub(crate) max_line_bytes: usize,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DispatchPolicy {
    /// Also surface events claimed by an internal handler.
    pub(crate) yield_internal_events: bool,
    /// Discard unhandled events when the output queue is full.
    pub(crate) drop_unhandled_events: bool,
}

enum Step {
    Route(Event),
    Deliver(Event),
}

pub(crate) struct Router {
    internal: InternalRegistry,
    external: HandlerTable,
    queue: mpsc::Sender<Event>,
    policy: DispatchPolicy,
}

impl Router {
    pub(crate) fn new(
        internal: InternalRegistry,
        external: HandlerTable,
        queue: mpsc::Sender<Event>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            internal,
            external,
            queue,
            policy,
        }
    }

    /// Routes one event and everything internal handlers derive from it.
    ///
    /// Any handler failure aborts dispatch and fails the stream attempt.
    pub(crate) async fn dispatch(
        &self,
        event: Event,
        ctx: &DispatchContext<'_>,
    ) -> Result<(), StreamError> {
        let mut pending = vec![Step::Route(event)];

        while let Some(step) = pending.pop() {
            match step {
                Step::Route(event) => match self.internal.get(event.event_type()) {
                    Some(handler) => {
                        let injected = handler.handle(&event, ctx).await?;
                        if self.policy.yield_internal_events {
                            pending.push(Step::Deliver(event));
                        }
                        pending.extend(injected.into_iter().rev().map(Step::Route));
                    }
                    None => pending.push(Step::Deliver(event)),
                },
                Step::Deliver(event) => self.deliver(event, ctx.shutdown).await?,
            }
        }
        Ok(())
    }

    async fn deliver(&self, event: Event, shutdown: &CancellationToken) -> Result<(), StreamError> {
        let handlers = self.external.handlers_for(event.event_type());
        if handlers.is_empty() {
            self.enqueue(event, shutdown).await;
            return Ok(());
        }

        for handler in handlers {
            handler(event.clone())
                .await
                .map_err(|source| StreamError::Handler {
                    event_type: event.event_type().to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn enqueue(&self, event: Event, shutdown: &CancellationToken) {
        if self.policy.drop_unhandled_events {
            match self.queue.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    debug!(
                        event = "unhandled_event_dropped",
                        event_type = event.event_type()
                    );
                }
                Err(TrySendError::Closed(event)) => {
                    debug!(
                        event = "event_queue_closed",
                        event_type = event.event_type()
                    );
                }
            }
            return;
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => {}
            sent = self.queue.send(event) => {
                if let Err(mpsc::error::SendError(event)) = sent {
                    debug!(
                        event = "event_queue_closed",
                        event_type = event.event_type()
                    );
                }
            }
        }
    }
}

//! Built-in handlers for event types the engine consumes itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::api::ApiError;
use crate::stream::client::StreamError;
use crate::stream::dispatch::DispatchContext;
use crate::stream::event::{decode_backlog_line, Event, IDLE, OOB_INCLUDE};
use crate::stream::lines::LineReader;

/// Engine-side consumer of one event type.
///
/// Returned events are re-injected into the dispatch path in order, ahead of
/// the triggering event's own external visibility.
#[async_trait]
pub(crate) trait InternalHandler: Send + Sync {
    async fn handle(
        &self,
        event: &Event,
        ctx: &DispatchContext<'_>,
    ) -> Result<Vec<Event>, StreamError>;
}

/// Fixed table of internal handlers, built once before a bot starts.
#[derive(Clone, Default)]
pub(crate) struct InternalRegistry {
    handlers: HashMap<&'static str, Arc<dyn InternalHandler>>,
}

impl InternalRegistry {
    /// Handlers for `oob_include` and `idle`.
    pub(crate) fn standard() -> Self {
        Self::default()
            .with(OOB_INCLUDE, BacklogInclude)
            .with(IDLE, IdleAck)
    }

    pub(crate) fn with<H>(mut self, event_type: &'static str, handler: H) -> Self
    where
        H: InternalHandler + 'static,
    {
        self.handlers.insert(event_type, Arc::new(handler));
        self
    }

    pub(crate) fn get(&self, event_type: &str) -> Option<&Arc<dyn InternalHandler>> {
        self.handlers.get(event_type)
    }
}

/// Fetches the backlog an `oob_include` event points at.
pub(crate) struct BacklogInclude;

#[async_trait]
impl InternalHandler for BacklogInclude {
    async fn handle(
        &self,
        event: &Event,
        ctx: &DispatchContext<'_>,
    ) -> Result<Vec<Event>, StreamError> {
        let url = event.str("url").map_err(|err| StreamError::Handler {
            event_type: event.event_type().to_string(),
            source: Box::new(err),
        })?;
        fetch_backlog(url, ctx).await
    }
}

/// Keep-alive. Resetting the idle watchdog already happened at decode time.
pub(crate) struct IdleAck;

#[async_trait]
impl InternalHandler for IdleAck {
    async fn handle(
        &self,
        _event: &Event,
        _ctx: &DispatchContext<'_>,
    ) -> Result<Vec<Event>, StreamError> {
        Ok(Vec::new())
    }
}

/// Reads a backlog body to completion. Shares the stream attempt's
/// lifetime, so an idle expiry also aborts an in-flight fetch. Every decoded
/// record counts as stream activity and resets the idle watchdog.
async fn fetch_backlog(url: &str, ctx: &DispatchContext<'_>) -> Result<Vec<Event>, StreamError> {
    let backlog_error = |source: ApiError| StreamError::Backlog {
        url: url.to_string(),
        source,
    };

    let body = tokio::select! {
        biased;
        () = ctx.lifetime.cancelled() => return Err(StreamError::Cancelled),
        opened = ctx.client.open_stream(url) => opened.map_err(backlog_error)?,
    };

    let mut reader = LineReader::new(body).with_max_line_bytes(ctx.max_line_bytes);
    let mut events = Vec::new();
    loop {
        let line = tokio::select! {
            biased;
            () = ctx.lifetime.cancelled() => return Err(StreamError::Cancelled),
            next = reader.next_line() => next.map_err(backlog_error)?,
        };
        let line = match line {
            Some(line) => line,
            None => break,
        };
        let decoded = decode_backlog_line(&line, &ctx.connection);
        if !decoded.is_empty() {
            ctx.watchdog.reset();
            events.extend(decoded);
        }
    }

    debug!(event = "backlog_fetched", url, count = events.len());
    Ok(events)
}

//! Stream events and their decoder.
//!
//! An [`Event`] is an immutable map of JSON fields plus engine metadata
//! (backlog flag and a [`ConnectionRef`] to the receiving client). The
//! metadata travels next to the fields and never inside them. For the list
//! of event types see the service's stream message reference.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::api::{ApiClient, ApiError, ConnectionRef};
use crate::stream::error_chain;

/// Chat message in a buffer; the only type that supports [`Event::reply`].
pub const BUFFER_MSG: &str = "buffer_msg";
/// Keep-alive sent by the service while the stream is quiet.
pub const IDLE: &str = "idle";
/// Points to out-of-band backlog data to fetch.
pub const OOB_INCLUDE: &str = "oob_include";

/// Failure to turn a raw record into an [`Event`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("record is not valid json")]
    Json(#[from] serde_json::Error),

    #[error("record is not a json object")]
    NotAnObject,

    #[error("record has no `type` field")]
    MissingType,

    #[error("record `type` field is not a string")]
    InvalidType,
}

/// Failure to read a field of, or act on, an [`Event`].
#[derive(Debug, Error)]
pub enum EventError {
    #[error("field `{0}` is missing")]
    MissingField(String),

    #[error("field `{field}` is not of expected type {expected}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
    },

    #[error("cannot reply to type '{event_type}'")]
    InvalidOperation { event_type: String },

    /// The client that received the event has been dropped.
    #[error("connection for this event is gone")]
    ConnectionClosed,

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Clone, Default)]
struct EventMeta {
    connection: ConnectionRef,
    from_backlog: bool,
}

/// One decoded record from the stream.
#[derive(Clone)]
pub struct Event {
    event_type: Arc<str>,
    fields: Arc<Map<String, Value>>,
    meta: EventMeta,
}

impl Event {
    /// Decodes one raw record.
    pub fn decode(
        record: &[u8],
        connection: ConnectionRef,
        from_backlog: bool,
    ) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(record)?;
        Self::from_value(value, connection, from_backlog)
    }

    /// Builds an event from an already parsed JSON value.
    pub fn from_value(
        value: Value,
        connection: ConnectionRef,
        from_backlog: bool,
    ) -> Result<Self, DecodeError> {
        let Value::Object(fields) = value else {
            return Err(DecodeError::NotAnObject);
        };
        let event_type = match fields.get("type") {
            Some(Value::String(event_type)) => Arc::from(event_type.as_str()),
            Some(_) => return Err(DecodeError::InvalidType),
            None => return Err(DecodeError::MissingType),
        };

        Ok(Self {
            event_type,
            fields: Arc::new(fields),
            meta: EventMeta {
                connection,
                from_backlog,
            },
        })
    }

    /// Value of the `type` field.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Whether the event came from a backlog fetch rather than the live
    /// stream.
    pub fn from_backlog(&self) -> bool {
        self.meta.from_backlog
    }

    /// Client the event was received with, if it is still alive.
    pub fn connection(&self) -> Option<ApiClient> {
        self.meta.connection.upgrade()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn str(&self, field: &str) -> Result<&str, EventError> {
        self.typed(field, "string", Value::as_str)
    }

    pub fn bool(&self, field: &str) -> Result<bool, EventError> {
        self.typed(field, "bool", Value::as_bool)
    }

    pub fn i64(&self, field: &str) -> Result<i64, EventError> {
        self.typed(field, "integer", |value| {
            value.as_i64().or_else(|| whole_number(value).map(|n| n as i64))
        })
    }

    pub fn u64(&self, field: &str) -> Result<u64, EventError> {
        self.typed(field, "unsigned integer", |value| {
            value
                .as_u64()
                .or_else(|| whole_number(value).filter(|n| *n >= 0.0).map(|n| n as u64))
        })
    }

    pub fn f64(&self, field: &str) -> Result<f64, EventError> {
        self.typed(field, "number", Value::as_f64)
    }

    pub fn object(&self, field: &str) -> Result<&Map<String, Value>, EventError> {
        self.typed(field, "object", Value::as_object)
    }

    /// Connection id the event belongs to.
    pub fn cid(&self) -> Result<u64, EventError> {
        self.u64("cid")
    }

    /// Sender of the message, if present.
    pub fn from(&self) -> Option<&str> {
        self.str("from").ok()
    }

    /// Channel the message was sent to, if present.
    pub fn chan(&self) -> Option<&str> {
        self.str("chan").ok()
    }

    /// Whether the message was sent by ourselves.
    pub fn is_self(&self) -> bool {
        self.bool("self").unwrap_or(false)
    }

    /// Says `message` in the channel this `buffer_msg` arrived in.
    ///
    /// Any other event type fails with [`EventError::InvalidOperation`] and
    /// sends nothing.
    pub async fn reply(&self, message: &str) -> Result<(), EventError> {
        if self.event_type() != BUFFER_MSG {
            return Err(EventError::InvalidOperation {
                event_type: self.event_type().to_string(),
            });
        }
        let cid = self.cid()?;
        let chan = self.str("chan")?;
        let client = self
            .meta
            .connection
            .upgrade()
            .ok_or(EventError::ConnectionClosed)?;
        client.say(cid, chan, message).await?;
        Ok(())
    }

    fn typed<'a, T>(
        &'a self,
        field: &str,
        expected: &'static str,
        extract: impl FnOnce(&'a Value) -> Option<T>,
    ) -> Result<T, EventError> {
        let value = self
            .fields
            .get(field)
            .ok_or_else(|| EventError::MissingField(field.to_string()))?;
        extract(value).ok_or_else(|| EventError::TypeMismatch {
            field: field.to_string(),
            expected,
        })
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.event_type)
            .field("from_backlog", &self.meta.from_backlog)
            .field("fields", &self.fields)
            .finish()
    }
}

fn whole_number(value: &Value) -> Option<f64> {
    value.as_f64().filter(|n| n.fract() == 0.0)
}

/// Decodes one line of a backlog response.
///
/// Backlog bodies are either a JSON array spread over many lines (with
/// bare `[` / `]` delimiter lines and trailing commas) or one record per
/// line. A line holding a whole array expands to all of its records.
/// Undecodable records are logged and skipped.
pub(crate) fn decode_backlog_line(line: &[u8], connection: &ConnectionRef) -> Vec<Event> {
    let line = trim_record(line);
    if matches!(line, b"" | b"[" | b"]") {
        return Vec::new();
    }

    let parsed = if line.first() == Some(&b'[') {
        serde_json::from_slice::<Vec<Value>>(line).or_else(|_| {
            let inner = trim_record(&line[1..]);
            let inner = inner.strip_suffix(b"]").unwrap_or(inner);
            serde_json::from_slice::<Value>(inner).map(|value| vec![value])
        })
    } else {
        let line = line.strip_suffix(b"]").unwrap_or(line);
        serde_json::from_slice::<Value>(line).map(|value| vec![value])
    };

    let values = match parsed {
        Ok(values) => values,
        Err(err) => {
            warn!(
                event = "backlog_line_unparsable",
                error = %error_chain(&err),
                line = %String::from_utf8_lossy(line)
            );
            return Vec::new();
        }
    };

    values
        .into_iter()
        .filter_map(
            |value| match Event::from_value(value, connection.clone(), true) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(event = "backlog_record_invalid", error = %error_chain(&err));
                    None
                }
            },
        )
        .collect()
}

fn trim_record(line: &[u8]) -> &[u8] {
    let is_noise = |b: &u8| b.is_ascii_whitespace() || *b == b',';
    let start = line.iter().position(|b| !is_noise(b)).unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !is_noise(b))
        .map_or(start, |pos| pos + 1);
    &line[start..end]
}

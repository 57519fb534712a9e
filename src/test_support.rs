//! In-memory transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use crate::api::{ApiError, ApiPaths};
use crate::transport::{ByteStream, FormRequest, Transport};

/// One scripted response body: chunks in order, then either end-of-stream or
/// a body that never completes.
pub(crate) struct ScriptedBody {
    chunks: Vec<Result<Bytes, ApiError>>,
    hang: bool,
    gap: Option<Duration>,
}

impl ScriptedBody {
    /// Emits `lines` (newline-terminated) and then stays open.
    pub(crate) fn open_lines(lines: &[&str]) -> Self {
        Self {
            chunks: lines.iter().map(|line| Ok(line_chunk(line))).collect(),
            hang: true,
            gap: None,
        }
    }

    /// Emits `lines` and then ends the body.
    pub(crate) fn closed_lines(lines: &[&str]) -> Self {
        Self {
            hang: false,
            ..Self::open_lines(lines)
        }
    }

    /// Emits `lines` and then fails with a read error.
    pub(crate) fn failing_after(lines: &[&str]) -> Self {
        let mut body = Self::closed_lines(lines);
        body.chunks
            .push(Err(ApiError::Disconnected("connection reset by peer".to_string())));
        body
    }

    /// Emits raw chunks exactly as given and then ends the body.
    pub(crate) fn raw(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks
                .iter()
                .map(|chunk| Ok(Bytes::from(chunk.to_string())))
                .collect(),
            hang: false,
            gap: None,
        }
    }

    /// Emits `lines` with `gap` of delay before each one, then ends the body.
    pub(crate) fn paced(lines: &[&str], gap: Duration) -> Self {
        Self {
            gap: Some(gap),
            ..Self::closed_lines(lines)
        }
    }

    fn into_stream(self) -> ByteStream {
        let chunks: ByteStream = match self.gap {
            Some(gap) => Box::pin(stream::iter(self.chunks).then(move |chunk| async move {
                tokio::time::sleep(gap).await;
                chunk
            })),
            None => Box::pin(stream::iter(self.chunks)),
        };
        if self.hang {
            Box::pin(chunks.chain(stream::pending()))
        } else {
            chunks
        }
    }
}

fn line_chunk(line: &str) -> Bytes {
    Bytes::from(format!("{line}\n"))
}

/// A POST as observed by [`ScriptedTransport`].
#[derive(Clone, Debug)]
pub(crate) struct RecordedPost {
    pub(crate) path: String,
    pub(crate) fields: Vec<(String, String)>,
    pub(crate) session: Option<String>,
    pub(crate) form_token: Option<String>,
}

impl RecordedPost {
    pub(crate) fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
pub(crate) struct ScriptedTransport {
    streams: Mutex<VecDeque<ScriptedBody>>,
    bodies: Mutex<HashMap<String, ScriptedBody>>,
    post_replies: Mutex<VecDeque<Value>>,
    posts: Mutex<Vec<RecordedPost>>,
    stream_opens: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues the body returned by the next open of the event stream. Once
    /// the queue is empty, further opens return a body that never yields.
    pub(crate) fn push_stream(&self, body: ScriptedBody) {
        lock(&self.streams).push_back(body);
    }

    /// Serves `body` once for GETs on `path`.
    pub(crate) fn serve(&self, path: &str, body: ScriptedBody) {
        lock(&self.bodies).insert(path.to_string(), body);
    }

    /// Queues a POST reply; without one, posts answer `{"success": true}`.
    pub(crate) fn push_post_reply(&self, reply: Value) {
        lock(&self.post_replies).push_back(reply);
    }

    pub(crate) fn posts(&self) -> Vec<RecordedPost> {
        lock(&self.posts).clone()
    }

    pub(crate) fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get_stream(&self, path: &str, _session: &SecretString) -> Result<ByteStream, ApiError> {
        if path == ApiPaths::STREAM {
            self.stream_opens.fetch_add(1, Ordering::SeqCst);
            let body = lock(&self.streams)
                .pop_front()
                .unwrap_or_else(|| ScriptedBody::open_lines(&[]));
            return Ok(body.into_stream());
        }

        match lock(&self.bodies).remove(path) {
            Some(body) => Ok(body.into_stream()),
            None => Err(ApiError::HttpStatus {
                status: StatusCode::NOT_FOUND,
                body: format!("no scripted body for {path}"),
            }),
        }
    }

    async fn post_form(&self, request: FormRequest<'_>) -> Result<Value, ApiError> {
        lock(&self.posts).push(RecordedPost {
            path: request.path.to_string(),
            fields: request
                .fields
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect(),
            session: request
                .session
                .map(|session| session.expose_secret().clone()),
            form_token: request.form_token.map(str::to_string),
        });
        Ok(lock(&self.post_replies)
            .pop_front()
            .unwrap_or_else(|| json!({"success": true})))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

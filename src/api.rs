//! Authenticated API client: login handshake, session credential and the
//! outbound chat commands.

use std::fmt;
use std::sync::{Arc, Weak};

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::transport::{ByteStream, FormRequest, Transport};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiPaths;

impl ApiPaths {
    pub const AUTH_FORMTOKEN: &'static str = "/chat/auth-formtoken";
    pub const LOGIN: &'static str = "/chat/login";
    pub const STREAM: &'static str = "/chat/stream";
    pub const JOIN: &'static str = "/chat/join";
    pub const PART: &'static str = "/chat/part";
    pub const TOPIC: &'static str = "/chat/topic";
    pub const SAY: &'static str = "/chat/say";
    pub const NICK: &'static str = "/chat/nick";
}

/// Errors produced by API requests and transports.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed")]
    Transport(#[source] reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// The service answered with `success: false`.
    #[error("{path} was not successful: {detail}")]
    Unsuccessful { path: String, detail: String },

    /// An authenticated call was attempted without a session credential.
    #[error("session credential is empty; login did not succeed")]
    MissingSession,

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    #[error("stream line exceeds {0} bytes")]
    LineTooLong(usize),

    /// The connection dropped while a response body was being read.
    #[error("connection lost: {0}")]
    Disconnected(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_connect(),
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::SERVICE_UNAVAILABLE
            }
            _ => false,
        }
    }
}

/// Client bound to one authenticated session.
///
/// Cloning is cheap; clones share the transport and credential.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    session: SecretString,
}

impl ApiClient {
    /// Runs the two-step login handshake and returns a client bound to the
    /// issued session.
    pub async fn login(
        transport: Arc<dyn Transport>,
        email: &str,
        password: &SecretString,
    ) -> Result<Self, ApiError> {
        let token = fetch_form_token(transport.as_ref()).await?;

        let response = transport
            .post_form(FormRequest {
                path: ApiPaths::LOGIN,
                fields: vec![
                    ("email", email.to_string()),
                    ("password", password.expose_secret().clone()),
                    ("token", token.clone()),
                ],
                session: None,
                form_token: Some(&token),
            })
            .await?;
        ensure_success(ApiPaths::LOGIN, &response)?;

        let session = response
            .get("session")
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(event = "login_succeeded", email);
        Self::with_session(transport, SecretString::new(session.to_string()))
    }

    /// Wraps an already issued session credential.
    ///
    /// An empty credential is rejected: every later request would be
    /// unauthenticated.
    pub fn with_session(
        transport: Arc<dyn Transport>,
        session: SecretString,
    ) -> Result<Self, ApiError> {
        if session.expose_secret().is_empty() {
            return Err(ApiError::MissingSession);
        }
        Ok(Self {
            inner: Arc::new(ClientInner { transport, session }),
        })
    }

    /// Joins `channel` on connection `cid`.
    pub async fn join(&self, cid: u64, channel: &str) -> Result<(), ApiError> {
        self.authenticated_post(
            ApiPaths::JOIN,
            vec![("cid", cid.to_string()), ("channel", channel.to_string())],
        )
        .await
    }

    /// Leaves `channel` on connection `cid`.
    pub async fn part(&self, cid: u64, channel: &str) -> Result<(), ApiError> {
        self.authenticated_post(
            ApiPaths::PART,
            vec![("cid", cid.to_string()), ("channel", channel.to_string())],
        )
        .await
    }

    /// Sets the topic of `channel` on connection `cid`.
    pub async fn topic(&self, cid: u64, channel: &str, topic: &str) -> Result<(), ApiError> {
        self.authenticated_post(
            ApiPaths::TOPIC,
            vec![
                ("cid", cid.to_string()),
                ("channel", channel.to_string()),
                ("topic", topic.to_string()),
            ],
        )
        .await
    }

    /// Posts `message` to `target` (channel or nick) on connection `cid`.
    pub async fn say(&self, cid: u64, target: &str, message: &str) -> Result<(), ApiError> {
        self.authenticated_post(
            ApiPaths::SAY,
            vec![
                ("cid", cid.to_string()),
                ("to", target.to_string()),
                ("msg", message.to_string()),
            ],
        )
        .await
    }

    /// Changes the own nickname on connection `cid`.
    pub async fn nick(&self, cid: u64, nick: &str) -> Result<(), ApiError> {
        self.authenticated_post(
            ApiPaths::NICK,
            vec![("cid", cid.to_string()), ("nick", nick.to_string())],
        )
        .await
    }

    /// Opens an authenticated streaming GET on `path`.
    pub(crate) async fn open_stream(&self, path: &str) -> Result<ByteStream, ApiError> {
        let session = self.session()?;
        self.inner.transport.get_stream(path, session).await
    }

    pub(crate) fn ensure_session(&self) -> Result<(), ApiError> {
        self.session().map(|_| ())
    }

    /// Returns a non-owning handle to this client.
    pub fn downgrade(&self) -> ConnectionRef {
        ConnectionRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn session(&self) -> Result<&SecretString, ApiError> {
        if self.inner.session.expose_secret().is_empty() {
            return Err(ApiError::MissingSession);
        }
        Ok(&self.inner.session)
    }

    async fn authenticated_post(
        &self,
        path: &str,
        mut fields: Vec<(&'static str, String)>,
    ) -> Result<(), ApiError> {
        let session = self.session()?;
        fields.push(("session", session.expose_secret().clone()));

        let response = self
            .inner
            .transport
            .post_form(FormRequest {
                path,
                fields,
                session: Some(session),
                form_token: None,
            })
            .await?;
        debug!(event = "api_call_completed", path);
        ensure_success(path, &response)
    }
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient").finish_non_exhaustive()
    }
}

/// Non-owning reference from an event back to the client that received it.
#[derive(Clone, Default)]
pub struct ConnectionRef {
    inner: Weak<ClientInner>,
}

impl ConnectionRef {
    /// A reference that never resolves.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Returns the client if it is still alive.
    pub fn upgrade(&self) -> Option<ApiClient> {
        self.inner.upgrade().map(|inner| ApiClient { inner })
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRef")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

async fn fetch_form_token(transport: &dyn Transport) -> Result<String, ApiError> {
    #[derive(Debug, Deserialize)]
    struct FormToken {
        #[serde(default)]
        success: bool,
        #[serde(default)]
        token: String,
    }

    let response = transport
        .post_form(FormRequest {
            path: ApiPaths::AUTH_FORMTOKEN,
            ..FormRequest::default()
        })
        .await?;
    let parsed: FormToken =
        serde_json::from_value(response).map_err(|err| ApiError::Parse(err.to_string()))?;

    if !parsed.success || parsed.token.is_empty() {
        return Err(ApiError::Unsuccessful {
            path: ApiPaths::AUTH_FORMTOKEN.to_string(),
            detail: "no auth-formtoken received".to_string(),
        });
    }
    Ok(parsed.token)
}

fn ensure_success(path: &str, response: &Value) -> Result<(), ApiError> {
    if response.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(());
    }

    let detail = response
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| summarize_error_body(&response.to_string()));
    Err(ApiError::Unsuccessful {
        path: path.to_string(),
        detail,
    })
}

pub(crate) fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

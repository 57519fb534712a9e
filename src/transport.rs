//! HTTP transport used by the API client and the stream engine.
//!
//! [`Transport`] is the seam between the client logic and the network: it
//! issues authenticated form posts and opens long-lived response bodies as
//! byte streams. [`HttpTransport`] is the reqwest-backed implementation.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::api::{summarize_error_body, ApiError};
use crate::retry::{retry_async, RetryPolicy};

/// Production endpoint of the chat service.
pub const DEFAULT_BASE_URL: &str = "https://www.irccloud.com";

/// Response body delivered chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

/// A form-encoded POST request.
#[derive(Clone, Debug, Default)]
pub struct FormRequest<'a> {
    /// Path relative to the base URL, or an absolute URL.
    pub path: &'a str,
    /// Form fields in encoding order.
    pub fields: Vec<(&'static str, String)>,
    /// Session credential sent as a cookie when present.
    pub session: Option<&'a SecretString>,
    /// Value of the `x-auth-formtoken` header used during login.
    pub form_token: Option<&'a str>,
}

/// Request primitives the client needs from the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues an authenticated GET and returns the body as a byte stream.
    ///
    /// The returned stream is not bounded by any request timeout; callers
    /// cancel it by dropping it.
    async fn get_stream(&self, path: &str, session: &SecretString) -> Result<ByteStream, ApiError>;

    /// Issues a form POST and returns the decoded JSON response body.
    async fn post_form(&self, request: FormRequest<'_>) -> Result<Value, ApiError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportDefaults;

impl TransportDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Tunables for [`HttpTransport`].
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub base_url: String,
    pub connect_timeout: Duration,
    /// Timeout for request/response calls. Streaming bodies are exempt.
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl TransportOptions {
    /// Points the transport at another deployment, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: TransportDefaults::CONNECT_TIMEOUT,
            request_timeout: TransportDefaults::REQUEST_TIMEOUT,
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// reqwest-backed [`Transport`].
#[derive(Clone, Debug)]
pub struct HttpTransport {
    http: Client,
    base_url: String,
    request_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl HttpTransport {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_options(TransportOptions::default())
    }

    pub fn with_options(options: TransportOptions) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            base_url: options.base_url,
            request_timeout: options.request_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<String, ApiError> {
        resolve_url(&self.base_url, path)
    }

    async fn post_attempt(&self, url: &str, request: &FormRequest<'_>) -> Result<Value, ApiError> {
        let mut builder = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&request.fields);

        if let Some(session) = request.session {
            builder = builder.header(COOKIE, session_cookie(session));
        }
        if let Some(token) = request.form_token {
            builder = builder.header("x-auth-formtoken", token);
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        serde_json::from_str(&body).map_err(|err| ApiError::Parse(err.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get_stream(&self, path: &str, session: &SecretString) -> Result<ByteStream, ApiError> {
        let url = self.url(path)?;
        let response = self
            .http
            .get(url)
            .header(COOKIE, session_cookie(session))
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(ApiError::Transport)),
        ))
    }

    async fn post_form(&self, request: FormRequest<'_>) -> Result<Value, ApiError> {
        let url = self.url(request.path)?;
        let url = url.as_str();
        let request = &request;

        retry_async(
            &self.retry_policy,
            move |_| self.post_attempt(url, request),
            ApiError::is_retryable,
        )
        .await
    }
}

fn session_cookie(session: &SecretString) -> String {
    format!("session={}", session.expose_secret())
}

/// Joins `path` onto `base_url`.
///
/// Absolute URLs are accepted only on the base URL's own scheme and host,
/// since every request carries the session cookie.
pub(crate) fn resolve_url(base_url: &str, path: &str) -> Result<String, ApiError> {
    let base_url = base_url.trim_end_matches('/');

    if path.contains("://") {
        let same_origin = path
            .strip_prefix(base_url)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']));
        if !same_origin {
            return Err(ApiError::InvalidUrl(path.to_string()));
        }
        return Ok(path.to_string());
    }
    if !path.starts_with('/') || path.starts_with("//") {
        return Err(ApiError::InvalidUrl(path.to_string()));
    }
    Ok(format!("{base_url}{path}"))
}

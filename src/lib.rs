//! Rust client for the IRCCloud chat-relay service.
//!
//! The crate is organized by concern:
//! - `api`: session login and outbound chat commands.
//! - `transport`: HTTP plumbing behind the API client.
//! - `stream`: the long-lived event stream, its dispatch engine and the
//!   [`Bot`] handle.
//! - `retry`: shared backoff and retry utilities.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use irccloud_sdk::{ApiClient, BotBuilder, HttpTransport};
//! use secrecy::SecretString;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(HttpTransport::new()?);
//! let password = SecretString::new("hunter2".to_string());
//! let client = ApiClient::login(transport, "me@example.com", &password).await?;
//!
//! let mut bot = BotBuilder::new(client)
//!     .on("buffer_msg", |event| async move {
//!         if event.str("msg")? == "!ping" {
//!             event.reply("pong").await?;
//!         }
//!         Ok::<(), irccloud_sdk::HandlerError>(())
//!     })
//!     .start(CancellationToken::new())?;
//!
//! while let Some(event) = bot.recv().await {
//!     println!("{}", event.event_type());
//! }
//! if let Some(err) = bot.err().await {
//!     eprintln!("stream terminated: {err}");
//! }
//! # Ok(())
//! # }
//! ```

/// Session login, outbound commands and the authenticated client handle.
pub mod api;
/// Backoff and retry helpers used across the SDK.
pub mod retry;
/// Event stream ingestion, dispatch and reconnection.
pub mod stream;
/// HTTP transport abstraction and its reqwest implementation.
pub mod transport;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError, ConnectionRef};
pub use retry::{BackoffPolicy, RetryPolicy};
pub use stream::client::{Bot, BotBuilder, BotDefaults, BotOptions, StreamError};
pub use stream::dispatch::HandlerError;
pub use stream::event::{DecodeError, Event, EventError};
pub use transport::{HttpTransport, Transport, TransportOptions};

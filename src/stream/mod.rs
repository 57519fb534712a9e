//! Event stream engine.
//!
//! - `lines`: splits the chunked response body into raw records.
//! - `event`: decoded events and their field accessors.
//! - `watchdog`: idle timer that cancels a silent stream attempt.
//! - `internal`: built-in handlers for `oob_include` and `idle`.
//! - `dispatch`: routing between internal handlers, registered handlers and
//!   the output queue.
//! - `client`: [`Bot`](client::Bot) handle and the reconnecting worker.

/// Bot handle, options and the reconnecting stream worker.
pub mod client;
/// Handler registration and event routing.
pub mod dispatch;
/// Stream events and decoding.
pub mod event;
pub(crate) mod internal;
/// Newline-delimited record reader.
pub mod lines;
/// Idle watchdog for stream attempts.
pub mod watchdog;

/// Renders `err` followed by its source chain, separated by `": "`.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

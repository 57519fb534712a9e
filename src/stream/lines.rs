//! Newline-delimited record reader over a chunked response body.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};

use crate::api::ApiError;

/// Longest record accepted before the body is considered broken.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Splits a byte stream into raw line records.
///
/// A reader is bound to one response body and cannot be restarted. After
/// end-of-stream or a read error it keeps returning `Ok(None)`.
pub struct LineReader<S> {
    source: S,
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    max_line_bytes: usize,
    finished: bool,
}

impl<S> LineReader<S>
where
    S: Stream<Item = Result<Bytes, ApiError>> + Unpin,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(8192),
            scanned: 0,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            finished: false,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    /// Returns the next line without its terminator (`\n` or `\r\n`).
    ///
    /// A trailing record without a terminator is returned once the body
    /// ends. `Ok(None)` marks end-of-stream.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>, ApiError> {
        loop {
            let found = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n');
            if let Some(offset) = found {
                let newline_pos = self.scanned + offset;
                self.scanned = 0;
                let mut line = self.buffer.split_to(newline_pos + 1);
                line.truncate(newline_pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(Some(line.freeze()));
            }

            self.scanned = self.buffer.len();

            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                self.scanned = 0;
                return Ok(Some(self.buffer.split().freeze()));
            }

            if self.buffer.len() > self.max_line_bytes {
                self.fail();
                return Err(ApiError::LineTooLong(self.max_line_bytes));
            }

            match self.source.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    self.fail();
                    return Err(err);
                }
                None => self.finished = true,
            }
        }
    }

    fn fail(&mut self) {
        self.finished = true;
        self.scanned = 0;
        self.buffer.clear();
    }
}

//! Chunk Reassembly
//!
//! Vendor streams arrive in arbitrary network reads. [`LineBuffer`] carries
//! the unconsumed tail of one read into the next and yields complete lines;
//! [`ChunkParser`] feeds those lines to the adapter and turns them into
//! [`CanonicalToken`]s.
//!
//! # Security
//!
//! - The carry buffer is capped so a vendor that never sends a newline cannot
//!   exhaust memory
//! - Lines are only decoded as UTF-8 once complete, so a multi-byte character
//!   split across reads is never mangled

use super::traits::CanonicalToken;
use super::ProviderAdapter;
use crate::error::{GatewayError, Result};

/// Default cap for a single unterminated frame (1 MiB)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Default number of consecutive bad frames tolerated before aborting
pub const DEFAULT_MAX_CONSECUTIVE_BAD_FRAMES: u32 = 5;

/// Minimum buffer capacity
const MIN_BUFFER_CAPACITY: usize = 4096;

/// What a single vendor frame meant
#[derive(Debug)]
pub enum FrameOutcome {
    /// Parsed, but carries no text (keep-alive, ignored event type)
    Skip,
    /// Parsed and carries token text
    Token(String),
    /// End-of-stream marker, with any text carried by the same frame
    Done(String),
    /// Could not be parsed; skipped unless too many arrive in a row
    Malformed(String),
    /// The vendor reported an error inside the stream
    Failed(GatewayError),
}

/// Carry buffer that splits raw bytes into newline-terminated lines
#[derive(Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    max_frame_bytes: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl LineBuffer {
    /// Create a buffer that rejects frames longer than `max_frame_bytes`
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_frame_bytes,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);

        // Only the unterminated tail counts against the cap
        let tail_start = self.buffer[self.read_pos..]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(self.read_pos, |i| self.read_pos + i + 1);
        let tail = self.buffer.len() - tail_start;
        if tail > self.max_frame_bytes {
            return Err(GatewayError::ResourceExceeded(format!(
                "frame exceeds {} bytes without a line break",
                self.max_frame_bytes
            )));
        }
        Ok(())
    }

    /// Get the number of bytes not yet consumed
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Take the next complete line, without its terminator (`\n` or `\r\n`)
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let rest = &self.buffer[self.read_pos..];
        let newline = rest.iter().position(|&b| b == b'\n')?;
        let mut line = &rest[..newline];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        let line = line.to_vec();
        self.read_pos += newline + 1;
        Some(line)
    }

    /// Take whatever is left (an unterminated final line)
    pub fn take_remainder(&mut self) -> Vec<u8> {
        let rest = self.buffer[self.read_pos..].to_vec();
        self.clear();
        rest
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.read_pos = 0;
    }
}

/// Turns raw vendor bytes into canonical tokens for one stream
#[derive(Debug)]
pub struct ChunkParser {
    adapter: ProviderAdapter,
    carry: LineBuffer,
    consecutive_failures: u32,
    max_consecutive_failures: u32,
    finished: bool,
}

impl ChunkParser {
    /// Create a parser with default limits
    #[must_use]
    pub fn new(adapter: ProviderAdapter) -> Self {
        Self::with_limits(
            adapter,
            DEFAULT_MAX_FRAME_BYTES,
            DEFAULT_MAX_CONSECUTIVE_BAD_FRAMES,
        )
    }

    /// Create a parser with explicit limits
    #[must_use]
    pub fn with_limits(
        adapter: ProviderAdapter,
        max_frame_bytes: usize,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            adapter,
            carry: LineBuffer::new(max_frame_bytes),
            consecutive_failures: 0,
            max_consecutive_failures: max_consecutive_failures.max(1),
            finished: false,
        }
    }

    /// Whether the end-of-stream marker has been seen
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes held back waiting for the rest of their frame
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.carry.available()
    }

    /// Feed one network read
    ///
    /// Complete frames are parsed immediately; a trailing partial frame is
    /// kept in the carry buffer and prefixed to the next chunk.
    pub fn parse_chunk(&mut self, chunk: &[u8]) -> Result<Vec<CanonicalToken>> {
        let mut tokens = Vec::new();
        self.parse_chunk_into(chunk, &mut tokens)?;
        Ok(tokens)
    }

    /// Like [`parse_chunk`](Self::parse_chunk), but tokens decoded before a
    /// failing frame stay in `tokens` when an error is returned
    pub fn parse_chunk_into(
        &mut self,
        chunk: &[u8],
        tokens: &mut Vec<CanonicalToken>,
    ) -> Result<()> {
        if self.finished {
            tracing::trace!(bytes = chunk.len(), "Ignoring bytes after end of stream");
            return Ok(());
        }

        self.carry.push(chunk)?;
        while let Some(line) = self.carry.next_line() {
            self.handle_line(&line, tokens)?;
            if self.finished {
                self.carry.clear();
                break;
            }
        }
        Ok(())
    }

    /// Flush the carry buffer when the connection closes
    ///
    /// Returns the closing token for framings that end on close. Framings
    /// with an explicit end marker that never arrived fail with a transport
    /// error so a truncated response is not mistaken for a complete one.
    pub fn finish(&mut self) -> Result<Vec<CanonicalToken>> {
        let mut tokens = Vec::new();
        self.finish_into(&mut tokens)?;
        Ok(tokens)
    }

    /// Like [`finish`](Self::finish), keeping already decoded tokens on error
    pub fn finish_into(&mut self, tokens: &mut Vec<CanonicalToken>) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        let remainder = self.carry.take_remainder();
        if !remainder.iter().all(u8::is_ascii_whitespace) {
            self.handle_line(&remainder, tokens)?;
        }

        if self.finished {
            return Ok(());
        }
        if self.adapter.ends_on_close() {
            self.finished = true;
            tokens.push(CanonicalToken::last(String::new()));
            return Ok(());
        }
        Err(GatewayError::Transport(format!(
            "{} connection closed before end-of-stream marker",
            self.adapter.name()
        )))
    }

    fn handle_line(&mut self, raw: &[u8], tokens: &mut Vec<CanonicalToken>) -> Result<()> {
        let outcome = match std::str::from_utf8(raw) {
            Ok(line) if line.trim().is_empty() => return Ok(()),
            Ok(line) => self.adapter.decode_line(line.trim_end()),
            Err(e) => FrameOutcome::Malformed(format!("invalid UTF-8: {e}")),
        };

        match outcome {
            FrameOutcome::Skip => self.consecutive_failures = 0,
            FrameOutcome::Token(text) => {
                self.consecutive_failures = 0;
                if !text.is_empty() {
                    tokens.push(CanonicalToken::text(text));
                }
            }
            FrameOutcome::Done(text) => {
                self.consecutive_failures = 0;
                self.finished = true;
                tokens.push(CanonicalToken::last(text));
            }
            FrameOutcome::Malformed(reason) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    provider = self.adapter.name(),
                    consecutive = self.consecutive_failures,
                    reason = %reason,
                    "Skipping malformed frame"
                );
                if self.consecutive_failures >= self.max_consecutive_failures {
                    return Err(GatewayError::Protocol(format!(
                        "{} consecutive unparseable {} frames (last: {reason})",
                        self.consecutive_failures,
                        self.adapter.name()
                    )));
                }
            }
            FrameOutcome::Failed(err) => return Err(err),
        }
        Ok(())
    }
}

//! SSE (Server-Sent Events) frame decoding
//!
//! Turns transport chunks of arbitrary size into blank-line-terminated frames.
//! The decoder knows nothing about event names or JSON; see `events` for that.

use tracing::debug;

/// Blank-line separator between frames, after newline normalization
const FRAME_SEPARATOR: &str = "\n\n";

/// Incremental frame decoder that buffers partial frames across chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Bytes of a multi-byte character split across chunks
    pending_bytes: Vec<u8>,
    /// The previous chunk ended in `\r`, already emitted as `\n`; a leading
    /// `\n` in the next chunk completes that pair and is dropped
    trailing_cr: bool,
    /// Decoded, normalized text not yet terminated by a separator
    buffer: String,
    /// Frames emitted so far
    frame_count: usize,
    /// Bytes received counter
    bytes_received: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk and return every frame it completes, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes_received += chunk.len();
        let text = self.decode_utf8(chunk);
        let text = self.normalize_newlines(&text);
        self.buffer.push_str(&text);

        let mut frames = Vec::new();
        while let Some(boundary) = self.buffer.find(FRAME_SEPARATOR) {
            let frame: String = self.buffer.drain(..boundary + FRAME_SEPARATOR.len()).collect();
            let frame = frame[..boundary].trim();
            if frame.is_empty() {
                continue;
            }
            self.frame_count += 1;
            frames.push(frame.to_string());
        }

        debug!(
            "SSE chunk: {} bytes (total: {} bytes), {} frames, {} bytes buffered",
            chunk.len(),
            self.bytes_received,
            frames.len(),
            self.buffer.len()
        );
        frames
    }

    /// Text still waiting for a separator
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Drop everything buffered, e.g. when the session is cancelled
    pub fn discard(&mut self) {
        if !self.buffer.is_empty() || !self.pending_bytes.is_empty() {
            debug!(
                "SSE decoder discarding {} buffered chars, {} pending bytes",
                self.buffer.len(),
                self.pending_bytes.len()
            );
        }
        self.buffer.clear();
        self.pending_bytes.clear();
        self.trailing_cr = false;
    }

    /// Streaming UTF-8 decode: an incomplete trailing sequence waits for the
    /// next chunk, invalid sequences become U+FFFD.
    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        self.pending_bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(self.pending_bytes.len());
        let mut start = 0;
        while start < self.pending_bytes.len() {
            let input = &self.pending_bytes[start..];
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending_bytes.len();
                }
                Err(e) => {
                    let valid_len = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&input[..valid_len]));
                    match e.error_len() {
                        // Incomplete sequence at the end: keep it for the next chunk
                        None => {
                            start += valid_len;
                            break;
                        }
                        Some(invalid_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start += valid_len + invalid_len;
                        }
                    }
                }
            }
        }

        self.pending_bytes.drain(..start);
        out
    }

    /// Map `\r\n` and lone `\r` to `\n`, including a pair split across chunks
    fn normalize_newlines(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.chars().peekable();

        if self.trailing_cr {
            if let Some(&first) = chars.peek() {
                self.trailing_cr = false;
                if first == '\n' {
                    chars.next();
                }
            }
        }

        while let Some(c) = chars.next() {
            if c != '\r' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('\n') => {
                    chars.next();
                    out.push('\n');
                }
                Some(_) => out.push('\n'),
                None => {
                    out.push('\n');
                    self.trailing_cr = true;
                }
            }
        }

        out
    }
}

//! Streamed output delivery.
//!
//! Generation appends decoded text to an [`OutputBuffer`] while a polling
//! caller drains it through a read cursor. Token fragments arrive as raw
//! bytes; [`Utf8Accumulator`] holds back incomplete code points so the buffer
//! only ever contains whole characters.
//!
//! # Key Concepts
//!
//! ## Chunked Reads
//!
//! `read_chunk(max_len)` returns at most `max_len` bytes and never splits a
//! code point: when the next character is wider than `max_len`, the chunk is
//! empty and the cursor stays put. A reader asking for at least
//! [`MAX_CHAR_LEN`] bytes always makes progress while text is unread.
//!
//! `peek_chunk` and `consume` split a read in two so a caller can hand the
//! bytes off before committing the cursor.

/// Widest UTF-8 encoding of a single character, in bytes.
pub const MAX_CHAR_LEN: usize = 4;

/// Reason a generation run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Reached the step limit or the end of the context window.
    Length,

    /// Sampled a stop token.
    EndOfSequence,

    /// Cancellation was requested.
    Cancelled,

    /// Forward pass, sampling or decoding failed.
    Failed,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Length => write!(f, "length"),
            Self::EndOfSequence => write!(f, "eos"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Reassembles UTF-8 text from byte fragments.
///
/// # Examples
///
/// ```rust
/// use llama_engine::streaming::Utf8Accumulator;
///
/// let mut acc = Utf8Accumulator::new();
/// // "é" split across two fragments.
/// assert_eq!(acc.push(&[b'a', 0xC3]), "a");
/// assert_eq!(acc.push(&[0xA9]), "é");
/// ```
#[derive(Debug, Default, Clone)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    /// Create an empty accumulator.
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Bytes held back waiting for the rest of a code point.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Add bytes and return every complete character now available.
    ///
    /// Invalid sequences become U+FFFD.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(s) => {
                    out.push_str(s);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // valid_up_to guarantees this prefix is UTF-8.
                    out.push_str(&String::from_utf8_lossy(
                        &self.pending[consumed..consumed + valid],
                    ));
                    consumed += valid;
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += bad;
                        }
                        None => break,
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }

    /// Flush held-back bytes, replacing an incomplete tail with U+FFFD.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Append-only text buffer with a read cursor.
///
/// # Examples
///
/// ```rust
/// use llama_engine::streaming::OutputBuffer;
///
/// let mut buf = OutputBuffer::new();
/// buf.push_str("Hello");
/// assert_eq!(buf.read_chunk(3), "Hel");
/// assert_eq!(buf.unread(), 2);
/// assert_eq!(buf.read_chunk(10), "lo");
/// assert_eq!(buf.read_chunk(10), "");
/// ```
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    text: String,
    cursor: usize,
}

impl OutputBuffer {
    /// Create an empty buffer.
    pub const fn new() -> Self {
        Self {
            text: String::new(),
            cursor: 0,
        }
    }

    /// Append text.
    pub fn push_str(&mut self, s: &str) {
        self.text.push_str(s);
    }

    /// Everything produced so far.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Total bytes produced.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Check if nothing has been produced.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Bytes already delivered.
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes not yet delivered.
    pub fn unread(&self) -> usize {
        self.text.len() - self.cursor
    }

    /// Take up to `max_len` unread bytes, ending on a character boundary.
    pub fn read_chunk(&mut self, max_len: usize) -> String {
        let chunk = self.peek_chunk(max_len).to_string();
        self.consume(chunk.len());
        chunk
    }

    /// The chunk `read_chunk(max_len)` would return, without moving the cursor.
    pub fn peek_chunk(&self, max_len: usize) -> &str {
        let mut end = self.cursor + max_len.min(self.unread());
        while !self.text.is_char_boundary(end) {
            end -= 1;
        }
        &self.text[self.cursor..end]
    }

    /// Advance the cursor past `len` bytes of a chunk returned by
    /// [`peek_chunk`](Self::peek_chunk).
    pub fn consume(&mut self, len: usize) {
        self.cursor += len.min(self.unread());
    }

    /// Drop all text and rewind the cursor.
    pub fn clear(&mut self) {
        self.text.clear();
        self.cursor = 0;
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_chunks_reassemble(text in "\\PC{0,40}", max_len in 4usize..16) {
            let mut buf = OutputBuffer::new();
            buf.push_str(&text);
            let mut out = String::new();
            loop {
                let chunk = buf.read_chunk(max_len);
                if chunk.is_empty() {
                    break;
                }
                prop_assert!(chunk.len() <= max_len);
                out.push_str(&chunk);
            }
            prop_assert_eq!(out, text);
        }

        #[test]
        fn prop_accumulator_any_split(text in "\\PC{0,30}", split in 0usize..200) {
            let bytes = text.as_bytes();
            let at = split.min(bytes.len());
            let mut acc = Utf8Accumulator::new();
            let mut out = acc.push(&bytes[..at]);
            out.push_str(&acc.push(&bytes[at..]));
            prop_assert_eq!(acc.pending(), 0);
            prop_assert_eq!(out, text);
        }
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Incremental, buffer-bounded line reading.
//!
//! The reader pulls fixed-size chunks from the underlying source and splits
//! them on the encoding's line terminator. A trailing fragment without a
//! terminator is held across calls until the line completes; it is never
//! emitted early. Byte accounting is exact in source-byte terms so offsets
//! derived from it survive restarts.

use std::io::Read;

use super::encoding::LineEncoding;

/// One complete physical line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLine {
    /// Decoded content without the terminator and without a trailing `\r`.
    pub content: String,
    /// Total source bytes consumed by this line, terminator included.
    pub bytes: u64,
    /// Set when the line exceeded the size cap and was cut.
    pub truncated: bool,
}

pub struct LineReader<R: Read> {
    inner: R,
    encoding: LineEncoding,
    buffer_size: usize,
    max_bytes: usize,
    /// Bytes read but not yet terminated. In discard mode this is only the
    /// search window past the capped head.
    pending: Vec<u8>,
    /// First `max_bytes` of an oversize line, kept for the truncated event.
    head: Vec<u8>,
    /// Oversize-line bytes already dropped from the search window.
    discarded: u64,
    discarding: bool,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R, encoding: LineEncoding, buffer_size: usize, max_bytes: usize) -> Self {
        Self {
            inner,
            encoding,
            buffer_size: buffer_size.max(1),
            max_bytes: max_bytes.max(1),
            pending: Vec::new(),
            head: Vec::new(),
            discarded: 0,
            discarding: false,
        }
    }

    /// Next complete line, or None when the source is exhausted for now.
    ///
    /// None is "EOF at this moment", not end of stream: a later call after
    /// the file grew picks up where reading stopped.
    pub fn next_line(&mut self) -> std::io::Result<Option<RawLine>> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(Some(line));
            }

            let mut chunk = vec![0u8; self.buffer_size];
            let n = self.inner.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Extract a terminated line from the buffer, if one is there.
    fn take_line(&mut self) -> Option<RawLine> {
        let nl = self.encoding.newline();

        if self.discarding {
            return match find(&self.pending, nl) {
                Some(pos) => {
                    let bytes =
                        self.head.len() as u64 + self.discarded + (pos + nl.len()) as u64;
                    self.pending.drain(..pos + nl.len());
                    let content = self.encoding.decode(&std::mem::take(&mut self.head));
                    self.discarded = 0;
                    self.discarding = false;
                    Some(RawLine {
                        content,
                        bytes,
                        truncated: true,
                    })
                }
                None => {
                    // Shrink the search window, keeping enough carry that a
                    // terminator straddling two reads is still found.
                    let keep = nl.len() - 1;
                    if self.pending.len() > keep {
                        let drop_n = self.pending.len() - keep;
                        self.discarded += drop_n as u64;
                        self.pending.drain(..drop_n);
                    }
                    None
                }
            };
        }

        match find(&self.pending, nl) {
            Some(pos) => {
                let consumed = pos + nl.len();
                let raw: Vec<u8> = self.pending.drain(..consumed).collect();
                // The cap truncates content, never the bytes consumed.
                let truncated = pos > self.max_bytes;
                let content_end = if truncated { self.max_bytes } else { pos };
                Some(RawLine {
                    content: self.encoding.decode(&raw[..content_end]),
                    bytes: consumed as u64,
                    truncated,
                })
            }
            None => {
                // No terminator in sight; cap memory on an oversize line by
                // moving the head aside and discarding until the terminator.
                if self.pending.len() > self.max_bytes {
                    self.head = self.pending.drain(..self.max_bytes).collect();
                    self.discarding = true;
                    return self.take_line();
                }
                None
            }
        }
    }

    /// Drop any buffered partial line, e.g. after a truncation restart.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.head.clear();
        self.discarded = 0;
        self.discarding = false;
    }

    /// Bytes held for an unterminated trailing line.
    pub fn pending_bytes(&self) -> u64 {
        self.head.len() as u64 + self.discarded + self.pending.len() as u64
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|&b| b == needle[0]);
    }
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// SPDX-License-Identifier: Apache-2.0

//! Character encoding support for line readers.
//!
//! Lines are split on the encoding's byte representation of `\n` before
//! decoding, so UTF-16 content is never broken mid code unit. Decoding is
//! per complete line via encoding_rs.

use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE};

use crate::error::{Error, Result};

const NL: &[u8] = b"\n";
const NL_UTF16LE: &[u8] = &[0x0A, 0x00];
const NL_UTF16BE: &[u8] = &[0x00, 0x0A];

/// A resolved line encoding: the codec plus its newline byte sequence.
#[derive(Debug, Clone, Copy)]
pub struct LineEncoding {
    encoding: &'static Encoding,
}

impl LineEncoding {
    /// Resolve a configured encoding label.
    ///
    /// `plain` and `utf-8` map to UTF-8; anything else goes through the
    /// WHATWG label registry, which covers utf-16le/be, latin1 and the other
    /// named codecs. An unknown label is a startup configuration error.
    pub fn for_label(label: &str) -> Result<Self> {
        let normalized = label.trim().to_lowercase();
        let encoding = match normalized.as_str() {
            "" | "plain" | "utf8" | "utf-8" => UTF_8,
            other => Encoding::for_label(other.as_bytes())
                .ok_or_else(|| Error::UnknownEncoding(label.to_string()))?,
        };
        Ok(Self { encoding })
    }

    /// The encoded form of `\n` in this encoding.
    pub fn newline(&self) -> &'static [u8] {
        if self.encoding == UTF_16LE {
            NL_UTF16LE
        } else if self.encoding == UTF_16BE {
            NL_UTF16BE
        } else {
            NL
        }
    }

    /// Decode one complete line (terminator already stripped) and trim a
    /// trailing carriage return so CRLF input is tolerated.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let (decoded, _, _) = self.encoding.decode(bytes);
        let mut line = decoded.into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }
}

impl Default for LineEncoding {
    fn default() -> Self {
        Self { encoding: UTF_8 }
    }
}

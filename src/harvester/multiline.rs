// SPDX-License-Identifier: Apache-2.0

//! Multiline aggregation: merging physical lines into one logical event.
//!
//! A pattern plus `negate` decides whether a line continues the current
//! group; `match` decides which side of the group continuations attach to.
//! Groups are bounded by `max_lines`/`max_bytes` (excess content is dropped,
//! not buffered) and force-flushed by the harvester once `timeout` passes
//! with no new line.

use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;

use super::reader::RawLine;
use crate::error::{Error, Result};

/// Which side of a group continuation lines attach to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Continuations follow the line that started the group.
    #[default]
    After,
    /// Continuations precede the line that completes the group.
    Before,
}

impl std::str::FromStr for MatchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "after" => Ok(MatchMode::After),
            "before" => Ok(MatchMode::Before),
            other => Err(Error::Config(format!(
                "invalid multiline match '{}', expected 'after' or 'before'",
                other
            ))),
        }
    }
}

fn default_max_lines() -> usize {
    500
}

fn default_max_group_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultilineConfig {
    pub pattern: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(default, rename = "match")]
    pub match_mode: MatchMode,
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,
    #[serde(default = "default_max_group_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_timeout", with = "crate::input::config::duration")]
    pub timeout: Duration,
}

/// One flushed logical line.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedLine {
    /// Physical lines joined with `\n`.
    pub content: String,
    /// Source bytes consumed by every physical line in the group, dropped
    /// lines included.
    pub bytes: u64,
    /// Set when the group hit its line/byte cap or contained a cut line.
    pub truncated: bool,
}

#[derive(Debug)]
pub struct MultilineJoiner {
    pattern: Regex,
    negate: bool,
    mode: MatchMode,
    max_lines: usize,
    max_bytes: usize,
    timeout: Duration,

    lines: Vec<String>,
    content_bytes: usize,
    consumed: u64,
    truncated: bool,
    last_line_at: Option<Instant>,
}

impl MultilineJoiner {
    pub fn new(config: &MultilineConfig) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(&config.pattern)?,
            negate: config.negate,
            mode: config.match_mode,
            max_lines: config.max_lines.max(1),
            max_bytes: config.max_bytes.max(1),
            timeout: config.timeout,
            lines: Vec::new(),
            content_bytes: 0,
            consumed: 0,
            truncated: false,
            last_line_at: None,
        })
    }

    /// Whether `line` continues the current group.
    fn is_continuation(&self, line: &str) -> bool {
        self.pattern.is_match(line) != self.negate
    }

    /// Feed one physical line; a completed group may fall out.
    pub fn push(&mut self, line: RawLine) -> Option<JoinedLine> {
        let continuation = self.is_continuation(&line.content);
        self.last_line_at = Some(Instant::now());

        match self.mode {
            MatchMode::After => {
                if self.lines.is_empty() || continuation {
                    self.append(line);
                    None
                } else {
                    // A new logical start: flush what we have, begin fresh.
                    let flushed = self.flush();
                    self.append(line);
                    self.last_line_at = Some(Instant::now());
                    flushed
                }
            }
            MatchMode::Before => {
                self.append(line);
                if continuation {
                    None
                } else {
                    self.flush()
                }
            }
        }
    }

    fn append(&mut self, line: RawLine) {
        self.consumed += line.bytes;
        self.truncated |= line.truncated;

        if self.lines.len() >= self.max_lines
            || self.content_bytes + line.content.len() > self.max_bytes
        {
            // Past the cap: count the bytes, drop the content.
            self.truncated = true;
            return;
        }

        self.content_bytes += line.content.len();
        self.lines.push(line.content);
    }

    /// Flush the pending group if the timeout has elapsed with no new line.
    pub fn flush_timed_out(&mut self) -> Option<JoinedLine> {
        let last = self.last_line_at?;
        if last.elapsed() >= self.timeout {
            self.flush()
        } else {
            None
        }
    }

    /// Force-flush the pending group (close, shutdown).
    pub fn flush(&mut self) -> Option<JoinedLine> {
        if self.lines.is_empty() && self.consumed == 0 {
            return None;
        }

        let joined = JoinedLine {
            content: self.lines.join("\n"),
            bytes: self.consumed,
            truncated: self.truncated,
        };

        self.lines.clear();
        self.content_bytes = 0;
        self.consumed = 0;
        self.truncated = false;
        self.last_line_at = None;

        Some(joined)
    }

    pub fn has_pending(&self) -> bool {
        !self.lines.is_empty() || self.consumed > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pattern: &str, negate: bool, mode: MatchMode) -> MultilineConfig {
        MultilineConfig {
            pattern: pattern.to_string(),
            negate,
            match_mode: mode,
            max_lines: default_max_lines(),
            max_bytes: default_max_group_bytes(),
            timeout: Duration::from_millis(50),
        }
    }

    fn raw(content: &str) -> RawLine {
        RawLine {
            content: content.to_string(),
            bytes: content.len() as u64 + 1,
            truncated: false,
        }
    }

    #[test]
    fn test_after_mode_java_stacktrace() {
        // Lines not starting with a timestamp continue the previous event.
        let cfg = config(r"^\d{4}-", true, MatchMode::After);
        let mut joiner = MultilineJoiner::new(&cfg).unwrap();

        assert_eq!(joiner.push(raw("2024-01-01 boom")), None);
        assert_eq!(joiner.push(raw("  at foo.bar()")), None);
        assert_eq!(joiner.push(raw("  at baz.qux()")), None);

        let flushed = joiner.push(raw("2024-01-02 next")).unwrap();
        assert_eq!(
            flushed.content,
            "2024-01-01 boom\n  at foo.bar()\n  at baz.qux()"
        );
        assert_eq!(flushed.bytes, 16 + 15 + 15);

        let last = joiner.flush().unwrap();
        assert_eq!(last.content, "2024-01-02 next");
    }

    #[test]
    fn test_before_mode() {
        // Lines ending in a backslash are continued by the following line.
        let cfg = config(r"\\$", false, MatchMode::Before);
        let mut joiner = MultilineJoiner::new(&cfg).unwrap();

        assert_eq!(joiner.push(raw("part one \\")), None);
        assert_eq!(joiner.push(raw("part two \\")), None);

        let flushed = joiner.push(raw("done")).unwrap();
        assert_eq!(flushed.content, "part one \\\npart two \\\ndone");
        assert!(!joiner.has_pending());
    }

    #[test]
    fn test_max_lines_drops_excess_but_counts_bytes() {
        let mut cfg = config(r"^start", true, MatchMode::After);
        cfg.max_lines = 2;
        let mut joiner = MultilineJoiner::new(&cfg).unwrap();

        joiner.push(raw("start"));
        joiner.push(raw("kept"));
        joiner.push(raw("dropped"));
        joiner.push(raw("also dropped"));

        let flushed = joiner.push(raw("start again")).unwrap();
        assert_eq!(flushed.content, "start\nkept");
        assert!(flushed.truncated);
        // Dropped lines still count toward the committed offset.
        assert_eq!(flushed.bytes, 6 + 5 + 8 + 13);
    }

    #[test]
    fn test_timeout_flush() {
        let cfg = config(r"^start", true, MatchMode::After);
        let mut joiner = MultilineJoiner::new(&cfg).unwrap();

        joiner.push(raw("start"));
        joiner.push(raw("more"));

        assert_eq!(joiner.flush_timed_out(), None);
        std::thread::sleep(Duration::from_millis(60));

        let flushed = joiner.flush_timed_out().unwrap();
        assert_eq!(flushed.content, "start\nmore");
        assert_eq!(joiner.flush_timed_out(), None);
    }

    #[test]
    fn test_force_flush_empty() {
        let cfg = config(r"x", false, MatchMode::After);
        let mut joiner = MultilineJoiner::new(&cfg).unwrap();
        assert_eq!(joiner.flush(), None);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let cfg = config(r"(unclosed", false, MatchMode::After);
        assert!(MultilineJoiner::new(&cfg).unwrap_err().is_config());
    }
}

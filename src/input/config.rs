// SPDX-License-Identifier: Apache-2.0

//! Per-input configuration.
//!
//! An input is either defined inline from CLI flags or loaded from a TOML
//! fragment in the reload-watched config directory. Validation is eager:
//! every error here is fatal at startup (exit code 1) and only logged when
//! it comes from a runtime reload.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::harvester::encoding::LineEncoding;
use crate::harvester::multiline::MultilineConfig;
use crate::scanner::Scanner;

/// Humantime-encoded durations in config fragments ("10s", "5m").
pub mod duration {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<std::time::Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}

/// Optional humantime durations; absent means disabled.
pub mod duration_opt {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Option<std::time::Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            None => Ok(None),
            Some(t) => humantime::parse_duration(&t)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    #[default]
    Log,
    Stdin,
}

/// JSON line decoding options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JsonConfig {
    /// Field holding the text that multiline/filtering applies to.
    pub message_key: Option<String>,
    /// Merge decoded keys into the event top level instead of under `json`.
    pub keys_under_root: bool,
    /// Record decode failures in an `error` field instead of dropping them.
    pub add_error_key: bool,
}

fn default_name() -> String {
    "default".to_string()
}

fn default_scan_frequency() -> Duration {
    Duration::from_secs(10)
}

fn default_close_inactive() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_harvester_buffer_size() -> usize {
    16 * 1024
}

fn default_max_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_backoff_factor() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: InputKind,

    /// Glob patterns of files to harvest.
    pub paths: Vec<String>,
    /// Regexes excluding matched paths.
    pub exclude_files: Vec<String>,
    pub encoding: String,
    pub recursive_glob: bool,

    #[serde(with = "duration")]
    pub scan_frequency: Duration,
    /// Files not modified for this long are not picked up for harvesting.
    /// Gates new starts only; an open harvester is never closed by age.
    #[serde(with = "duration_opt")]
    pub ignore_older: Option<Duration>,
    /// Start new files at their end on the first scan.
    pub tail_files: bool,

    #[serde(with = "duration")]
    pub close_inactive: Duration,
    pub close_removed: bool,
    pub close_renamed: bool,
    pub close_eof: bool,

    pub harvester_buffer_size: usize,
    /// Cap on a single message's bytes; longer lines are truncated.
    pub max_bytes: usize,

    #[serde(with = "duration")]
    pub backoff: Duration,
    #[serde(with = "duration")]
    pub max_backoff: Duration,
    pub backoff_factor: u32,

    pub multiline: Option<MultilineConfig>,
    pub json: Option<JsonConfig>,

    /// Drop registry entries for files unseen for this long.
    #[serde(with = "duration_opt")]
    pub clean_inactive: Option<Duration>,
    /// Drop registry entries once the file is gone from disk.
    pub clean_removed: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            kind: InputKind::Log,
            paths: Vec::new(),
            exclude_files: Vec::new(),
            encoding: "plain".to_string(),
            recursive_glob: true,
            scan_frequency: default_scan_frequency(),
            ignore_older: None,
            tail_files: false,
            close_inactive: default_close_inactive(),
            close_removed: true,
            close_renamed: false,
            close_eof: false,
            harvester_buffer_size: default_harvester_buffer_size(),
            max_bytes: default_max_bytes(),
            backoff: default_backoff(),
            max_backoff: default_max_backoff(),
            backoff_factor: default_backoff_factor(),
            multiline: None,
            json: None,
            clean_inactive: None,
            clean_removed: true,
        }
    }
}

impl InputConfig {
    /// Parse one TOML config fragment.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: InputConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }

    /// Fail-fast validation, run before any harvester starts.
    pub fn validate(&self) -> Result<()> {
        if self.kind == InputKind::Log && self.paths.is_empty() {
            return Err(Error::Config(format!(
                "No paths were defined for input {}",
                self.name
            )));
        }

        LineEncoding::for_label(&self.encoding)?;

        if self.kind == InputKind::Log {
            // Compiles globs and exclude regexes.
            Scanner::new(&self.paths, &self.exclude_files, self.recursive_glob)?;
        }

        if let Some(multiline) = &self.multiline {
            regex::Regex::new(&multiline.pattern)?;

            if let Some(json) = &self.json {
                if json.message_key.is_none() {
                    return Err(Error::Config(
                        "When using the JSON decoder and multiline together, \
                         you need to specify a message_key value"
                            .to_string(),
                    ));
                }
            }
        }

        if let Some(clean_inactive) = self.clean_inactive {
            let floor = self.ignore_older.unwrap_or_default() + self.scan_frequency;
            if clean_inactive <= floor {
                return Err(Error::Config(
                    "clean_inactive must be > ignore_older + scan_frequency to make sure \
                     only files which are not monitored anymore are removed"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

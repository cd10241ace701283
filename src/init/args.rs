// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::error::Result;
use crate::harvester::multiline::MultilineConfig;
use crate::input::config::{InputConfig, InputKind, JsonConfig};

/// Input type for the inline input.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum InputTypeArg {
    /// Tail files matched by --path globs
    #[default]
    Log,
    /// Read lines from standard input
    Stdin,
}

/// Where published events go.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputArg {
    /// JSON lines on stdout
    #[default]
    Console,
    /// JSON lines appended to --output-file
    File,
}

#[derive(Debug, Args, Clone)]
pub struct AgentRun {
    /// Daemonize
    #[arg(long, env = "LOGTAIL_DAEMON", default_value = "false")]
    pub daemon: bool,

    /// PID file
    #[arg(long, env = "LOGTAIL_PID_FILE", default_value = "/tmp/logtail.pid")]
    pub pid_file: String,

    /// Log file (used when daemonized)
    #[arg(long, env = "LOGTAIL_LOG_FILE", default_value = "/tmp/logtail.log")]
    pub log_file: String,

    /// Input type of the inline input
    #[arg(
        value_enum,
        long = "input-type",
        env = "LOGTAIL_INPUT_TYPE",
        default_value = "log"
    )]
    pub input_type: InputTypeArg,

    /// Comma-separated glob patterns of files to harvest
    #[arg(long = "path", env = "LOGTAIL_PATHS", value_delimiter = ',')]
    pub paths: Vec<String>,

    /// Comma-separated regexes excluding matched file paths
    #[arg(long, env = "LOGTAIL_EXCLUDE_FILES", value_delimiter = ',')]
    pub exclude_files: Vec<String>,

    /// File encoding (plain, utf-8, utf-16le, utf-16be, latin1, ...)
    #[arg(long, env = "LOGTAIL_ENCODING", default_value = "plain")]
    pub encoding: String,

    /// Treat ** in path patterns as a single *
    #[arg(long, env = "LOGTAIL_DISABLE_RECURSIVE_GLOB", default_value = "false")]
    pub disable_recursive_glob: bool,

    /// How often to scan for new and changed files
    #[arg(long, env = "LOGTAIL_SCAN_FREQUENCY", default_value = "10s",
        value_parser = humantime::parse_duration)]
    pub scan_frequency: Duration,

    /// Skip files last modified longer ago than this
    #[arg(long, env = "LOGTAIL_IGNORE_OLDER", value_parser = humantime::parse_duration)]
    pub ignore_older: Option<Duration>,

    /// Start reading new files at their end on the first scan
    #[arg(long, env = "LOGTAIL_TAIL_FILES", default_value = "false")]
    pub tail_files: bool,

    /// Close a harvester after this long without new data
    #[arg(long, env = "LOGTAIL_CLOSE_INACTIVE", default_value = "5m",
        value_parser = humantime::parse_duration)]
    pub close_inactive: Duration,

    /// Close a harvester when its file is removed
    #[arg(long, env = "LOGTAIL_CLOSE_REMOVED", default_value = "true",
        action = clap::ArgAction::Set)]
    pub close_removed: bool,

    /// Close a harvester when its file is renamed
    #[arg(long, env = "LOGTAIL_CLOSE_RENAMED", default_value = "false",
        action = clap::ArgAction::Set)]
    pub close_renamed: bool,

    /// Close a harvester at end of file (batch mode)
    #[arg(long, env = "LOGTAIL_CLOSE_EOF", default_value = "false")]
    pub close_eof: bool,

    /// Read buffer size per harvester, in bytes
    #[arg(long, env = "LOGTAIL_HARVESTER_BUFFER_SIZE", default_value = "16384")]
    pub harvester_buffer_size: usize,

    /// Maximum bytes of a single message; longer lines are truncated
    #[arg(long, env = "LOGTAIL_MAX_BYTES", default_value = "10485760")]
    pub max_bytes: usize,

    /// Multiline continuation pattern; enables multiline aggregation
    #[arg(long, env = "LOGTAIL_MULTILINE_PATTERN")]
    pub multiline_pattern: Option<String>,

    /// Negate the multiline pattern
    #[arg(long, env = "LOGTAIL_MULTILINE_NEGATE", default_value = "false")]
    pub multiline_negate: bool,

    /// Where continuation lines attach: after or before
    #[arg(long, env = "LOGTAIL_MULTILINE_MATCH", default_value = "after")]
    pub multiline_match: String,

    /// Maximum physical lines aggregated into one event
    #[arg(long, env = "LOGTAIL_MULTILINE_MAX_LINES", default_value = "500")]
    pub multiline_max_lines: usize,

    /// Flush a pending multiline group after this long without a new line
    #[arg(long, env = "LOGTAIL_MULTILINE_TIMEOUT", default_value = "5s",
        value_parser = humantime::parse_duration)]
    pub multiline_timeout: Duration,

    /// Decode each line as JSON
    #[arg(long, env = "LOGTAIL_JSON", default_value = "false")]
    pub json: bool,

    /// JSON field holding the message text
    #[arg(long, env = "LOGTAIL_JSON_MESSAGE_KEY")]
    pub json_message_key: Option<String>,

    /// Merge decoded JSON keys into the event top level
    #[arg(long, env = "LOGTAIL_JSON_KEYS_UNDER_ROOT", default_value = "false")]
    pub json_keys_under_root: bool,

    /// Record JSON decode failures in an error field
    #[arg(long, env = "LOGTAIL_JSON_ADD_ERROR_KEY", default_value = "false")]
    pub json_add_error_key: bool,

    /// Drop registry entries for files unseen for this long
    #[arg(long, env = "LOGTAIL_CLEAN_INACTIVE", value_parser = humantime::parse_duration)]
    pub clean_inactive: Option<Duration>,

    /// Drop registry entries once their file is gone from disk
    #[arg(long, env = "LOGTAIL_CLEAN_REMOVED", default_value = "true",
        action = clap::ArgAction::Set)]
    pub clean_removed: bool,

    /// Registry file path (parent directories are created)
    #[arg(long, env = "LOGTAIL_REGISTRY_FILE", default_value = "data/registry.json")]
    pub registry_file: PathBuf,

    /// Directory of TOML input fragments, reloaded at runtime
    #[arg(long, env = "LOGTAIL_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// How often to check the config directory for changes
    #[arg(long, env = "LOGTAIL_RELOAD_PERIOD", default_value = "10s",
        value_parser = humantime::parse_duration)]
    pub reload_period: Duration,

    /// Maximum concurrently open harvesters across all inputs (0 = unlimited)
    #[arg(long, env = "LOGTAIL_HARVESTER_LIMIT", default_value = "0")]
    pub harvester_limit: usize,

    /// Output sink
    #[arg(value_enum, long, env = "LOGTAIL_OUTPUT", default_value = "console")]
    pub output: OutputArg,

    /// Output file path (with --output file)
    #[arg(long, env = "LOGTAIL_OUTPUT_FILE")]
    pub output_file: Option<PathBuf>,

    /// How long shutdown waits for harvesters and the pipeline to drain
    #[arg(long, env = "LOGTAIL_SHUTDOWN_TIMEOUT", default_value = "10s",
        value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,
}

impl AgentRun {
    /// Build the inline input from CLI flags, if one is configured.
    ///
    /// Returns None when neither --path patterns nor the stdin type are
    /// given; inputs may then still come from --config-dir.
    pub fn inline_input(&self) -> Result<Option<InputConfig>> {
        if self.input_type == InputTypeArg::Log && self.paths.is_empty() {
            return Ok(None);
        }

        let multiline = match &self.multiline_pattern {
            None => None,
            Some(pattern) => Some(MultilineConfig {
                pattern: pattern.clone(),
                negate: self.multiline_negate,
                match_mode: self.multiline_match.parse()?,
                max_lines: self.multiline_max_lines,
                max_bytes: self.max_bytes,
                timeout: self.multiline_timeout,
            }),
        };

        let json = (self.json
            || self.json_message_key.is_some()
            || self.json_keys_under_root
            || self.json_add_error_key)
            .then(|| JsonConfig {
                message_key: self.json_message_key.clone(),
                keys_under_root: self.json_keys_under_root,
                add_error_key: self.json_add_error_key,
            });

        Ok(Some(InputConfig {
            kind: match self.input_type {
                InputTypeArg::Log => InputKind::Log,
                InputTypeArg::Stdin => InputKind::Stdin,
            },
            paths: self.paths.clone(),
            exclude_files: self.exclude_files.clone(),
            encoding: self.encoding.clone(),
            recursive_glob: !self.disable_recursive_glob,
            scan_frequency: self.scan_frequency,
            ignore_older: self.ignore_older,
            tail_files: self.tail_files,
            close_inactive: self.close_inactive,
            close_removed: self.close_removed,
            close_renamed: self.close_renamed,
            close_eof: self.close_eof,
            harvester_buffer_size: self.harvester_buffer_size,
            max_bytes: self.max_bytes,
            multiline,
            json,
            clean_inactive: self.clean_inactive,
            clean_removed: self.clean_removed,
            ..Default::default()
        }))
    }
}

// SPDX-License-Identifier: Apache-2.0

//! The harvester: one task per actively-tailed file.
//!
//! A harvester exclusively owns its file handle, reads incrementally from
//! the committed offset, and emits line events into the publish channel.
//! It detects truncation (restart at zero), enforces the close_* policies
//! against last-activity timestamps, and commits a confirmed final offset
//! before its task exits so a graceful close never loses progress.
//!
//! Harvesters run as blocking tasks (`spawn_blocking`): file reads and the
//! backpressuring channel send are both blocking operations, and the
//! process-wide harvester limit bounds how many such tasks exist.

pub mod encoding;
pub mod limit;
pub mod multiline;
pub mod reader;

use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Map;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::error::{Error, Result};
use crate::event::{Event, EventBatch};
use crate::identity::FileIdentity;
use crate::input::config::{InputConfig, JsonConfig};
use crate::registrar::RegistrarHandle;
use crate::states::{SharedStates, State, StateUpdate};

use encoding::LineEncoding;
use limit::HarvesterTicket;
use multiline::MultilineJoiner;
use reader::{LineReader, RawLine};

/// Events accumulated before a channel send.
const EVENT_BATCH_SIZE: usize = 50;

/// Sleep quantum so idle backoff stays responsive to cancellation.
const SLEEP_QUANTUM: Duration = Duration::from_millis(100);

/// Wait cap for the confirmed final commit during close.
const FINAL_COMMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-input dependencies shared by all of its harvesters.
#[derive(Clone)]
pub struct HarvesterContext {
    pub config: Arc<InputConfig>,
    pub out: BoundedSender<EventBatch>,
    pub registrar: RegistrarHandle,
    pub states: SharedStates,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Eof,
    Inactive,
    Removed,
    Renamed,
    Shutdown,
    ReadError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileStatus {
    Unchanged,
    Truncated,
    Removed,
    Renamed,
}

pub struct Harvester {
    ctx: HarvesterContext,
    state: State,
    reader: LineReader<File>,
    joiner: Option<MultilineJoiner>,
    /// Decoded fields of a multiline group's first line, held until flush.
    pending_fields: Option<Map<String, serde_json::Value>>,
    batch: Vec<Event>,
    ticket: HarvesterTicket,
}

impl Harvester {
    /// Open the file at the state's committed offset.
    ///
    /// The caller resolves which offset to use; this only guards against the
    /// file changing between scan and open (treated as removed, retried next
    /// scan) and against an offset beyond the current size (truncated while
    /// closed, restart from zero).
    pub fn open(ctx: HarvesterContext, mut state: State, ticket: HarvesterTicket) -> Result<Self> {
        let mut file = File::open(&state.source)?;

        let identity = FileIdentity::of_file(&file)?;
        if identity != state.identity {
            return Err(Error::FileNotFound(state.source.clone()));
        }

        let size = file.metadata()?.len();
        if state.offset > size {
            debug!(
                path = %state.source.display(),
                offset = state.offset,
                size = size,
                "Stored offset is past the end of file, starting from the beginning"
            );
            state.offset = 0;
        }
        file.seek(SeekFrom::Start(state.offset))?;

        let line_encoding = LineEncoding::for_label(&ctx.config.encoding)?;
        let reader = LineReader::new(
            file,
            line_encoding,
            ctx.config.harvester_buffer_size,
            ctx.config.max_bytes,
        );

        let joiner = match &ctx.config.multiline {
            Some(cfg) => Some(MultilineJoiner::new(cfg)?),
            None => None,
        };

        Ok(Self {
            ctx,
            state,
            reader,
            joiner,
            pending_fields: None,
            batch: Vec::new(),
            ticket,
        })
    }

    /// Run until a close condition. Blocking; consumed by `spawn_blocking`.
    pub fn run(mut self) {
        info!(
            path = %self.state.source.display(),
            offset = self.state.offset,
            "Harvester started for file"
        );

        let reason = self.harvest();
        self.close(reason);
    }

    fn harvest(&mut self) -> CloseReason {
        let mut backoff = self.ctx.config.backoff;
        let mut last_activity = Instant::now();

        loop {
            if self.ctx.cancel.is_cancelled() {
                return CloseReason::Shutdown;
            }

            // Drain everything currently readable.
            let mut got_data = false;
            loop {
                match self.reader.next_line() {
                    Ok(Some(raw)) => {
                        got_data = true;
                        self.handle_line(raw);
                        if self.batch.len() >= EVENT_BATCH_SIZE && !self.ship() {
                            return CloseReason::Shutdown;
                        }
                        if self.ctx.cancel.is_cancelled() {
                            return CloseReason::Shutdown;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!(
                            path = %self.state.source.display(),
                            error = %e,
                            "Read error, closing harvester"
                        );
                        return CloseReason::ReadError;
                    }
                }
            }

            if got_data {
                last_activity = Instant::now();
                backoff = self.ctx.config.backoff;
            }

            // A pending multiline group flushes once its timeout passes,
            // even if no new start line ever arrives.
            if let Some(joiner) = &mut self.joiner {
                if let Some(joined) = joiner.flush_timed_out() {
                    let fields = self.pending_fields.take();
                    self.emit_joined(joined, fields);
                }
            }

            if !self.batch.is_empty() && !self.ship() {
                return CloseReason::Shutdown;
            }

            if self.ctx.config.close_eof {
                return CloseReason::Eof;
            }

            match self.check_file() {
                Ok(FileStatus::Unchanged) => {}
                Ok(FileStatus::Truncated) => {
                    info!("File was truncated. Begin reading file from offset 0.");
                    if self.restart_at_zero().is_err() {
                        return CloseReason::ReadError;
                    }
                    last_activity = Instant::now();
                    continue;
                }
                Ok(FileStatus::Removed) => {
                    if self.ctx.config.close_removed {
                        return CloseReason::Removed;
                    }
                }
                Ok(FileStatus::Renamed) => {
                    if self.ctx.config.close_renamed {
                        return CloseReason::Renamed;
                    }
                    // Identity is authoritative: keep reading, but track the
                    // new path so state and output stay truthful.
                    if let Ok(new_path) = crate::identity::path_of_file(self.reader.get_mut()) {
                        debug!(
                            old = %self.state.source.display(),
                            new = %new_path.display(),
                            "File rename was detected"
                        );
                        self.state.source = new_path;
                        self.ctx.states.lock().unwrap().update(self.state.clone());
                    }
                }
                Err(e) => {
                    // The handle itself failed; nothing more to read.
                    error!(path = %self.state.source.display(), error = %e, "File check failed");
                    return CloseReason::ReadError;
                }
            }

            if last_activity.elapsed() >= self.ctx.config.close_inactive {
                return CloseReason::Inactive;
            }

            if !self.sleep_cancellable(backoff) {
                return CloseReason::Shutdown;
            }
            backoff = (backoff * self.ctx.config.backoff_factor).min(self.ctx.config.max_backoff);
        }
    }

    /// Route one physical line through JSON decode and multiline joining.
    fn handle_line(&mut self, raw: RawLine) {
        let json_config = self.ctx.config.json.clone();

        match &mut self.joiner {
            Some(joiner) => {
                let (raw, mut fields) = match &json_config {
                    Some(json) => {
                        // Multiline matches against the message_key value of
                        // each decoded line; the group keeps the fields of
                        // its first line.
                        let (message, fields) = decode_json_line(json, &raw.content);
                        (
                            RawLine {
                                content: message.unwrap_or(raw.content),
                                bytes: raw.bytes,
                                truncated: raw.truncated,
                            },
                            fields,
                        )
                    }
                    None => (raw, None),
                };

                let was_empty = !joiner.has_pending();
                let flushed = joiner.push(raw);

                // Fields follow the group's first line: a flush of a group
                // that began with this very line takes this line's fields,
                // otherwise the held ones.
                let group_fields = match &flushed {
                    Some(_) if was_empty => fields.take(),
                    Some(_) => self.pending_fields.take(),
                    None => None,
                };
                if joiner.has_pending() && (was_empty || flushed.is_some()) {
                    self.pending_fields = fields.take();
                }

                if let Some(joined) = flushed {
                    self.emit_joined(joined, group_fields);
                }
            }
            None => {
                self.state.offset += raw.bytes;
                self.state.timestamp = chrono::Utc::now();

                if raw.content.is_empty() {
                    // Offset advances, no event content.
                    self.batch.push(Event::new(None, &self.state));
                    return;
                }

                let mut event = match &json_config {
                    Some(json) => {
                        let (message, fields) = decode_json_line(json, &raw.content);
                        let mut event = Event::new(message, &self.state);
                        event.fields = fields;
                        event.fields_under_root = json.keys_under_root;
                        event
                    }
                    None => Event::new(Some(raw.content), &self.state),
                };
                event.truncated = raw.truncated;
                self.batch.push(event);
            }
        }
    }

    fn emit_joined(&mut self, joined: multiline::JoinedLine, fields: Option<Map<String, serde_json::Value>>) {
        self.state.offset += joined.bytes;
        self.state.timestamp = chrono::Utc::now();

        let message = (!joined.content.is_empty()).then_some(joined.content);
        let mut event = Event::new(message, &self.state);
        event.truncated = joined.truncated;
        event.fields = fields;
        if let Some(json) = &self.ctx.config.json {
            event.fields_under_root = json.keys_under_root;
        }
        self.batch.push(event);
    }

    /// Send the accumulated batch. False means the pipeline is gone and the
    /// harvester should shut down.
    fn ship(&mut self) -> bool {
        if self.batch.is_empty() {
            return true;
        }

        self.ctx
            .states
            .lock()
            .unwrap()
            .update(self.state.clone());

        let events = std::mem::take(&mut self.batch);
        self.ctx.out.send_blocking(EventBatch::new(events)).is_ok()
    }

    /// Stat the owned handle and the original path to classify what happened
    /// to the file since the last cycle.
    fn check_file(&mut self) -> std::io::Result<FileStatus> {
        let file = self.reader.get_mut();
        let metadata = file.metadata()?;

        if metadata.len() < self.state.offset {
            return Ok(FileStatus::Truncated);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if metadata.nlink() == 0 {
                return Ok(FileStatus::Removed);
            }
        }

        match FileIdentity::of_path(&self.state.source) {
            Ok(identity) if identity == self.state.identity => Ok(FileStatus::Unchanged),
            Ok(_) => Ok(FileStatus::Renamed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Identity is authoritative: with the inode still linked the
                // file was moved elsewhere, otherwise it is gone.
                if cfg!(unix) {
                    Ok(FileStatus::Renamed)
                } else {
                    Ok(FileStatus::Removed)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn restart_at_zero(&mut self) -> std::io::Result<()> {
        self.reader.reset();
        if let Some(joiner) = &mut self.joiner {
            joiner.flush();
        }
        self.pending_fields = None;
        self.reader.get_mut().seek(SeekFrom::Start(0))?;
        self.state.offset = 0;
        self.state.timestamp = chrono::Utc::now();
        // Make the reset durable so a crash cannot resume past the new end.
        self.batch.push(Event::new(None, &self.state));
        Ok(())
    }

    /// Interruptible sleep; false when cancelled.
    fn sleep_cancellable(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.ctx.cancel.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            std::thread::sleep(SLEEP_QUANTUM.min(remaining));
        }
    }

    fn close(mut self, reason: CloseReason) {
        // A pending multiline group is flushed, never dropped.
        if let Some(joiner) = &mut self.joiner {
            if let Some(joined) = joiner.flush() {
                let fields = self.pending_fields.take();
                self.emit_joined(joined, fields);
            }
        }

        match reason {
            CloseReason::Eof => {
                info!("End of file reached. Closing because close_eof is enabled.")
            }
            CloseReason::Inactive => info!(
                "File is inactive. Closing because close_inactive of {:?} reached.",
                self.ctx.config.close_inactive
            ),
            CloseReason::Removed => {
                info!("File was removed. Closing because close_removed is enabled.")
            }
            CloseReason::Renamed => {
                info!("File was renamed. Closing because close_renamed is enabled.")
            }
            CloseReason::Shutdown => debug!("Harvester stopping on shutdown"),
            CloseReason::ReadError => {}
        }
        info!("Closing file: {}", self.state.source.display());

        self.state.finished = true;
        self.state.timestamp = chrono::Utc::now();

        {
            let mut states = self.ctx.states.lock().unwrap();
            states.mark_finished(&self.state.identity, self.state.offset);
        }

        // Final confirmed commit, ordered behind any events still in the
        // publish channel. Falls back to a direct registrar commit when the
        // publisher is already gone.
        let mut final_events = std::mem::take(&mut self.batch);
        final_events.push(Event::new(None, &self.state));

        let (done_tx, done_rx) = flume::bounded(1);
        let sent = self
            .ctx
            .out
            .send_blocking(EventBatch {
                events: final_events,
                done: Some(done_tx),
            })
            .is_ok();

        let confirmed = sent && done_rx.recv_timeout(FINAL_COMMIT_TIMEOUT).is_ok();
        if !confirmed {
            if let Err(e) = self
                .ctx
                .registrar
                .commit_confirmed_blocking(vec![StateUpdate::Set(self.state.clone())])
            {
                warn!(
                    path = %self.state.source.display(),
                    error = %e,
                    "Failed to commit final harvester state"
                );
            }
        }

        debug!(
            path = %self.state.source.display(),
            offset = self.state.offset,
            "Harvester closed"
        );
        drop(self.ticket);
    }
}

/// Decode one line as JSON per the input's json config.
///
/// Returns the extracted message (from `message_key`, when present and a
/// string) and the decoded fields. Undecodable lines keep their raw text as
/// the message; with `add_error_key` the failure is recorded in an `error`
/// field.
fn decode_json_line(
    config: &JsonConfig,
    content: &str,
) -> (Option<String>, Option<Map<String, serde_json::Value>>) {
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(serde_json::Value::Object(mut map)) => {
            let message = config.message_key.as_ref().and_then(|key| {
                map.get(key)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            });
            if let Some(key) = &config.message_key {
                map.remove(key);
            }
            (message, Some(map))
        }
        Ok(other) => {
            // Valid JSON but not an object; keep it as the message text.
            (Some(other.to_string()), None)
        }
        Err(e) => {
            let fields = config.add_error_key.then(|| {
                let mut map = Map::new();
                map.insert(
                    "error".to_string(),
                    serde_json::Value::String(format!("Error decoding JSON: {}", e)),
                );
                map
            });
            (Some(content.to_string()), fields)
        }
    }
}

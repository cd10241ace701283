// SPDX-License-Identifier: Apache-2.0

//! Events emitted by harvesters toward the publisher.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::states::State;

/// One logical log line (possibly a multiline aggregate) read from a source.
///
/// An event without a message is a bare offset advance: empty lines and
/// registry-only updates flow through the same channel so that ordering with
/// surrounding events is preserved.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
    /// Decoded JSON fields when the input has a JSON decoder configured.
    pub fields: Option<serde_json::Map<String, serde_json::Value>>,
    /// Merge fields into the output top level instead of under `json`.
    pub fields_under_root: bool,
    pub source: PathBuf,
    /// Byte offset after this event's content.
    pub offset: u64,
    /// Set when a line or multiline group was cut at its size cap.
    pub truncated: bool,
    /// State snapshot to commit once this event has been published.
    /// None for sources without durable state (stdin).
    pub update: Option<State>,
}

impl Event {
    pub fn new(message: Option<String>, state: &State) -> Self {
        Self {
            timestamp: Utc::now(),
            message,
            fields: None,
            fields_under_root: false,
            source: state.source.clone(),
            offset: state.offset,
            truncated: false,
            update: Some(state.clone()),
        }
    }

    pub fn has_message(&self) -> bool {
        self.message.is_some() || self.fields.is_some()
    }
}

/// A batch of events plus an optional completion signal.
///
/// When `done` is set, the publisher acknowledges it only after the batch has
/// been written to the sink and its state updates have been durably committed
/// by the registrar. Harvesters use this for their final close commit.
pub struct EventBatch {
    pub events: Vec<Event>,
    pub done: Option<flume::Sender<()>>,
}

impl EventBatch {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events, done: None }
    }
}

// SPDX-License-Identifier: Apache-2.0

//! The publisher: the acknowledgement boundary of the pipeline.
//!
//! Drains event batches from the harvesters, writes them as JSON lines to
//! the configured sink, and only then forwards the batch's state updates to
//! the registrar. A crash between sink write and registry persist replays
//! the batch on restart: at-least-once, never at-most-once.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::error::{Error, Result};
use crate::event::{Event, EventBatch};
use crate::registrar::{Commit, RegistrarHandle};
use crate::states::StateUpdate;

/// Backoff cap while a sink keeps failing.
const SINK_RETRY_MAX: Duration = Duration::from_secs(5);

/// Where published events go.
pub trait EventSink: Send {
    fn write_batch(&mut self, events: &[Event]) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// JSON lines to stdout.
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn write_batch(&mut self, events: &[Event]) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for event in events {
            if event.has_message() {
                serde_json::to_writer(&mut out, &encode_event(event))?;
                out.write_all(b"\n")?;
            }
        }
        out.flush()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "console"
    }
}

/// JSON lines appended to a file.
pub struct FileSink {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
        })
    }
}

impl EventSink for FileSink {
    fn write_batch(&mut self, events: &[Event]) -> Result<()> {
        for event in events {
            if event.has_message() {
                serde_json::to_writer(&mut self.writer, &encode_event(event))?;
                self.writer.write_all(b"\n")?;
            }
        }
        self.writer
            .flush()
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

fn encode_event(event: &Event) -> serde_json::Value {
    let mut doc = json!({
        "@timestamp": event.timestamp.to_rfc3339(),
        "source": event.source.display().to_string(),
        "offset": event.offset,
    });

    let map = doc.as_object_mut().unwrap();
    if let Some(message) = &event.message {
        map.insert("message".to_string(), json!(message));
    }
    if event.truncated {
        map.insert("truncated".to_string(), json!(true));
    }
    if let Some(fields) = &event.fields {
        if event.fields_under_root {
            for (key, value) in fields {
                // Top-level event keys win on collision.
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        } else {
            map.insert("json".to_string(), serde_json::Value::Object(fields.clone()));
        }
    }

    doc
}

pub struct Publisher {
    rx: BoundedReceiver<EventBatch>,
    sink: Box<dyn EventSink>,
    registrar: RegistrarHandle,
}

impl Publisher {
    pub fn new(
        rx: BoundedReceiver<EventBatch>,
        sink: Box<dyn EventSink>,
        registrar: RegistrarHandle,
    ) -> Self {
        Self {
            rx,
            sink,
            registrar,
        }
    }

    /// Publish until every harvester-side sender is gone.
    pub async fn run(mut self) -> Result<()> {
        debug!(sink = self.sink.name(), "Publisher started");

        while let Some(batch) = self.rx.next().await {
            self.publish(batch).await?;
        }

        debug!("Publisher stopped");
        Ok(())
    }

    async fn publish(&mut self, batch: EventBatch) -> Result<()> {
        // Retry the sink until it takes the batch; losing it would break
        // at-least-once. Backoff here backpressures harvesters through the
        // bounded channel.
        let mut backoff = Duration::from_millis(250);
        loop {
            match self.sink.write_batch(&batch.events) {
                Ok(()) => break,
                Err(e) => {
                    warn!(sink = self.sink.name(), error = %e, "Sink write failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(SINK_RETRY_MAX);
                }
            }
        }

        let updates: Vec<StateUpdate> = batch
            .events
            .iter()
            .filter_map(|e| e.update.clone())
            .map(StateUpdate::Set)
            .collect();

        if updates.is_empty() && batch.done.is_none() {
            return Ok(());
        }

        self.registrar
            .send(Commit {
                updates,
                done: batch.done,
            })
            .await
    }
}

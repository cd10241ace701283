// SPDX-License-Identifier: Apache-2.0

//! Stdin input: a single harvester over standard input.
//!
//! Reuses the line reader, JSON decode and multiline machinery of the file
//! harvester, but carries no durable state: stdin has no identity to resume
//! from. EOF always closes (batch mode).

use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, error};

use crate::error::Result;
use crate::event::{Event, EventBatch};
use crate::harvester::HarvesterContext;
use crate::harvester::encoding::LineEncoding;
use crate::harvester::multiline::MultilineJoiner;
use crate::harvester::reader::LineReader;

const STDIN_SOURCE: &str = "-";
const EVENT_BATCH_SIZE: usize = 50;

pub async fn run(ctx: HarvesterContext) -> Result<()> {
    let handle = tokio::task::spawn_blocking(move || read_loop(ctx));
    handle
        .await
        .map_err(|e| crate::error::Error::Config(format!("stdin task failed: {}", e)))?
}

fn read_loop(ctx: HarvesterContext) -> Result<()> {
    let config = &ctx.config;
    let encoding = LineEncoding::for_label(&config.encoding)?;
    let mut reader = LineReader::new(
        std::io::stdin(),
        encoding,
        config.harvester_buffer_size,
        config.max_bytes,
    );
    let mut joiner = match &config.multiline {
        Some(cfg) => Some(MultilineJoiner::new(cfg)?),
        None => None,
    };

    debug!("Harvester started for stdin");

    let mut offset: u64 = 0;
    let mut batch: Vec<Event> = Vec::new();

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        match reader.next_line() {
            Ok(Some(raw)) => {
                let (content, bytes, truncated) = match &mut joiner {
                    Some(joiner) => match joiner.push(raw) {
                        Some(joined) => (joined.content, joined.bytes, joined.truncated),
                        None => continue,
                    },
                    None => (raw.content, raw.bytes, raw.truncated),
                };
                offset += bytes;
                if !content.is_empty() {
                    batch.push(stdin_event(content, offset, truncated));
                }
                if batch.len() >= EVENT_BATCH_SIZE
                    && ctx
                        .out
                        .send_blocking(EventBatch::new(std::mem::take(&mut batch)))
                        .is_err()
                {
                    return Ok(());
                }
            }
            // Stdin EOF is final: close like close_eof.
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Read error on stdin");
                break;
            }
        }
    }

    if let Some(joiner) = &mut joiner {
        if let Some(joined) = joiner.flush() {
            offset += joined.bytes;
            if !joined.content.is_empty() {
                batch.push(stdin_event(joined.content, offset, joined.truncated));
            }
        }
    }
    if !batch.is_empty() {
        let _ = ctx.out.send_blocking(EventBatch::new(batch));
    }

    debug!(offset = offset, "Stdin harvester finished");
    Ok(())
}

fn stdin_event(message: String, offset: u64, truncated: bool) -> Event {
    Event {
        timestamp: Utc::now(),
        message: Some(message),
        fields: None,
        fields_under_root: false,
        source: PathBuf::from(STDIN_SOURCE),
        offset,
        truncated,
        update: None,
    }
}

// SPDX-License-Identifier: Apache-2.0

//! On-disk registry formats.
//!
//! The current format is versioned and keyed by file identity. The legacy
//! format predates identity keying: a plain JSON object mapping the file
//! path to an entry whose OS identity is nested under `FileStateOS`. The
//! registrar accepts both shapes on load and only ever writes the current
//! one.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::FileIdentity;
use crate::states::State;

/// Current registry schema version.
pub const REGISTRY_VERSION: u8 = 1;

/// Never-expire TTL sentinel.
pub const TTL_NEVER: i64 = -1;

/// Current registry file shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryFile {
    pub version: u8,
    /// Keyed by `FileIdentity::key()`.
    pub states: HashMap<String, RegistryEntry>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            states: HashMap::new(),
        }
    }
}

impl RegistryFile {
    /// True when a raw registry JSON value is in the current shape.
    pub fn is_current(value: &serde_json::Value) -> bool {
        value.get("version").is_some() && value.get("states").is_some()
    }
}

/// One durable per-file state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Last known path of the file.
    pub source: String,
    /// Committed read offset in bytes.
    pub offset: u64,
    /// Last commit touching this entry.
    pub timestamp: DateTime<Utc>,
    /// Seconds a finished entry is retained; `TTL_NEVER` keeps it forever.
    pub ttl: i64,
    pub identity: FileIdentity,
}

impl RegistryEntry {
    pub fn key(&self) -> String {
        self.identity.key()
    }

    pub fn from_state(state: &State) -> Self {
        Self {
            source: state.source.to_string_lossy().into_owned(),
            offset: state.offset,
            timestamp: state.timestamp,
            ttl: state
                .ttl
                .map(|d| d.as_secs() as i64)
                .unwrap_or(TTL_NEVER),
            identity: state.identity,
        }
    }

    pub fn to_state(&self) -> State {
        State {
            identity: self.identity,
            source: self.source.clone().into(),
            offset: self.offset,
            timestamp: self.timestamp,
            ttl: (self.ttl >= 0).then(|| std::time::Duration::from_secs(self.ttl as u64)),
            // Loaded entries never have a live harvester.
            finished: true,
        }
    }
}

/// Legacy registry: path-keyed entries with a nested `FileStateOS`.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct LegacyRegistry(pub HashMap<String, LegacyEntry>);

#[derive(Debug, Deserialize)]
pub struct LegacyEntry {
    #[serde(default)]
    pub source: Option<String>,
    pub offset: u64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Nanoseconds in the legacy format; negative means never.
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(rename = "FileStateOS")]
    pub file_state_os: LegacyFileStateOs,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LegacyFileStateOs {
    Posix { inode: u64, device: u64 },
    Windows { idxhi: u64, idxlo: u64, vol: u64 },
}

impl LegacyFileStateOs {
    pub fn to_identity(&self) -> FileIdentity {
        match *self {
            LegacyFileStateOs::Posix { inode, device } => FileIdentity::Posix {
                device,
                inode,
            },
            LegacyFileStateOs::Windows { idxhi, idxlo, vol } => FileIdentity::Windows {
                volume: vol,
                idx_hi: idxhi,
                idx_lo: idxlo,
            },
        }
    }
}

// SPDX-License-Identifier: Apache-2.0

//! In-memory table of per-file harvesting state.
//!
//! One entry per file identity ever seen by an input. The table is the
//! lifecycle controller's view of the world: an unfinished entry means a
//! harvester currently owns that identity (the exclusivity invariant), a
//! finished entry records where reading stopped so a later harvester can
//! resume. The registrar holds the durable mirror of this table, updated
//! only for published events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::identity::FileIdentity;

/// Harvesting state of a single file identity.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub identity: FileIdentity,
    /// Last known path of the file. Identity is authoritative; the source
    /// changes when a rename is detected.
    pub source: PathBuf,
    /// Byte offset up to which content has been read.
    pub offset: u64,
    /// Last time this state was updated.
    pub timestamp: DateTime<Utc>,
    /// How long a finished state is retained before registry clean-up.
    /// None keeps it forever.
    pub ttl: Option<Duration>,
    /// True once no harvester owns this identity anymore.
    pub finished: bool,
}

impl State {
    pub fn new(identity: FileIdentity, source: PathBuf, offset: u64) -> Self {
        Self {
            identity,
            source,
            offset,
            timestamp: Utc::now(),
            ttl: None,
            finished: false,
        }
    }

    /// Updated copy with a new offset and a fresh timestamp.
    pub fn advanced_to(&self, offset: u64) -> Self {
        Self {
            offset,
            timestamp: Utc::now(),
            ..self.clone()
        }
    }
}

/// A change to be applied to the registrar's durable state.
#[derive(Debug, Clone)]
pub enum StateUpdate {
    Set(State),
    Remove(FileIdentity),
}

/// State table shared between the crawler, its harvesters and the runner.
#[derive(Debug, Default)]
pub struct States {
    by_identity: HashMap<FileIdentity, State>,
}

impl States {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &FileIdentity) -> Option<&State> {
        self.by_identity.get(identity)
    }

    /// Insert or replace the state for its identity.
    pub fn update(&mut self, state: State) {
        self.by_identity.insert(state.identity, state);
    }

    pub fn remove(&mut self, identity: &FileIdentity) -> Option<State> {
        self.by_identity.remove(identity)
    }

    /// Record a new path for an identity without touching its offset (the
    /// owning harvester may be ahead of the caller's snapshot). Returns the
    /// updated state for forwarding to the registrar.
    pub fn set_source(&mut self, identity: &FileIdentity, source: PathBuf) -> Option<State> {
        self.by_identity.get_mut(identity).map(|state| {
            state.source = source;
            state.timestamp = Utc::now();
            state.clone()
        })
    }

    /// Mark an identity finished at the given offset. No-op for unknown
    /// identities.
    pub fn mark_finished(&mut self, identity: &FileIdentity, offset: u64) {
        if let Some(state) = self.by_identity.get_mut(identity) {
            state.offset = offset;
            state.timestamp = Utc::now();
            state.finished = true;
        }
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &State> {
        self.by_identity.values()
    }

    pub fn snapshot(&self) -> Vec<State> {
        self.by_identity.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.by_identity.values().filter(|s| !s.finished).count()
    }

    /// True when no unfinished state has a source accepted by `matches`.
    ///
    /// Used before starting a replacement runner: a new input may only take
    /// over paths once every prior harvester for them has closed.
    pub fn all_finished_matching(&self, matches: impl Fn(&Path) -> bool) -> bool {
        !self
            .by_identity
            .values()
            .any(|s| !s.finished && matches(&s.source))
    }
}

pub type SharedStates = Arc<Mutex<States>>;

pub fn shared() -> SharedStates {
    Arc::new(Mutex::new(States::new()))
}

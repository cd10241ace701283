// SPDX-License-Identifier: Apache-2.0

//! The crawler: per-input harvester lifecycle control.
//!
//! Every `scan_frequency` the crawler runs its scanner and reconciles the
//! result against the state table: start harvesters for new or grown files,
//! resume finished ones at their committed offset, record renames (identity
//! is authoritative, paths are advisory), and clean states for removed
//! files. Starts respect the process-wide harvester limit; files refused at
//! the limit go into a FIFO deferral queue that is serviced before fresh
//! candidates on the next scan, so repeated deferral cannot starve a file.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::SystemTime;

use tokio::select;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::Result;
use crate::harvester::limit::HarvesterLimiter;
use crate::harvester::{Harvester, HarvesterContext};
use crate::scanner::{ScanEntry, Scanner};
use crate::states::{State, StateUpdate};

pub struct Crawler {
    ctx: HarvesterContext,
    scanner: Scanner,
    limiter: HarvesterLimiter,
    harvesters: JoinSet<()>,
    /// Paths deferred at the harvester limit, in discovery order.
    deferred: VecDeque<PathBuf>,
    first_scan: bool,
}

impl Crawler {
    pub fn new(ctx: HarvesterContext, limiter: HarvesterLimiter) -> Result<Self> {
        let config = &ctx.config;
        let scanner = Scanner::new(&config.paths, &config.exclude_files, config.recursive_glob)?;

        Ok(Self {
            ctx,
            scanner,
            limiter,
            harvesters: JoinSet::new(),
            deferred: VecDeque::new(),
            first_scan: true,
        })
    }

    /// Scan on the configured interval until cancelled, then wait for every
    /// harvester to finish its clean close.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.ctx.config.scan_frequency);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticker.tick() => {
                    self.scan_once().await;
                }

                // Reap finished harvester tasks as they close.
                Some(_) = self.harvesters.join_next(), if !self.harvesters.is_empty() => {}

                _ = self.ctx.cancel.cancelled() => break,
            }
        }

        // Harvesters observe the same token; wait for their final commits.
        while self.harvesters.join_next().await.is_some() {}
        Ok(())
    }

    async fn scan_once(&mut self) {
        debug!("Start next scan");

        let entries = self.scanner.scan();
        let mut updates: Vec<StateUpdate> = Vec::new();
        let mut limit_logged = false;

        // Deferred files first, in the order they were first seen.
        let mut by_path: HashMap<PathBuf, ScanEntry> = entries
            .into_iter()
            .map(|e| (e.path.clone(), e))
            .collect();
        let seen: HashSet<_> = by_path.values().map(|e| e.identity).collect();

        let mut ordered = Vec::with_capacity(by_path.len());
        for path in std::mem::take(&mut self.deferred) {
            if let Some(entry) = by_path.remove(&path) {
                ordered.push(entry);
            }
        }
        ordered.extend(by_path.into_values());

        for entry in ordered {
            self.offer(entry, &mut limit_logged, &mut updates);
        }

        if self.ctx.config.clean_removed {
            self.clean_removed(&seen, &mut updates);
        }

        self.first_scan = false;

        if !updates.is_empty() {
            if let Err(e) = self.ctx.registrar.commit(updates).await {
                warn!(error = %e, "Failed to forward state updates to registrar");
            }
        }
    }

    /// Decide what to do with one scanned file.
    fn offer(
        &mut self,
        entry: ScanEntry,
        limit_logged: &mut bool,
        updates: &mut Vec<StateUpdate>,
    ) {
        let existing = {
            let states = self.ctx.states.lock().unwrap();
            states.get(&entry.identity).cloned()
        };

        let size = entry.metadata.len();

        match existing {
            None => {
                if self.is_ignore_older(&entry) {
                    debug!(
                        path = %entry.path.display(),
                        "Ignore file because ignore_older reached"
                    );
                    // Record the state anyway: clean_inactive applies to it,
                    // and later appends resume past today's content instead
                    // of replaying it.
                    let mut state = State::new(entry.identity, entry.path, size);
                    state.finished = true;
                    state.ttl = self.ctx.config.clean_inactive;
                    self.ctx.states.lock().unwrap().update(state.clone());
                    updates.push(StateUpdate::Set(state));
                    return;
                }

                let offset = if self.ctx.config.tail_files && self.first_scan {
                    size
                } else {
                    0
                };
                let state = State::new(entry.identity, entry.path, offset);
                self.try_start(state, limit_logged);
            }

            Some(state) if !state.finished => {
                // A harvester owns this identity. The path may have moved
                // under it; the harvester itself decides about close_renamed.
                if state.source != entry.path {
                    debug!(
                        old = %state.source.display(),
                        new = %entry.path.display(),
                        "File rename was detected"
                    );
                    let renamed = self
                        .ctx
                        .states
                        .lock()
                        .unwrap()
                        .set_source(&entry.identity, entry.path);
                    if let Some(renamed) = renamed {
                        updates.push(StateUpdate::Set(renamed));
                    }
                }
            }

            Some(mut state) => {
                if state.source != entry.path {
                    debug!(
                        old = %state.source.display(),
                        new = %entry.path.display(),
                        "File rename was detected on closed file"
                    );
                    state.source = entry.path.clone();
                    let renamed = self
                        .ctx
                        .states
                        .lock()
                        .unwrap()
                        .set_source(&entry.identity, entry.path.clone());
                    if let Some(renamed) = renamed {
                        updates.push(StateUpdate::Set(renamed));
                    }
                }

                if self.is_ignore_older(&entry) {
                    return;
                }

                if size > state.offset {
                    // New content past the committed offset: resume there,
                    // never from zero.
                    self.try_start(state, limit_logged);
                } else if size < state.offset {
                    debug!(
                        path = %entry.path.display(),
                        offset = state.offset,
                        size = size,
                        "Old file was truncated. Starting from the beginning"
                    );
                    state.offset = 0;
                    self.try_start(state, limit_logged);
                }
            }
        }
    }

    fn is_ignore_older(&self, entry: &ScanEntry) -> bool {
        let Some(ignore_older) = self.ctx.config.ignore_older else {
            return false;
        };
        let age = entry
            .metadata
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok());
        matches!(age, Some(age) if age > ignore_older)
    }

    /// Claim the identity and spawn a harvester, subject to the limit.
    fn try_start(&mut self, mut state: State, limit_logged: &mut bool) {
        let Some(ticket) = self.limiter.try_start() else {
            if !*limit_logged {
                warn!("harvester limit reached");
                *limit_logged = true;
            }
            if !self.deferred.contains(&state.source) {
                self.deferred.push_back(state.source.clone());
            }
            return;
        };

        state.finished = false;
        state.ttl = self.ctx.config.clean_inactive;
        state.timestamp = chrono::Utc::now();

        // Claim the identity before opening; at most one harvester per
        // identity, ever.
        self.ctx.states.lock().unwrap().update(state.clone());

        match Harvester::open(self.ctx.clone(), state.clone(), ticket) {
            Ok(harvester) => {
                self.harvesters.spawn_blocking(move || harvester.run());
            }
            Err(e) => {
                // Permission denied, vanished between scan and open, and the
                // like: release the claim, retry next scan.
                warn!(
                    path = %state.source.display(),
                    error = %e,
                    "Harvester could not be started on file"
                );
                self.ctx
                    .states
                    .lock()
                    .unwrap()
                    .mark_finished(&state.identity, state.offset);
            }
        }
    }

    /// Drop states for finished files that are gone from disk. With
    /// clean_removed disabled, entries are retained so a file reappearing at
    /// the same path with the same identity resumes correctly.
    fn clean_removed(&mut self, seen: &HashSet<crate::identity::FileIdentity>, updates: &mut Vec<StateUpdate>) {
        let removed: Vec<State> = {
            let states = self.ctx.states.lock().unwrap();
            states
                .iter()
                // Only states this input owns; the table is shared.
                .filter(|s| self.scanner.matches(&s.source))
                .filter(|s| s.finished && !seen.contains(&s.identity) && !s.source.exists())
                .cloned()
                .collect()
        };

        if removed.is_empty() {
            return;
        }

        let mut states = self.ctx.states.lock().unwrap();
        for state in removed {
            debug!(
                path = %state.source.display(),
                "Remove state of file as file removed"
            );
            states.remove(&state.identity);
            updates.push(StateUpdate::Remove(state.identity));
        }
    }
}

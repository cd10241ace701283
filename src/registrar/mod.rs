// SPDX-License-Identifier: Apache-2.0

//! The registrar: durable, at-least-once offset store.
//!
//! An owned service with an injected file store, accessed only through
//! load/commit. The registrar task is the single writer to the registry
//! file; commits from every harvester funnel through its channel and are
//! batched, never interleaved at the byte level. Offsets are committed only
//! for events that have left the pipeline (the publisher forwards updates
//! after the sink write), which is what bounds replay after a crash to the
//! last unpersisted batch.

pub mod migration;
pub mod schema;
pub mod store;

use std::time::Duration;

use tokio::select;
use tracing::{debug, info, warn};

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};
use crate::error::{Error, Result};
use crate::states::{State, StateUpdate};

use schema::{LegacyRegistry, RegistryEntry, RegistryFile};
use store::RegistryStore;

const COMMIT_CHANNEL_SIZE: usize = 64;
const GC_INTERVAL: Duration = Duration::from_secs(30);

/// One commit request: updates plus an optional durability confirmation.
pub struct Commit {
    pub updates: Vec<StateUpdate>,
    /// Fired after the updates are applied and persisted. Used by harvester
    /// close paths so graceful shutdown cannot lose a final offset.
    pub done: Option<flume::Sender<()>>,
}

/// Cloneable sender side of the registrar.
#[derive(Clone)]
pub struct RegistrarHandle {
    tx: BoundedSender<Commit>,
}

impl RegistrarHandle {
    pub async fn commit(&self, updates: Vec<StateUpdate>) -> Result<()> {
        self.send(Commit {
            updates,
            done: None,
        })
        .await
    }

    pub async fn send(&self, commit: Commit) -> Result<()> {
        self.tx.send(commit).await.map_err(|_| Error::ChannelSend)
    }

    /// Blocking confirmed commit for harvester threads: returns once the
    /// update has been applied and a persist attempt made.
    pub fn commit_confirmed_blocking(&self, updates: Vec<StateUpdate>) -> Result<()> {
        let (done_tx, done_rx) = flume::bounded(1);
        self.tx
            .send_blocking(Commit {
                updates,
                done: Some(done_tx),
            })
            .map_err(|_| Error::ChannelSend)?;
        done_rx
            .recv_timeout(Duration::from_secs(30))
            .map_err(|_| Error::ChannelSend)?;
        Ok(())
    }
}

pub struct Registrar {
    store: RegistryStore,
    registry: RegistryFile,
    rx: BoundedReceiver<Commit>,
    /// Applied updates not yet persisted (after a failed write).
    dirty: bool,
}

impl Registrar {
    pub fn new(registry_path: impl AsRef<std::path::Path>) -> Result<(Self, RegistrarHandle)> {
        let store = RegistryStore::open(registry_path)?;
        let (tx, rx) = bounded_channel::bounded(COMMIT_CHANNEL_SIZE);

        Ok((
            Self {
                store,
                registry: RegistryFile::default(),
                rx,
                dirty: false,
            },
            RegistrarHandle { tx },
        ))
    }

    /// Load persisted states, migrating the legacy format transparently.
    ///
    /// Returns the resumable states for seeding the in-memory tables. Runs
    /// before any harvester starts; a corrupted registry is a fatal error
    /// rather than a silent restart from zero (which would duplicate data).
    pub fn load(&mut self) -> Result<Vec<State>> {
        let raw = match self.store.load_raw()? {
            Some(raw) => raw,
            None => {
                debug!("No registry file found, starting fresh");
                return Ok(Vec::new());
            }
        };

        if RegistryFile::is_current(&raw) {
            self.registry = serde_json::from_value(raw)
                .map_err(|e| Error::Persistence(format!("invalid registry file: {}", e)))?;
        } else {
            let legacy: LegacyRegistry = serde_json::from_value(raw)
                .map_err(|e| Error::Persistence(format!("invalid legacy registry file: {}", e)))?;

            info!("Old registry states found: {}", legacy.0.len());

            let mut registry = RegistryFile::default();
            let converted = migration::migrate_legacy(legacy, &mut registry);
            self.registry = registry;
            self.persist();

            info!(
                "Old states converted to new states and written to registrar: {}",
                converted
            );
        }

        debug!("States loaded from registrar: {}", self.registry.states.len());
        Ok(self.registry.states.values().map(|e| e.to_state()).collect())
    }

    /// Run the commit loop until every handle is dropped, then persist one
    /// final time.
    pub async fn run(mut self) -> Result<()> {
        let mut gc_tick = tokio::time::interval(GC_INTERVAL);
        gc_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                commit = self.rx.next() => {
                    match commit {
                        Some(commit) => self.handle_commit(commit),
                        None => break,
                    }
                }

                _ = gc_tick.tick() => {
                    // Expire idle entries even when no commits arrive, and
                    // retry a persist that failed earlier.
                    if self.gc() > 0 || self.dirty {
                        self.persist();
                    }
                }
            }
        }

        // Drain anything the publisher pushed right before dropping out.
        while let Some(commit) = self.rx.try_recv() {
            self.handle_commit(commit);
        }

        if self.dirty {
            self.persist();
        }
        debug!("Registrar stopped");
        Ok(())
    }

    fn handle_commit(&mut self, commit: Commit) {
        self.apply(&commit.updates);
        self.gc();
        self.persist();

        if let Some(done) = commit.done {
            let _ = done.send(());
        }
    }

    fn apply(&mut self, updates: &[StateUpdate]) {
        for update in updates {
            match update {
                StateUpdate::Set(state) => {
                    let entry = RegistryEntry::from_state(state);
                    self.registry.states.insert(entry.key(), entry);
                }
                StateUpdate::Remove(identity) => {
                    if self.registry.states.remove(&identity.key()).is_some() {
                        debug!(identity = %identity, "Removed state from registry");
                    }
                }
            }
        }
        if !updates.is_empty() {
            self.dirty = true;
        }
    }

    /// Drop entries whose TTL has expired. Entries with a live harvester
    /// keep a fresh timestamp through regular commits, so only idle ones
    /// age out.
    fn gc(&mut self) -> usize {
        let now = chrono::Utc::now();
        let before = self.registry.states.len();

        self.registry.states.retain(|_, entry| {
            if entry.ttl < 0 {
                return true;
            }
            let age = now.signed_duration_since(entry.timestamp);
            age.num_seconds() <= entry.ttl
        });

        let removed = before - self.registry.states.len();
        if removed > 0 {
            debug!("Cleaned {} expired states from registry", removed);
            self.dirty = true;
        }
        removed
    }

    /// Persist the registry. Failure must not crash harvesting: the state
    /// stays in memory and the next successful commit catches up, at the
    /// cost of a larger replay window on crash.
    fn persist(&mut self) {
        match self.store.save(&self.registry) {
            Ok(()) => {
                self.dirty = false;
                debug!(
                    "Registry file updated. {} states written.",
                    self.registry.states.len()
                );
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist registry, will retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FileIdentity;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn state(inode: u64, offset: u64) -> State {
        State::new(
            FileIdentity::Posix {
                device: 1,
                inode,
            },
            PathBuf::from(format!("/logs/{}.log", inode)),
            offset,
        )
    }

    #[tokio::test]
    async fn test_commit_persists_states() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let (mut registrar, handle) = Registrar::new(&path).unwrap();
        registrar.load().unwrap();

        let task = tokio::spawn(registrar.run());

        handle
            .commit(vec![
                StateUpdate::Set(state(1, 10)),
                StateUpdate::Set(state(2, 20)),
            ])
            .await
            .unwrap();

        drop(handle);
        task.await.unwrap().unwrap();

        let (mut reloaded, _handle) = Registrar::new(&path).unwrap();
        let states = reloaded.load().unwrap();
        assert_eq!(states.len(), 2);

        let s1 = states.iter().find(|s| s.offset == 10).unwrap();
        assert_eq!(s1.source, PathBuf::from("/logs/1.log"));
        assert!(s1.finished);
    }

    #[tokio::test]
    async fn test_updates_replace_per_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let (mut registrar, handle) = Registrar::new(&path).unwrap();
        registrar.load().unwrap();

        let task = tokio::spawn(registrar.run());

        handle
            .commit(vec![StateUpdate::Set(state(1, 10))])
            .await
            .unwrap();
        handle
            .commit(vec![StateUpdate::Set(state(1, 50))])
            .await
            .unwrap();

        drop(handle);
        task.await.unwrap().unwrap();

        let (mut reloaded, _handle) = Registrar::new(&path).unwrap();
        let states = reloaded.load().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].offset, 50);
    }

    #[tokio::test]
    async fn test_remove_update() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let (mut registrar, handle) = Registrar::new(&path).unwrap();
        registrar.load().unwrap();

        let task = tokio::spawn(registrar.run());

        let s = state(1, 10);
        let identity = s.identity;
        handle.commit(vec![StateUpdate::Set(s)]).await.unwrap();
        handle
            .commit(vec![StateUpdate::Remove(identity)])
            .await
            .unwrap();

        drop(handle);
        task.await.unwrap().unwrap();

        let (mut reloaded, _handle) = Registrar::new(&path).unwrap();
        assert!(reloaded.load().unwrap().is_empty());
    }

    #[test]
    fn test_confirmed_blocking_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();

        let (mut registrar, handle) = Registrar::new(&path).unwrap();
        registrar.load().unwrap();
        let task = runtime.spawn(registrar.run());

        // From a plain thread, like a harvester close path.
        let committer = std::thread::spawn(move || {
            handle.commit_confirmed_blocking(vec![StateUpdate::Set(state(7, 77))])
        });
        committer.join().unwrap().unwrap();

        // Confirmed means it is already on disk, before shutdown.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"offset\": 77"));

        runtime.block_on(async move {
            task.abort();
            let _ = task.await;
        });
    }

    #[tokio::test]
    async fn test_load_migrates_legacy_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"{
                "logs/hello.log": {
                    "source": "logs/hello.log",
                    "offset": 4,
                    "FileStateOS": { "inode": 917214, "device": 64768 }
                }
            }"#,
        )
        .unwrap();

        let (mut registrar, _handle) = Registrar::new(&path).unwrap();
        let states = registrar.load().unwrap();

        assert_eq!(states.len(), 1);
        assert_eq!(states[0].offset, 4);
        assert_eq!(
            states[0].identity,
            FileIdentity::Posix {
                device: 64768,
                inode: 917214
            }
        );

        // The migrated form was persisted in the current format.
        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(RegistryFile::is_current(&value));
    }

    #[tokio::test]
    async fn test_gc_expires_ttl_entries() {
        let dir = TempDir::new().unwrap();
        let (mut registrar, _handle) = Registrar::new(dir.path().join("r.json")).unwrap();
        registrar.load().unwrap();

        let mut expired = state(1, 10);
        expired.ttl = Some(Duration::from_secs(60));
        expired.timestamp = chrono::Utc::now() - chrono::Duration::seconds(3600);

        let mut fresh = state(2, 20);
        fresh.ttl = Some(Duration::from_secs(60));

        registrar.apply(&[StateUpdate::Set(expired), StateUpdate::Set(fresh)]);
        assert_eq!(registrar.gc(), 1);
        assert_eq!(registrar.registry.states.len(), 1);
        assert!(registrar.registry.states.contains_key("1-2"));
    }

    #[tokio::test]
    async fn test_corrupted_registry_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"\"just a string\"").unwrap();

        let (mut registrar, _handle) = Registrar::new(&path).unwrap();
        assert!(registrar.load().is_err());
    }
}

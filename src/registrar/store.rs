// SPDX-License-Identifier: Apache-2.0

//! Registry file persistence with atomic writes.
//!
//! The registrar is the single writer; writes go to a temp file that is
//! renamed over the registry, so readers and crash recovery never observe a
//! half-written file.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::schema::RegistryFile;

pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    /// Prepare a store at `path`, creating parent directories as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Persistence(format!(
                        "failed to create registry directory {:?}: {}",
                        parent, e
                    ))
                })?;
            }
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw JSON of the registry file, if one exists. The caller decides
    /// whether the shape is current or legacy.
    pub fn load_raw(&self) -> Result<Option<serde_json::Value>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let file = File::open(&self.path)
            .map_err(|e| Error::Persistence(format!("failed to open registry file: {}", e)))?;
        let value = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            Error::Persistence(format!(
                "registry file {:?} is corrupted and cannot be loaded: {}. \
                 To start fresh, delete it and restart.",
                self.path, e
            ))
        })?;

        Ok(Some(value))
    }

    /// Persist the registry atomically: write temp, flush, fsync, rename.
    pub fn save(&self, registry: &RegistryFile) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");

        let file = File::create(&temp_path)
            .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer_pretty(&mut writer, registry)
            .map_err(|e| Error::Persistence(format!("failed to write registry: {}", e)))?;
        writer
            .flush()
            .map_err(|e| Error::Persistence(format!("failed to flush registry: {}", e)))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::Persistence(format!("failed to sync registry: {}", e)))?;
        drop(writer);

        fs::rename(&temp_path, &self.path)
            .map_err(|e| Error::Persistence(format!("failed to rename registry file: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FileIdentity;
    use crate::registrar::schema::RegistryEntry;
    use chrono::Utc;
    use tempfile::TempDir;

    fn entry(inode: u64, offset: u64) -> RegistryEntry {
        RegistryEntry {
            source: format!("/logs/{}.log", inode),
            offset,
            timestamp: Utc::now(),
            ttl: -1,
            identity: FileIdentity::Posix {
                device: 1,
                inode,
            },
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = RegistryStore::open(dir.path().join("registry.json")).unwrap();

        assert!(store.load_raw().unwrap().is_none());

        let mut registry = RegistryFile::default();
        let e = entry(100, 42);
        registry.states.insert(e.identity.key(), e);
        store.save(&registry).unwrap();

        let raw = store.load_raw().unwrap().unwrap();
        let loaded: RegistryFile = serde_json::from_value(raw).unwrap();
        assert_eq!(loaded.version, registry.version);
        assert_eq!(loaded.states.len(), 1);
        assert_eq!(loaded.states.get("1-100").unwrap().offset, 42);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c/registry.json");

        let store = RegistryStore::open(&nested).unwrap();
        store.save(&RegistryFile::default()).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn test_corrupted_file_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = RegistryStore::open(&path).unwrap();
        let err = store.load_raw().unwrap_err();
        assert!(err.to_string().contains("corrupted"));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let store = RegistryStore::open(&path).unwrap();

        store.save(&RegistryFile::default()).unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Periodic file discovery for one input.
//!
//! Expands the configured glob patterns into the current candidate set,
//! applying exclude filters and skipping symlinks and directories. Age
//! policy (`ignore_older`) is applied by the crawler, which has the state
//! table; the scanner only reports what exists. No ordering is guaranteed.

use std::collections::HashSet;
use std::fs::Metadata;
use std::path::PathBuf;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::identity::FileIdentity;

/// One discovered candidate file.
#[derive(Debug)]
pub struct ScanEntry {
    pub path: PathBuf,
    pub metadata: Metadata,
    pub identity: FileIdentity,
}

#[derive(Debug)]
pub struct Scanner {
    include: Vec<String>,
    include_patterns: Vec<glob::Pattern>,
    exclude: Vec<Regex>,
}

impl Scanner {
    /// Compile the include globs and exclude regexes of one input.
    ///
    /// With `recursive_glob` disabled, `**` degrades to a single-level `*`.
    /// Pattern errors are configuration errors and surface at startup.
    pub fn new(paths: &[String], exclude_files: &[String], recursive_glob: bool) -> Result<Self> {
        let include: Vec<String> = paths
            .iter()
            .map(|p| {
                if recursive_glob {
                    p.clone()
                } else {
                    p.replace("**", "*")
                }
            })
            .collect();

        let include_patterns = include
            .iter()
            .map(|p| glob::Pattern::new(p).map_err(|e| Error::InvalidGlob(format!("{}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;

        let exclude = exclude_files
            .iter()
            .map(|e| Regex::new(e).map_err(Error::Pattern))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            include,
            include_patterns,
            exclude,
        })
    }

    /// True when `path` is covered by this scanner's patterns and not
    /// excluded. Used for runner-replacement conflict checks.
    pub fn matches(&self, path: &std::path::Path) -> bool {
        self.include_patterns.iter().any(|p| p.matches_path(path)) && !self.is_excluded(path)
    }

    fn is_excluded(&self, path: &std::path::Path) -> bool {
        let text = path.to_string_lossy();
        self.exclude.iter().any(|re| re.is_match(&text))
    }

    /// Produce the candidate set for one scan cycle.
    ///
    /// Per-file problems (vanished between glob and stat, unreadable
    /// metadata) are skipped and retried on the next scan, never fatal.
    pub fn scan(&self) -> Vec<ScanEntry> {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut entries = Vec::new();

        for pattern in &self.include {
            let matches = match glob::glob(pattern) {
                Ok(m) => m,
                Err(e) => {
                    // Patterns were validated in new(); this only happens if
                    // a pattern was mutated since, so log and move on.
                    warn!(pattern = %pattern, error = %e, "Skipping invalid glob pattern");
                    continue;
                }
            };

            for entry in matches {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        debug!(error = %e, "Skipping unreadable glob match");
                        continue;
                    }
                };

                if !seen.insert(path.clone()) {
                    continue;
                }

                // symlink_metadata so links are visible as links.
                let metadata = match std::fs::symlink_metadata(&path) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "File vanished during scan");
                        continue;
                    }
                };

                if metadata.file_type().is_symlink() {
                    debug!(path = %path.display(), "Skipping symlink");
                    continue;
                }

                if !metadata.is_file() {
                    continue;
                }

                if self.is_excluded(&path) {
                    debug!(path = %path.display(), "Skipping excluded file");
                    continue;
                }

                let identity = identity_of(&path, &metadata);
                let identity = match identity {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Failed to resolve file identity");
                        continue;
                    }
                };

                entries.push(ScanEntry {
                    path,
                    metadata,
                    identity,
                });
            }
        }

        entries
    }
}

#[cfg(unix)]
fn identity_of(_path: &std::path::Path, metadata: &Metadata) -> std::io::Result<FileIdentity> {
    Ok(FileIdentity::of_metadata(metadata))
}

#[cfg(windows)]
fn identity_of(path: &std::path::Path, _metadata: &Metadata) -> std::io::Result<FileIdentity> {
    FileIdentity::of_path(path)
}

// SPDX-License-Identifier: Apache-2.0

//! Legacy registry migration as a pure function.
//!
//! Converts path-keyed legacy entries into the identity-keyed current
//! format. Runs once at registrar load time; testable without any process
//! startup.

use super::schema::{LegacyRegistry, RegistryEntry, RegistryFile, TTL_NEVER};

/// Merge legacy entries into `registry`, returning how many were converted.
///
/// Offsets are preserved exactly. If a path already has an entry in the
/// current format, the legacy entry for it is dropped: first-writer-wins,
/// migration never overwrites newer state.
pub fn migrate_legacy(legacy: LegacyRegistry, registry: &mut RegistryFile) -> usize {
    let mut converted = 0;

    for (path, entry) in legacy.0 {
        let source = entry.source.clone().unwrap_or(path);

        let path_taken = registry.states.values().any(|e| e.source == source);
        if path_taken {
            continue;
        }

        let identity = entry.file_state_os.to_identity();
        if registry.states.contains_key(&identity.key()) {
            continue;
        }

        let migrated = RegistryEntry {
            source,
            offset: entry.offset,
            timestamp: entry.timestamp.unwrap_or_else(chrono::Utc::now),
            // Legacy TTLs are nanoseconds; negative means never.
            ttl: entry
                .ttl
                .map(|nanos| {
                    if nanos < 0 {
                        TTL_NEVER
                    } else {
                        nanos / 1_000_000_000
                    }
                })
                .unwrap_or(TTL_NEVER),
            identity,
        };

        registry.states.insert(migrated.key(), migrated);
        converted += 1;
    }

    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FileIdentity;
    use chrono::Utc;

    fn parse_legacy(raw: &str) -> LegacyRegistry {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_migrate_preserves_offset_and_identity() {
        let legacy = parse_legacy(
            r#"{
                "logs/hello.log": {
                    "source": "logs/hello.log",
                    "offset": 4,
                    "FileStateOS": { "inode": 917214, "device": 64768 }
                }
            }"#,
        );

        let mut registry = RegistryFile::default();
        let converted = migrate_legacy(legacy, &mut registry);

        assert_eq!(converted, 1);
        let entry = registry.states.get("64768-917214").unwrap();
        assert_eq!(entry.source, "logs/hello.log");
        assert_eq!(entry.offset, 4);
        assert_eq!(entry.ttl, TTL_NEVER);
    }

    #[test]
    fn test_migrate_is_first_writer_wins_on_duplicate_path() {
        let legacy = parse_legacy(
            r#"{
                "logs/hello.log": {
                    "offset": 4,
                    "FileStateOS": { "inode": 1, "device": 1 }
                }
            }"#,
        );

        let mut registry = RegistryFile::default();
        let existing = RegistryEntry {
            source: "logs/hello.log".to_string(),
            offset: 999,
            timestamp: Utc::now(),
            ttl: TTL_NEVER,
            identity: FileIdentity::Posix {
                device: 9,
                inode: 9,
            },
        };
        registry.states.insert(existing.key(), existing);

        let converted = migrate_legacy(legacy, &mut registry);

        // The current-format entry is untouched, the legacy one dropped.
        assert_eq!(converted, 0);
        assert_eq!(registry.states.len(), 1);
        assert_eq!(registry.states.get("9-9").unwrap().offset, 999);
    }

    #[test]
    fn test_migrate_skips_duplicate_identity() {
        let legacy = parse_legacy(
            r#"{
                "logs/renamed.log": {
                    "offset": 4,
                    "FileStateOS": { "inode": 5, "device": 5 }
                }
            }"#,
        );

        let mut registry = RegistryFile::default();
        let existing = RegistryEntry {
            source: "logs/other-path.log".to_string(),
            offset: 50,
            timestamp: Utc::now(),
            ttl: TTL_NEVER,
            identity: FileIdentity::Posix {
                device: 5,
                inode: 5,
            },
        };
        registry.states.insert(existing.key(), existing);

        assert_eq!(migrate_legacy(legacy, &mut registry), 0);
        assert_eq!(registry.states.get("5-5").unwrap().offset, 50);
    }

    #[test]
    fn test_migrate_multiple_entries() {
        let legacy = parse_legacy(
            r#"{
                "a.log": { "offset": 1, "FileStateOS": { "inode": 1, "device": 1 } },
                "b.log": { "offset": 2, "FileStateOS": { "inode": 2, "device": 1 } },
                "c.log": { "offset": 3, "FileStateOS": { "inode": 3, "device": 1 } }
            }"#,
        );

        let mut registry = RegistryFile::default();
        assert_eq!(migrate_legacy(legacy, &mut registry), 3);
        assert_eq!(registry.states.len(), 3);
    }

    #[test]
    fn test_migrate_legacy_ttl_nanoseconds() {
        let legacy = parse_legacy(
            r#"{
                "a.log": {
                    "offset": 1,
                    "ttl": 1800000000000,
                    "FileStateOS": { "inode": 1, "device": 1 }
                }
            }"#,
        );

        let mut registry = RegistryFile::default();
        migrate_legacy(legacy, &mut registry);
        assert_eq!(registry.states.get("1-1").unwrap().ttl, 1800);
    }

    #[test]
    fn test_migrate_missing_source_uses_path_key() {
        let legacy = parse_legacy(
            r#"{
                "logs/keyed.log": {
                    "offset": 7,
                    "FileStateOS": { "inode": 42, "device": 1 }
                }
            }"#,
        );

        let mut registry = RegistryFile::default();
        migrate_legacy(legacy, &mut registry);
        assert_eq!(registry.states.get("1-42").unwrap().source, "logs/keyed.log");
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Registry behavior end to end: legacy migration with resumed offsets,
//! clean_removed retention, and clean_inactive expiry.

mod common;

use std::time::Duration;

use common::*;
use tempfile::TempDir;

#[cfg(unix)]
fn posix_identity(path: &std::path::Path) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    let metadata = std::fs::metadata(path).unwrap();
    (metadata.dev(), metadata.ino())
}

#[cfg(unix)]
#[tokio::test]
async fn test_legacy_registry_migration_resumes_offset() {
    let dir = TempDir::new().unwrap();
    let paths = layout(dir.path());
    let log = paths.logs.join("hello.log");

    // "abc\n" is the already-shipped prefix: 4 bytes.
    append(&log, "abc\nrest 0\nrest 1\n");
    let (device, inode) = posix_identity(&log);

    // Legacy path-keyed registry pointing at offset 4.
    let mut legacy = serde_json::Map::new();
    legacy.insert(
        log.to_string_lossy().into_owned(),
        serde_json::json!({
            "source": log.to_string_lossy(),
            "offset": 4,
            "FileStateOS": { "inode": inode, "device": device }
        }),
    );
    std::fs::write(&paths.registry, serde_json::to_string(&legacy).unwrap()).unwrap();

    let pipeline = Pipeline::start(
        &paths.registry,
        &paths.sink,
        test_config(&paths.logs),
        0,
    )
    .await;

    wait_for_events(&paths.sink, 2, Duration::from_secs(5)).await;
    settle().await;

    // Reading resumed at byte 4, not 0: "abc" is never replayed.
    let messages = published_messages(&paths.sink);
    assert_eq!(messages, vec!["rest 0", "rest 1"]);

    pipeline.stop().await;

    // The registry is now in the current identity-keyed format, offset
    // advanced past the appended lines.
    let registry = read_registry(&paths.registry);
    assert_eq!(registry["version"], 1);
    let key = format!("{}-{}", device, inode);
    let entry = &registry["states"][&key];
    assert_eq!(
        entry["offset"].as_u64().unwrap(),
        std::fs::metadata(&log).unwrap().len()
    );
    assert_eq!(entry["identity"]["device"].as_u64().unwrap(), device);
    assert_eq!(entry["identity"]["inode"].as_u64().unwrap(), inode);
}

#[tokio::test]
async fn test_clean_removed_disabled_retains_state_for_reappearing_file() {
    let dir = TempDir::new().unwrap();
    let paths = layout(dir.path());
    let log = paths.logs.join("app.log");

    append(&log, "keep 0\nkeep 1\n");

    let mut config = test_config(&paths.logs);
    config.clean_removed = false;
    config.close_removed = true;

    let pipeline = Pipeline::start(&paths.registry, &paths.sink, config, 0).await;
    wait_for_events(&paths.sink, 2, Duration::from_secs(5)).await;

    std::fs::remove_file(&log).unwrap();
    settle().await;

    pipeline.stop().await;

    // The entry survives the file's removal.
    assert_eq!(registry_states(&paths.registry).len(), 1);
}

#[tokio::test]
async fn test_clean_removed_drops_state_for_deleted_file() {
    let dir = TempDir::new().unwrap();
    let paths = layout(dir.path());
    let log = paths.logs.join("app.log");

    append(&log, "gone 0\ngone 1\n");

    let mut config = test_config(&paths.logs);
    config.close_removed = true;
    config.clean_removed = true;

    let pipeline = Pipeline::start(&paths.registry, &paths.sink, config, 0).await;
    wait_for_events(&paths.sink, 2, Duration::from_secs(5)).await;

    std::fs::remove_file(&log).unwrap();

    // Give the harvester time to close on removal and the next scans time
    // to clean the state.
    tokio::time::sleep(Duration::from_millis(600)).await;

    pipeline.stop().await;
    assert_eq!(registry_states(&paths.registry).len(), 0);
}

#[tokio::test]
async fn test_registry_offsets_survive_pipeline_restarts() {
    let dir = TempDir::new().unwrap();
    let paths = layout(dir.path());
    let log = paths.logs.join("app.log");

    // Three rounds of append-run-stop; each run must deliver only its own
    // lines.
    for round in 0..3 {
        append(&log, &numbered_lines(&format!("round{}", round), 0..5));

        let sink = dir.path().join(format!("output{}.jsonl", round));
        let pipeline =
            Pipeline::start(&paths.registry, &sink, test_config(&paths.logs), 0).await;
        wait_for_events(&sink, 5, Duration::from_secs(5)).await;
        settle().await;

        let messages = published_messages(&sink);
        assert_eq!(messages.len(), 5, "round {} over- or under-delivered", round);
        assert!(
            messages
                .iter()
                .all(|m| m.starts_with(&format!("round{}", round)))
        );

        pipeline.stop().await;
    }

    let states = registry_states(&paths.registry);
    assert_eq!(states.len(), 1);
    let entry = states.values().next().unwrap();
    assert_eq!(
        entry["offset"].as_u64().unwrap(),
        std::fs::metadata(&log).unwrap().len()
    );
}

// SPDX-License-Identifier: Apache-2.0

//! Shared pipeline harness for integration tests: a real registrar,
//! publisher with a file sink, and one input runner, wired the same way the
//! agent wires them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use logtail::bounded_channel::{self, BoundedSender};
use logtail::error::BoxError;
use logtail::event::EventBatch;
use logtail::harvester::limit::HarvesterLimiter;
use logtail::input::runner::{Runner, RunnerDeps};
use logtail::input::InputConfig;
use logtail::publish::{FileSink, Publisher};
use logtail::registrar::{Registrar, RegistrarHandle};
use logtail::states;

pub struct Pipeline {
    cancel: CancellationToken,
    runner: Runner,
    tasks: JoinSet<Result<(), BoxError>>,
    events_tx: BoundedSender<EventBatch>,
    registrar_handle: RegistrarHandle,
}

impl Pipeline {
    pub async fn start(
        registry_path: &Path,
        sink_path: &Path,
        config: InputConfig,
        harvester_limit: usize,
    ) -> Self {
        config.validate().expect("test input config invalid");

        let (mut registrar, registrar_handle) = Registrar::new(registry_path).unwrap();
        let loaded = registrar.load().unwrap();

        let shared_states = states::shared();
        {
            let mut table = shared_states.lock().unwrap();
            for state in loaded {
                table.update(state);
            }
        }

        let (events_tx, events_rx) = bounded_channel::bounded(256);
        let sink = FileSink::open(sink_path).unwrap();
        let publisher = Publisher::new(events_rx, Box::new(sink), registrar_handle.clone());

        let mut tasks: JoinSet<Result<(), BoxError>> = JoinSet::new();
        tasks.spawn(async move { registrar.run().await.map_err(Into::into) });
        tasks.spawn(async move { publisher.run().await.map_err(Into::into) });

        let deps = RunnerDeps {
            out: events_tx.clone(),
            registrar: registrar_handle.clone(),
            states: shared_states,
            limiter: HarvesterLimiter::new(harvester_limit),
        };

        let cancel = CancellationToken::new();
        let mut runner = Runner::new("test", Arc::new(config));
        runner.start(&deps, &cancel).unwrap();

        Self {
            cancel,
            runner,
            tasks,
            events_tx,
            registrar_handle,
        }
    }

    /// Graceful shutdown: harvesters close and commit, the pipeline drains,
    /// the registry gets its final persist.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        self.runner.stop().await;

        drop(self.events_tx);
        drop(self.registrar_handle);
        while let Some(res) = self.tasks.join_next().await {
            res.unwrap().unwrap();
        }
    }
}

/// Fast-cycle input config for tests.
pub fn test_config(dir: &Path) -> InputConfig {
    InputConfig {
        paths: vec![format!("{}/*.log", dir.display())],
        scan_frequency: Duration::from_millis(50),
        backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn published_lines(sink_path: &Path) -> Vec<serde_json::Value> {
    match std::fs::read_to_string(sink_path) {
        Ok(content) => content
            .lines()
            .map(|l| serde_json::from_str(l).expect("sink line is not JSON"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub fn published_messages(sink_path: &Path) -> Vec<String> {
    published_lines(sink_path)
        .iter()
        .filter_map(|v| v["message"].as_str().map(|s| s.to_string()))
        .collect()
}

/// Poll the sink until it holds at least `want` events or the deadline hits.
pub async fn wait_for_events(sink_path: &Path, want: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if published_lines(sink_path).len() >= want {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "timed out waiting for {} events, have {}",
                want,
                published_lines(sink_path).len()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Sleep long enough for a few scan/read cycles to pass.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

pub fn read_registry(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

pub fn registry_states(path: &Path) -> serde_json::Map<String, serde_json::Value> {
    read_registry(path)["states"].as_object().unwrap().clone()
}

pub fn append(path: &Path, content: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
}

pub fn numbered_lines(prefix: &str, range: std::ops::Range<usize>) -> String {
    range
        .map(|i| format!("{} {}\n", prefix, i))
        .collect::<String>()
}

pub struct Paths {
    pub logs: PathBuf,
    pub registry: PathBuf,
    pub sink: PathBuf,
}

/// Standard layout inside one temp dir: logs/, registry.json, output.jsonl.
pub fn layout(dir: &Path) -> Paths {
    let logs = dir.join("logs");
    std::fs::create_dir_all(&logs).unwrap();
    Paths {
        logs,
        registry: dir.join("registry.json"),
        sink: dir.join("output.jsonl"),
    }
}

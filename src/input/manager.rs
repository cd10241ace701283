// SPDX-License-Identifier: Apache-2.0

//! Input manager: runner supervision and dynamic config reload.
//!
//! Static inputs run for the process lifetime. With a config directory set,
//! TOML fragments are polled every reload period: a new fragment starts a
//! runner, a content change stops the old runner before starting the
//! replacement, a removed fragment stops its runner. A replacement refused
//! with a state conflict is retried on the next tick; it resolves once the
//! old runner's harvesters have closed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

use super::config::InputConfig;
use super::runner::{Runner, RunnerDeps};

pub struct InputManager {
    static_configs: Vec<Arc<InputConfig>>,
    config_dir: Option<PathBuf>,
    reload_period: Duration,
    deps: RunnerDeps,
    runners: HashMap<String, Runner>,
    /// Fragment contents currently applied (or skipped as invalid).
    fragments: HashMap<String, String>,
}

impl InputManager {
    pub fn new(
        static_configs: Vec<Arc<InputConfig>>,
        config_dir: Option<PathBuf>,
        reload_period: Duration,
        deps: RunnerDeps,
    ) -> Self {
        Self {
            static_configs,
            config_dir,
            reload_period,
            deps,
            runners: HashMap::new(),
            fragments: HashMap::new(),
        }
    }

    /// Supervise runners until cancelled, then stop them all, waiting for
    /// each runner's harvesters to finish their clean close.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let result = self.supervise(&cancel).await;

        // Runners started before an error still get a clean stop.
        for runner in self.runners.values_mut() {
            runner.stop().await;
        }
        debug!("Input manager stopped");
        result
    }

    async fn supervise(&mut self, cancel: &CancellationToken) -> Result<()> {
        for config in self.static_configs.clone() {
            let mut runner = Runner::new(config.name.clone(), config);
            runner.start(&self.deps, cancel)?;
            self.runners.insert(runner.name().to_string(), runner);
        }

        // First fragment pass is startup: errors there are fatal.
        if self.config_dir.is_some() {
            self.reload_pass(true, cancel).await?;
        }

        let mut ticker = tokio::time::interval(self.reload_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                _ = ticker.tick(), if self.config_dir.is_some() => {
                    if let Err(e) = self.reload_pass(false, cancel).await {
                        error!(error = %e, "Config reload failed");
                    }
                }

                _ = cancel.cancelled() => break,
            }
        }

        Ok(())
    }

    async fn reload_pass(&mut self, startup: bool, cancel: &CancellationToken) -> Result<()> {
        let Some(dir) = self.config_dir.clone() else {
            return Ok(());
        };
        let current = read_fragments(&dir)?;

        // Runners whose fragment disappeared.
        let removed: Vec<String> = self
            .fragments
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(mut runner) = self.runners.remove(&name) {
                runner.stop().await;
            }
            self.fragments.remove(&name);
        }

        let mut names: Vec<&String> = current.keys().collect();
        names.sort();

        for name in names {
            let content = &current[name];
            if self.fragments.get(name) == Some(content) {
                continue;
            }

            let config = match parse_fragment(name, content) {
                Ok(config) => config,
                Err(e) => {
                    if startup {
                        return Err(e);
                    }
                    error!(fragment = %name, error = %e, "Ignoring invalid input config");
                    // Remember the bad content so the error is logged once
                    // per change, not every tick.
                    self.fragments.insert(name.clone(), content.clone());
                    continue;
                }
            };

            // Content change: the old runner stops before the new definition
            // starts, waiting for its harvesters.
            if let Some(mut old) = self.runners.remove(name) {
                old.stop().await;
            }

            let mut runner = Runner::new(name.clone(), Arc::new(config));
            match runner.start(&self.deps, cancel) {
                Ok(()) => {
                    self.runners.insert(name.clone(), runner);
                    self.fragments.insert(name.clone(), content.clone());
                }
                Err(Error::ConflictingState(detail)) => {
                    // Retryable: the fragment stays unapplied so the next
                    // tick tries again once the old harvesters are done.
                    warn!(
                        fragment = %name,
                        "Can only start an input when all related states are finished: {}",
                        detail
                    );
                }
                Err(e) => {
                    if startup {
                        return Err(e);
                    }
                    error!(fragment = %name, error = %e, "Failed to start input");
                    self.fragments.insert(name.clone(), content.clone());
                }
            }
        }

        Ok(())
    }
}

fn parse_fragment(name: &str, content: &str) -> Result<InputConfig> {
    let mut config = InputConfig::from_toml(content)?;
    if config.name == "default" {
        config.name = name.to_string();
    }
    config.validate()?;
    Ok(config)
}

/// Map fragment name (file stem) to raw content for every `*.toml` in `dir`.
fn read_fragments(dir: &std::path::Path) -> Result<HashMap<String, String>> {
    let mut fragments = HashMap::new();

    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot read config directory {:?}: {}", dir, e)))?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                fragments.insert(stem.to_string(), content);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read config fragment");
            }
        }
    }

    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel;
    use crate::harvester::limit::HarvesterLimiter;
    use crate::registrar::Registrar;
    use crate::states;
    use tempfile::TempDir;

    fn deps(dir: &TempDir) -> RunnerDeps {
        let (registrar, handle) = Registrar::new(dir.path().join("registry.json")).unwrap();
        drop(registrar);
        let (out, _rx) = bounded_channel::bounded(8);
        RunnerDeps {
            out,
            registrar: handle,
            states: states::shared(),
            limiter: HarvesterLimiter::new(0),
        }
    }

    #[test]
    fn test_read_fragments_only_toml() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("one.toml"), "paths = ['/a/*.log']").unwrap();
        std::fs::write(dir.path().join("two.toml"), "paths = ['/b/*.log']").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let fragments = read_fragments(dir.path()).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments.contains_key("one"));
        assert!(fragments.contains_key("two"));
    }

    #[test]
    fn test_parse_fragment_names_from_stem() {
        let config = parse_fragment("syslog", "paths = ['/var/log/*.log']").unwrap();
        assert_eq!(config.name, "syslog");

        let config =
            parse_fragment("ignored", "name = 'explicit'\npaths = ['/var/log/*.log']").unwrap();
        assert_eq!(config.name, "explicit");
    }

    #[test]
    fn test_parse_fragment_validates() {
        // No paths: the input's validation error surfaces.
        let err = parse_fragment("empty", "").unwrap_err();
        assert!(err.to_string().contains("No paths were defined"));
    }

    #[tokio::test]
    async fn test_manager_starts_and_stops_fragment_runners() {
        let logs = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        std::fs::write(
            config_dir.path().join("app.toml"),
            format!(
                "paths = ['{}/*.log']\nscan_frequency = '50ms'",
                logs.path().display()
            ),
        )
        .unwrap();

        let manager = InputManager::new(
            Vec::new(),
            Some(config_dir.path().to_path_buf()),
            Duration::from_millis(50),
            deps(&logs),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_manager_fails_fast_on_bad_startup_fragment() {
        let dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        std::fs::write(config_dir.path().join("bad.toml"), "paths = 42").unwrap();

        let manager = InputManager::new(
            Vec::new(),
            Some(config_dir.path().to_path_buf()),
            Duration::from_secs(10),
            deps(&dir),
        );

        let err = manager.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_config());
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Runner supervision: one restartable unit per active input.
//!
//! A runner walks Stopped -> Starting -> Running -> Stopping -> Stopped.
//! Starting a log runner over paths whose states are not all finished is
//! refused with a retryable conflict; the condition resolves itself once the
//! prior runner's harvesters close.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bounded_channel::BoundedSender;
use crate::crawler::Crawler;
use crate::error::{Error, Result};
use crate::event::EventBatch;
use crate::harvester::HarvesterContext;
use crate::harvester::limit::HarvesterLimiter;
use crate::registrar::RegistrarHandle;
use crate::scanner::Scanner;
use crate::states::SharedStates;

use super::config::{InputConfig, InputKind};
use super::stdin;

/// Shared dependencies handed to every runner.
#[derive(Clone)]
pub struct RunnerDeps {
    pub out: BoundedSender<EventBatch>,
    pub registrar: RegistrarHandle,
    pub states: SharedStates,
    pub limiter: HarvesterLimiter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

pub struct Runner {
    name: String,
    config: Arc<InputConfig>,
    state: RunnerState,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl Runner {
    pub fn new(name: impl Into<String>, config: Arc<InputConfig>) -> Self {
        Self {
            name: name.into(),
            config,
            state: RunnerState::Stopped,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    /// Start the input's task tree.
    ///
    /// Fails with a conflict when an unfinished state still owns a path this
    /// input covers; the caller retries on its next reload tick.
    pub fn start(&mut self, deps: &RunnerDeps, parent: &CancellationToken) -> Result<()> {
        if self.state != RunnerState::Stopped {
            return Ok(());
        }
        self.state = RunnerState::Starting;

        match self.spawn(deps, parent) {
            Ok(task) => {
                self.task = Some(task);
                self.state = RunnerState::Running;
                info!("Starting runner: {}", self.name);
                Ok(())
            }
            Err(e) => {
                // A refused start leaves the runner stopped and retryable.
                self.state = RunnerState::Stopped;
                Err(e)
            }
        }
    }

    fn spawn(
        &mut self,
        deps: &RunnerDeps,
        parent: &CancellationToken,
    ) -> Result<JoinHandle<Result<()>>> {
        self.cancel = parent.child_token();
        let ctx = HarvesterContext {
            config: self.config.clone(),
            out: deps.out.clone(),
            registrar: deps.registrar.clone(),
            states: deps.states.clone(),
            cancel: self.cancel.clone(),
        };

        Ok(match self.config.kind {
            InputKind::Log => {
                self.check_conflicts(deps)?;
                let crawler = Crawler::new(ctx, deps.limiter.clone())?;
                tokio::spawn(crawler.run())
            }
            InputKind::Stdin => tokio::spawn(stdin::run(ctx)),
        })
    }

    fn check_conflicts(&self, deps: &RunnerDeps) -> Result<()> {
        let scanner = Scanner::new(
            &self.config.paths,
            &self.config.exclude_files,
            self.config.recursive_glob,
        )?;

        let states = deps.states.lock().unwrap();
        if let Some(conflicting) = states
            .iter()
            .find(|s| !s.finished && scanner.matches(&s.source))
        {
            return Err(Error::ConflictingState(format!(
                "{} (offset {})",
                conflicting.source.display(),
                conflicting.offset
            )));
        }
        Ok(())
    }

    /// Stop and wait for every owned harvester's clean close.
    pub async fn stop(&mut self) {
        if self.state != RunnerState::Running {
            return;
        }
        self.state = RunnerState::Stopping;
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(runner = %self.name, error = %e, "Runner exited with error"),
                Err(e) => error!(runner = %self.name, error = %e, "Runner task panicked"),
            }
        }

        self.state = RunnerState::Stopped;
        info!("Runner stopped: {}", self.name);
    }
}

// SPDX-License-Identifier: Apache-2.0

//! Agent assembly: wires the registrar, publisher and input manager into a
//! running pipeline and supervises shutdown ordering.
//!
//! Shutdown is a drain, not a teardown: cancelling stops the inputs first
//! (each harvester commits a final offset), then the event and commit
//! channels close, the publisher drains, and the registrar persists one
//! last time. The shutdown timeout bounds the whole sequence.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bounded_channel;
use crate::error::{BoxError, Error};
use crate::harvester::limit::HarvesterLimiter;
use crate::init::args::{AgentRun, OutputArg};
use crate::init::wait;
use crate::input::{InputManager, RunnerDeps};
use crate::publish::{ConsoleSink, EventSink, FileSink, Publisher};
use crate::registrar::Registrar;
use crate::states;

/// Event batches buffered between harvesters and the publisher.
const EVENT_CHANNEL_SIZE: usize = 512;

pub struct Agent {
    args: AgentRun,
}

impl Agent {
    pub fn new(args: AgentRun) -> Self {
        Self { args }
    }

    /// Validate configuration, wire the pipeline, and run until cancelled.
    ///
    /// Configuration problems surface here before any harvester starts and
    /// become a non-zero process exit.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BoxError> {
        let args = self.args;

        let mut static_configs = Vec::new();
        if let Some(input) = args.inline_input()? {
            input.validate()?;
            static_configs.push(Arc::new(input));
        }

        if static_configs.is_empty() && args.config_dir.is_none() {
            return Err(Error::Config(
                "no modules or inputs enabled and config reloading disabled. \
                 What files do you want me to watch?"
                    .to_string(),
            )
            .into());
        }

        let (mut registrar, registrar_handle) = Registrar::new(&args.registry_file)?;
        let loaded = registrar.load()?;
        info!(
            registry = %args.registry_file.display(),
            states = loaded.len(),
            "Registrar loaded"
        );

        let shared_states = states::shared();
        {
            let mut table = shared_states.lock().unwrap();
            for state in loaded {
                table.update(state);
            }
        }

        let sink: Box<dyn EventSink> = match args.output {
            OutputArg::Console => Box::new(ConsoleSink),
            OutputArg::File => {
                let path = args.output_file.as_ref().ok_or_else(|| {
                    Error::Config("--output file requires --output-file".to_string())
                })?;
                Box::new(FileSink::open(path)?)
            }
        };

        let (events_tx, events_rx) = bounded_channel::bounded(EVENT_CHANNEL_SIZE);
        let publisher = Publisher::new(events_rx, sink, registrar_handle.clone());

        let deps = RunnerDeps {
            out: events_tx.clone(),
            registrar: registrar_handle.clone(),
            states: shared_states,
            limiter: HarvesterLimiter::new(args.harvester_limit),
        };
        let manager = InputManager::new(
            static_configs,
            args.config_dir.clone(),
            args.reload_period,
            deps,
        );

        let mut pipeline: JoinSet<Result<(), BoxError>> = JoinSet::new();
        pipeline.spawn(async move { registrar.run().await.map_err(Into::into) });
        pipeline.spawn(async move { publisher.run().await.map_err(Into::into) });

        let mut inputs: JoinSet<Result<(), BoxError>> = JoinSet::new();
        {
            let cancel = cancel.clone();
            inputs.spawn(async move { manager.run(cancel).await.map_err(Into::into) });
        }

        // The manager returns once cancelled (or on a startup error), with
        // every runner stopped and every harvester's final offset committed.
        let inputs_result = wait::wait_for_any_task(&mut inputs).await;

        // Closing the event and commit channels drains the pipeline: the
        // publisher exits at channel end, then the registrar persists one
        // final time and stops.
        drop(events_tx);
        drop(registrar_handle);
        wait::wait_for_tasks_with_timeout(&mut pipeline, args.shutdown_timeout).await?;

        inputs_result?;
        debug!("Agent stopped");
        Ok(())
    }
}

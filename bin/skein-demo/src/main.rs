//! Demonstration host for the skein engine.
//!
//! Counts the words of a small built-in corpus. Each document is counted by its own process: the document is fetched
//! on the `io` pool, split into lines on the passive `main` pool, and every line is counted in a flow of its own, with
//! the process's total reported by a join callback.
#![deny(warnings)]
#![deny(missing_docs)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser as _;
use skein_app::prelude::*;
use skein_config::ConfigurationLoader;
use skein_core::{
    config::RuntimeConfiguration,
    pool::{FixedWorkerPool, OverloadPolicy, PassivePool},
    runtime::{Runtime, RuntimeBuilder},
    value,
};
use skein_error::{ErrorContext as _, GenericError};
use tracing::{error, info, warn};

mod graph;

/// Runs a demonstration process graph on a skein runtime.
#[derive(clap::Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a YAML configuration file.
    ///
    /// Settings can also be overridden with `SKEIN_`-prefixed environment variables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long to wait for each process to complete, in seconds.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(None) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    match run(&cli) {
        Ok(0) => info!("Demo finished."),
        Ok(failed) => {
            warn!(failed, "Demo finished with failed processes.");
            std::process::exit(1);
        }
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn load_configuration(path: Option<&PathBuf>) -> Result<RuntimeConfiguration, GenericError> {
    let mut loader = ConfigurationLoader::default();
    if let Some(path) = path {
        loader = loader
            .from_yaml(path)
            .with_error_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;
    }

    loader
        .from_environment("SKEIN")
        .error_context("Failed to read configuration from the environment.")?
        .into_typed()
        .error_context("Invalid runtime configuration.")
}

fn build_runtime(config: RuntimeConfiguration) -> Result<Runtime, GenericError> {
    let mut builder = RuntimeBuilder::new(config.clone());

    // Without any configured pools, fall back to the pools the demo graph expects.
    if config.pools.is_empty() {
        builder = builder
            .with_pool(Arc::new(PassivePool::new(graph::MAIN_POOL)))
            .with_pool(Arc::new(FixedWorkerPool::new(
                graph::IO_POOL,
                2,
                64,
                OverloadPolicy::Queue,
            )));
    }

    builder
        .build(graph::word_count())
        .error_context("Failed to build runtime.")
}

fn run(cli: &Cli) -> Result<usize, GenericError> {
    let config = load_configuration(cli.config.as_ref())?;
    let runtime = build_runtime(config)?;
    runtime.start().error_context("Failed to start runtime.")?;

    let timeout = Duration::from_secs(cli.timeout_secs);
    let mut failed = 0;
    let handles = (0..graph::CORPUS.len())
        .map(|document| runtime.invoke_process_by_name(graph::ENTRY_POINT, Some(value(document)), |_| {}))
        .collect::<Result<Vec<_>, _>>()
        .error_context("Failed to invoke process.")?;

    for handle in handles {
        match handle.wait_timeout(timeout) {
            Some(outcome) if outcome.is_success() => {
                info!(process_id = %handle.id(), "Process completed.");
            }
            Some(outcome) => {
                failed += 1;
                if let Some(escalation) = outcome.escalation() {
                    warn!(process_id = %handle.id(), escalation = %escalation, "Process failed.");
                }
            }
            None => {
                failed += 1;
                warn!(process_id = %handle.id(), timeout = ?timeout, "Process did not complete in time. Cancelling.");
                handle.cancel();
            }
        }
    }

    runtime.stop();
    Ok(failed)
}

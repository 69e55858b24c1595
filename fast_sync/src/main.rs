use core::future::Future;
use std::{io::Write as _, process::ExitCode};

use anyhow::Result;
use clap::{Error as ClapError, Parser as _};
use logging::{error_with_peers, info_with_peers};
use tokio::runtime::Builder;

use crate::{
    fast_sync_args::FastSyncArgs,
    fast_sync_config::FastSyncConfig,
    simulation::SyncReport,
};

mod fast_sync_args;
mod fast_sync_config;
mod simulation;

fn main() -> ExitCode {
    if let Err(error) = try_main() {
        error.downcast_ref().map(ClapError::exit);
        error_with_peers!("{error:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn try_main() -> Result<()> {
    binary_utils::initialize_tracing_logger(module_path!())?;

    let config = FastSyncArgs::try_parse()?
        .try_into_config()
        .map_err(FastSyncArgs::clap_error)?;

    let FastSyncConfig {
        pool_config,
        simulation_config,
        features,
        print_metrics,
    } = config;

    if !features.is_empty() {
        info_with_peers!("enabled features: {features:?}");
    }

    let registry = prometheus::default_registry();
    let report = block_on(simulation::run(pool_config, simulation_config, registry))?;

    let SyncReport {
        status,
        caught_up,
        redone_requests,
        request_timeouts,
        elapsed,
    } = report;

    info_with_peers!(
        "fast sync finished at height {} in {elapsed:?} \
         (caught up: {caught_up}, peers left: {}, redone requests: {redone_requests}, \
         request timeouts: {request_timeouts})",
        status.height,
        status.peer_count,
    );

    if print_metrics {
        let encoded = prometheus_metrics::encode_registry(registry)?;
        std::io::stdout().lock().write_all(encoded.as_bytes())?;
    }

    Ok(())
}

fn block_on<T>(future: impl Future<Output = Result<T>>) -> Result<T> {
    // This is roughly what `#[tokio::main]` expands to.
    Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(future)
}

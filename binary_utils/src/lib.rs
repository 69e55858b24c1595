use std::io::{self, IsTerminal as _};

use anyhow::Result;
use chrono::{Local, SecondsFormat};
use logging::debug_with_peers;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter, Registry,
};

const LOG_ENV_VARIABLE: &str = "FAST_SYNC_LOG";

const WORKSPACE_CRATES: &[&str] = &[
    "binary_utils",
    "block_pool",
    "features",
    "prometheus_metrics",
];

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> core::fmt::Result {
        write!(
            w,
            "[{}]",
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        )
    }
}

pub fn initialize_tracing_logger(module_path: &str) -> Result<()> {
    let mut filter = default_filter(module_path)?;

    if let Ok(env_filter) = EnvFilter::try_from_env(LOG_ENV_VARIABLE) {
        for directive in env_filter.to_string().split(',') {
            filter = filter.add_directive(directive.parse()?)
        }
    }

    let enable_ansi = io::stdout().is_terminal();

    let stdout_layer = fmt::layer::<Registry>()
        .compact()
        .with_thread_ids(false)
        .with_target(true)
        .with_file(false)
        .with_line_number(true)
        .with_timer(LocalTimer)
        .with_ansi(enable_ansi);

    tracing_subscriber::registry()
        .with(stdout_layer.with_filter(filter))
        .try_init()?;

    debug_with_peers!("tracing started!");

    Ok(())
}

fn default_filter(module_path: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::default().add_directive(LevelFilter::OFF.into());

    for crate_name in WORKSPACE_CRATES {
        filter = filter.add_directive(format!("{crate_name}=info").parse()?);
    }

    Ok(filter.add_directive(format!("{module_path}=info").parse()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_enables_workspace_crates_at_info() -> Result<()> {
        let filter = default_filter("fast_sync")?.to_string();

        assert!(filter.contains("block_pool=info"));
        assert!(filter.contains("features=info"));
        assert!(filter.contains("fast_sync=info"));
        assert!(filter.contains("off"));

        Ok(())
    }

    #[test]
    fn logger_can_only_be_installed_once() {
        assert!(initialize_tracing_logger("fast_sync").is_ok());
        assert!(initialize_tracing_logger("fast_sync").is_err());
    }
}

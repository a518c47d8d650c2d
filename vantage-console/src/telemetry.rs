//! Logging setup.
//!
//! Logs go to stderr so they never interleave with rendered views on
//! stdout.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::ConsoleError;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "VANTAGE_LOG";

const DEFAULT_FILTER: &str = "vantage_console=info,vantage_cache=info";

pub fn init_logging() -> Result<(), ConsoleError> {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()
        .map_err(|e| ConsoleError::Telemetry(e.to_string()))
}

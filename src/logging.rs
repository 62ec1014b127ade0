//! Log subscriber setup with a reloadable level filter

use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::{LogEncoding, LoggingConfig};
use crate::error::{Error, Result};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Build a filter for `level` (e.g. `info` or `pc_proxy=debug,warn`)
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| Error::logging(format!("Invalid log level '{}': {}", level, e)))
}

/// Install the global subscriber writing to stderr.
///
/// `RUST_LOG` takes precedence over the configured level at startup.
pub fn init(config: &LoggingConfig) -> Result<LogHandle> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&config.level)?,
    };
    let (filter, handle) = reload::Layer::new(filter);

    let (console, json) = match config.encoding {
        LogEncoding::Console => (
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            ),
            None,
        ),
        LogEncoding::Json => (None, Some(fmt::layer().json().with_writer(std::io::stderr))),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(json)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to install subscriber: {}", e)))?;

    Ok(LogHandle::new(handle, config.clone()))
}

/// Handle for changing the log level of an installed subscriber
pub struct LogHandle {
    filter: FilterHandle,
    current: Mutex<LoggingConfig>,
}

impl LogHandle {
    fn new(filter: FilterHandle, current: LoggingConfig) -> Self {
        Self {
            filter,
            current: Mutex::new(current),
        }
    }

    /// Apply reloaded logging settings. Level changes take effect immediately;
    /// an encoding change needs a restart.
    pub fn apply(&self, config: &LoggingConfig) -> Result<()> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());

        if config.encoding != current.encoding {
            tracing::warn!(
                old = ?current.encoding,
                new = ?config.encoding,
                "logging.encoding changed but requires restart to take effect"
            );
        }

        if config.level != current.level {
            let filter = build_filter(&config.level)?;
            self.filter
                .reload(filter)
                .map_err(|e| Error::logging(format!("Failed to reload log filter: {}", e)))?;
            tracing::info!(level = %config.level, "Log level changed");
            current.level = config.level.clone();
        }

        Ok(())
    }
}

//! Logging initialisation for vmbmc.
//!
//! When the `VMBMC_LOG` environment variable is set to `1`, structured logs
//! are also written to `vmbmc.log` in the log directory. Otherwise only
//! stderr output (filtered by `RUST_LOG`) is enabled. Session child
//! processes inherit stderr, so their lines interleave with the daemon's;
//! stdout stays reserved for the control channel.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::PathBuf;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::paths::VmbmcPaths;

pub const LOG_ENV: &str = "VMBMC_LOG";
const LOG_FILE: &str = "vmbmc.log";

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// `default_level` applies when `RUST_LOG` is unset: the daemon logs at
/// `info`, CLI commands at `warn`. Call once from `main`.
pub fn init(default_level: &str) -> LogGuard {
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_guard = if std::env::var(LOG_ENV).as_deref() == Ok("1") {
        let dir = log_dir();
        let _ = std::fs::create_dir_all(&dir);
        let file_appender = tracing_appender::rolling::never(dir, LOG_FILE);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn log_dir() -> PathBuf {
    VmbmcPaths::resolve()
        .map(|paths| paths.logs)
        .unwrap_or_else(|| std::env::temp_dir().join("vmbmc"))
}

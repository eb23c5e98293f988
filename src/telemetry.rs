//! Logging setup for the CLI and the server.
//!
//! `RUST_LOG` overrides the default level. When a log directory is given,
//! a daily-rotated JSON copy of every event is written there as well.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format for the console.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "info,repowatch=debug" } else { "info" })
    })
}

/// Install the global subscriber. Returns the file writer guard, which must
/// be held until exit so buffered lines are flushed. A second call is a no-op.
pub fn init(verbose: bool, format: LogFormat, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let console = match format {
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).with_target(false).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let appender = tracing_appender::rolling::daily(dir, "repowatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(default_filter(verbose))
        .with(console)
        .with(file)
        .try_init()
        .is_ok();

    if installed { guard } else { None }
}

//! Logging setup shared by the binaries.
//!
//! An `EnvFilter` driven by `HEARTH_LOG` with a per-binary default, a
//! stderr writer, and optionally a non-blocking file writer for the daemon.
//! Nothing ever logs to stdout: in a session worker stdout is the protocol
//! stream.

use std::path::PathBuf;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding the tracing filter directives.
pub const LOG_ENV: &str = "HEARTH_LOG";

pub struct LogConfig {
    default_directive: String,
    stderr: bool,
    file: Option<FileOutput>,
}

struct FileOutput {
    dir: PathBuf,
    prefix: String,
}

impl LogConfig {
    /// Filter from [`LOG_ENV`], falling back to `default_directive`.
    pub fn from_env(default_directive: &str) -> Self {
        Self {
            default_directive: default_directive.to_owned(),
            stderr: false,
            file: None,
        }
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    /// Add a daily-rotated file writer under `dir`.
    pub fn with_file(mut self, dir: impl Into<PathBuf>, prefix: &str) -> Self {
        self.file = Some(FileOutput {
            dir: dir.into(),
            prefix: prefix.to_owned(),
        });
        self
    }
}

/// Keeps the non-blocking file writer alive; dropping flushes it. Hold in
/// `main` for the life of the process.
pub struct LogGuards {
    _file: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. Safe to call more than once; later calls
/// keep the first subscriber.
pub fn init_logging(config: &LogConfig) -> LogGuards {
    let (subscriber, guards) = build(config);
    let _ = tracing::subscriber::set_global_default(subscriber);
    guards
}

fn build(config: &LogConfig) -> (impl tracing::Subscriber + Send + Sync + use<>, LogGuards) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(&config.default_directive));
    let stderr_layer = config
        .stderr
        .then(|| fmt::layer().with_writer(std::io::stderr));
    let (file_layer, file_guard) = match &config.file {
        Some(out) => {
            let appender = tracing_appender::rolling::daily(&out.dir, &out.prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer);
    (subscriber, LogGuards { _file: file_guard })
}

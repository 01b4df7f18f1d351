//! Structured file logging for every command that touches the store.
//!
//! Events go to `<data-dir>/logs/unembed.log` through a non-blocking writer,
//! as JSON lines unless `UNEMBED_LOG_FORMAT=pretty`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::paths::LOG_FILE_NAME;

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";

pub const LOG_FILTER_ENV: &str = "UNEMBED_LOG_FILTER";
pub const LOG_FORMAT_ENV: &str = "UNEMBED_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Anything other than `pretty` (any case) means JSON.
    fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

/// Keeps the background writer flushing; hold it until the process exits.
pub struct LoggingHandle {
    _guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;

    let directives = filter_directives(
        std::env::var(LOG_FILTER_ENV).ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format = LogFormat::parse(std::env::var(LOG_FORMAT_ENV).ok().as_deref());

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE_NAME));
    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_target(true);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match format {
        LogFormat::Json => base.json().flatten_event(true).with_current_span(true).boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_dir.join(LOG_FILE_NAME).display(),
        format = format.as_str(),
        filter = %directives,
    );

    Ok(LoggingHandle { _guard: guard })
}

/// `UNEMBED_LOG_FILTER` wins over `RUST_LOG`; blank values are ignored.
fn filter_directives(own: Option<String>, rust_log: Option<String>) -> String {
    own.into_iter()
        .chain(rust_log)
        .find(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

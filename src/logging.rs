use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. When a log
/// directory is configured, output goes to a daily rolling file and the
/// returned guard must be held until exit so buffered lines are flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;

  let (writer, guard) = match &config.directory {
    Some(directory) => {
      let appender = tracing_appender::rolling::daily(directory, "querycache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (fmt::writer::BoxMakeWriter::new(writer), Some(guard))
    }
    None => (fmt::writer::BoxMakeWriter::new(std::io::stderr), None),
  };
  let ansi = config.directory.is_none();

  let registry = tracing_subscriber::registry().with(filter);
  let installed = match config.format {
    LogFormat::Json => registry
      .with(fmt::layer().json().with_writer(writer))
      .try_init(),
    LogFormat::Pretty => registry
      .with(fmt::layer().with_target(true).with_ansi(ansi).with_writer(writer))
      .try_init(),
  };
  installed.map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  tracing::debug!(level = %config.level, format = ?config.format, "logging initialized");
  Ok(guard)
}

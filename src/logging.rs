//! Subscriber setup for the binary.

use clap::ValueEnum;
use color_eyre::{eyre::eyre, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Overrides the level-derived filter when set (EnvFilter syntax).
pub const FILTER_ENV: &str = "CAMPUS_RELAY_LOG";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
  Error,
  #[default]
  Warn,
  Info,
  Debug,
  Trace,
}

impl LogLevel {
  pub fn as_str(self) -> &'static str {
    match self {
      LogLevel::Error => "error",
      LogLevel::Warn => "warn",
      LogLevel::Info => "info",
      LogLevel::Debug => "debug",
      LogLevel::Trace => "trace",
    }
  }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
  pub level: LogLevel,
  /// Append to this file instead of stderr
  pub file: Option<PathBuf>,
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<()> {
  if GUARD.get().is_some() {
    return Ok(());
  }

  let (writer, guard) = match &config.file {
    Some(path) => {
      let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| eyre!("Failed to open log file {}: {}", path.display(), e))?;
      tracing_appender::non_blocking(file)
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  let subscriber = tracing_subscriber::fmt()
    .with_env_filter(build_filter(config.level))
    .with_target(config.level >= LogLevel::Debug)
    .with_ansi(config.file.is_none())
    .with_writer(writer)
    .finish();

  tracing::subscriber::set_global_default(subscriber)
    .map_err(|e| eyre!("Failed to install logger: {}", e))?;

  let _ = GUARD.set(guard);
  Ok(())
}

fn build_filter(level: LogLevel) -> EnvFilter {
  if let Ok(filter) = std::env::var(FILTER_ENV) {
    return EnvFilter::new(filter);
  }
  EnvFilter::new(default_filter_for(level))
}

/// At debug and trace only our own crate gets chatty.
fn default_filter_for(level: LogLevel) -> String {
  if level >= LogLevel::Debug {
    format!("warn,campus_relay={}", level.as_str())
  } else {
    level.as_str().to_string()
  }
}

//! Tracing setup for the library and the `bt-discover` binary.
//!
//! Console output goes to stderr so discovery results printed on stdout stay
//! clean. The rolling file writer is opt-in.

use crate::domain::settings::LogSettings;
use anyhow::Context;
use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Keeps the file writer alive; drop it last to flush pending lines
pub struct LoggingGuard {
    file_writer: Option<WorkerGuard>,
}

impl LoggingGuard {
    pub fn writes_to_file(&self) -> bool {
        self.file_writer.is_some()
    }
}

fn rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// `RUST_LOG` wins over the configured level
fn level_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&settings.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn file_appender(settings: &LogSettings) -> anyhow::Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(rotation(&settings.rotation))
        .filename_prefix(settings.file_name_prefix.as_str())
        .filename_suffix("log")
        .build(&settings.log_dir)
        .with_context(|| format!("Cannot write logs under {}", settings.log_dir))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let console_layer = settings.console_logging_enabled.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_file(settings.show_file_line)
            .with_line_number(settings.show_file_line)
            .with_thread_names(settings.show_thread_names)
            .with_target(settings.show_target)
            .with_ansi(settings.ansi_colors)
    });

    let mut file_writer = None;
    let file_layer = if settings.file_logging_enabled {
        let (writer, guard) = tracing_appender::non_blocking(file_appender(settings)?);
        file_writer = Some(guard);
        Some(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_names(settings.show_thread_names)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter(settings))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("A global logger is already installed")?;

    let guard = LoggingGuard { file_writer };
    tracing::debug!(
        level = %settings.level,
        file = guard.writes_to_file(),
        "Logger ready"
    );
    Ok(guard)
}

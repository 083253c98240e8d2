use std::io::{self, IsTerminal};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::LogFormat;

#[derive(Default, Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl Level {
    pub fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            Level::Silent
        } else if verbose {
            Level::Debug
        } else {
            Level::default()
        }
    }
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> LevelFilter {
        match level {
            Level::Silent => LevelFilter::OFF,
            Level::Error => LevelFilter::ERROR,
            Level::Warn => LevelFilter::WARN,
            Level::Info => LevelFilter::INFO,
            Level::Debug => LevelFilter::DEBUG,
        }
    }
}

/// Install the global subscriber. Logs always go to stderr; stdout carries
/// the event stream.
pub fn init_tracing(level: Level, log_format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy();

    let stderr = io::stderr;
    let ansi = stderr().is_terminal();

    match log_format {
        LogFormat::Full => {
            let stderr_layer = fmt::layer().with_writer(stderr).with_ansi(ansi);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
        LogFormat::Pretty => {
            let stderr_layer = fmt::layer()
                .with_writer(stderr)
                .with_ansi(ansi)
                .pretty();
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
        LogFormat::Json => {
            let stderr_layer = fmt::layer().json().with_writer(stderr);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
        }
    }
}

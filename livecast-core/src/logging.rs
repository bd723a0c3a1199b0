//! Subscriber setup for the `tracing` events emitted across the crate

use anyhow::{anyhow, Context};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    fmt::{format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    registry::Registry,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Output shape of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, with span context
    Json,
    /// Multi-line human output
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(anyhow!("unknown log format '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        })
    }
}

/// `warning` is accepted as an alias for `warn`.
pub fn parse_level(level: &str) -> anyhow::Result<LevelFilter> {
    let level = level.trim().to_ascii_lowercase();
    let level = if level == "warning" { "warn" } else { level.as_str() };
    LevelFilter::from_str(level).map_err(|_| anyhow!("invalid log level '{level}'"))
}

/// Install the global subscriber.
///
/// Lines go to stderr, or are appended to `file_path` without ANSI colors.
/// stdout stays free for command output. `RUST_LOG` overrides the
/// configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let format: LogFormat = config.format.parse()?;
    let filter = env_filter(&config.level)?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {path}"))?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    tracing_subscriber::registry()
        .with(fmt_layer(format, writer, ansi).with_filter(filter))
        .try_init()?;

    tracing::debug!(format = %format, level = %config.level, "Logging initialized");
    Ok(())
}

fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    let level = parse_level(level)?;
    Ok(EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into())))
}

fn fmt_layer(format: LogFormat, writer: BoxMakeWriter, ansi: bool) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => layer
            .json()
            .with_file(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed(),
        LogFormat::Pretty => layer.pretty().with_file(false).boxed(),
    }
}

//! Structured file logging for the console.
//!
//! Every event carries `component` and `event` fields. Output goes to
//! `<log_dir>/console.log` through a non-blocking writer; stdout stays free
//! for command output and terminal bytes.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "console.log";
const DEFAULT_FILTER: &str = "info,tungstenite=warn,tokio_tungstenite=warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// `pretty` (any case) selects human output; anything else is JSON lines.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Keeps the background writer alive; drop it last.
pub struct LoggingHandle {
    pub run_id: String,
    pub format: LogFormat,
    pub guard: WorkerGuard,
}

/// First directive that parses wins: `TERMFLEET_LOG_FILTER`, then `RUST_LOG`,
/// then the built-in default.
fn resolve_filter(own: Option<String>, rust_log: Option<String>) -> (EnvFilter, String) {
    [own, rust_log]
        .into_iter()
        .flatten()
        .find_map(|directive| EnvFilter::try_new(&directive).ok().map(|f| (f, directive)))
        .unwrap_or_else(|| (EnvFilter::new(DEFAULT_FILTER), DEFAULT_FILTER.to_string()))
}

pub fn init_logging(log_dir: &Path) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);

    if std::env::var("TERMFLEET_TRUNCATE_LOG_ON_START").as_deref() == Ok("1") {
        std::fs::File::create(&log_path)?;
    }

    let (filter, directive) = resolve_filter(
        std::env::var("TERMFLEET_LOG_FILTER").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let format = LogFormat::parse(std::env::var("TERMFLEET_LOG_FORMAT").ok().as_deref());
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));

    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true);
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry.with(base.pretty()).try_init()?,
        LogFormat::Json => registry
            .with(base.json().flatten_event(true).with_current_span(true))
            .try_init()?,
    }

    let run_id = std::env::var("TERMFLEET_RUN_ID").unwrap_or_else(|_| {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("{}-{started}", std::process::id())
    });

    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = ?format,
        run_id = %run_id,
        filter = %directive,
    );

    Ok(LoggingHandle {
        run_id,
        format,
        guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_defaults_to_json() {
        assert_eq!(LogFormat::parse(None), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("PRETTY")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(Some("compact")), LogFormat::Json);
    }

    #[test]
    fn own_filter_beats_rust_log_unless_invalid() {
        let (_, picked) = resolve_filter(Some("debug".into()), Some("warn".into()));
        assert_eq!(picked, "debug");

        let (_, picked) = resolve_filter(Some("termfleet=loud".into()), Some("warn".into()));
        assert_eq!(picked, "warn");

        let (_, picked) = resolve_filter(None, None);
        assert_eq!(picked, DEFAULT_FILTER);
    }
}

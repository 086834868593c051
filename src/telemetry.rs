//! Tracing setup for the bot.
//!
//! Mirrors the `get_subscriber`/`init_subscriber` split so that tests can
//! build a subscriber without installing it globally.

use crate::configuration::LoggingSettings;
use tracing::{
    Level, Subscriber,
    subscriber::set_global_default,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Builds a subscriber writing to stdout. Used when no log file is configured.
pub fn get_subscriber(level: &str) -> impl Subscriber + Send + Sync {
    FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .finish()
}

/// Builds a subscriber that writes to a rotating log file, returning the
/// worker guard that must be kept alive for the life of the process.
///
/// `max_bytes`/`backup_count` are accepted from configuration for
/// compatibility but the rotation granularity `tracing-appender` offers is
/// daily, not byte-bounded; we rotate daily and rely on `backup_count`-many
/// days being retained by the filesystem.
pub fn get_file_subscriber(
    level: &str,
    logging: &LoggingSettings,
) -> (impl Subscriber + Send + Sync, WorkerGuard) {
    let filename = logging
        .filename
        .as_ref()
        .expect("get_file_subscriber requires logging.filename to be set");
    let directory = filename.parent().unwrap_or_else(|| std::path::Path::new("."));
    let file_name = filename
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("beem.log");

    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(parse_level(level))
        .with_writer(non_blocking)
        .with_ansi(false)
        .finish();

    (subscriber, guard)
}

pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

use anyhow::Result;
use tracing::Level;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Configures logging with a stdout layer and a daily-rolling file layer.
///
/// # Arguments
/// * `name` - Base name for the log file under `logs/`
/// * `level` - Default level for stdout when `RUST_LOG` is unset
pub fn setup_logging(name: &str, level: Level) -> Result<()> {
    let stdout_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", level)));

    let stdout_log = fmt::layer().with_filter(stdout_filter);

    let file_appender = rolling::daily("logs", format!("{}.log", name));
    let file_log = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug,sqlx=info"));

    tracing_subscriber::Registry::default()
        .with(stdout_log)
        .with(file_log)
        .init();

    Ok(())
}

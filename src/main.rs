//! Entry point of the beem chat relay bot.

use beem::configuration::Settings;
use beem::orchestrator;
use beem::telemetry::{get_file_subscriber, get_subscriber, init_subscriber};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Multi-source chat relay bot for DCSS webtiles and Twitch chat.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "./beem_config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    let _guard = if settings.logging_config.filename.is_some() {
        let (subscriber, guard) = get_file_subscriber(&settings.logging_config.level, &settings.logging_config);
        init_subscriber(subscriber);
        Some(guard)
    } else {
        init_subscriber(get_subscriber(&settings.logging_config.level));
        None
    };

    info!("beem: starting up");

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone());

    orchestrator::run(settings, cancel).await?;

    info!("beem: shut down");
    Ok(())
}

/// Interrupt (Ctrl-C) and terminate both request a graceful shutdown; we
/// don't distinguish them beyond the log line, since every task already
/// tears down the same way on cancellation.
fn install_signal_handlers(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("beem: received interrupt, shutting down"),
                _ = terminate.recv() => info!("beem: received terminate signal, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("beem: received interrupt, shutting down");
        }
        cancel.cancel();
    });
}

use anyhow::Context;
use moisture_bridge::config::Settings;
use moisture_bridge::{logging, supervisor};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            if tracing::dispatcher::has_been_set() {
                error!("fatal: {e:#}");
            } else {
                eprintln!("moisture-bridge: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cfg_path = std::env::var("APP_CONFIG").unwrap_or_else(|_| "config/config.yaml".into());
    let settings =
        Settings::load(&cfg_path).with_context(|| format!("loading config from {cfg_path}"))?;
    logging::init(&settings.logging).context("initialising logging")?;
    info!(
        config = %cfg_path,
        broker = %settings.mqtt.broker,
        topic = %settings.mqtt.topic,
        database = %settings.database.name,
        "loaded config"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let reason = supervisor::start(&settings, shutdown)
        .await
        .context("startup failed")?;
    info!(reason = %reason, exit_code = reason.exit_code(), "moisture bridge stopped");
    Ok(ExitCode::from(reason.exit_code()))
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    token.cancel();
}

#![forbid(unsafe_code)]

use std::sync::Arc;

use httpdisk_attach::{AttachConfig, CommandSlotHost, ProcessSupervisor, SlotManager};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let config = AttachConfig::load();

    // stdout is reserved for the device path.
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    });

    let host = Arc::new(CommandSlotHost::new(config.nbd_client.clone()));
    let mut supervisor = ProcessSupervisor::new(SlotManager::new(host), config.bridge.clone());
    let mut stdout = tokio::io::stdout();
    supervisor
        .run(
            &config.socket_path,
            &config.export,
            &config.urls,
            cancel,
            &mut stdout,
        )
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install SIGINT handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}

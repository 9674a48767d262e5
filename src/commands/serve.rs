use dra_plugin_client::demo::demo_server;
use dra_plugin_client::ApiVersion;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub(crate) async fn cmd_serve(
    socket: &Path,
    versions: Vec<ApiVersion>,
    delay_ms: u64,
) -> anyhow::Result<()> {
    let versions = if versions.is_empty() {
        ApiVersion::FALLBACK_ORDER.to_vec()
    } else {
        versions
    };
    let server = demo_server(&versions, Duration::from_millis(delay_ms));

    let shutdown = CancellationToken::new();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let handle = shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    handle.cancel();
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    handle.cancel();
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        let handle = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Received Ctrl+C");
            handle.cancel();
        });
    }

    server.serve_at(socket, shutdown).await
}

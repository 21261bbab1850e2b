//! Serve command implementation.

use arkive_coordinator::{Coordinator, CoordinatorHandle};
use arkive_core::RepoConfig;
use std::path::{Path, PathBuf};

/// Runs the coordinator until a stop signal arrives.
pub async fn run(
    config: RepoConfig,
    config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let handle = Coordinator::bind(config).await?;
    tracing::info!(
        endpoint = %handle.local_endpoint(),
        version = env!("CARGO_PKG_VERSION"),
        "arkive coordinator started"
    );

    wait_for_stop(&handle, config_path.as_deref()).await?;

    tracing::info!(
        in_flight = handle.live_transactions(),
        "stop requested, finishing in-flight transactions"
    );
    handle.stop().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_stop(handle: &CoordinatorHandle, config_path: Option<&Path>) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("ctrl-c received, shutting down");
                return Ok(());
            }
            _ = terminate.recv() => {
                tracing::warn!("SIGTERM received, shutting down");
                return Ok(());
            }
            _ = hangup.recv() => reload(handle, config_path).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_stop(_handle: &CoordinatorHandle, _config_path: Option<&Path>) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::warn!("ctrl-c received, shutting down");
    Ok(())
}

#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(handle: &CoordinatorHandle, config_path: Option<&Path>) {
    let Some(path) = config_path else {
        tracing::warn!("reload requested but no configuration file was given");
        return;
    };
    tracing::info!(path = %path.display(), "reloading configuration");
    let result = match RepoConfig::load(path) {
        Ok(config) => handle.reload(config).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "reload failed, keeping the current configuration");
    }
}

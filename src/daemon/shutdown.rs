use std::{path::Path, sync::Arc};

use anyhow::Result;
use tokio::{
    select,
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::TrackerConfig;

/// Waits for SIGINT or SIGTERM and cancels `cancellation`. SIGHUP re-reads the configuration in
/// between. Returns early if something else cancels first.
pub async fn detect_shutdown(
    cancellation: CancellationToken,
    config_path: &Path,
    config: &watch::Sender<Arc<TrackerConfig>>,
) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT");
                break;
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = hangup.recv() => {
                reload_config(config_path, config);
            }
            _ = cancellation.cancelled() => return Ok(()),
        }
    }
    cancellation.cancel();
    Ok(())
}

/// Publishes the configuration at `path`. A file that fails to load keeps the running
/// configuration in place.
pub fn reload_config(path: &Path, config: &watch::Sender<Arc<TrackerConfig>>) -> bool {
    match TrackerConfig::load(path) {
        Ok(new) => {
            info!("Reloaded configuration from {path:?}");
            config.send_replace(Arc::new(new));
            true
        }
        Err(e) => {
            warn!("Keeping the previous configuration, {e:?}");
            false
        }
    }
}

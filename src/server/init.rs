//! Daemon startup and main run loop

use super::config::AppConfig;
use super::shutdown::cancel_on_signal;
use anyhow::{Context, Result};
use palmlink_core::delivery::TransportError;
use palmlink_core::instance_lock::LockError;
use palmlink_core::{ConnectionId, Daemon, FrameSink, InstanceLock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Frame sink used until a connection layer is attached. Every connection
/// is reported gone.
struct DetachedSink;

impl FrameSink for DetachedSink {
    fn send_frame(&self, _connection: &ConnectionId, _frame: String) -> Result<(), TransportError> {
        Err(TransportError::ConnectionGone)
    }

    fn close(&self, _connection: &ConnectionId) {}
}

/// Run the daemon until Ctrl+C or SIGTERM.
pub async fn run(config: AppConfig, pair: bool) -> Result<()> {
    info!("Starting palmlink v{}", env!("CARGO_PKG_VERSION"));

    config.validate().context("Invalid configuration")?;
    let settings = config.daemon_settings()?;
    info!("Data directory: {}", settings.data_dir.display());

    let lock = InstanceLock::acquire(
        settings.lock_path(),
        Duration::from_secs(config.lock.stale_after_secs),
    )
    .await
    .map_err(|e| match e {
        LockError::AlreadyRunning { pid } => {
            anyhow::anyhow!("palmlink is already running (pid {})", pid)
        }
        other => anyhow::Error::new(other).context("Failed to acquire instance lock"),
    })?;

    let daemon = Arc::new(
        Daemon::new(settings, Arc::new(DetachedSink))
            .await
            .context("Failed to initialize daemon")?,
    );

    if let Some(mut completions) = daemon.take_pairing_completions().await {
        tokio::spawn(async move {
            while let Some(paired) = completions.recv().await {
                info!(
                    device_id = %paired.device_id,
                    device_name = %paired.device_name,
                    "Device paired"
                );
            }
        });
    }

    if pair {
        let code = daemon.start_pairing().await;
        println!(
            "Pairing code: {}  (valid for {} minutes)",
            code.display,
            config.pairing.ttl_secs.div_ceil(60)
        );
    }

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let heartbeat = tokio::spawn(heartbeat_loop(
        lock,
        Duration::from_secs(config.lock.heartbeat_secs.max(1)),
        cancel.clone(),
    ));

    let result = daemon.run(cancel.clone()).await;
    cancel.cancel();

    match heartbeat.await {
        Ok(Some(lock)) => {
            if let Err(e) = lock.release().await {
                warn!(error = %e, "Failed to release instance lock");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Heartbeat task failed"),
    }

    result.context("Daemon stopped with an error")?;
    info!("palmlink stopped");
    Ok(())
}

/// Refresh the lock until cancelled. Returns the lock unless another process
/// took it over, in which case the daemon is shut down.
async fn heartbeat_loop(
    mut lock: InstanceLock,
    every: Duration,
    cancel: CancellationToken,
) -> Option<InstanceLock> {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Some(lock),
            _ = interval.tick() => {
                match lock.heartbeat().await {
                    Ok(()) => {}
                    Err(LockError::Lost { pid }) => {
                        error!(pid, "Instance lock taken over, shutting down");
                        cancel.cancel();
                        return None;
                    }
                    Err(e) => warn!(error = %e, "Lock heartbeat failed"),
                }
            }
        }
    }
}

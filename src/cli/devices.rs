//! Paired device commands
//!
//! `palmlink devices`             List paired devices
//! `palmlink revoke <id>`         Remove a paired device
//! `palmlink rename <id> <name>`  Change a device's display name

use crate::server::config::AppConfig;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use palmlink_core::{ClientRegistry, DaemonSettings, InstanceLock};
use std::time::Duration;

async fn open_registry(config: &AppConfig) -> Result<(DaemonSettings, ClientRegistry)> {
    let settings = config.daemon_settings()?;
    let registry = ClientRegistry::open(settings.registry_path())
        .await
        .context("Failed to open client registry")?;
    Ok((settings, registry))
}

/// The running daemon keeps the registry in memory and would overwrite
/// changes made behind its back.
async fn ensure_daemon_stopped(config: &AppConfig, settings: &DaemonSettings) -> Result<()> {
    let stale_after = Duration::from_secs(config.lock.stale_after_secs);
    if let Ok(Some(lock)) = InstanceLock::read(&settings.lock_path()).await {
        if !lock.is_stale(stale_after, Utc::now()) {
            bail!(
                "palmlink is running (pid {}); stop it before changing devices",
                lock.pid
            );
        }
    }
    Ok(())
}

/// List all paired devices
pub async fn list(config: &AppConfig) -> Result<()> {
    let (_, registry) = open_registry(config).await?;
    let devices = registry.list().await;

    if devices.is_empty() {
        println!("\nNo paired devices.");
        println!("Run `palmlink serve --pair` to pair a device.\n");
        return Ok(());
    }

    println!("\nPaired Devices ({})\n{}", devices.len(), "-".repeat(60));
    for device in &devices {
        println!(
            "  {} — {} (paired: {}, last seen: {})",
            device.device_id,
            device.name,
            device.created_at.format("%Y-%m-%d %H:%M"),
            device.last_seen.format("%Y-%m-%d %H:%M"),
        );
    }
    println!();

    Ok(())
}

/// Revoke a device by ID
pub async fn revoke(config: &AppConfig, device_id: &str) -> Result<()> {
    let (settings, registry) = open_registry(config).await?;
    ensure_daemon_stopped(config, &settings).await?;

    if registry.revoke(device_id).await? {
        println!("Device {} revoked.", device_id);
    } else {
        println!("Device {} not found.", device_id);
    }
    Ok(())
}

/// Rename a device
pub async fn rename(config: &AppConfig, device_id: &str, name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        bail!("Device name cannot be empty");
    }

    let (settings, registry) = open_registry(config).await?;
    ensure_daemon_stopped(config, &settings).await?;

    if registry.rename(device_id, name).await? {
        println!("Device {} renamed to {}.", device_id, name);
    } else {
        println!("Device {} not found.", device_id);
    }
    Ok(())
}

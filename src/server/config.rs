//! Configuration types
//!
//! Deserialized from the layered sources in `loader` and turned into
//! [`DaemonSettings`] for the core.

use anyhow::{bail, Context, Result};
use palmlink_core::pairing::PairingConfig;
use palmlink_core::tunnel::valid_subdomain;
use palmlink_core::{DaemonSettings, RestartPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// State directory, `~/.palmlink` when unset
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Session descriptor directory, `<data_dir>/sessions` when unset
    #[serde(default)]
    pub sessions_dir: Option<String>,
    pub server: ServerConfig,
    #[serde(default)]
    pub pairing: PairingAppConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(default)]
    pub workstation_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingAppConfig {
    #[serde(default = "default_pairing_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_confirm_attempts")]
    pub max_confirm_attempts: u32,
}

fn default_pairing_ttl() -> u64 {
    300
}

fn default_max_confirm_attempts() -> u32 {
    3
}

impl Default for PairingAppConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_pairing_ttl(),
            max_confirm_attempts: default_max_confirm_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

fn default_max_pending() -> usize {
    palmlink_core::delivery::DEFAULT_MAX_PENDING
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: u64,
}

fn default_stability_window_ms() -> u64 {
    300
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            stability_window_ms: default_stability_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

fn default_stale_after() -> u64 {
    30
}

fn default_heartbeat() -> u64 {
    10
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

/// Tunnel client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tunnel_binary")]
    pub binary: String,
    #[serde(default)]
    pub server_addr: String,
    #[serde(default = "default_tunnel_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub subdomain: Option<String>,
    #[serde(default = "default_restart_base_delay_ms")]
    pub restart_base_delay_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_tunnel_binary() -> String {
    "frpc".to_string()
}

fn default_tunnel_server_port() -> u16 {
    7000
}

fn default_restart_base_delay_ms() -> u64 {
    1000
}

fn default_max_restarts() -> u32 {
    5
}

fn default_stop_grace_secs() -> u64 {
    5
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: default_tunnel_binary(),
            server_addr: String::new(),
            server_port: default_tunnel_server_port(),
            domain: String::new(),
            subdomain: None,
            restart_base_delay_ms: default_restart_base_delay_ms(),
            max_restarts: default_max_restarts(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub file: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { file: true }
    }
}

impl AppConfig {
    /// Resolved state directory.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Ok(expand_home(dir)),
            _ => dirs::home_dir()
                .map(|home| home.join(".palmlink"))
                .context("Cannot resolve home directory; set data_dir"),
        }
    }

    /// Resolved session descriptor directory.
    pub fn sessions_dir(&self) -> Result<PathBuf> {
        match self.sessions_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => Ok(expand_home(dir)),
            _ => Ok(self.data_dir()?.join("sessions")),
        }
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        self.data_dir()?;
        if self.delivery.max_pending == 0 {
            bail!("delivery.max_pending must be at least 1");
        }
        if self.pairing.ttl_secs == 0 {
            bail!("pairing.ttl_secs must be non-zero");
        }

        if self.tunnel.enabled {
            match self.tunnel.subdomain.as_deref().map(str::trim) {
                None | Some("") => bail!("tunnel.subdomain is required when the tunnel is enabled"),
                Some(s) if !valid_subdomain(s) => {
                    bail!("tunnel.subdomain {:?} is not a valid DNS label", s)
                }
                Some(_) => {}
            }
            if self.tunnel.server_addr.trim().is_empty() {
                bail!("tunnel.server_addr is required when the tunnel is enabled");
            }
            if self.tunnel.domain.trim().is_empty() {
                bail!("tunnel.domain is required when the tunnel is enabled");
            }
        }
        Ok(())
    }

    /// Build the core daemon settings.
    pub fn daemon_settings(&self) -> Result<DaemonSettings> {
        let mut settings = DaemonSettings::under(self.data_dir()?);
        settings.sessions_dir = self.sessions_dir()?;
        if let Some(name) = self.server.workstation_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                settings.workstation_name = name.to_string();
            }
        }
        settings.stability_window = Duration::from_millis(self.watcher.stability_window_ms);
        settings.pairing = PairingConfig {
            ttl: Duration::from_secs(self.pairing.ttl_secs),
            max_confirm_attempts: self.pairing.max_confirm_attempts,
        };
        settings.max_pending = self.delivery.max_pending;

        let tunnel = &mut settings.tunnel;
        tunnel.enabled = self.tunnel.enabled;
        tunnel.binary = PathBuf::from(&self.tunnel.binary);
        tunnel.server_addr = self.tunnel.server_addr.clone();
        tunnel.server_port = self.tunnel.server_port;
        tunnel.subdomain = self
            .tunnel
            .subdomain
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        tunnel.domain = self.tunnel.domain.clone();
        tunnel.local_port = self.server.port;
        tunnel.restart = RestartPolicy {
            base_delay: Duration::from_millis(self.tunnel.restart_base_delay_ms),
            max_attempts: self.tunnel.max_restarts,
        };
        tunnel.stop_grace = Duration::from_secs(self.tunnel.stop_grace_secs);

        Ok(settings)
    }

    /// Daily log directory.
    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join("logs"))
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests;

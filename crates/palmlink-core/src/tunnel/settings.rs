//! Tunnel settings, restart policy and frpc config rendering.

use std::path::PathBuf;
use std::time::Duration;

/// Exponential restart backoff with a fixed attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before the first restart
    pub base_delay: Duration,
    /// Restarts allowed before giving up
    pub max_attempts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based): `base × 2^(attempt−1)`.
    /// `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt - 1)?;
        self.base_delay.checked_mul(factor)
    }
}

/// Everything the supervisor needs to launch the tunnel client.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Whether tunneling is switched on
    pub enabled: bool,
    /// Tunnel client binary, looked up on `PATH` unless it is a path
    pub binary: PathBuf,
    /// Tunnel server host
    pub server_addr: String,
    /// Tunnel server port
    pub server_port: u16,
    /// Subdomain reserved for this workstation
    pub subdomain: Option<String>,
    /// Public tunnel domain
    pub domain: String,
    /// Local port the connection layer listens on
    pub local_port: u16,
    /// Generated frpc config file
    pub config_path: PathBuf,
    /// Tunnel client output log
    pub log_path: PathBuf,
    /// Credentials file holding the bearer token
    pub credentials_path: PathBuf,
    /// Restart backoff
    pub restart: RestartPolicy,
    /// Time between SIGTERM and kill on stop
    pub stop_grace: Duration,
}

impl TunnelSettings {
    /// Public URL once connected: `https://<subdomain>.<domain>`.
    pub fn public_url(&self) -> Option<String> {
        let subdomain = self.subdomain.as_deref()?.trim();
        if subdomain.is_empty() {
            return None;
        }
        Some(format!("https://{}.{}", subdomain, self.domain))
    }
}

/// Whether a subdomain is usable as a DNS label.
pub fn valid_subdomain(subdomain: &str) -> bool {
    !subdomain.is_empty()
        && subdomain.len() <= 63
        && !subdomain.starts_with('-')
        && !subdomain.ends_with('-')
        && subdomain
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Env var the generated config reads the bearer token from.
pub const TOKEN_ENV: &str = "PALMLINK_TUNNEL_TOKEN";
/// Env var the generated config reads the local port from.
pub const LOCAL_PORT_ENV: &str = "PALMLINK_LOCAL_PORT";

/// Render the frpc TOML config. Secrets stay out of the file; frpc fills
/// them in from the environment through its template syntax.
pub fn render_frpc_config(settings: &TunnelSettings, subdomain: &str) -> String {
    format!(
        r#"# Generated by palmlink. Changes are overwritten on every start.
serverAddr = "{server_addr}"
serverPort = {server_port}
loginFailExit = false

auth.method = "token"
auth.token = "{{{{ .Envs.{token_env} }}}}"

log.to = "console"
log.level = "info"

[[proxies]]
name = "palmlink-{subdomain}"
type = "http"
localIP = "127.0.0.1"
localPort = {{{{ .Envs.{port_env} }}}}
subdomain = "{subdomain}"
"#,
        server_addr = settings.server_addr.replace(['"', '\\'], ""),
        server_port = settings.server_port,
        token_env = TOKEN_ENV,
        port_env = LOCAL_PORT_ENV,
        subdomain = subdomain,
    )
}

//! Tunnel client supervisor.
//!
//! Runs the frpc tunnel client as a child process and tracks its
//! connectivity from output markers and exit codes:
//!
//! ```text
//! disabled ──start──▶ starting ──marker──▶ connected
//!                        │                    │
//!                        │ preconditions      │ exit / closed marker
//!                        ▼                    ▼
//!                  not_configured        disconnected ──backoff──▶ starting
//!                                             │
//!                                             │ budget spent
//!                                             ▼
//!                                           error
//! ```
//!
//! Every launch bumps a generation number. Output and exit notifications of
//! an older child carry a stale generation and are ignored.

pub mod settings;

pub use settings::{render_frpc_config, valid_subdomain, RestartPolicy, TunnelSettings};

use crate::credentials::LocalCredentials;
use crate::event_bus::{DaemonEvent, EventBus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use settings::{LOCAL_PORT_ENV, TOKEN_ENV};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connectivity state of the tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    /// Not running
    #[default]
    Disabled,
    /// Child spawned, waiting for a login marker
    Starting,
    /// Proxy registered with the server
    Connected,
    /// Child lost its connection or exited; a restart may be pending
    Disconnected,
    /// Failure marker, spawn error, or restart budget spent
    Error,
    /// Preconditions unmet
    NotConfigured,
}

/// Full supervisor state, published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelState {
    /// Current status
    pub status: TunnelStatus,
    /// Reason for the last failure
    pub last_error: Option<String>,
    /// Child process id while running
    pub pid: Option<u32>,
    /// Consecutive restarts since the last successful connection
    pub restart_count: u32,
    /// Public URL of the tunnel
    pub url: Option<String>,
    /// Delay of the pending restart, in milliseconds
    pub next_retry_ms: Option<u64>,
}

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    /// A launch precondition is unmet
    #[error("tunnel not configured: {0}")]
    NotConfigured(String),

    /// The child could not be spawned
    #[error("failed to spawn tunnel client: {0}")]
    Spawn(std::io::Error),

    /// Writing the config or log file failed
    #[error("tunnel io: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// What an output line says about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMarker {
    /// Login or proxy registration succeeded
    Connected,
    /// Unrecoverable failure reported by the client
    Failed,
    /// The server connection dropped
    Disconnected,
}

const FAILURE_MARKERS: &[&str] = &[
    "login to the server failed",
    "connect to server error",
    "proxy already exists",
];
const CONNECTED_MARKERS: &[&str] = &["login to server success", "start proxy success"];
const DISCONNECTED_MARKERS: &[&str] = &["connection closed", "EOF"];

impl OutputMarker {
    /// Classify one line of client output.
    pub fn classify(line: &str) -> Option<Self> {
        if FAILURE_MARKERS.iter().any(|m| line.contains(m)) {
            Some(Self::Failed)
        } else if CONNECTED_MARKERS.iter().any(|m| line.contains(m)) {
            Some(Self::Connected)
        } else if DISCONNECTED_MARKERS.iter().any(|m| line.contains(m)) {
            Some(Self::Disconnected)
        } else {
            None
        }
    }
}

struct RunningChild {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exited: oneshot::Receiver<()>,
}

impl RunningChild {
    fn force_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

#[derive(Default)]
struct RunState {
    generation: u64,
    intentional_stop: bool,
    child: Option<RunningChild>,
    restart_timer: Option<JoinHandle<()>>,
}

struct Inner {
    settings: TunnelSettings,
    bus: EventBus,
    state: watch::Sender<TunnelState>,
    run: Mutex<RunState>,
}

/// Supervises the tunnel client process.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    /// Create a supervisor in the `disabled` state.
    pub fn new(settings: TunnelSettings, bus: EventBus) -> Self {
        let (state, _) = watch::channel(TunnelState {
            url: settings.public_url(),
            ..Default::default()
        });
        Self {
            inner: Arc::new(Inner {
                settings,
                bus,
                state,
                run: Mutex::new(RunState::default()),
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> TunnelState {
        self.inner.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.inner.state.subscribe()
    }

    /// Manually start the tunnel. Resets the restart budget and cancels any
    /// pending restart. Does nothing if the client is already running.
    pub async fn start(&self) -> Result<()> {
        let mut run = self.inner.run.lock().await;
        if let Some(timer) = run.restart_timer.take() {
            timer.abort();
        }
        self.inner.update(|s| s.restart_count = 0);
        Inner::launch(&self.inner, &mut run).await
    }

    /// Stop the tunnel: cancel pending restarts, send SIGTERM, and kill the
    /// child if it is still alive after the grace period.
    pub async fn stop(&self) {
        let child = {
            let mut run = self.inner.run.lock().await;
            run.intentional_stop = true;
            if let Some(timer) = run.restart_timer.take() {
                timer.abort();
            }
            run.child.take()
        };

        let Some(mut child) = child else {
            self.inner.update(|s| {
                s.status = TunnelStatus::Disabled;
                s.pid = None;
                s.next_retry_ms = None;
            });
            return;
        };

        info!(pid = ?child.pid, "Stopping tunnel client");
        if !terminate(child.pid) {
            child.force_kill();
        }

        let grace = self.inner.settings.stop_grace;
        if tokio::time::timeout(grace, &mut child.exited).await.is_err() {
            warn!(pid = ?child.pid, grace_secs = grace.as_secs(), "Tunnel client ignored SIGTERM, killing");
            child.force_kill();
            let _ = child.exited.await;
        }
    }
}

impl Inner {
    fn update(&self, apply: impl FnOnce(&mut TunnelState)) {
        let mut changed = false;
        self.state.send_if_modified(|state| {
            let before = state.clone();
            apply(state);
            changed = *state != before;
            changed
        });
        if changed {
            let state = self.state.borrow().clone();
            debug!(status = ?state.status, restart_count = state.restart_count, "Tunnel state changed");
            self.bus.publish(DaemonEvent::TunnelStatusChanged { state });
        }
    }

    async fn check_preconditions(&self) -> std::result::Result<(String, String), String> {
        let settings = &self.settings;
        if !settings.enabled {
            return Err("tunneling is disabled".to_string());
        }
        let subdomain = match settings.subdomain.as_deref().map(str::trim) {
            Some(s) if valid_subdomain(s) => s.to_string(),
            Some(s) if !s.is_empty() => return Err(format!("invalid subdomain {:?}", s)),
            _ => return Err("no subdomain configured".to_string()),
        };

        let credentials = LocalCredentials::load(&settings.credentials_path)
            .await
            .ok()
            .flatten()
            .ok_or_else(|| "no stored credentials".to_string())?;
        let token = credentials
            .valid_bearer_token(Utc::now())
            .ok_or_else(|| "bearer token missing or expired".to_string())?
            .to_string();

        if which::which(&settings.binary).is_err() {
            return Err(format!(
                "tunnel client {} not found",
                settings.binary.display()
            ));
        }
        Ok((subdomain, token))
    }

    async fn launch(self: &Arc<Self>, run: &mut RunState) -> Result<()> {
        if run.child.is_some() {
            debug!("Tunnel client already running");
            return Ok(());
        }

        self.update(|s| {
            s.status = TunnelStatus::Starting;
            s.next_retry_ms = None;
            s.pid = None;
        });

        let (subdomain, token) = match self.check_preconditions().await {
            Ok(ok) => ok,
            Err(reason) => {
                info!(reason = %reason, "Tunnel not configured");
                self.update(|s| {
                    s.status = TunnelStatus::NotConfigured;
                    s.last_error = Some(reason.clone());
                });
                return Err(TunnelError::NotConfigured(reason));
            }
        };

        let log = match self.prepare_files(&subdomain).await {
            Ok(log) => log,
            Err(e) => {
                self.fail(e.to_string());
                return Err(e.into());
            }
        };

        let mut command = Command::new(&self.settings.binary);
        command
            .arg("-c")
            .arg(&self.settings.config_path)
            .env(TOKEN_ENV, &token)
            .env(LOCAL_PORT_ENV, self.settings.local_port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(binary = %self.settings.binary.display(), error = %e, "Tunnel client spawn failed");
                self.fail(e.to_string());
                return Err(TunnelError::Spawn(e));
            }
        };

        run.generation += 1;
        run.intentional_stop = false;
        let generation = run.generation;
        let pid = child.id();

        let log = Arc::new(Mutex::new(log));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(Self::watch_output(self.clone(), generation, stdout, log.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(Self::watch_output(self.clone(), generation, stderr, log));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        tokio::spawn(Self::watch_exit(self.clone(), generation, child, kill_rx, exited_tx));

        run.child = Some(RunningChild {
            pid,
            kill: Some(kill_tx),
            exited: exited_rx,
        });
        info!(pid = ?pid, subdomain = %subdomain, "Tunnel client started");
        self.update(|s| {
            s.pid = pid;
            s.url = self.settings.public_url();
        });
        Ok(())
    }

    async fn prepare_files(&self, subdomain: &str) -> std::io::Result<File> {
        for path in [&self.settings.config_path, &self.settings.log_path] {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }
        tokio::fs::write(
            &self.settings.config_path,
            render_frpc_config(&self.settings, subdomain),
        )
        .await?;
        File::create(&self.settings.log_path).await
    }

    fn fail(&self, reason: String) {
        self.update(|s| {
            s.status = TunnelStatus::Error;
            s.last_error = Some(reason);
            s.pid = None;
        });
    }

    async fn watch_output<R>(self: Arc<Self>, generation: u64, stream: R, log: Arc<Mutex<File>>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut lines = BufReader::new(stream).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Tunnel output read failed");
                    break;
                }
            };

            {
                let mut log = log.lock().await;
                if let Err(e) = log.write_all(format!("{}\n", line).as_bytes()).await {
                    debug!(error = %e, "Tunnel log write failed");
                }
            }

            if let Some(marker) = OutputMarker::classify(&line) {
                self.on_marker(generation, marker, &line).await;
            }
        }
        let _ = log.lock().await.flush().await;
    }

    async fn on_marker(&self, generation: u64, marker: OutputMarker, line: &str) {
        let run = self.run.lock().await;
        if run.generation != generation || run.child.is_none() {
            return;
        }
        drop(run);

        match marker {
            OutputMarker::Connected => {
                info!(url = ?self.settings.public_url(), "Tunnel connected");
                self.update(|s| {
                    s.status = TunnelStatus::Connected;
                    s.restart_count = 0;
                    s.last_error = None;
                });
            }
            OutputMarker::Failed => {
                warn!(line = %line, "Tunnel client reported failure");
                self.update(|s| {
                    s.status = TunnelStatus::Error;
                    s.last_error = Some(line.trim().to_string());
                });
            }
            OutputMarker::Disconnected => {
                // A failure marker stays terminal.
                let running = matches!(
                    self.state.borrow().status,
                    TunnelStatus::Starting | TunnelStatus::Connected
                );
                if running {
                    info!("Tunnel connection lost");
                    self.update(|s| s.status = TunnelStatus::Disconnected);
                }
            }
        }
    }

    async fn watch_exit(
        self: Arc<Self>,
        generation: u64,
        mut child: Child,
        kill: oneshot::Receiver<()>,
        exited: oneshot::Sender<()>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill => {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Tunnel client kill failed");
                }
                child.wait().await
            }
        };
        self.on_exit(generation, status).await;
        let _ = exited.send(());
    }

    async fn on_exit(self: &Arc<Self>, generation: u64, status: std::io::Result<ExitStatus>) {
        let mut run = self.run.lock().await;
        if run.generation != generation {
            return;
        }
        run.child = None;

        let reason = match &status {
            Ok(status) => format!("tunnel client exited with {}", status),
            Err(e) => format!("tunnel client wait failed: {}", e),
        };

        if run.intentional_stop {
            info!("Tunnel client stopped");
            self.update(|s| {
                s.status = TunnelStatus::Disabled;
                s.pid = None;
                s.next_retry_ms = None;
            });
            return;
        }

        if self.state.borrow().status == TunnelStatus::Error {
            warn!(reason = %reason, "Tunnel client exited after a failure marker, not restarting");
            self.update(|s| s.pid = None);
            return;
        }

        warn!(reason = %reason, "Tunnel client exited unexpectedly");
        self.update(|s| {
            s.status = TunnelStatus::Disconnected;
            s.last_error = Some(reason);
            s.pid = None;
        });
        self.schedule_restart(&mut run);
    }

    fn schedule_restart(self: &Arc<Self>, run: &mut RunState) {
        let attempt = self.state.borrow().restart_count + 1;
        let Some(delay) = self.settings.restart.delay_for(attempt) else {
            let max = self.settings.restart.max_attempts;
            warn!(attempts = max, "Tunnel restart budget exhausted");
            self.update(|s| {
                s.status = TunnelStatus::Error;
                s.last_error = Some(format!("gave up after {} restarts", max));
                s.next_retry_ms = None;
            });
            return;
        };

        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling tunnel restart");
        self.update(|s| {
            s.restart_count = attempt;
            s.next_retry_ms = Some(delay.as_millis() as u64);
        });

        let inner = self.clone();
        run.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut run = inner.run.lock().await;
            run.restart_timer = None;
            if run.intentional_stop {
                return;
            }
            if let Err(e) = Inner::launch(&inner, &mut run).await {
                debug!(error = %e, "Tunnel restart failed");
            }
        }));
    }
}

impl std::fmt::Debug for TunnelSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSupervisor")
            .field("state", &self.state())
            .finish()
    }
}

/// Send SIGTERM. Returns false when no signal could be sent.
#[cfg(unix)]
fn terminate(pid: Option<u32>) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "SIGTERM failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn terminate(_pid: Option<u32>) -> bool {
    false
}

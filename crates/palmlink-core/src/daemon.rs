//! Daemon composition root
//!
//! Owns every component and exposes the API the connection layer calls:
//! authenticate a device on a connection, deliver and acknowledge batches,
//! drive pairing, and tear a connection down. The connection layer itself
//! (sockets, framing) plugs in through [`FrameSink`].

use crate::channel::{ConnectionId, SecureChannelManager};
use crate::credentials::LocalCredentials;
use crate::delivery::{
    BatchTransport, DeliveryQueue, DeliveryReceipt, MessageBatch, TransportError,
    DEFAULT_MAX_PENDING,
};
use crate::error::{ChannelError, Result};
use crate::event_bus::{DaemonEvent, EventBus};
use crate::fs_watch::DEFAULT_STABILITY_WINDOW;
use crate::pairing::{
    PairedClient, PairingCode, PairingConfig, PairingEngine, PairingMessage, WorkstationIdentity,
};
use crate::registry::ClientRegistry;
use crate::sessions::{SessionDescriptor, SessionWatcher};
use crate::transcript::{TranscriptStore, TranscriptWatcher};
use crate::tunnel::{RestartPolicy, TunnelSettings, TunnelSupervisor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry file name under the data directory.
pub const REGISTRY_FILE: &str = "clients.json";
/// Credentials file name under the data directory.
pub const CREDENTIALS_FILE: &str = "credentials.json";
/// Instance lock file name under the data directory.
pub const LOCK_FILE: &str = "palmlink.lock";

/// Daemon settings, usually built from the binary's configuration.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// State directory (registry, credentials, lock, logs)
    pub data_dir: PathBuf,
    /// Directory agents write session descriptors into
    pub sessions_dir: PathBuf,
    /// Display name sent to pairing devices
    pub workstation_name: String,
    /// Debounce window for filesystem changes
    pub stability_window: Duration,
    /// Pairing code lifetime and retry budget
    pub pairing: PairingConfig,
    /// Pending batch bound per connection
    pub max_pending: usize,
    /// Event bus broadcast capacity
    pub event_capacity: usize,
    /// Tunnel client settings
    pub tunnel: TunnelSettings,
}

impl DaemonSettings {
    /// Defaults rooted at `data_dir`, with tunneling disabled.
    pub fn under(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let workstation_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "workstation".to_string());

        Self {
            sessions_dir: data_dir.join("sessions"),
            workstation_name,
            stability_window: DEFAULT_STABILITY_WINDOW,
            pairing: PairingConfig::default(),
            max_pending: DEFAULT_MAX_PENDING,
            event_capacity: 256,
            tunnel: TunnelSettings {
                enabled: false,
                binary: PathBuf::from("frpc"),
                server_addr: String::new(),
                server_port: 7000,
                subdomain: None,
                domain: String::new(),
                local_port: 0,
                config_path: data_dir.join("frpc.toml"),
                log_path: data_dir.join("logs").join("frpc.log"),
                credentials_path: data_dir.join(CREDENTIALS_FILE),
                restart: RestartPolicy::default(),
                stop_grace: Duration::from_secs(5),
            },
            data_dir,
        }
    }

    /// Registry file path.
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE)
    }

    /// Credentials file path.
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join(CREDENTIALS_FILE)
    }

    /// Instance lock path.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE)
    }
}

/// Outbound side of the connection layer.
pub trait FrameSink: Send + Sync {
    /// Send a base64 envelope to a connection. Must not block.
    fn send_frame(&self, connection: &ConnectionId, frame: String) -> std::result::Result<(), TransportError>;

    /// Close a connection the daemon gave up on, so the client reconnects
    /// and resumes from its cursor.
    fn close(&self, connection: &ConnectionId);
}

/// Encrypts batches with the connection's channel key before handing them
/// to the frame sink.
struct SealedTransport {
    channels: Arc<SecureChannelManager>,
    sink: Arc<dyn FrameSink>,
}

impl BatchTransport for SealedTransport {
    fn send_batch(
        &self,
        connection: &ConnectionId,
        batch: &MessageBatch,
    ) -> std::result::Result<(), TransportError> {
        let frame = self
            .channels
            .encrypt_json(connection, batch)
            .map_err(|e| match e {
                ChannelError::NoContext(_) => TransportError::ConnectionGone,
                other => TransportError::Other(other.to_string()),
            })?;
        self.sink.send_frame(connection, frame)
    }
}

/// The palmlink daemon.
pub struct Daemon {
    settings: DaemonSettings,
    bus: EventBus,
    credentials: LocalCredentials,
    registry: Arc<ClientRegistry>,
    pairing: Arc<PairingEngine>,
    completions: Mutex<Option<mpsc::UnboundedReceiver<PairedClient>>>,
    channels: Arc<SecureChannelManager>,
    sink: Arc<dyn FrameSink>,
    delivery: DeliveryQueue,
    sessions: Arc<SessionWatcher>,
    transcripts: Arc<TranscriptWatcher>,
    tunnel: TunnelSupervisor,
}

impl Daemon {
    /// Build every component. Must be called inside the tokio runtime.
    pub async fn new(settings: DaemonSettings, transport: Arc<dyn FrameSink>) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.data_dir).await?;

        let bus = EventBus::new(settings.event_capacity);
        let credentials = LocalCredentials::load_or_create(&settings.credentials_path()).await?;
        let registry = Arc::new(ClientRegistry::open(settings.registry_path()).await?);

        let identity = WorkstationIdentity {
            id: credentials.workstation_id(),
            name: settings.workstation_name.clone(),
        };
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let pairing = PairingEngine::new(
            registry.clone(),
            bus.clone(),
            identity,
            settings.pairing.clone(),
            completions_tx,
        );

        let channels = Arc::new(SecureChannelManager::new());
        let delivery = DeliveryQueue::with_max_pending(
            Arc::new(SealedTransport {
                channels: channels.clone(),
                sink: transport.clone(),
            }),
            settings.max_pending,
        );

        let sessions = Arc::new(SessionWatcher::new(
            &settings.sessions_dir,
            bus.clone(),
            settings.stability_window,
        )?);
        let transcripts = Arc::new(TranscriptWatcher::new(
            Arc::new(TranscriptStore::new()),
            bus.clone(),
            settings.stability_window,
        )?);
        let tunnel = TunnelSupervisor::new(settings.tunnel.clone(), bus.clone());

        info!(
            workstation_id = %pairing.identity().id,
            data_dir = %settings.data_dir.display(),
            "Daemon initialized"
        );

        Ok(Self {
            settings,
            bus,
            credentials,
            registry,
            pairing,
            completions: Mutex::new(Some(completions_rx)),
            channels,
            sink: transport,
            delivery,
            sessions,
            transcripts,
            tunnel,
        })
    }

    /// Settings the daemon was built with.
    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Workstation credentials.
    pub fn credentials(&self) -> &LocalCredentials {
        &self.credentials
    }

    /// Paired-device registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Transcript buffers, for cursor-based resync.
    pub fn transcripts(&self) -> &Arc<TranscriptStore> {
        self.transcripts.store()
    }

    /// Tunnel supervisor.
    pub fn tunnel(&self) -> &TunnelSupervisor {
        &self.tunnel
    }

    /// Sessions currently known to be running.
    pub async fn active_sessions(&self) -> Vec<SessionDescriptor> {
        self.sessions.active().await
    }

    /// Start a pairing session and return the code to show the operator.
    pub async fn start_pairing(&self) -> PairingCode {
        self.pairing.start_pairing().await
    }

    /// Cancel the active pairing session, if any.
    pub async fn cancel_pairing(&self) {
        self.pairing.cancel().await;
    }

    /// Handle one raw pairing message from an unauthenticated connection.
    pub async fn handle_pairing(&self, raw: &str) -> PairingMessage {
        self.pairing.handle_json(raw).await
    }

    /// Take the receiver of completed pairings. Only the first caller gets it.
    pub async fn take_pairing_completions(&self) -> Option<mpsc::UnboundedReceiver<PairedClient>> {
        self.completions.lock().await.take()
    }

    /// Authenticate a device on a connection and install its channel key.
    pub async fn authenticate(&self, connection: &ConnectionId, device_id: &str, token: &str) -> bool {
        if !self.registry.validate(device_id, token).await {
            warn!(connection = %connection, device_id = %device_id, "Authentication failed");
            return false;
        }
        let Some(key) = self.registry.encryption_key(device_id).await else {
            // Revoked between validate and key lookup.
            return false;
        };
        if let Err(e) = self.registry.touch(device_id).await {
            warn!(device_id = %device_id, error = %e, "Failed to record last-seen time");
        }

        self.channels.register(connection.clone(), device_id, key);
        info!(connection = %connection, device_id = %device_id, "Client authenticated");
        true
    }

    /// Forget a connection: drop its channel context and undelivered batches.
    pub fn disconnect(&self, connection: &ConnectionId) {
        let had_context = self.channels.remove(connection);
        let dropped = self.delivery.on_disconnect(connection);
        if had_context {
            info!(connection = %connection, dropped, "Client disconnected");
        }
    }

    /// Queue a batch for an authenticated connection.
    ///
    /// On overflow the connection is closed as well as dropped.
    pub fn deliver(&self, connection: &ConnectionId, batch: MessageBatch) -> Result<DeliveryReceipt> {
        if !self.channels.has(connection) {
            return Err(ChannelError::NoContext(connection.clone()).into());
        }
        match self.delivery.enqueue(connection, batch) {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                warn!(connection = %connection, error = %e, "Dropping slow client");
                self.close_connection(connection);
                Err(e.into())
            }
        }
    }

    /// Queue every line of a session after the client's timestamp cursor.
    pub async fn resync(
        &self,
        connection: &ConnectionId,
        session_id: &str,
        cursor: &str,
    ) -> Result<Option<DeliveryReceipt>> {
        let lines = self.transcripts().since_timestamp(session_id, cursor).await;
        if lines.is_empty() {
            return Ok(None);
        }
        let batch = MessageBatch {
            session_id: session_id.to_string(),
            lines,
            initial: cursor.is_empty(),
        };
        self.deliver(connection, batch).map(Some)
    }

    /// The client acknowledged its in-flight batch.
    pub fn acknowledge(&self, connection: &ConnectionId) -> bool {
        self.delivery.on_ack(connection)
    }

    /// Decrypt and parse an inbound frame from an authenticated connection.
    pub fn open_frame<T: serde::de::DeserializeOwned>(
        &self,
        connection: &ConnectionId,
        frame: &str,
    ) -> Result<T> {
        Ok(self.channels.decrypt_json(connection, frame)?)
    }

    /// Revoke a device and drop all of its connections.
    pub async fn revoke(&self, device_id: &str) -> Result<bool> {
        let removed = self.registry.revoke(device_id).await?;
        for connection in self.channels.connections_for(device_id) {
            self.close_connection(&connection);
        }
        Ok(removed)
    }

    /// Daemon-initiated disconnect: forget the connection and ask the
    /// connection layer to close it.
    fn close_connection(&self, connection: &ConnectionId) {
        self.disconnect(connection);
        self.sink.close(connection);
    }

    /// Run until `cancel` fires: watch sessions and transcripts, fan new
    /// lines out to authenticated connections, and supervise the tunnel.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        // Subscribe before the scan so no session event is missed.
        let mut events = self.bus.subscribe();

        self.sessions.scan_existing().await?;

        let sessions_task = {
            let sessions = self.sessions.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move { sessions.run(cancel).await })
        };
        let transcripts_task = {
            let transcripts = self.transcripts.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move { transcripts.run(cancel).await })
        };

        if self.settings.tunnel.enabled {
            if let Err(e) = self.tunnel.start().await {
                warn!(error = %e, "Tunnel did not start");
            }
        }

        let mut tracked: HashMap<String, PathBuf> = HashMap::new();
        for session in self.sessions.active().await {
            self.track_session(&mut tracked, &session).await;
        }

        info!(sessions_dir = %self.settings.sessions_dir.display(), "Daemon running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => self.on_event(&mut tracked, event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Event bus lagged, reconciling sessions");
                        self.reconcile(&mut tracked).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("Daemon shutting down");
        self.tunnel.stop().await;
        cancel.cancel();
        let _ = sessions_task.await;
        let _ = transcripts_task.await;
        Ok(())
    }

    async fn on_event(&self, tracked: &mut HashMap<String, PathBuf>, event: DaemonEvent) {
        match event {
            DaemonEvent::SessionStarted { session } | DaemonEvent::SessionUpdated { session } => {
                self.track_session(tracked, &session).await;
            }
            DaemonEvent::SessionEnded { session_id } => {
                if tracked.remove(&session_id).is_some() {
                    self.transcripts.unregister(&session_id).await;
                }
            }
            DaemonEvent::MessagesAppended {
                session_id,
                lines,
                initial,
            } => {
                self.fan_out(MessageBatch {
                    session_id,
                    lines,
                    initial,
                });
            }
            other => debug!(event = other.name(), "Event not routed"),
        }
    }

    async fn track_session(&self, tracked: &mut HashMap<String, PathBuf>, session: &SessionDescriptor) {
        if tracked.get(&session.session_id) == Some(&session.transcript_path) {
            return;
        }
        tracked.insert(session.session_id.clone(), session.transcript_path.clone());
        self.transcripts
            .register(&session.session_id, &session.transcript_path)
            .await;
    }

    async fn reconcile(&self, tracked: &mut HashMap<String, PathBuf>) {
        let active = self.sessions.active().await;
        let stale: Vec<String> = tracked
            .keys()
            .filter(|id| !active.iter().any(|s| &s.session_id == *id))
            .cloned()
            .collect();
        for session_id in stale {
            tracked.remove(&session_id);
            self.transcripts.unregister(&session_id).await;
        }
        for session in &active {
            self.track_session(tracked, session).await;
        }
    }

    fn fan_out(&self, batch: MessageBatch) {
        for connection in self.channels.connections() {
            if let Err(e) = self.delivery.enqueue(&connection, batch.clone()) {
                warn!(connection = %connection, error = %e, "Dropping slow client");
                self.close_connection(&connection);
            }
        }
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("data_dir", &self.settings.data_dir)
            .field("connections", &self.channels.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;

//! Session lifecycle watcher.
//!
//! Agent hooks write one `<session_id>.json` descriptor per running session
//! into a shared directory and delete it when the session ends. The watcher
//! mirrors that directory into an active-session map and republishes every
//! change on the event bus.

use crate::event_bus::{DaemonEvent, EventBus};
use crate::fs_watch::{FsChange, FsChangeKind, FsWatcher};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Externally written description of a running agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    /// Session identifier
    pub session_id: String,
    /// Agent that owns the session
    #[serde(default)]
    pub provider: String,
    /// Working directory of the agent
    #[serde(default)]
    pub cwd: PathBuf,
    /// JSONL transcript file
    pub transcript_path: PathBuf,
    /// Agent process id
    #[serde(default)]
    pub pid: Option<u32>,
    /// Controlling terminal
    #[serde(default)]
    pub tty: Option<String>,
    /// When the session started
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Watches the session descriptor directory.
pub struct SessionWatcher {
    dir: PathBuf,
    bus: EventBus,
    fs: FsWatcher,
    changes: Mutex<Option<mpsc::UnboundedReceiver<FsChange>>>,
    // Keyed by descriptor file stem.
    active: RwLock<HashMap<String, SessionDescriptor>>,
}

impl SessionWatcher {
    /// Create a watcher for `dir`. Nothing is read until
    /// [`SessionWatcher::scan_existing`] or [`SessionWatcher::run`].
    pub fn new(dir: impl Into<PathBuf>, bus: EventBus, stability_window: Duration) -> notify::Result<Self> {
        let (fs, changes) = FsWatcher::new(stability_window)?;
        Ok(Self {
            dir: dir.into(),
            bus,
            fs,
            changes: Mutex::new(Some(changes)),
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Descriptor directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if needed, start watching it, and load every
    /// descriptor already present.
    pub async fn scan_existing(&self) -> std::io::Result<usize> {
        tokio::fs::create_dir_all(&self.dir).await?;
        if let Err(e) = self.fs.watch_dir(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "Cannot watch session directory");
        }

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_descriptor(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            self.handle_upsert(path).await;
        }
        let count = self.active.read().await.len();
        info!(dir = %self.dir.display(), count, "Loaded existing sessions");
        Ok(count)
    }

    /// A descriptor appeared or changed.
    pub async fn handle_upsert(&self, path: &Path) {
        let Some(key) = descriptor_key(path) else {
            return;
        };
        let descriptor = match read_descriptor(path).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable session descriptor");
                return;
            }
        };

        let event = {
            let mut active = self.active.write().await;
            match active.insert(key, descriptor.clone()) {
                Some(previous) if previous == descriptor => None,
                Some(_) => Some(DaemonEvent::SessionUpdated {
                    session: descriptor,
                }),
                None => Some(DaemonEvent::SessionStarted {
                    session: descriptor,
                }),
            }
        };

        if let Some(event) = event {
            if let DaemonEvent::SessionStarted { session } = &event {
                info!(session_id = %session.session_id, provider = %session.provider, "Session started");
            }
            self.bus.publish(event);
            self.publish_snapshot().await;
        }
    }

    /// A descriptor was deleted.
    pub async fn handle_removed(&self, path: &Path) {
        let Some(key) = descriptor_key(path) else {
            return;
        };
        let Some(removed) = self.active.write().await.remove(&key) else {
            return;
        };

        info!(session_id = %removed.session_id, "Session ended");
        self.bus.publish(DaemonEvent::SessionEnded {
            session_id: removed.session_id,
        });
        self.publish_snapshot().await;
    }

    /// Route one debounced filesystem change.
    pub async fn handle_change(&self, change: FsChange) {
        if !is_descriptor(&change.path) {
            return;
        }
        match change.kind {
            FsChangeKind::Created | FsChangeKind::Modified => self.handle_upsert(&change.path).await,
            FsChangeKind::Removed => self.handle_removed(&change.path).await,
        }
    }

    /// Active sessions, ordered by session id.
    pub async fn active(&self) -> Vec<SessionDescriptor> {
        let mut sessions: Vec<_> = self.active.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Look up an active session by id.
    pub async fn get(&self, session_id: &str) -> Option<SessionDescriptor> {
        self.active
            .read()
            .await
            .values()
            .find(|d| d.session_id == session_id)
            .cloned()
    }

    /// Consume filesystem changes until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut changes) = self.changes.lock().await.take() else {
            warn!("Session watcher already running");
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = changes.recv() => match change {
                    Some(change) => self.handle_change(change).await,
                    None => break,
                },
            }
        }
        debug!("Session watcher stopped");
    }

    async fn publish_snapshot(&self) {
        let sessions = self.active().await;
        self.bus.publish(DaemonEvent::SessionsChanged { sessions });
    }
}

impl std::fmt::Debug for SessionWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionWatcher")
            .field("dir", &self.dir)
            .finish()
    }
}

fn is_descriptor(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

fn descriptor_key(path: &Path) -> Option<String> {
    if !is_descriptor(path) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
}

async fn read_descriptor(path: &Path) -> Result<SessionDescriptor, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let descriptor: SessionDescriptor =
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    if descriptor.session_id.trim().is_empty() {
        return Err("empty sessionId".to_string());
    }
    Ok(descriptor)
}

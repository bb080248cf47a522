//! Tails registered transcript files and publishes new lines.

use super::parser::StoredLine;
use super::reader::{read_from, read_full, ReadResult};
use super::store::TranscriptStore;
use crate::event_bus::{DaemonEvent, EventBus};
use crate::fs_watch::{FsChange, FsChangeKind, FsWatcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watches transcript files of active sessions.
pub struct TranscriptWatcher {
    store: Arc<TranscriptStore>,
    bus: EventBus,
    fs: FsWatcher,
    changes: Mutex<Option<mpsc::UnboundedReceiver<FsChange>>>,
    // Directory watched per session: the transcript's parent, or its
    // nearest existing ancestor while the parent does not exist yet.
    watched: Mutex<HashMap<String, PathBuf>>,
    // Serializes reads so a change and a registration never interleave.
    ingest: Mutex<()>,
}

impl TranscriptWatcher {
    /// Create a watcher with the given stability window.
    pub fn new(
        store: Arc<TranscriptStore>,
        bus: EventBus,
        stability_window: Duration,
    ) -> notify::Result<Self> {
        let (fs, changes) = FsWatcher::new(stability_window)?;
        Ok(Self {
            store,
            bus,
            fs,
            changes: Mutex::new(Some(changes)),
            watched: Mutex::new(HashMap::new()),
            ingest: Mutex::new(()),
        })
    }

    /// Shared transcript store.
    pub fn store(&self) -> &Arc<TranscriptStore> {
        &self.store
    }

    /// Start tailing a session's transcript.
    ///
    /// The buffer starts empty even when the file does not exist yet; an
    /// existing file is read in full and published as the initial batch.
    pub async fn register(&self, session_id: &str, path: &Path) {
        let path = resolve(path).await;
        if let Some(previous) = self.store.path(session_id).await {
            self.unregister(session_id).await;
            debug!(session_id = %session_id, previous = %previous.display(), "Re-registering transcript");
        }

        self.store.init_session(session_id, &path).await;
        self.arm(session_id, &path).await;
        info!(session_id = %session_id, path = %path.display(), "Tailing transcript");

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            self.handle_created(session_id).await;
        }
    }

    /// Stop tailing a session and discard its buffer.
    pub async fn unregister(&self, session_id: &str) {
        if !self.store.remove(session_id).await {
            return;
        }
        if let Some(dir) = self.watched.lock().await.remove(session_id) {
            self.fs.unwatch_dir(&dir);
        }
        debug!(session_id = %session_id, "Stopped tailing transcript");
    }

    /// Full read after the file appeared: replace the buffer and publish
    /// everything as one initial batch.
    pub async fn handle_created(&self, session_id: &str) {
        let _guard = self.ingest.lock().await;
        let Some(path) = self.store.path(session_id).await else {
            return;
        };

        match read_full(&path).await {
            Ok(result) => self.apply_full(session_id, result).await,
            Err(e) => {
                warn!(session_id = %session_id, path = %path.display(), error = %e, "Transcript read failed");
            }
        }
    }

    /// Incremental read after the file changed: append and publish only the
    /// new lines.
    pub async fn handle_changed(&self, session_id: &str) {
        let _guard = self.ingest.lock().await;
        let (Some(path), Some(cursor)) = (
            self.store.path(session_id).await,
            self.store.cursor(session_id).await,
        ) else {
            return;
        };

        let result = match read_from(&path, cursor).await {
            Ok(result) => result,
            Err(e) => {
                warn!(session_id = %session_id, path = %path.display(), error = %e, "Transcript read failed");
                return;
            }
        };

        if result.reset {
            self.apply_full(session_id, result).await;
            return;
        }
        if result.lines.is_empty() {
            if result.cursor != cursor {
                self.store.append(session_id, Vec::new(), result.cursor).await;
            }
            return;
        }

        let renamed = self
            .store
            .append(session_id, result.lines.clone(), result.cursor)
            .await;
        debug!(session_id = %session_id, count = result.lines.len(), cursor = result.cursor, "Transcript appended");
        self.publish(session_id, result.lines, false, renamed);
    }

    /// Route one debounced filesystem change.
    pub async fn handle_change(&self, change: FsChange) {
        let Some(session_id) = self.store.session_for_path(&change.path).await else {
            self.rearm_waiting(&change.path).await;
            return;
        };
        match change.kind {
            FsChangeKind::Created => self.handle_created(&session_id).await,
            FsChangeKind::Modified => self.handle_changed(&session_id).await,
            FsChangeKind::Removed => {
                debug!(session_id = %session_id, "Transcript file removed");
            }
        }
    }

    /// Consume filesystem changes until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let Some(mut changes) = self.changes.lock().await.take() else {
            warn!("Transcript watcher already running");
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
        debug!("Transcript watcher stopped");
    }

    /// Watch the transcript's directory, falling back to its nearest
    /// existing ancestor. Returns true once the directory itself is watched.
    async fn arm(&self, session_id: &str, path: &Path) -> bool {
        let Some(dir) = path.parent() else {
            return false;
        };
        let mut watched = self.watched.lock().await;

        // Repeat while directories keep appearing under the new watch.
        loop {
            let Some(target) = nearest_existing_dir(dir).await else {
                warn!(session_id = %session_id, dir = %dir.display(), "No existing ancestor to watch");
                return false;
            };
            if watched.get(session_id) == Some(&target) {
                return target == dir;
            }
            if let Err(e) = self.fs.watch_dir(&target) {
                warn!(session_id = %session_id, dir = %target.display(), error = %e, "Cannot watch transcript directory");
                return false;
            }
            if let Some(previous) = watched.insert(session_id.to_string(), target.clone()) {
                self.fs.unwatch_dir(&previous);
            }
            if target == dir {
                return true;
            }
            debug!(
                session_id = %session_id,
                dir = %dir.display(),
                watching = %target.display(),
                "Transcript directory missing, watching ancestor"
            );
        }
    }

    /// A directory on the way to some transcripts appeared: move their
    /// watches down and read any file that is already there.
    async fn rearm_waiting(&self, changed: &Path) {
        let waiting: Vec<String> = {
            let watched = self.watched.lock().await;
            let mut ids = Vec::new();
            for (session_id, dir) in watched.iter() {
                let Some(path) = self.store.path(session_id).await else {
                    continue;
                };
                if path.parent() != Some(dir.as_path()) && path.starts_with(changed) {
                    ids.push(session_id.clone());
                }
            }
            ids
        };

        for session_id in waiting {
            let Some(path) = self.store.path(&session_id).await else {
                continue;
            };
            if self.arm(&session_id, &path).await {
                info!(session_id = %session_id, dir = %changed.display(), "Transcript directory appeared");
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    self.handle_created(&session_id).await;
                }
            }
        }
    }

    async fn apply_full(&self, session_id: &str, result: ReadResult) {
        let renamed = self
            .store
            .replace(session_id, result.lines.clone(), result.cursor)
            .await;
        debug!(session_id = %session_id, count = result.lines.len(), cursor = result.cursor, "Transcript loaded");
        self.publish(session_id, result.lines, true, renamed);
    }

    fn publish(
        &self,
        session_id: &str,
        lines: Vec<StoredLine>,
        initial: bool,
        renamed: Option<String>,
    ) {
        if !lines.is_empty() {
            self.bus.publish(DaemonEvent::MessagesAppended {
                session_id: session_id.to_string(),
                lines,
                initial,
            });
        }
        if let Some(name) = renamed {
            info!(session_id = %session_id, name = %name, "Session renamed");
            self.bus.publish(DaemonEvent::SessionRenamed {
                session_id: session_id.to_string(),
                name,
            });
        }
    }
}

impl std::fmt::Debug for TranscriptWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptWatcher")
            .field("fs", &self.fs)
            .finish()
    }
}

/// Absolute path whose deepest existing ancestor is canonical, matching
/// what the OS watcher reports.
async fn resolve(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    for ancestor in absolute.ancestors().skip(1) {
        let Ok(canonical) = tokio::fs::canonicalize(ancestor).await else {
            continue;
        };
        if let Ok(rest) = absolute.strip_prefix(ancestor) {
            return canonical.join(rest);
        }
    }
    absolute
}

async fn nearest_existing_dir(dir: &Path) -> Option<PathBuf> {
    for candidate in dir.ancestors() {
        if tokio::fs::metadata(candidate)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            return Some(candidate.to_path_buf());
        }
    }
    None
}

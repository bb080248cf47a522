//! Debounced filesystem change notifications.
//!
//! Wraps a `notify` recommended watcher. Raw events are forwarded into a
//! tokio channel and coalesced per path: a change is emitted once the path
//! has been quiet for the stability window. The final kind is checked
//! against the filesystem when emitted, so rename-into-place writes surface
//! as a create or modify of the target path.

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default quiet period before a change is emitted.
pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_millis(300);

/// Coalesced kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsChangeKind {
    /// The path appeared
    Created,
    /// The path's contents changed
    Modified,
    /// The path disappeared
    Removed,
}

impl FsChangeKind {
    fn from_event(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::Create(_) => Some(Self::Created),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(Self::Removed),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Self::Created),
            EventKind::Modify(_) => Some(Self::Modified),
            EventKind::Remove(_) => Some(Self::Removed),
            _ => None,
        }
    }

    /// Fold a later raw change into an earlier pending one.
    fn merge(self, later: Self) -> Self {
        match (self, later) {
            (Self::Created, Self::Modified) => Self::Created,
            (Self::Removed, Self::Modified) => Self::Created,
            (_, later) => later,
        }
    }
}

/// A debounced change to one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsChange {
    /// Affected path
    pub path: PathBuf,
    /// Coalesced kind
    pub kind: FsChangeKind,
}

struct PendingChange {
    kind: FsChangeKind,
    due: Instant,
}

/// Per-path stability-window coalescing.
pub(crate) struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, PendingChange>,
}

impl Debouncer {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Record a raw change; restarts the path's quiet period.
    pub(crate) fn record(&mut self, path: PathBuf, kind: FsChangeKind, now: Instant) {
        let due = now + self.window;
        self.pending
            .entry(path)
            .and_modify(|p| {
                p.kind = p.kind.merge(kind);
                p.due = due;
            })
            .or_insert(PendingChange { kind, due });
    }

    /// Earliest deadline among pending paths.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.due).min()
    }

    /// Remove and return every change whose quiet period has elapsed.
    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<FsChange> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| p.due <= now)
            .map(|(path, _)| path.clone())
            .collect();

        let mut changes: Vec<FsChange> = due
            .into_iter()
            .filter_map(|path| {
                self.pending
                    .remove(&path)
                    .map(|p| FsChange { path, kind: p.kind })
            })
            .collect();
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        changes
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Filesystem watcher emitting debounced [`FsChange`]s.
///
/// Directories are watched non-recursively with reference counts, so several
/// files in one directory share a single OS watch.
pub struct FsWatcher {
    watcher: Mutex<RecommendedWatcher>,
    dirs: Mutex<HashMap<PathBuf, usize>>,
}

impl FsWatcher {
    /// Create a watcher and the receiver its debounced changes arrive on.
    ///
    /// Must be called inside a tokio runtime. The receiver closes when the
    /// watcher is dropped.
    pub fn new(window: Duration) -> notify::Result<(Self, mpsc::UnboundedReceiver<FsChange>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Event>();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => warn!(error = %e, "Filesystem watch error"),
            }
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(debounce_loop(raw_rx, tx, window));

        Ok((
            Self {
                watcher: Mutex::new(watcher),
                dirs: Mutex::new(HashMap::new()),
            },
            rx,
        ))
    }

    /// Start watching a directory (reference counted).
    pub fn watch_dir(&self, dir: &Path) -> notify::Result<()> {
        let mut dirs = self.dirs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = dirs.get_mut(dir) {
            *count += 1;
            return Ok(());
        }

        self.watcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .watch(dir, RecursiveMode::NonRecursive)?;
        dirs.insert(dir.to_path_buf(), 1);
        debug!(dir = %dir.display(), "Watching directory");
        Ok(())
    }

    /// Drop one reference to a watched directory.
    pub fn unwatch_dir(&self, dir: &Path) {
        let mut dirs = self.dirs.lock().unwrap_or_else(|p| p.into_inner());
        let Some(count) = dirs.get_mut(dir) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }

        dirs.remove(dir);
        if let Err(e) = self
            .watcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .unwatch(dir)
        {
            debug!(dir = %dir.display(), error = %e, "Unwatch failed");
        }
    }

    /// Number of directories currently watched.
    pub fn watched_dirs(&self) -> usize {
        self.dirs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl std::fmt::Debug for FsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsWatcher")
            .field("dirs", &self.watched_dirs())
            .finish()
    }
}

async fn debounce_loop(
    mut raw: mpsc::UnboundedReceiver<notify::Event>,
    out: mpsc::UnboundedSender<FsChange>,
    window: Duration,
) {
    let mut debouncer = Debouncer::new(window);
    loop {
        let next_due = debouncer.next_due();
        tokio::select! {
            event = raw.recv() => {
                let Some(event) = event else { break };
                let Some(kind) = FsChangeKind::from_event(&event.kind) else { continue };
                let now = Instant::now();
                for path in event.paths {
                    debouncer.record(path, kind, now);
                }
            }
            _ = sleep_until_due(next_due), if next_due.is_some() => {
                for change in debouncer.drain_due(Instant::now()) {
                    if out.send(settle(change)).is_err() {
                        return;
                    }
                }
            }
        }
    }

    // Flush what is left once the watcher is gone.
    if !debouncer.is_empty() {
        let far = Instant::now() + window;
        for change in debouncer.drain_due(far) {
            let _ = out.send(settle(change));
        }
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    if let Some(due) = due {
        tokio::time::sleep_until(due).await;
    }
}

/// Reconcile a coalesced kind with what is on disk now.
fn settle(mut change: FsChange) -> FsChange {
    let exists = change.path.exists();
    change.kind = match (change.kind, exists) {
        (FsChangeKind::Removed, true) => FsChangeKind::Created,
        (_, false) => FsChangeKind::Removed,
        (kind, true) => kind,
    };
    change
}

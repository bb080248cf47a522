//! In-memory per-session transcript buffers.

use super::parser::StoredLine;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Buffered transcript of one active session.
#[derive(Debug, Clone, Default)]
pub struct SessionTranscript {
    /// Lines in file order
    pub lines: Vec<StoredLine>,
    /// Transcript file
    pub path: PathBuf,
    /// Byte offset just after the last ingested line
    pub cursor: u64,
    /// Name set by the latest in-band rename marker
    pub display_name: Option<String>,
}

impl SessionTranscript {
    fn apply_renames(&mut self, lines: &[StoredLine]) -> Option<String> {
        let title = lines.iter().rev().find_map(StoredLine::rename_title)?;
        if self.display_name.as_deref() == Some(title) {
            return None;
        }
        self.display_name = Some(title.to_string());
        self.display_name.clone()
    }
}

/// Transcript buffers keyed by session id.
#[derive(Debug, Default)]
pub struct TranscriptStore {
    sessions: RwLock<HashMap<String, SessionTranscript>>,
}

impl TranscriptStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty buffer for a session, discarding any previous one.
    pub async fn init_session(&self, session_id: &str, path: &Path) {
        self.sessions.write().await.insert(
            session_id.to_string(),
            SessionTranscript {
                path: path.to_path_buf(),
                ..Default::default()
            },
        );
    }

    /// Discard a session's buffer. Returns false if it was not tracked.
    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    /// Replace the whole buffer after a full read.
    ///
    /// Returns the new display name when the lines renamed the session.
    /// Untracked sessions are ignored.
    pub async fn replace(
        &self,
        session_id: &str,
        lines: Vec<StoredLine>,
        cursor: u64,
    ) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(session_id)?;
        let renamed = entry.apply_renames(&lines);
        entry.lines = lines;
        entry.cursor = cursor;
        renamed
    }

    /// Append lines after an incremental read and advance the cursor.
    ///
    /// Returns the new display name when the lines renamed the session.
    pub async fn append(
        &self,
        session_id: &str,
        lines: Vec<StoredLine>,
        cursor: u64,
    ) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(session_id)?;
        let renamed = entry.apply_renames(&lines);
        entry.lines.extend(lines);
        entry.cursor = cursor;
        renamed
    }

    /// Lines with a timestamp strictly after `cursor` (string order), plus
    /// every line without a timestamp. An empty cursor returns everything.
    pub async fn since_timestamp(&self, session_id: &str, cursor: &str) -> Vec<StoredLine> {
        let sessions = self.sessions.read().await;
        let Some(entry) = sessions.get(session_id) else {
            return Vec::new();
        };
        if cursor.is_empty() {
            return entry.lines.clone();
        }
        entry
            .lines
            .iter()
            .filter(|line| {
                line.timestamp
                    .as_deref()
                    .map_or(true, |ts| ts > cursor)
            })
            .cloned()
            .collect()
    }

    /// All buffered lines of a session.
    pub async fn lines(&self, session_id: &str) -> Vec<StoredLine> {
        self.since_timestamp(session_id, "").await
    }

    /// Byte cursor of a session.
    pub async fn cursor(&self, session_id: &str) -> Option<u64> {
        self.sessions.read().await.get(session_id).map(|e| e.cursor)
    }

    /// Transcript path of a session.
    pub async fn path(&self, session_id: &str) -> Option<PathBuf> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.path.clone())
    }

    /// Display name set by a rename marker.
    pub async fn display_name(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|e| e.display_name.clone())
    }

    /// Session whose transcript lives at `path`.
    pub async fn session_for_path(&self, path: &Path) -> Option<String> {
        self.sessions
            .read()
            .await
            .iter()
            .find(|(_, e)| e.path == path)
            .map(|(id, _)| id.clone())
    }

    /// Ids of every tracked session.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

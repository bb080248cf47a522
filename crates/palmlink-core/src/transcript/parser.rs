//! JSONL transcript line parsing.

use serde::Serialize;
use serde_json::Value;

/// Marker type written by the agent when the user renames a session.
pub const RENAME_MARKER_TYPE: &str = "custom-title";

/// What a transcript line represents, decoded from its `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    /// User turn
    User,
    /// Assistant turn
    Assistant,
    /// System notice
    System,
    /// Conversation summary
    Summary,
    /// In-band session rename marker
    Rename {
        /// New display name
        title: String,
    },
    /// Any other tag, kept verbatim
    Unrecognized(String),
}

impl LineKind {
    fn from_tag(tag: &str, object: &serde_json::Map<String, Value>) -> Self {
        match tag {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "summary" => Self::Summary,
            RENAME_MARKER_TYPE => match object.get("customTitle").and_then(Value::as_str) {
                Some(title) => Self::Rename {
                    title: title.to_string(),
                },
                None => Self::Unrecognized(tag.to_string()),
            },
            other => Self::Unrecognized(other.to_string()),
        }
    }
}

/// One parsed transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredLine {
    /// The line's JSON object, untouched
    pub payload: Value,
    /// Sortable timestamp string, used as a sync cursor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Unique line id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Decoded line type
    pub kind: LineKind,
}

impl StoredLine {
    /// Title carried by a rename marker.
    pub fn rename_title(&self) -> Option<&str> {
        match &self.kind {
            LineKind::Rename { title } => Some(title),
            _ => None,
        }
    }
}

/// Parse one line. Blank lines, non-objects and objects without a string
/// `type` yield `None`.
pub fn parse_line(line: &str) -> Option<StoredLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let payload: Value = serde_json::from_str(line).ok()?;
    let object = payload.as_object()?;
    let tag = object.get("type")?.as_str()?;

    let kind = LineKind::from_tag(tag, object);
    let timestamp = object
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_string);
    let uuid = object.get("uuid").and_then(Value::as_str).map(str::to_string);

    Some(StoredLine {
        payload,
        timestamp,
        uuid,
        kind,
    })
}

/// Parse every line of a chunk of complete lines, skipping malformed ones.
pub fn parse_lines(chunk: &str) -> Vec<StoredLine> {
    chunk.lines().filter_map(parse_line).collect()
}

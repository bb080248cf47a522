//! Transcript ingestion.
//!
//! Agent sessions write append-only JSONL transcripts. This module tails
//! them incrementally:
//!
//! - [`parser`]: one line into a [`StoredLine`]
//! - [`reader`]: full and from-offset reads that stop at the last newline
//! - [`store`]: per-session buffers with byte and timestamp cursors
//! - [`watcher`]: file watching that feeds the store and the event bus

pub mod parser;
pub mod reader;
pub mod store;
pub mod watcher;

pub use parser::{parse_line, parse_lines, LineKind, StoredLine};
pub use reader::{read_from, read_full, ReadResult};
pub use store::{SessionTranscript, TranscriptStore};
pub use watcher::TranscriptWatcher;

//! Whole-file and incremental transcript reads.
//!
//! Both reads stop at the last newline they see. The cursor always sits just
//! after a newline, so a line that is still being written is never parsed;
//! it is picked up by the next read once its newline lands.

use super::parser::{parse_lines, StoredLine};
use std::io::{self, SeekFrom};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Lines read plus the byte cursor to resume from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult {
    /// Parsed complete lines
    pub lines: Vec<StoredLine>,
    /// Offset just after the last complete line consumed
    pub cursor: u64,
    /// The file was shorter than the requested offset and was re-read from
    /// the start
    pub reset: bool,
}

/// Read every complete line of a file.
pub async fn read_full(path: &Path) -> io::Result<ReadResult> {
    read_from(path, 0).await
}

/// Read the complete lines appended since `offset`.
///
/// No new bytes gives an empty result with the cursor unchanged. A file
/// shorter than `offset` (truncated or replaced) is read from the start.
pub async fn read_from(path: &Path, offset: u64) -> io::Result<ReadResult> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();

    let (start, reset) = if len < offset {
        debug!(path = %path.display(), offset, len, "Transcript shrank, re-reading from start");
        (0, true)
    } else {
        (offset, false)
    };

    if len == start {
        return Ok(ReadResult {
            lines: Vec::new(),
            cursor: start,
            reset,
        });
    }

    file.seek(SeekFrom::Start(start)).await?;
    let mut chunk = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut chunk).await?;

    let Some(last_newline) = chunk.iter().rposition(|b| *b == b'\n') else {
        return Ok(ReadResult {
            lines: Vec::new(),
            cursor: start,
            reset,
        });
    };

    let complete = String::from_utf8_lossy(&chunk[..=last_newline]);
    Ok(ReadResult {
        lines: parse_lines(&complete),
        cursor: start + last_newline as u64 + 1,
        reset,
    })
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resumable log reads.
//!
//! Clients tail a log by passing back the offset returned by the previous
//! read. Offsets are plain byte positions, so consecutive reads of an
//! append-only file never overlap and never skip bytes.

use std::io::SeekFrom;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// How far back an offset-less read starts.
pub const DEFAULT_TAIL_BYTES: u64 = 1024 * 1024;

/// Upper bound on the bytes returned by one read.
pub const MAX_CHUNK_BYTES: u64 = 1024 * 1024;

/// Minimum size of the header sent before the first chunk. Some browsers
/// buffer short `text/plain` responses before rendering anything.
pub const LOG_HEADER_MIN_BYTES: usize = 1024;

/// Bytes read from a log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    /// The bytes, starting at the resolved start offset.
    pub data: Vec<u8>,
    /// Offset to pass to the next read.
    pub next_offset: u64,
}

/// Read `path` from `offset` (or the last [`DEFAULT_TAIL_BYTES`] when
/// `None`) up to end of file, at most [`MAX_CHUNK_BYTES`] at a time.
///
/// A missing file reads as empty with offset 0. An offset past the end of the
/// file means the file was truncated or rotated; reading restarts at 0.
pub async fn read_from(path: &Path, offset: Option<u64>) -> std::io::Result<LogChunk> {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LogChunk {
                data: Vec::new(),
                next_offset: 0,
            });
        }
        Err(e) => return Err(e),
    };

    let start = match offset {
        None => size.saturating_sub(DEFAULT_TAIL_BYTES),
        Some(offset) if offset > size => 0,
        Some(offset) => offset,
    };
    let len = (size - start).min(MAX_CHUNK_BYTES);

    let mut data = Vec::with_capacity(len as usize);
    if len > 0 {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        file.take(len).read_to_end(&mut data).await?;
    }

    Ok(LogChunk {
        next_offset: start + data.len() as u64,
        data,
    })
}

/// Static header of a log view, padded to [`LOG_HEADER_MIN_BYTES`] and ending
/// with the `DATE` line and a blank line.
pub fn log_header(handle_id: &str, now: DateTime<Utc>) -> String {
    let mut header = format!("Hangar daemon log of handle {}\n", handle_id);
    let date = format!("DATE {}\n\n", now.to_rfc2822());
    let pad = LOG_HEADER_MIN_BYTES.saturating_sub(header.len() + date.len() + 1);
    header.push_str(&" ".repeat(pad));
    header.push('\n');
    header.push_str(&date);
    header
}

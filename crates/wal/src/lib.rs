//! Write-ahead log consumed by the buffer pool's write-back hook.
//!
//! The log is an append-only file of length-prefixed page-update
//! records. Appends accumulate in an in-memory tail; `flush(lsn)`
//! writes the tail at its file offset and syncs before returning, which
//! is what the buffer pool calls before writing a dirty page image back
//! to disk. An LSN is a byte offset into the log file, so "durable
//! through lsn" is a plain length comparison.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;

/// Log sequence number: a byte offset into the log file.
pub type Lsn = u64;
pub type PageId = u64;

const DEFAULT_LOG_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wal corruption: {0}")]
    Corrupt(String),
}

pub type WalResult<T> = Result<T, WalError>;

/// A physical page-update record: before and after images of a byte
/// range within one page.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub page_id: PageId,
    pub offset: u32,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

// Fixed-width prefix of an encoded record, after the u32 length:
// lsn, page_id, offset, before_len, after_len.
const RECORD_HEADER_SIZE: usize = 8 + 8 + 4 + 4 + 4;

impl LogRecord {
    /// Builds a record with an unassigned LSN; `LogManager::append` fills
    /// it in.
    pub fn page_update(page_id: PageId, offset: u32, before: Vec<u8>, after: Vec<u8>) -> Self {
        Self {
            lsn: 0,
            page_id,
            offset,
            before,
            after,
        }
    }

    /// Serializes the record, including its u32 length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = RECORD_HEADER_SIZE + self.before.len() + self.after.len();
        let mut buffer = Vec::with_capacity(4 + body_len);
        buffer.extend_from_slice(&((4 + body_len) as u32).to_le_bytes());
        buffer.extend_from_slice(&self.lsn.to_le_bytes());
        buffer.extend_from_slice(&self.page_id.to_le_bytes());
        buffer.extend_from_slice(&self.offset.to_le_bytes());
        buffer.extend_from_slice(&(self.before.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&(self.after.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&self.before);
        buffer.extend_from_slice(&self.after);
        buffer
    }

    /// Decodes a record body (everything after the length prefix).
    pub fn from_bytes(bytes: &[u8]) -> WalResult<Self> {
        let too_small = || WalError::Corrupt("log record too small".to_string());
        let lsn = take_u64(bytes, 0).ok_or_else(too_small)?;
        let page_id = take_u64(bytes, 8).ok_or_else(too_small)?;
        let offset = take_u32(bytes, 16).ok_or_else(too_small)?;
        let before_len = take_u32(bytes, 20).ok_or_else(too_small)? as usize;
        let after_len = take_u32(bytes, 24).ok_or_else(too_small)? as usize;

        let images = bytes.get(RECORD_HEADER_SIZE..).unwrap_or_default();
        if images.len() < before_len + after_len {
            return Err(WalError::Corrupt("log record images truncated".to_string()));
        }
        Ok(LogRecord {
            lsn,
            page_id,
            offset,
            before: images[..before_len].to_vec(),
            after: images[before_len..before_len + after_len].to_vec(),
        })
    }
}

/// Buffered log writer. Records stay in the in-memory tail until a
/// flush (explicit, or forced by a full buffer) makes them durable.
pub struct LogManager {
    tail: Mutex<LogTail>,
}

struct LogTail {
    file: File,
    /// Encoded records not yet on disk; starts at file offset
    /// `flushed_lsn`.
    buffer: Vec<u8>,
    flushed_lsn: Lsn,
    capacity: usize,
}

impl LogManager {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        Self::open_with_buffer(path, DEFAULT_LOG_BUFFER_SIZE)
    }

    pub fn open_with_buffer(path: impl AsRef<Path>, capacity: usize) -> WalResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path.as_ref())?;
        let flushed_lsn = file.metadata()?.len();
        Ok(Self {
            tail: Mutex::new(LogTail {
                file,
                buffer: Vec::with_capacity(capacity),
                flushed_lsn,
                capacity,
            }),
        })
    }

    /// Appends a record and returns its assigned LSN. The record is not
    /// durable until `flush` covers it.
    pub fn append(&self, mut record: LogRecord) -> WalResult<Lsn> {
        let mut tail = self.tail.lock();
        record.lsn = tail.flushed_lsn + tail.buffer.len() as u64;
        let bytes = record.to_bytes();
        if tail.buffer.len() + bytes.len() > tail.capacity {
            tail.write_tail()?;
        }
        tail.buffer.extend_from_slice(&bytes);
        Ok(record.lsn)
    }

    /// Makes every record at or below `lsn` durable before returning.
    pub fn flush(&self, lsn: Lsn) -> WalResult<()> {
        let mut tail = self.tail.lock();
        if lsn < tail.flushed_lsn {
            return Ok(());
        }
        tail.write_tail()
    }

    /// File offset below which the log is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.tail.lock().flushed_lsn
    }
}

impl LogTail {
    fn write_tail(&mut self) -> WalResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.write_all_at(&self.buffer, self.flushed_lsn)?;
        self.file.sync_data()?;
        self.flushed_lsn += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }
}

/// Sequential scan over an on-disk log file.
pub struct LogReader {
    file: File,
    offset: u64,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> WalResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file, offset: 0 })
    }

    /// Positions the next read at `lsn`.
    pub fn seek(&mut self, lsn: Lsn) {
        self.offset = lsn;
    }

    pub fn next_record(&mut self) -> WalResult<Option<LogRecord>> {
        let mut len_bytes = [0u8; 4];
        let n = self.file.read_at(&mut len_bytes, self.offset)?;
        if n == 0 {
            return Ok(None);
        }
        if n < 4 {
            return Err(WalError::Corrupt("log record length truncated".to_string()));
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len < 4 {
            return Err(WalError::Corrupt("invalid log record length".to_string()));
        }
        let mut body = vec![0u8; len - 4];
        self.file.read_exact_at(&mut body, self.offset + 4)?;
        self.offset += len as u64;
        Ok(Some(LogRecord::from_bytes(&body)?))
    }
}

fn take_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let chunk: [u8; 8] = bytes.get(at..at + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(chunk))
}

fn take_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let chunk: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn log_round_trip() {
        let path = std::env::temp_dir().join("silt_wal_round_trip.log");
        let _ = fs::remove_file(&path);
        let manager = LogManager::open_with_buffer(&path, 128).unwrap();

        let first = manager
            .append(LogRecord::page_update(7, 0, vec![0, 0], vec![1, 2]))
            .unwrap();
        let second = manager
            .append(LogRecord::page_update(7, 64, vec![9], vec![8]))
            .unwrap();
        assert!(second > first);

        // Both records still fit the tail: nothing durable yet.
        assert_eq!(manager.flushed_lsn(), 0);
        manager.flush(second).unwrap();
        assert!(manager.flushed_lsn() > second);

        let mut reader = LogReader::open(&path).unwrap();
        let mut seen = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            seen.push(record);
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].lsn, first);
        assert_eq!(seen[0].page_id, 7);
        assert_eq!(seen[0].after, vec![1, 2]);
        assert_eq!(seen[1].lsn, second);
        assert_eq!(seen[1].offset, 64);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn flush_covers_requested_lsn() {
        let path = std::env::temp_dir().join("silt_wal_flush_order.log");
        let _ = fs::remove_file(&path);
        // Tiny buffer so appends force intermediate tail writes.
        let manager = LogManager::open_with_buffer(&path, 64).unwrap();

        let mut last = 0;
        for i in 0..20u8 {
            last = manager
                .append(LogRecord::page_update(u64::from(i), 0, vec![i], vec![i]))
                .unwrap();
        }
        manager.flush(last).unwrap();
        assert!(manager.flushed_lsn() > last);

        // Re-flushing an already durable lsn is a no-op.
        let durable = manager.flushed_lsn();
        manager.flush(0).unwrap();
        assert_eq!(manager.flushed_lsn(), durable);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn record_encoding_round_trip() {
        let record = LogRecord {
            lsn: 42,
            page_id: 3,
            offset: 128,
            before: vec![1, 2, 3],
            after: vec![4, 5, 6, 7],
        };
        let bytes = record.to_bytes();
        let decoded = LogRecord::from_bytes(&bytes[4..]).unwrap();
        assert_eq!(decoded.lsn, 42);
        assert_eq!(decoded.page_id, 3);
        assert_eq!(decoded.offset, 128);
        assert_eq!(decoded.before, vec![1, 2, 3]);
        assert_eq!(decoded.after, vec![4, 5, 6, 7]);

        assert!(LogRecord::from_bytes(&bytes[4..10]).is_err());
    }
}

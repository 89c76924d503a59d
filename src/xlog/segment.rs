//! Segment writer.
//!
//! Layout of a segment file:
//!
//! ```text
//! XLOG\n
//! {"version":"1","instance":"<uuid>","vclock":{...}}\n
//! \n
//! <tx-block>*
//! <eof marker>        only if the segment was closed cleanly
//! ```
//!
//! A tx-block is a fixheader `{magic, crc32, payload_len, row_count}`
//! (all u32 LE) followed by `payload_len` bytes of row frames. The crc
//! covers the payload only. The EOF marker is a bare magic word.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{XlogError, XlogResult};
use super::reader::XlogReader;
use crate::clock::VClock;
use crate::fault::{self, knobs};

/// Magic line opening every segment file.
pub(crate) const XLOG_MAGIC_LINE: &[u8] = b"XLOG\n";

/// Segment format version recorded in the header.
pub const XLOG_FORMAT_VERSION: &str = "1";

/// Segment file extension.
pub const XLOG_EXTENSION: &str = "xlog";

/// Magic word opening every tx-block.
pub(crate) const TX_BLOCK_MAGIC: u32 = 0xb10c_0de5;

/// Magic word marking a clean end of segment.
pub(crate) const EOF_MAGIC: u32 = 0xc10c_0e0f;

/// Size of the tx-block fixheader in bytes.
pub(crate) const TX_FIXHEADER_LEN: usize = 16;

/// Preallocation granularity: extending the file in 1 MiB steps keeps the
/// syscall rate low without adding much commit latency.
pub(crate) const FALLOCATE_LEN: u64 = 1024 * 1024;

/// Parsed segment header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Format version.
    pub version: String,
    /// UUID of the instance that wrote this segment.
    pub instance: Uuid,
    /// Vclock of the log right before the first row of this segment.
    pub vclock: VClock,
}

impl SegmentMeta {
    /// Header for a new segment starting at `vclock`.
    pub fn new(instance: Uuid, vclock: VClock) -> Self {
        Self { version: XLOG_FORMAT_VERSION.to_string(), instance, vclock }
    }

    fn encode_header(&self) -> XlogResult<Vec<u8>> {
        let mut header = Vec::with_capacity(128);
        header.extend_from_slice(XLOG_MAGIC_LINE);
        let meta = serde_json::to_vec(self)
            .map_err(|e| XlogError::corruption(format!("unencodable segment meta: {}", e)))?;
        header.extend_from_slice(&meta);
        header.extend_from_slice(b"\n\n");
        Ok(header)
    }
}

/// Append-only writer over one segment file.
///
/// All methods run on the WAL thread; the writer is never shared.
pub struct XlogWriter {
    path: PathBuf,
    file: File,
    meta: SegmentMeta,
    /// Bytes of valid data written so far, header included.
    offset: u64,
    /// Preallocation high-water mark.
    allocated: u64,
    /// Flush also syncs the file to the device.
    sync_on_flush: bool,
    /// Buffered tx-blocks not yet handed to the OS.
    buf: Vec<u8>,
}

impl XlogWriter {
    /// Create a new segment at `path` and persist its header.
    pub fn create(path: &Path, meta: SegmentMeta, sync_on_flush: bool) -> XlogResult<Self> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .map_err(|e| XlogError::io(format!("failed to create {}", path.display()), e))?;
        let header = meta.encode_header()?;
        file.write_all(&header)
            .map_err(|e| XlogError::io(format!("failed to write header of {}", path.display()), e))?;
        let offset = header.len() as u64;
        let mut writer = Self {
            path: path.to_path_buf(),
            file,
            meta,
            offset,
            allocated: offset,
            sync_on_flush,
            buf: Vec::new(),
        };
        writer.flush()?;
        Ok(writer)
    }

    /// Reopen an existing segment for appending.
    ///
    /// Scans the body to find the end of the last intact tx-block and
    /// truncates anything after it, including a previous clean-close EOF
    /// marker. Returns the writer positioned for the next block, plus the
    /// vclock accumulated over the scanned rows.
    pub fn open_append(path: &Path, sync_on_flush: bool) -> XlogResult<(Self, VClock)> {
        let mut reader = XlogReader::open(path)?;
        let meta = reader.meta().clone();
        let mut vclock = meta.vclock.clone();
        while let Some(row) = reader.next_row()? {
            if row.lsn > vclock.get(row.replica_id) {
                let _ = vclock.follow(row.replica_id, row.lsn);
            }
        }
        let offset = reader.good_offset();
        drop(reader);

        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| XlogError::io(format!("failed to reopen {}", path.display()), e))?;
        file.set_len(offset)
            .map_err(|e| XlogError::io(format!("failed to truncate tail of {}", path.display()), e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| XlogError::io(format!("failed to seek in {}", path.display()), e))?;
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                meta,
                offset,
                allocated: offset,
                sync_on_flush,
                buf: Vec::new(),
            },
            vclock,
        ))
    }

    /// Segment header.
    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Bytes of valid data in the segment, buffered bytes included.
    pub fn offset(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }

    /// File path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make sure at least `len` more bytes are preallocated past the
    /// current write position.
    ///
    /// Out-of-space surfaces as [`XlogError::is_no_space`]; the caller is
    /// expected to free old segments and retry.
    pub fn fallocate(&mut self, len: u64) -> XlogResult<()> {
        if fault::is_armed(knobs::WAL_FALLOCATE) {
            return Err(XlogError::no_space("injected out-of-space in preallocation"));
        }
        let needed = self.offset() + len;
        if self.allocated >= needed {
            return Ok(());
        }
        let target = self.offset() + len.max(FALLOCATE_LEN);
        self.file
            .set_len(target)
            .map_err(|e| XlogError::io(format!("failed to preallocate {}", self.path.display()), e))?;
        self.allocated = target;
        Ok(())
    }

    /// Append one tx-block holding the given pre-encoded row frames.
    ///
    /// The block stays in the writer's buffer until [`flush`] runs; a
    /// failed append leaves neither buffer nor file with a partial block.
    ///
    /// Returns the encoded block size in bytes.
    ///
    /// [`flush`]: XlogWriter::flush
    pub fn append_tx(&mut self, encoded_rows: &[Vec<u8>]) -> XlogResult<u64> {
        let payload_len: usize = encoded_rows.iter().map(Vec::len).sum();
        let mut hasher = crc32fast::Hasher::new();
        for row in encoded_rows {
            hasher.update(row);
        }
        let crc = hasher.finalize();

        let block_len = TX_FIXHEADER_LEN + payload_len;
        self.buf.reserve(block_len);
        self.buf.extend_from_slice(&TX_BLOCK_MAGIC.to_le_bytes());
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
        self.buf.extend_from_slice(&(encoded_rows.len() as u32).to_le_bytes());
        for row in encoded_rows {
            self.buf.extend_from_slice(row);
        }
        Ok(block_len as u64)
    }

    /// Hand buffered blocks to the OS, syncing to the device when the
    /// segment was opened in sync mode.
    pub fn flush(&mut self) -> XlogResult<()> {
        if !self.buf.is_empty() {
            self.file
                .write_all(&self.buf)
                .map_err(|e| XlogError::io(format!("failed to write {}", self.path.display()), e))?;
            self.offset += self.buf.len() as u64;
            self.buf.clear();
        }
        if self.sync_on_flush {
            self.file
                .sync_data()
                .map_err(|e| XlogError::io(format!("failed to sync {}", self.path.display()), e))?;
        }
        Ok(())
    }

    /// Drop any buffered but unflushed blocks after a failed write, so the
    /// next batch starts from the last durable position.
    pub fn discard_buffered(&mut self) {
        self.buf.clear();
    }

    /// Seal the segment: flush, write the EOF marker, shrink away the
    /// preallocated tail and sync.
    pub fn close(mut self) -> XlogResult<()> {
        self.flush()?;
        self.file
            .write_all(&EOF_MAGIC.to_le_bytes())
            .map_err(|e| XlogError::io(format!("failed to write eof marker to {}", self.path.display()), e))?;
        self.offset += 4;
        self.file
            .set_len(self.offset)
            .map_err(|e| XlogError::io(format!("failed to trim {}", self.path.display()), e))?;
        self.file
            .sync_data()
            .map_err(|e| XlogError::io(format!("failed to sync {}", self.path.display()), e))?;
        Ok(())
    }

    /// Forget the file handle without writing an EOF marker. Used after a
    /// fork so the child never seals the parent's segment.
    pub fn forget(self) {
        std::mem::forget(self.file);
    }
}

/// Encode a block buffer for tests and tools.
#[cfg(test)]
pub(crate) fn encode_block(encoded_rows: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = encoded_rows.iter().map(Vec::len).sum();
    let mut hasher = crc32fast::Hasher::new();
    for row in encoded_rows {
        hasher.update(row);
    }
    let mut out = Vec::with_capacity(TX_FIXHEADER_LEN + payload_len);
    out.extend_from_slice(&TX_BLOCK_MAGIC.to_le_bytes());
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(&(payload_len as u32).to_le_bytes());
    out.extend_from_slice(&(encoded_rows.len() as u32).to_le_bytes());
    for row in encoded_rows {
        out.extend_from_slice(row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xrow::{Row, RowType};
    use tempfile::TempDir;

    fn sample_rows(first_lsn: i64, count: i64) -> Vec<Row> {
        (0..count)
            .map(|i| {
                let mut row = Row::new(RowType::Insert, format!("row-{}", i).into_bytes());
                row.replica_id = 1;
                row.lsn = first_lsn + i;
                row.tsn = first_lsn;
                row.is_commit = i == count - 1;
                row
            })
            .collect()
    }

    fn encode_rows(rows: &[Row]) -> Vec<Vec<u8>> {
        rows.iter().map(Row::encode).collect()
    }

    #[test]
    fn test_create_writes_parseable_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("00000000000000000000.xlog");
        let meta = SegmentMeta::new(Uuid::new_v4(), VClock::new());
        let writer = XlogWriter::create(&path, meta.clone(), false).unwrap();
        drop(writer);

        let reader = XlogReader::open(&path).unwrap();
        assert_eq!(reader.meta(), &meta);
    }

    #[test]
    fn test_append_flush_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("00000000000000000000.xlog");
        let meta = SegmentMeta::new(Uuid::new_v4(), VClock::new());
        let mut writer = XlogWriter::create(&path, meta, false).unwrap();

        let rows = sample_rows(1, 3);
        writer.append_tx(&encode_rows(&rows)).unwrap();
        writer.flush().unwrap();
        writer.close().unwrap();

        let mut reader = XlogReader::open(&path).unwrap();
        for expected in &rows {
            let got = reader.next_row().unwrap().unwrap();
            assert_eq!(&got, expected);
        }
        assert!(reader.next_row().unwrap().is_none());
        assert!(reader.saw_eof_marker());
    }

    #[test]
    fn test_offset_tracks_buffered_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("00000000000000000000.xlog");
        let meta = SegmentMeta::new(Uuid::new_v4(), VClock::new());
        let mut writer = XlogWriter::create(&path, meta, false).unwrap();
        let before = writer.offset();
        let written = writer.append_tx(&encode_rows(&sample_rows(1, 2))).unwrap();
        assert_eq!(writer.offset(), before + written);
    }

    #[test]
    fn test_discard_buffered_drops_partial_batch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("00000000000000000000.xlog");
        let meta = SegmentMeta::new(Uuid::new_v4(), VClock::new());
        let mut writer = XlogWriter::create(&path, meta, false).unwrap();
        let before = writer.offset();
        writer.append_tx(&encode_rows(&sample_rows(1, 2))).unwrap();
        writer.discard_buffered();
        assert_eq!(writer.offset(), before);
        writer.close().unwrap();

        let mut reader = XlogReader::open(&path).unwrap();
        assert!(reader.next_row().unwrap().is_none());
    }

    #[test]
    fn test_open_append_continues_after_clean_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("00000000000000000000.xlog");
        let meta = SegmentMeta::new(Uuid::new_v4(), VClock::new());

        let mut writer = XlogWriter::create(&path, meta, false).unwrap();
        writer.append_tx(&encode_rows(&sample_rows(1, 2))).unwrap();
        writer.flush().unwrap();
        writer.close().unwrap();

        let (mut writer, vclock) = XlogWriter::open_append(&path, false).unwrap();
        assert_eq!(vclock.get(1), 2);
        writer.append_tx(&encode_rows(&sample_rows(3, 1))).unwrap();
        writer.flush().unwrap();
        writer.close().unwrap();

        let mut reader = XlogReader::open(&path).unwrap();
        let mut lsns = Vec::new();
        while let Some(row) = reader.next_row().unwrap() {
            lsns.push(row.lsn);
        }
        assert_eq!(lsns, vec![1, 2, 3]);
    }

    #[test]
    fn test_open_append_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("00000000000000000000.xlog");
        let meta = SegmentMeta::new(Uuid::new_v4(), VClock::new());

        let mut writer = XlogWriter::create(&path, meta, false).unwrap();
        writer.append_tx(&encode_rows(&sample_rows(1, 2))).unwrap();
        writer.flush().unwrap();
        drop(writer);

        // Simulate a crash mid-append: half a block at the tail.
        let block = encode_block(&encode_rows(&sample_rows(3, 1)));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&block[..block.len() / 2]).unwrap();
        drop(file);

        let (writer, vclock) = XlogWriter::open_append(&path, false).unwrap();
        assert_eq!(vclock.get(1), 2);
        writer.close().unwrap();

        let mut reader = XlogReader::open(&path).unwrap();
        let mut count = 0;
        while reader.next_row().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
        assert!(reader.saw_eof_marker());
    }

    #[test]
    fn test_fallocate_injection_reports_no_space() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("00000000000000000000.xlog");
        let meta = SegmentMeta::new(Uuid::new_v4(), VClock::new());
        let mut writer = XlogWriter::create(&path, meta, false).unwrap();

        fault::arm_count(knobs::WAL_FALLOCATE, 1);
        let err = writer.fallocate(1024).unwrap_err();
        assert!(err.is_no_space());
        // Countdown exhausted: the retry succeeds.
        writer.fallocate(1024).unwrap();
        fault::disarm(knobs::WAL_FALLOCATE);
    }
}

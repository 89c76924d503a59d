//! Segment reader.
//!
//! Reads a segment sequentially: header, then tx-blocks, verifying the
//! crc of every block before yielding its rows. A torn block at the end
//! of the file reads as end-of-log (the crash happened mid-append); a
//! checksum mismatch on a complete block is corruption.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use super::errors::{XlogError, XlogResult};
use super::segment::{SegmentMeta, EOF_MAGIC, TX_BLOCK_MAGIC, TX_FIXHEADER_LEN, XLOG_MAGIC_LINE};
use crate::xrow::Row;

/// Sequential reader over one segment file.
#[derive(Debug)]
pub struct XlogReader {
    path: PathBuf,
    file: BufReader<File>,
    meta: SegmentMeta,
    /// Rows of the current block not yet handed out.
    pending: VecDeque<Row>,
    /// Byte offset just past the last fully verified block.
    good_offset: u64,
    /// Byte offset of the next unread byte.
    offset: u64,
    /// A clean-close EOF marker was found.
    eof_marker: bool,
    /// No more blocks will be yielded.
    done: bool,
}

impl XlogReader {
    /// Open a segment and parse its header.
    pub fn open(path: &Path) -> XlogResult<Self> {
        let file = File::open(path)
            .map_err(|e| XlogError::io(format!("failed to open {}", path.display()), e))?;
        let mut file = BufReader::new(file);

        let mut magic = [0u8; 5];
        read_exact_at(&mut file, &mut magic, path, 0)?;
        if magic != XLOG_MAGIC_LINE {
            return Err(XlogError::corruption_at(0, format!("bad magic in {}", path.display())));
        }
        let meta_line = read_line(&mut file, path)?;
        let meta: SegmentMeta = serde_json::from_slice(&meta_line).map_err(|e| {
            XlogError::corruption(format!("bad segment meta in {}: {}", path.display(), e))
        })?;
        let blank = read_line(&mut file, path)?;
        if !blank.is_empty() {
            return Err(XlogError::corruption(format!(
                "missing blank line after header in {}",
                path.display()
            )));
        }
        // magic + meta json + '\n' + '\n'
        let offset = (XLOG_MAGIC_LINE.len() + meta_line.len() + 2) as u64;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            meta,
            pending: VecDeque::new(),
            good_offset: offset,
            offset,
            eof_marker: false,
            done: false,
        })
    }

    /// Parse only the header of a segment.
    pub fn read_meta(path: &Path) -> XlogResult<SegmentMeta> {
        Ok(Self::open(path)?.meta)
    }

    /// Segment header.
    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Byte offset just past the last fully verified block. After the
    /// reader returns `None`, this is where appending may resume.
    pub fn good_offset(&self) -> u64 {
        self.good_offset
    }

    /// True once a clean-close EOF marker has been read.
    pub fn saw_eof_marker(&self) -> bool {
        self.eof_marker
    }

    /// Resume reading at a block boundary previously reported by
    /// [`good_offset`]. Used by tailing readers that reopen a live
    /// segment after more blocks were flushed behind them.
    ///
    /// [`good_offset`]: XlogReader::good_offset
    pub fn seek_to(&mut self, offset: u64) -> XlogResult<()> {
        use std::io::{Seek, SeekFrom};
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| XlogError::io(format!("failed to seek in {}", self.path.display()), e))?;
        self.offset = offset;
        self.good_offset = offset;
        self.pending.clear();
        self.eof_marker = false;
        self.done = false;
        Ok(())
    }

    /// Next row, or `None` at the end of the readable log.
    pub fn next_row(&mut self) -> XlogResult<Option<Row>> {
        loop {
            if let Some(row) = self.pending.pop_front() {
                if self.pending.is_empty() {
                    // All rows of the block consumed; the block is good.
                    self.good_offset = self.offset;
                }
                return Ok(Some(row));
            }
            if self.done {
                return Ok(None);
            }
            if !self.read_block()? {
                self.done = true;
                return Ok(None);
            }
        }
    }

    /// Read and verify one tx-block into `pending`. Returns false at the
    /// end of the log (EOF marker, file end, or torn tail).
    fn read_block(&mut self) -> XlogResult<bool> {
        let mut magic = [0u8; 4];
        match self.file.read_exact(&mut magic) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(e) => {
                return Err(XlogError::io(format!("failed to read {}", self.path.display()), e))
            }
        }
        let magic = u32::from_le_bytes(magic);
        if magic == EOF_MAGIC {
            self.eof_marker = true;
            return Ok(false);
        }
        if magic != TX_BLOCK_MAGIC {
            // Preallocated zero tail reads as a torn end, anything else
            // is corruption.
            if magic == 0 {
                return Ok(false);
            }
            return Err(XlogError::corruption_at(
                self.offset,
                format!("bad tx-block magic {:#x} in {}", magic, self.path.display()),
            ));
        }

        let mut rest = [0u8; TX_FIXHEADER_LEN - 4];
        if self.file.read_exact(&mut rest).is_err() {
            // Torn fixheader at the tail.
            return Ok(false);
        }
        let crc = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        let payload_len = u32::from_le_bytes(rest[4..8].try_into().unwrap()) as usize;
        let row_count = u32::from_le_bytes(rest[8..12].try_into().unwrap()) as usize;

        let mut payload = vec![0u8; payload_len];
        if self.file.read_exact(&mut payload).is_err() {
            // Torn payload at the tail.
            return Ok(false);
        }

        let actual_crc = crc32fast::hash(&payload);
        if actual_crc != crc {
            return Err(XlogError::corruption_at(
                self.offset,
                format!(
                    "tx-block checksum mismatch in {}: stored {:08x}, computed {:08x}",
                    self.path.display(),
                    crc,
                    actual_crc
                ),
            ));
        }

        let mut cursor = payload.as_slice();
        for _ in 0..row_count {
            let row = Row::read_from(&mut cursor).map_err(|e| {
                XlogError::corruption_at(
                    self.offset,
                    format!("bad row frame in {}: {}", self.path.display(), e),
                )
            })?;
            self.pending.push_back(row);
        }
        if !cursor.is_empty() {
            return Err(XlogError::corruption_at(
                self.offset,
                format!("trailing bytes inside tx-block of {}", self.path.display()),
            ));
        }

        self.offset += (TX_FIXHEADER_LEN + payload_len) as u64;
        if self.pending.is_empty() {
            // A block with zero rows still counts as consumed.
            self.good_offset = self.offset;
        }
        Ok(true)
    }
}

fn read_exact_at(
    file: &mut BufReader<File>,
    buf: &mut [u8],
    path: &Path,
    offset: u64,
) -> XlogResult<()> {
    file.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            XlogError::corruption_at(offset, format!("truncated header in {}", path.display()))
        } else {
            XlogError::io(format!("failed to read {}", path.display()), e)
        }
    })
}

/// Read bytes up to (not including) the next `\n`.
fn read_line(file: &mut BufReader<File>, path: &Path) -> XlogResult<Vec<u8>> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match file.read_exact(&mut byte) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(XlogError::corruption(format!(
                    "truncated header in {}",
                    path.display()
                )))
            }
            Err(e) => {
                return Err(XlogError::io(format!("failed to read {}", path.display()), e))
            }
        }
        if byte[0] == b'\n' {
            return Ok(line);
        }
        line.push(byte[0]);
        if line.len() > 4096 {
            return Err(XlogError::corruption(format!(
                "unterminated header line in {}",
                path.display()
            )));
        }
    }
}

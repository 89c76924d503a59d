//! Row structure and frame codec.
//!
//! Frame layout, all integers little-endian:
//!
//! - frame length (u32, bytes after this field)
//! - row type (u8)
//! - group id (u8)
//! - flags (u8, bit 0 = commit)
//! - replica id (u32)
//! - lsn (i64)
//! - tsn (i64)
//! - tm (f64, seconds since the epoch)
//! - body length (u32)
//! - body (opaque bytes)
//!
//! The body of an acknowledgement row is a JSON-encoded vclock; every
//! other body is opaque to this crate.

use std::io::{self, Read, Write};

use chrono::Utc;

use crate::clock::{ReplicaId, VClock};

/// Fixed part of a frame after the length prefix.
const ROW_FIXED_LEN: usize = 1 + 1 + 1 + 4 + 8 + 8 + 8 + 4;

/// Upper bound on a frame accepted from the wire or a file. Larger frames
/// are treated as corruption rather than allocated blindly.
pub(crate) const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Row types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RowType {
    /// Empty liveness probe; carries only a timestamp.
    Heartbeat = 0,
    /// Insertion of a new tuple.
    Insert = 1,
    /// Replacement of an existing tuple.
    Update = 2,
    /// Deletion of a tuple.
    Delete = 3,
    /// No-op that still advances the follower's clock.
    Nop = 4,
    /// Follower acknowledgement carrying a vclock body.
    Ack = 5,
}

impl RowType {
    /// Convert from the wire byte, `None` for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(RowType::Heartbeat),
            1 => Some(RowType::Insert),
            2 => Some(RowType::Update),
            3 => Some(RowType::Delete),
            4 => Some(RowType::Nop),
            5 => Some(RowType::Ack),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for rows that mutate (or deliberately skip mutating) data and
    /// therefore occupy an LSN.
    pub fn is_dml(self) -> bool {
        matches!(
            self,
            RowType::Insert | RowType::Update | RowType::Delete | RowType::Nop
        )
    }
}

/// Replication group of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GroupId {
    /// Replicated everywhere.
    Default = 0,
    /// Instance-local; never leaves the instance as-is.
    Local = 1,
}

impl GroupId {
    /// Convert from the wire byte, `None` for unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(GroupId::Default),
            1 => Some(GroupId::Local),
            _ => None,
        }
    }
}

/// Current wall-clock time as a row timestamp.
pub fn now_tm() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// One log record.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Record type.
    pub rtype: RowType,
    /// Originating instance; [`crate::clock::REPLICA_ID_NIL`] until the
    /// WAL signs a local row.
    pub replica_id: ReplicaId,
    /// Replication group.
    pub group_id: GroupId,
    /// Log sequence number, per replica id.
    pub lsn: i64,
    /// Transaction id: the LSN of the transaction's first local row.
    pub tsn: i64,
    /// Last row of its transaction.
    pub is_commit: bool,
    /// Writer-assigned wall-clock timestamp.
    pub tm: f64,
    /// Opaque payload.
    pub body: Vec<u8>,
}

impl Row {
    /// A fresh unsigned row with the given type and body.
    pub fn new(rtype: RowType, body: Vec<u8>) -> Self {
        Self {
            rtype,
            replica_id: 0,
            group_id: GroupId::Default,
            lsn: 0,
            tsn: 0,
            is_commit: false,
            tm: 0.0,
            body,
        }
    }

    /// An instance-local row that must never replicate as-is.
    pub fn local(rtype: RowType, body: Vec<u8>) -> Self {
        let mut row = Self::new(rtype, body);
        row.group_id = GroupId::Local;
        row
    }

    /// A zero-body heartbeat stamped with the current time.
    pub fn heartbeat(replica_id: ReplicaId) -> Self {
        Self {
            rtype: RowType::Heartbeat,
            replica_id,
            group_id: GroupId::Default,
            lsn: 0,
            tsn: 0,
            is_commit: false,
            tm: now_tm(),
            body: Vec::new(),
        }
    }

    /// An acknowledgement row whose body encodes `vclock`.
    pub fn ack(replica_id: ReplicaId, vclock: &VClock) -> Self {
        let body = serde_json::to_vec(vclock).expect("vclock always serializes");
        let mut row = Self::new(RowType::Ack, body);
        row.replica_id = replica_id;
        row.tm = now_tm();
        row
    }

    /// Decode the vclock body of an [`RowType::Ack`] row.
    pub fn decode_ack(&self) -> io::Result<VClock> {
        if self.rtype != RowType::Ack {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected ack row, got {:?}", self.rtype),
            ));
        }
        serde_json::from_slice(&self.body).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("malformed ack body: {}", e))
        })
    }

    /// Rewrite a local row into a NOP that advances the follower's clock
    /// without carrying data. LSN, TSN, origin and commit flag are kept.
    pub fn to_nop(&self) -> Self {
        Self {
            rtype: RowType::Nop,
            replica_id: self.replica_id,
            group_id: GroupId::Default,
            lsn: self.lsn,
            tsn: self.tsn,
            is_commit: self.is_commit,
            tm: self.tm,
            body: Vec::new(),
        }
    }

    /// Encoded size of this row including the length prefix.
    pub fn encoded_len(&self) -> usize {
        4 + ROW_FIXED_LEN + self.body.len()
    }

    /// Serialize the full frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut buf).expect("Vec write cannot fail");
        buf
    }

    /// Write the full frame to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let frame_len = (ROW_FIXED_LEN + self.body.len()) as u32;
        writer.write_all(&frame_len.to_le_bytes())?;
        writer.write_all(&[self.rtype.as_u8()])?;
        writer.write_all(&[self.group_id as u8])?;
        writer.write_all(&[if self.is_commit { 1 } else { 0 }])?;
        writer.write_all(&self.replica_id.to_le_bytes())?;
        writer.write_all(&self.lsn.to_le_bytes())?;
        writer.write_all(&self.tsn.to_le_bytes())?;
        writer.write_all(&self.tm.to_le_bytes())?;
        writer.write_all(&(self.body.len() as u32).to_le_bytes())?;
        writer.write_all(&self.body)?;
        Ok(())
    }

    /// Read one frame from a reader.
    ///
    /// Errors with `UnexpectedEof` if the stream ends mid-frame and with
    /// `InvalidData` for malformed frames.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let frame_len = u32::from_le_bytes(len_buf);
        if frame_len < ROW_FIXED_LEN as u32 || frame_len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid row frame length: {}", frame_len),
            ));
        }
        let mut frame = vec![0u8; frame_len as usize];
        reader.read_exact(&mut frame)?;
        Self::decode_frame(&frame)
    }

    /// Decode a frame whose length prefix has already been stripped.
    fn decode_frame(frame: &[u8]) -> io::Result<Self> {
        if frame.len() < ROW_FIXED_LEN {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "row frame too short",
            ));
        }
        let rtype = RowType::from_u8(frame[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid row type: {}", frame[0]),
            )
        })?;
        let group_id = GroupId::from_u8(frame[1]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid group id: {}", frame[1]),
            )
        })?;
        let is_commit = frame[2] & 1 != 0;
        let replica_id = u32::from_le_bytes(frame[3..7].try_into().unwrap());
        let lsn = i64::from_le_bytes(frame[7..15].try_into().unwrap());
        let tsn = i64::from_le_bytes(frame[15..23].try_into().unwrap());
        let tm = f64::from_le_bytes(frame[23..31].try_into().unwrap());
        let body_len = u32::from_le_bytes(frame[31..35].try_into().unwrap()) as usize;
        if frame.len() != ROW_FIXED_LEN + body_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "row body length mismatch: frame {} bytes, body claims {}",
                    frame.len(),
                    body_len
                ),
            ));
        }
        Ok(Self {
            rtype,
            replica_id,
            group_id,
            lsn,
            tsn,
            is_commit,
            tm,
            body: frame[ROW_FIXED_LEN..].to_vec(),
        })
    }
}

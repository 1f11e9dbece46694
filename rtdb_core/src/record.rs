//! Recording-container boundary: the 24-byte chunk header that precedes
//! every metadata or data record in a recording file, and the sidecar
//! time-index entry used for seeking. Byte layouts are fixed; recordings
//! written by other tools must stay readable.

use crate::error::{DbError, DbResult};
use crate::object::ObjectId;
use crate::time::Timestamp;
use crate::trace::TraceEventKind;
use bytemuck::{Pod, Zeroable};

/// Chunk signature, first four bytes of every chunk header.
pub const CHUNK_FOURCC: [u8; 4] = *b"RTDB";

pub const CHUNK_HEADER_SIZE: usize = 24;

/// Header preceding one recorded chunk. `length` counts the body bytes
/// only, excluding this header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ChunkHeader {
    pub fourcc: [u8; 4],
    pub length: u32,
    pub timestamp: i64,
    pub oid: u32,
    pub event: u32,
}

impl ChunkHeader {
    pub fn new(event: TraceEventKind, oid: ObjectId, ts: Timestamp, length: u32) -> ChunkHeader {
        ChunkHeader {
            fourcc: CHUNK_FOURCC,
            length,
            timestamp: ts.as_nanos(),
            oid: oid.0,
            event: event as u32,
        }
    }

    pub fn event_kind(&self) -> DbResult<TraceEventKind> {
        TraceEventKind::from_raw(self.event)
            .ok_or_else(|| DbError::Invalid(format!("unknown chunk event {}", self.event)))
    }

    pub fn oid(&self) -> ObjectId {
        ObjectId(self.oid)
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp(self.timestamp)
    }

    pub fn encode(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut out = [0u8; CHUNK_HEADER_SIZE];
        out.copy_from_slice(bytemuck::bytes_of(self));
        out
    }

    /// Parse and validate a header from the front of `buf`.
    pub fn decode(buf: &[u8]) -> DbResult<ChunkHeader> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(DbError::Invalid(format!(
                "chunk header needs {CHUNK_HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let hdr: ChunkHeader = bytemuck::pod_read_unaligned(&buf[..CHUNK_HEADER_SIZE]);
        if hdr.fourcc != CHUNK_FOURCC {
            return Err(DbError::Invalid(format!(
                "bad chunk signature {:02x?}",
                hdr.fourcc
            )));
        }
        hdr.event_kind()?;
        Ok(hdr)
    }
}

/// Seconds per time-index bucket.
pub const INDEX_BUCKET_SECS: i64 = 1;

/// One sidecar index entry: the byte offset of the first chunk at or
/// after a coarse time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IndexEntry {
    /// Bucket start, seconds since epoch.
    pub bucket_secs: i64,
    /// Byte offset of the first chunk header in that bucket.
    pub offset: u64,
}

/// In-memory time index, built while writing or scanning a recording.
#[derive(Debug, Default)]
pub struct TimeIndex {
    entries: Vec<IndexEntry>,
}

impl TimeIndex {
    pub fn new() -> TimeIndex {
        TimeIndex::default()
    }

    /// Record a chunk seen at `ts` and file offset `offset`. Chunks
    /// arrive in timestamp order; only the first of each bucket is kept.
    pub fn note(&mut self, ts: Timestamp, offset: u64) {
        let bucket = ts.as_nanos().div_euclid(INDEX_BUCKET_SECS * 1_000_000_000);
        match self.entries.last() {
            Some(last) if last.bucket_secs >= bucket => {}
            _ => self.entries.push(IndexEntry {
                bucket_secs: bucket,
                offset,
            }),
        }
    }

    /// Byte offset to start scanning from to reach `ts`: the latest
    /// bucket at or before it, or the file start.
    pub fn seek(&self, ts: Timestamp) -> u64 {
        let bucket = ts.as_nanos().div_euclid(INDEX_BUCKET_SECS * 1_000_000_000);
        match self
            .entries
            .partition_point(|e| e.bucket_secs <= bucket)
        {
            0 => 0,
            n => self.entries[n - 1].offset,
        }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn encode(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.entries).to_vec()
    }

    pub fn decode(buf: &[u8]) -> DbResult<TimeIndex> {
        if buf.len() % std::mem::size_of::<IndexEntry>() != 0 {
            return Err(DbError::Invalid(format!(
                "time index of {} bytes is not a whole number of entries",
                buf.len()
            )));
        }
        let mut entries = Vec::with_capacity(buf.len() / std::mem::size_of::<IndexEntry>());
        for chunk in buf.chunks_exact(std::mem::size_of::<IndexEntry>()) {
            entries.push(bytemuck::pod_read_unaligned(chunk));
        }
        Ok(TimeIndex { entries })
    }
}

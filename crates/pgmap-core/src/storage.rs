//! Snapshot file format: one zstd frame of a postcard-encoded
//! [`PgMapSnapshot`] behind a small fixed header.
//!
//! File layout:
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ HEADER (16 bytes, uncompressed)              │
//! │   magic: [u8; 4]        = b"PGM1"            │
//! │   version: u16          = 1                  │
//! │   _reserved: [u8; 2]    = [0; 2]             │
//! │   crc32: u32            (of PAYLOAD)         │
//! │   payload_len: u32                           │
//! ├──────────────────────────────────────────────┤
//! │ PAYLOAD                                      │
//! │   zstd(postcard(PgMapSnapshot))              │
//! └──────────────────────────────────────────────┘
//! ```
//! All integers little-endian.

use std::fs;
use std::io::{self, Read as _, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::map::{PgMap, PgMapSnapshot};

const MAGIC: [u8; 4] = *b"PGM1";
const VERSION: u16 = 1;
const HEADER_SIZE: usize = 16;
const ZSTD_LEVEL: i32 = 3;

/// Parsed snapshot file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub version: u16,
    pub crc32: u32,
    pub payload_len: u32,
}

impl SnapshotHeader {
    fn parse(header: &[u8; HEADER_SIZE]) -> io::Result<Self> {
        let magic = &header[0..4];
        if magic != MAGIC {
            return Err(io::Error::other(format!(
                "invalid magic: expected PGM1, got {:?}",
                magic
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != VERSION {
            return Err(io::Error::other(format!(
                "unsupported version: {}",
                version
            )));
        }
        Ok(Self {
            version,
            crc32: u32::from_le_bytes([header[8], header[9], header[10], header[11]]),
            payload_len: u32::from_le_bytes([header[12], header[13], header[14], header[15]]),
        })
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&self.version.to_le_bytes());
        header[8..12].copy_from_slice(&self.crc32.to_le_bytes());
        header[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        header
    }
}

/// Encodes a snapshot into the file format.
pub fn encode_snapshot(snap: &PgMapSnapshot) -> io::Result<Vec<u8>> {
    let raw = postcard::to_allocvec(snap).map_err(io::Error::other)?;
    let payload = zstd::encode_all(&raw[..], ZSTD_LEVEL)?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::other("snapshot too large for file format"))?;

    let header = SnapshotHeader {
        version: VERSION,
        crc32: crc32fast::hash(&payload),
        payload_len,
    };
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&payload);
    debug!(
        raw_len = raw.len(),
        compressed_len = payload.len(),
        "storage: snapshot encoded"
    );
    Ok(out)
}

/// Decodes a snapshot, verifying magic, version, length and checksum.
pub fn decode_snapshot(data: &[u8]) -> io::Result<PgMapSnapshot> {
    let header: &[u8; HEADER_SIZE] = data
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| io::Error::other("file too small for header"))?;
    let header = SnapshotHeader::parse(header)?;

    let payload = &data[HEADER_SIZE..];
    if payload.len() != header.payload_len as usize {
        return Err(io::Error::other(format!(
            "payload length mismatch: header says {}, found {}",
            header.payload_len,
            payload.len()
        )));
    }
    let crc = crc32fast::hash(payload);
    if crc != header.crc32 {
        return Err(io::Error::other(format!(
            "checksum mismatch: header {:08x}, payload {:08x}",
            header.crc32, crc
        )));
    }

    let raw = zstd::decode_all(payload)?;
    postcard::from_bytes(&raw).map_err(|e| {
        warn!(
            raw_len = raw.len(),
            error = %e,
            "storage: snapshot deserialization failed"
        );
        io::Error::other(e)
    })
}

/// Reads only the header of a snapshot file.
pub fn read_header(path: &Path) -> io::Result<SnapshotHeader> {
    let mut file = fs::File::open(path)?;
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;
    SnapshotHeader::parse(&header)
}

/// Writes a snapshot file atomically via a `.tmp` sibling.
pub fn write_snapshot(path: &Path, snap: &PgMapSnapshot) -> io::Result<()> {
    let data = encode_snapshot(snap)?;
    let tmp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp_path, path)
}

pub fn read_snapshot(path: &Path) -> io::Result<PgMapSnapshot> {
    decode_snapshot(&fs::read(path)?)
}

/// Saves the complete state of `map`.
pub fn save_map(path: &Path, map: &PgMap) -> io::Result<()> {
    write_snapshot(path, &map.to_snapshot())
}

/// Loads a map, rejecting snapshots that violate the map's invariants.
pub fn load_map(path: &Path) -> io::Result<PgMap> {
    let snap = read_snapshot(path)?;
    PgMap::from_snapshot(snap).map_err(io::Error::other)
}

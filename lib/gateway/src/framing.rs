// SPDX-License-Identifier: Apache-2.0

//! Outer and inner frame headers.
//!
//! Outer wire format, little-endian, fixed 40-byte header:
//!
//! ```text
//! [port: u32][data_size: u32][sha256: 32 bytes][payload ...]
//! ```
//!
//! The checksum covers exactly `data_size` payload bytes. Inner frames carry
//! only a 4-byte `data_size`; their integrity is already guaranteed by TLS or
//! by the enclosing outer frame.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Size of the outer header on the wire.
pub const OUTER_HEADER_SIZE: usize = 40;

/// Size of the inner header on the wire.
pub const INNER_HEADER_SIZE: usize = 4;

/// Largest payload the mux accepts in a single outer frame.
pub const MAX_FRAME_SIZE: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterHeader {
    pub port: u32,
    pub data_size: u32,
    pub checksum: [u8; 32],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerHeader {
    pub data_size: u32,
}

/// SHA-256 over the whole payload.
pub fn checksum(payload: &[u8]) -> [u8; 32] {
    Sha256::digest(payload).into()
}

/// Builds the outer header for `payload`; the caller appends the payload.
pub fn build_outer(port: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(OUTER_HEADER_SIZE);

    buf.put_u32_le(port);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&checksum(payload));

    buf.freeze()
}

/// Parses the first [`OUTER_HEADER_SIZE`] bytes of `raw`.
pub fn parse_outer(raw: &[u8]) -> Result<OuterHeader> {
    if raw.len() < OUTER_HEADER_SIZE {
        return Err(Error::InvalidArgument(format!(
            "outer header needs {OUTER_HEADER_SIZE} bytes, got {}",
            raw.len()
        )));
    }

    let port = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let data_size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);

    let mut checksum = [0u8; 32];
    checksum.copy_from_slice(&raw[8..OUTER_HEADER_SIZE]);

    Ok(OuterHeader {
        port,
        data_size,
        checksum,
    })
}

/// Builds the inner header for a payload of `data_size` bytes.
pub fn build_inner(data_size: u32) -> [u8; INNER_HEADER_SIZE] {
    data_size.to_le_bytes()
}

/// Parses the first [`INNER_HEADER_SIZE`] bytes of `raw`.
pub fn parse_inner(raw: &[u8]) -> Result<InnerHeader> {
    if raw.len() < INNER_HEADER_SIZE {
        return Err(Error::InvalidArgument(format!(
            "inner header needs {INNER_HEADER_SIZE} bytes, got {}",
            raw.len()
        )));
    }

    Ok(InnerHeader {
        data_size: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
    })
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Wire descriptors handed to the co-processor at boot.
//!
//! The peer reads these once from a configuration block, so the layout is
//! bit-exact and little-endian regardless of host endianness.

use serde::Serialize;

use crate::error::RingError;

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn check_len(bytes: &[u8], expected: usize, what: &str) -> Result<(), RingError> {
    if bytes.len() < expected {
        return Err(RingError::InvalidDescriptor {
            reason: format!("{} needs {} bytes, got {}", what, expected, bytes.len()),
        });
    }
    Ok(())
}

/// Location and geometry of one shared ring buffer.
///
/// All locations are region-relative offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingDescriptor {
    pub buffer_location: u32,
    pub num_packets: u32,
    pub packet_size: u32,
    pub read_index_location: u32,
    pub write_index_location: u32,
}

impl RingDescriptor {
    pub const WIRE_SIZE: usize = 20;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        let fields = [
            self.buffer_location,
            self.num_packets,
            self.packet_size,
            self.read_index_location,
            self.write_index_location,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RingError> {
        check_len(bytes, Self::WIRE_SIZE, "ring descriptor")?;
        Ok(Self {
            buffer_location: le_u32(bytes, 0),
            num_packets: le_u32(bytes, 4),
            packet_size: le_u32(bytes, 8),
            read_index_location: le_u32(bytes, 12),
            write_index_location: le_u32(bytes, 16),
        })
    }
}

/// One direction of traffic: a ring plus its two interrupt lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamDescriptor {
    pub ring: RingDescriptor,
    /// Line signalled when the consumer has read.
    pub read_bit: u8,
    /// Line signalled when the producer has written.
    pub write_bit: u8,
}

impl StreamDescriptor {
    pub const WIRE_SIZE: usize = RingDescriptor::WIRE_SIZE + 2;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..RingDescriptor::WIRE_SIZE].copy_from_slice(&self.ring.to_bytes());
        out[RingDescriptor::WIRE_SIZE] = self.read_bit;
        out[RingDescriptor::WIRE_SIZE + 1] = self.write_bit;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RingError> {
        check_len(bytes, Self::WIRE_SIZE, "stream descriptor")?;
        Ok(Self {
            ring: RingDescriptor::from_bytes(bytes)?,
            read_bit: bytes[RingDescriptor::WIRE_SIZE],
            write_bit: bytes[RingDescriptor::WIRE_SIZE + 1],
        })
    }
}

/// Both directions of a bidirectional transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportDescriptor {
    /// Co-processor to host.
    pub to_host: StreamDescriptor,
    /// Host to co-processor.
    pub from_host: StreamDescriptor,
}

impl TransportDescriptor {
    pub const WIRE_SIZE: usize = StreamDescriptor::WIRE_SIZE * 2;

    pub fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..StreamDescriptor::WIRE_SIZE].copy_from_slice(&self.to_host.to_bytes());
        out[StreamDescriptor::WIRE_SIZE..].copy_from_slice(&self.from_host.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RingError> {
        check_len(bytes, Self::WIRE_SIZE, "transport descriptor")?;
        Ok(Self {
            to_host: StreamDescriptor::from_bytes(bytes)?,
            from_host: StreamDescriptor::from_bytes(&bytes[StreamDescriptor::WIRE_SIZE..])?,
        })
    }
}

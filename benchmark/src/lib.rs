// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! MxLink Benchmarking Support
//!
//! Shared fixtures for the criterion benches: a ring over an anonymous
//! region, and a peer-facing pair of rings for the same memory.

use std::sync::Arc;

use mxlink_core::shm::{BlockAllocator, RingGeometry, SharedAllocator, SharedRingBuffer};
use mxlink_core::RingError;

/// Payload sizes to benchmark (in bytes).
pub const PAYLOAD_SIZES: &[usize] = &[4, 8, 64, 256, 1024];

/// A ring and a second handle on the same memory, as the co-processor sees it.
pub struct RingPair {
    pub host: SharedRingBuffer,
    pub peer: SharedRingBuffer,
}

impl RingPair {
    pub fn new(mem_length: u32, packet_size: u32) -> Result<Self, RingError> {
        let geometry = RingGeometry::from_mem_length(mem_length, packet_size)?;
        let allocator: Arc<dyn SharedAllocator> = Arc::new(
            BlockAllocator::anonymous(geometry.byte_len() * 2 + 64 * 1024)?,
        );
        let host = SharedRingBuffer::new(allocator.clone(), geometry)?;
        let peer = SharedRingBuffer::attach(allocator, &host.descriptor()?)?;
        Ok(Self { host, peer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_shares_memory() {
        let mut pair = RingPair::new(1024, 8).expect("Failed to create ring pair");
        assert!(pair.host.write(b"abc"));

        let mut buf = [0u8; 8];
        assert_eq!(pair.peer.read(&mut buf), 8);
        assert_eq!(&buf[..3], b"abc");
        assert!(pair.host.is_empty());
    }
}

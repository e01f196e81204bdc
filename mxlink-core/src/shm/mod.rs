// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared memory layer.
//!
//! The mapping both processors see, the allocator that carves it up, the
//! packet rings placed in it, and the little-endian descriptors that tell
//! the peer where everything lives.

pub mod allocator;
pub mod descriptor;
mod region;
mod ring_buffer;

pub use allocator::{BlockAllocator, SharedAllocator, BLOCK_SIZE};
pub use descriptor::{RingDescriptor, StreamDescriptor, TransportDescriptor};
pub use region::SharedMemoryRegion;
pub use ring_buffer::{Packet, PacketIndex, RingGeometry, SharedRingBuffer};

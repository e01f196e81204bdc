// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Packet ring buffer living in the shared region.
//!
//! Both cursors are 32-bit words inside the region itself, each with exactly
//! one writer: the producer owns `write_index`, the consumer owns
//! `read_index`. Data is copied in before the producer publishes its cursor
//! with release ordering, and the consumer loads that cursor with acquire
//! ordering before touching the bytes it covers. No lock is shared with the
//! peer.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{RegionError, RingError};
use crate::shm::allocator::SharedAllocator;
use crate::shm::descriptor::RingDescriptor;

/// Alignment of the packet area and cursor words.
const WORD_ALIGN: usize = 4;

/// Shape of a ring: how many packets of what size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub num_packets: u32,
    pub packet_size: u32,
}

impl RingGeometry {
    /// Validate a geometry.
    ///
    /// One slot is always kept free, so fewer than two packets would leave
    /// no usable capacity.
    pub fn new(num_packets: u32, packet_size: u32) -> Result<Self, RingError> {
        let invalid = |reason| RingError::InvalidGeometry {
            num_packets,
            packet_size,
            reason,
        };

        if packet_size == 0 {
            return Err(invalid("packet size must be non-zero"));
        }
        if num_packets < 2 {
            return Err(invalid("need at least two packets"));
        }
        num_packets
            .checked_mul(packet_size)
            .ok_or_else(|| invalid("byte length overflows u32"))?;

        Ok(Self {
            num_packets,
            packet_size,
        })
    }

    /// Geometry for a ring of `mem_length` bytes cut into `packet_size` packets.
    pub fn from_mem_length(mem_length: u32, packet_size: u32) -> Result<Self, RingError> {
        if packet_size == 0 {
            return Err(RingError::InvalidGeometry {
                num_packets: 0,
                packet_size,
                reason: "packet size must be non-zero",
            });
        }
        Self::new(mem_length / packet_size, packet_size)
    }

    /// Bytes occupied by the packet area.
    pub const fn byte_len(&self) -> usize {
        self.num_packets as usize * self.packet_size as usize
    }

    /// Packets a message of `len` bytes occupies.
    pub const fn packets_for(&self, len: usize) -> usize {
        len.div_ceil(self.packet_size as usize)
    }
}

/// Position of one packet, handed out by [`SharedRingBuffer::peek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketIndex(u32);

impl PacketIndex {
    pub const fn value(self) -> u32 {
        self.0
    }
}

/// A packet still owned by the ring until `peek_complete` is called.
#[derive(Debug)]
pub struct Packet<'a> {
    index: PacketIndex,
    data: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn index(&self) -> PacketIndex {
        self.index
    }

    /// Full packet contents, `packet_size` bytes.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Fixed-geometry packet ring over shared memory.
///
/// Usable capacity is `num_packets - 1`. Messages always occupy whole
/// packets; the unused tail of a last packet keeps whatever it held.
pub struct SharedRingBuffer {
    allocator: Arc<dyn SharedAllocator>,
    buffer: NonNull<u8>,
    read_index: NonNull<AtomicU32>,
    write_index: NonNull<AtomicU32>,
    geometry: RingGeometry,
    /// Set when this side allocated the memory and must return it.
    owns_memory: bool,
}

// SAFETY: the ring holds raw pointers into a mapping that outlives it via the
// allocator Arc. Only one thread drives each end at a time (`&mut self`).
unsafe impl Send for SharedRingBuffer {}

impl SharedRingBuffer {
    /// Allocate a fresh ring and its two cursor words from `allocator`.
    ///
    /// Anything allocated before a failure is returned before the error is.
    pub fn new(
        allocator: Arc<dyn SharedAllocator>,
        geometry: RingGeometry,
    ) -> Result<Self, RingError> {
        let geometry = RingGeometry::new(geometry.num_packets, geometry.packet_size)?;
        let byte_len = geometry.byte_len();

        let buffer = allocator
            .alloc(byte_len, WORD_ALIGN)
            .ok_or(RegionError::OutOfMemory {
                requested: byte_len,
            })?;

        let Some(read_index) = allocator.alloc(WORD_ALIGN, WORD_ALIGN) else {
            allocator.free(buffer);
            return Err(RegionError::OutOfMemory {
                requested: WORD_ALIGN,
            }
            .into());
        };

        let Some(write_index) = allocator.alloc(WORD_ALIGN, WORD_ALIGN) else {
            allocator.free(read_index);
            allocator.free(buffer);
            return Err(RegionError::OutOfMemory {
                requested: WORD_ALIGN,
            }
            .into());
        };

        let ring = Self {
            allocator,
            buffer,
            read_index: read_index.cast(),
            write_index: write_index.cast(),
            geometry,
            owns_memory: true,
        };
        ring.read_cursor().store(0, Ordering::Release);
        ring.write_cursor().store(0, Ordering::Release);

        tracing::debug!(
            num_packets = geometry.num_packets,
            packet_size = geometry.packet_size,
            "Ring buffer allocated"
        );

        Ok(ring)
    }

    /// Bind to a ring someone else allocated, as described by `desc`.
    ///
    /// The attached ring never frees the memory.
    pub fn attach(
        allocator: Arc<dyn SharedAllocator>,
        desc: &RingDescriptor,
    ) -> Result<Self, RingError> {
        let geometry = RingGeometry::new(desc.num_packets, desc.packet_size)?;

        let resolve = |peer_ref: u32| {
            allocator
                .from_peer_ref(peer_ref)
                .ok_or(RingError::Region(RegionError::UnresolvedPeerRef { peer_ref }))
        };

        let buffer = resolve(desc.buffer_location)?;
        let last_byte = desc
            .buffer_location
            .checked_add(geometry.byte_len() as u32 - 1)
            .ok_or_else(|| RingError::InvalidDescriptor {
                reason: "packet area wraps the address space".to_string(),
            })?;
        resolve(last_byte)?;

        let read_index = resolve(desc.read_index_location)?;
        let write_index = resolve(desc.write_index_location)?;
        resolve(desc.read_index_location.saturating_add(3))?;
        resolve(desc.write_index_location.saturating_add(3))?;

        if read_index.as_ptr() as usize % WORD_ALIGN != 0
            || write_index.as_ptr() as usize % WORD_ALIGN != 0
        {
            return Err(RingError::InvalidDescriptor {
                reason: "cursor words are not 4-byte aligned".to_string(),
            });
        }

        Ok(Self {
            allocator,
            buffer,
            read_index: read_index.cast(),
            write_index: write_index.cast(),
            geometry,
            owns_memory: false,
        })
    }

    fn read_cursor(&self) -> &AtomicU32 {
        // SAFETY: points at an aligned, live cursor word in the region
        unsafe { self.read_index.as_ref() }
    }

    fn write_cursor(&self) -> &AtomicU32 {
        // SAFETY: points at an aligned, live cursor word in the region
        unsafe { self.write_index.as_ref() }
    }

    /// Load a cursor, folding an out-of-range value written by a confused
    /// peer back into the ring.
    fn load(&self, cursor: &AtomicU32) -> u32 {
        cursor.load(Ordering::Acquire) % self.geometry.num_packets
    }

    fn advance(&self, index: u32, packets: usize) -> u32 {
        ((index as usize + packets) % self.geometry.num_packets as usize) as u32
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    pub fn num_packets(&self) -> u32 {
        self.geometry.num_packets
    }

    pub fn packet_size(&self) -> u32 {
        self.geometry.packet_size
    }

    /// Current `(read_index, write_index)`.
    pub fn cursors(&self) -> (u32, u32) {
        (self.load(self.read_cursor()), self.load(self.write_cursor()))
    }

    /// Packets that can still be written.
    pub fn free_space(&self) -> usize {
        let (read, write) = self.cursors();
        let n = self.geometry.num_packets as usize;
        let (read, write) = (read as usize, write as usize);
        let free = if write >= read {
            read + n - write
        } else {
            read - write
        };
        free - 1
    }

    /// Packets waiting to be read.
    pub fn available_packets(&self) -> usize {
        let (read, write) = self.cursors();
        let n = self.geometry.num_packets as usize;
        (write as usize + n - read as usize) % n
    }

    pub fn is_empty(&self) -> bool {
        let (read, write) = self.cursors();
        read == write
    }

    pub fn is_full(&self) -> bool {
        let (read, write) = self.cursors();
        self.advance(write, 1) == read
    }

    /// Copy `src` into the packet area starting at byte `pos`, wrapping.
    fn copy_in(&mut self, pos: usize, src: &[u8]) -> usize {
        let byte_len = self.geometry.byte_len();
        let first = src.len().min(byte_len - pos);

        // SAFETY: pos < byte_len and both chunks stay inside the packet area;
        // the peer does not read these bytes until the cursor is published.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.buffer.as_ptr().add(pos), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(first),
                    self.buffer.as_ptr(),
                    src.len() - first,
                );
            }
        }

        (pos + src.len()) % byte_len
    }

    /// Copy out of the packet area starting at byte `pos`, wrapping.
    fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        let byte_len = self.geometry.byte_len();
        let first = dst.len().min(byte_len - pos);

        // SAFETY: pos < byte_len and both chunks stay inside the packet area;
        // the acquire load of the write cursor covers these bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(self.buffer.as_ptr().add(pos), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(
                    self.buffer.as_ptr(),
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }

    /// Write one message. Returns `false`, leaving the ring untouched, when
    /// the message does not fit or is empty.
    pub fn write(&mut self, data: &[u8]) -> bool {
        self.write_gather(&[data])
    }

    /// Write several buffers as one packet-aligned message.
    ///
    /// The result is byte-identical to writing their concatenation. Space is
    /// checked for the whole message first and the write cursor moves once.
    pub fn write_gather(&mut self, parts: &[&[u8]]) -> bool {
        let total: usize = parts.iter().map(|part| part.len()).sum();
        if total == 0 {
            return false;
        }

        let packets = self.geometry.packets_for(total);
        let free = self.free_space();
        if packets > free {
            tracing::trace!(packets, free, "Ring full");
            return false;
        }

        let write = self.load(self.write_cursor());
        let mut pos = write as usize * self.geometry.packet_size as usize;
        for part in parts.iter().filter(|part| !part.is_empty()) {
            pos = self.copy_in(pos, part);
        }

        let next = self.advance(write, packets);
        self.write_cursor().store(next, Ordering::Release);

        tracing::trace!(bytes = total, packets, write_index = next, "Ring write");
        true
    }

    /// Read up to `buf.len()` bytes, consuming whole packets.
    ///
    /// A partial-packet request still consumes the full packet. A request
    /// for more than is buffered is truncated to what is there; callers must
    /// check the returned length.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let available = self.available_packets();
        let mut packets = self.geometry.packets_for(buf.len());
        let mut bytes = buf.len();
        if packets > available {
            packets = available;
            bytes = available * self.geometry.packet_size as usize;
        }
        if packets == 0 {
            return 0;
        }

        let read = self.load(self.read_cursor());
        let pos = read as usize * self.geometry.packet_size as usize;
        self.copy_out(pos, &mut buf[..bytes]);

        let next = self.advance(read, packets);
        self.read_cursor().store(next, Ordering::Release);

        tracing::trace!(bytes, packets, read_index = next, "Ring read");
        bytes
    }

    /// Look at the next unread packet without consuming it.
    ///
    /// With `current` set, returns the packet after it. `None` means nothing
    /// more is buffered.
    pub fn peek(&self, current: Option<PacketIndex>) -> Option<Packet<'_>> {
        let (read, write) = self.cursors();
        let index = match current {
            Some(PacketIndex(index)) => self.advance(index, 1),
            None => read,
        };
        if index == write {
            return None;
        }

        let packet_size = self.geometry.packet_size as usize;
        // SAFETY: index < num_packets so the packet lies inside the area, and
        // the acquire load of the write cursor covers it.
        let data = unsafe {
            std::slice::from_raw_parts(
                self.buffer.as_ptr().add(index as usize * packet_size),
                packet_size,
            )
        };

        Some(Packet {
            index: PacketIndex(index),
            data,
        })
    }

    /// Consume every packet up to and including `last`.
    pub fn peek_complete(&mut self, last: PacketIndex) {
        let next = self.advance(last.0 % self.geometry.num_packets, 1);
        self.read_cursor().store(next, Ordering::Release);
        tracing::trace!(read_index = next, "Ring peek complete");
    }

    /// Drop everything buffered by moving the read cursor to the write cursor.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.available_packets();
        let write = self.load(self.write_cursor());
        self.read_cursor().store(write, Ordering::Release);
        dropped
    }

    /// Overwrite the whole packet area with `byte`.
    pub fn fill(&mut self, byte: u8) {
        // SAFETY: the packet area is byte_len bytes long
        unsafe {
            std::ptr::write_bytes(self.buffer.as_ptr(), byte, self.geometry.byte_len());
        }
    }

    /// Region-relative description for the peer.
    pub fn descriptor(&self) -> Result<RingDescriptor, RingError> {
        let peer_ref = |ptr: NonNull<u8>, what: &str| {
            self.allocator
                .to_peer_ref(ptr)
                .ok_or_else(|| RingError::InvalidDescriptor {
                    reason: format!("{} is outside the shared region", what),
                })
        };

        Ok(RingDescriptor {
            buffer_location: peer_ref(self.buffer, "packet area")?,
            num_packets: self.geometry.num_packets,
            packet_size: self.geometry.packet_size,
            read_index_location: peer_ref(self.read_index.cast(), "read cursor")?,
            write_index_location: peer_ref(self.write_index.cast(), "write cursor")?,
        })
    }
}

impl fmt::Debug for SharedRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (read, write) = self.cursors();
        f.debug_struct("SharedRingBuffer")
            .field("num_packets", &self.geometry.num_packets)
            .field("packet_size", &self.geometry.packet_size)
            .field("read_index", &read)
            .field("write_index", &write)
            .field("owns_memory", &self.owns_memory)
            .finish()
    }
}

impl Drop for SharedRingBuffer {
    fn drop(&mut self) {
        if !self.owns_memory {
            return;
        }
        self.read_cursor().store(0, Ordering::Release);
        self.write_cursor().store(0, Ordering::Release);
        self.allocator.free(self.write_index.cast());
        self.allocator.free(self.read_index.cast());
        self.allocator.free(self.buffer);
        tracing::debug!("Ring buffer released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::BlockAllocator;

    fn allocator() -> Arc<BlockAllocator> {
        Arc::new(BlockAllocator::anonymous(16 * 1024).unwrap())
    }

    fn ring(num_packets: u32, packet_size: u32) -> SharedRingBuffer {
        SharedRingBuffer::new(
            allocator(),
            RingGeometry::new(num_packets, packet_size).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_geometry_validation() {
        assert!(RingGeometry::new(1, 8).is_err());
        assert!(RingGeometry::new(8, 0).is_err());
        assert!(RingGeometry::new(u32::MAX, 2).is_err());
        assert!(RingGeometry::from_mem_length(3, 4).is_err());

        let geometry = RingGeometry::from_mem_length(512, 8).unwrap();
        assert_eq!(geometry.num_packets, 64);
        assert_eq!(geometry.packets_for(9), 2);
    }

    #[test]
    fn test_fresh_ring_has_one_slot_reserved() {
        for (num_packets, packet_size) in [(2, 1), (4, 4), (64, 8), (100, 3)] {
            let ring = ring(num_packets, packet_size);
            assert_eq!(ring.free_space(), num_packets as usize - 1);
            assert!(ring.is_empty());
            assert!(!ring.is_full());
        }
    }

    #[test]
    fn test_four_by_four_scenario() {
        let mut ring = ring(4, 4);

        assert!(ring.write(b"abcdefghijkl"));
        assert_eq!(ring.free_space(), 0);
        assert!(ring.is_full());

        let before = ring.cursors();
        assert!(!ring.write(b"x"));
        assert_eq!(ring.cursors(), before);

        let mut buf = [0u8; 4];
        assert_eq!(ring.read(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(ring.free_space(), 1);
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let mut ring = ring(16, 8);
        let messages: [&[u8]; 3] = [b"first", b"second message", b"3"];
        for message in messages {
            assert!(ring.write(message));
        }

        for message in messages {
            let mut buf = vec![0u8; message.len()];
            assert_eq!(ring.read(&mut buf), message.len());
            assert_eq!(buf, message);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_gather_matches_concatenated_write() {
        let mut gathered = ring(8, 4);
        let mut single = ring(8, 4);

        assert!(gathered.write_gather(&[b"ab", b"", b"cdefg", b"h"]));
        assert!(single.write(b"abcdefgh"));
        assert_eq!(gathered.cursors(), single.cursors());

        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        gathered.read(&mut a);
        single.read(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_gather_is_all_or_nothing() {
        let mut ring = ring(4, 4);
        assert!(!ring.write_gather(&[b"abcdefgh", b"ijklm"]));
        assert!(ring.is_empty());
        assert!(!ring.write_gather(&[b"", b""]));
    }

    #[test]
    fn test_wraparound_split_copy() {
        let mut ring = ring(5, 4);
        let mut buf = [0u8; 12];

        // Move both cursors to packet 3 so the next write crosses the end.
        assert!(ring.write(&[0u8; 12]));
        assert_eq!(ring.read(&mut buf), 12);
        assert_eq!(ring.cursors(), (3, 3));

        let data: Vec<u8> = (1..=13).collect();
        assert!(ring.write(&data));
        assert_eq!(ring.cursors().1, 2);

        let mut out = vec![0u8; 13];
        assert_eq!(ring.read(&mut out), 13);
        assert_eq!(out, data);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_read_truncates_to_available() {
        let mut ring = ring(8, 4);
        assert!(ring.write(b"12345"));

        let mut buf = [0u8; 20];
        assert_eq!(ring.read(&mut buf), 8);
        assert_eq!(&buf[..5], b"12345");
        assert_eq!(ring.read(&mut buf), 0);
    }

    #[test]
    fn test_partial_read_consumes_whole_packet() {
        let mut ring = ring(8, 4);
        assert!(ring.write(b"abcdefgh"));

        let mut buf = [0u8; 1];
        assert_eq!(ring.read(&mut buf), 1);
        assert_eq!(ring.available_packets(), 1);

        let mut rest = [0u8; 4];
        ring.read(&mut rest);
        assert_eq!(&rest, b"efgh");
    }

    #[test]
    fn test_peek_iterates_and_commits_once() {
        let mut ring = ring(8, 2);
        for message in [b"a0", b"b1", b"c2"] {
            assert!(ring.write(message));
        }

        let mut seen = Vec::new();
        let mut last = None;
        while let Some(packet) = ring.peek(last) {
            seen.push(packet.data().to_vec());
            last = Some(packet.index());
        }
        assert_eq!(seen, vec![b"a0".to_vec(), b"b1".to_vec(), b"c2".to_vec()]);
        assert_eq!(ring.available_packets(), 3);

        ring.peek_complete(last.unwrap());
        assert!(ring.is_empty());
        assert!(ring.peek(None).is_none());
    }

    #[test]
    fn test_full_iff_no_free_space() {
        let mut ring = ring(6, 1);
        for _ in 0..5 {
            assert_eq!(ring.is_full(), ring.free_space() == 0);
            assert!(ring.write(b"x"));
        }
        assert!(ring.is_full());
        assert_eq!(ring.free_space(), 0);
    }

    #[test]
    fn test_attach_shares_cursors() {
        let ram = allocator();
        let mut host = SharedRingBuffer::new(ram.clone(), RingGeometry::new(8, 4).unwrap()).unwrap();
        let mut peer = SharedRingBuffer::attach(ram.clone(), &host.descriptor().unwrap()).unwrap();

        assert!(peer.write(b"ping"));
        let mut buf = [0u8; 4];
        assert_eq!(host.read(&mut buf), 4);
        assert_eq!(&buf, b"ping");
        assert!(peer.is_empty());

        drop(peer);
        assert_eq!(ram.live_allocations(), 3);
        drop(host);
        assert_eq!(ram.live_allocations(), 0);
    }

    #[test]
    fn test_attach_rejects_foreign_descriptor() {
        let ram = allocator();
        let desc = RingDescriptor {
            buffer_location: 1 << 30,
            num_packets: 4,
            packet_size: 4,
            read_index_location: 0,
            write_index_location: 64,
        };
        assert!(matches!(
            SharedRingBuffer::attach(ram, &desc),
            Err(RingError::Region(RegionError::UnresolvedPeerRef { .. }))
        ));
    }

    #[test]
    fn test_allocation_failure_unwinds() {
        let ram = Arc::new(BlockAllocator::anonymous(4096).unwrap());
        // Packet area fits exactly, leaving nothing for the cursors.
        let result = SharedRingBuffer::new(ram.clone(), RingGeometry::new(64, 64).unwrap());
        assert!(matches!(
            result,
            Err(RingError::Region(RegionError::OutOfMemory { .. }))
        ));
        assert_eq!(ram.live_allocations(), 0);
        assert_eq!(ram.free_bytes(), 4096);
    }

    #[test]
    fn test_discard_and_fill() {
        let mut ring = ring(4, 4);
        ring.fill(0xFF);
        assert!(ring.write(b"abc"));
        assert_eq!(ring.discard_pending(), 1);
        assert!(ring.is_empty());

        let desc = ring.descriptor().unwrap();
        assert_eq!(desc.num_packets, 4);
        assert_eq!(desc.packet_size, 4);
    }
}

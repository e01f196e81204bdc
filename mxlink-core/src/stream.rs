// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! ByteStream - one direction of traffic between host and co-processor.
//!
//! A stream couples one [`SharedRingBuffer`] with two interrupt lines: the
//! write line announces new data to the consumer, the read line announces
//! freed space to the producer. The host always owns the to-host line (with
//! a local handler) and drives the from-host line.
//!
//! | direction | write line | read line |
//! |-----------|------------|-----------|
//! | `In`      | to-host    | from-host |
//! | `Out`     | from-host  | to-host   |

use std::fmt;
use std::sync::Arc;

use tracing::Level;

use crate::device::Device;
use crate::error::{RingError, TransportError};
use crate::intrbit::{InterruptBitRegistry, IrqHandler};
use crate::shm::{Packet, PacketIndex, RingGeometry, SharedRingBuffer, StreamDescriptor};
use crate::types::{Direction, IntrBit, Target};

/// Byte inbound rings are filled with before first use.
const INBOUND_FILL: u8 = 0xFF;

/// How the from-host line of a stream is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrBitType {
    /// Allocated from the registry and returned on release.
    Alloc,
    /// The target's pre-reserved panic line, never allocated or freed.
    Reserved,
}

/// One direction of a transport.
pub struct ByteStream {
    ring: SharedRingBuffer,
    registry: Arc<InterruptBitRegistry>,
    direction: Direction,
    target: Target,
    bit_type: IntrBitType,
    tohost: IntrBit,
    fromhost: IntrBit,
}

impl ByteStream {
    /// Allocate the ring and both lines.
    ///
    /// `handler` runs whenever the peer drives this stream's to-host line.
    /// On failure everything obtained so far is returned before the error.
    pub fn new(
        device: &Device,
        target: Target,
        direction: Direction,
        geometry: RingGeometry,
        bit_type: IntrBitType,
        handler: IrqHandler,
    ) -> Result<Self, TransportError> {
        let mut ring = SharedRingBuffer::new(device.allocator(), geometry)?;
        if direction == Direction::In {
            ring.fill(INBOUND_FILL);
        }

        let registry = device.registry().clone();

        let tohost = match registry.alloc_tohost(handler) {
            Ok(bit) => bit,
            Err(e) => {
                drop(ring);
                return Err(e.into());
            }
        };

        let fromhost = match bit_type {
            IntrBitType::Reserved => target.reserved_panic_bit(),
            IntrBitType::Alloc => match registry.alloc_fromhost(target) {
                Ok(bit) => bit,
                Err(e) => {
                    drop(ring);
                    registry.free_tohost(tohost);
                    return Err(e.into());
                }
            },
        };

        tracing::debug!(
            remote = %target,
            direction = %direction,
            tohost = %tohost,
            fromhost = %fromhost,
            num_packets = geometry.num_packets,
            packet_size = geometry.packet_size,
            "Stream initialised"
        );

        Ok(Self {
            ring,
            registry,
            direction,
            target,
            bit_type,
            tohost,
            fromhost,
        })
    }

    /// Line the producer drives after writing.
    pub fn write_bit(&self) -> IntrBit {
        match self.direction {
            Direction::In => self.tohost,
            Direction::Out => self.fromhost,
        }
    }

    /// Line the consumer drives after reading.
    pub fn read_bit(&self) -> IntrBit {
        match self.direction {
            Direction::In => self.fromhost,
            Direction::Out => self.tohost,
        }
    }

    pub fn tohost_bit(&self) -> IntrBit {
        self.tohost
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn bit_type(&self) -> IntrBitType {
        self.bit_type
    }

    pub fn ring(&self) -> &SharedRingBuffer {
        &self.ring
    }

    pub fn registry(&self) -> &Arc<InterruptBitRegistry> {
        &self.registry
    }

    /// Write one message and signal the consumer. `false` means no space and
    /// no signal was sent.
    pub fn write(&mut self, data: &[u8]) -> bool {
        self.write_gather(&[data])
    }

    /// Gather-write a message and signal the consumer once.
    pub fn write_gather(&mut self, parts: &[&[u8]]) -> bool {
        if !self.ring.write_gather(parts) {
            return false;
        }
        self.registry.raise(self.write_bit(), self.target);
        true
    }

    /// Read into `buf`, signalling the producer only when something was read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let read = self.ring.read(buf);
        if read > 0 {
            self.registry.raise(self.read_bit(), self.target);
        }
        read
    }

    pub fn peek(&self, current: Option<PacketIndex>) -> Option<Packet<'_>> {
        self.ring.peek(current)
    }

    /// Consume through `last` and signal the producer.
    pub fn peek_complete(&mut self, last: PacketIndex) {
        self.ring.peek_complete(last);
        self.registry.raise(self.read_bit(), self.target);
    }

    /// Throw away everything buffered without telling the peer.
    pub fn discard_pending(&mut self) -> usize {
        self.ring.discard_pending()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn free_space(&self) -> usize {
        self.ring.free_space()
    }

    /// Wire description for the peer.
    pub fn descriptor(&self) -> Result<StreamDescriptor, RingError> {
        Ok(StreamDescriptor {
            ring: self.ring.descriptor()?,
            read_bit: self.read_bit().value(),
            write_bit: self.write_bit().value(),
        })
    }

    /// Emit the cursor state at `level`.
    pub fn log_state(&self, level: Level) {
        let (read_index, write_index) = self.ring.cursors();
        macro_rules! emit {
            ($lvl:expr) => {
                tracing::event!(
                    $lvl,
                    remote = %self.target,
                    direction = %self.direction,
                    read_index,
                    write_index,
                    free = self.ring.free_space(),
                    "Stream state"
                )
            };
        }
        match level {
            Level::ERROR => emit!(Level::ERROR),
            Level::WARN => emit!(Level::WARN),
            Level::INFO => emit!(Level::INFO),
            Level::DEBUG => emit!(Level::DEBUG),
            _ => emit!(Level::TRACE),
        }
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("direction", &self.direction)
            .field("target", &self.target)
            .field("bit_type", &self.bit_type)
            .field("read_bit", &self.read_bit())
            .field("write_bit", &self.write_bit())
            .field("ring", &self.ring)
            .finish()
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        self.registry.free_tohost(self.tohost);
        if self.bit_type == IntrBitType::Alloc {
            self.registry.free_fromhost(self.fromhost, self.target);
        }
        tracing::debug!(
            remote = %self.target,
            direction = %self.direction,
            "Stream released"
        );
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! In-process stand-in for the co-processor.
//!
//! [`LoopbackInterrupts`] plays the interrupt hardware: the host side raises
//! from-host lines into it and the simulated peer fires to-host lines out of
//! it through the registered ISR. [`PeerStream`] is the co-processor's end
//! of a byte stream, attached purely from the wire descriptor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::MxResult;
use crate::intrbit::{InterruptController, Isr};
use crate::shm::{SharedAllocator, SharedRingBuffer, StreamDescriptor};
use crate::types::{IntrBit, Target, NUM_INTR_BITS, NUM_TARGETS};

struct LineState {
    pending: u16,
    masked: u16,
    isr: Option<Isr>,
    raised: [[u64; NUM_INTR_BITS]; NUM_TARGETS],
    /// Bumped on every from-host raise so peers can wait for news.
    raise_seq: u64,
}

/// Interrupt controller backed by plain memory.
pub struct LoopbackInterrupts {
    state: Mutex<LineState>,
    raised: Condvar,
}

impl LoopbackInterrupts {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LineState {
                pending: 0,
                masked: 0,
                isr: None,
                raised: [[0; NUM_INTR_BITS]; NUM_TARGETS],
                raise_seq: 0,
            }),
            raised: Condvar::new(),
        }
    }

    /// Peer drives to-host line `bit`. Delivered through the ISR unless masked.
    pub fn fire(&self, bit: IntrBit) {
        let isr = {
            let mut state = self.state.lock();
            state.pending |= bit.mask();
            if state.masked & bit.mask() != 0 {
                tracing::trace!(bit = %bit, "Line masked, interrupt held pending");
                return;
            }
            state.isr.clone()
        };

        if let Some(isr) = isr {
            isr();
        }
    }

    /// How often the host raised `bit` towards `target`.
    pub fn raised_count(&self, bit: IntrBit, target: Target) -> u64 {
        self.state.lock().raised[target.index()][bit.index()]
    }

    /// Sequence number of the latest from-host raise.
    pub fn raise_seq(&self) -> u64 {
        self.state.lock().raise_seq
    }

    /// Block until a raise newer than `seen` arrives or `timeout` passes.
    /// Returns the current sequence number.
    pub fn wait_raised(&self, seen: u64, timeout: Duration) -> u64 {
        let mut state = self.state.lock();
        if state.raise_seq == seen {
            let _ = self.raised.wait_for(&mut state, timeout);
        }
        state.raise_seq
    }

    pub fn is_masked(&self, bit: IntrBit) -> bool {
        self.state.lock().masked & bit.mask() != 0
    }

    pub fn has_isr(&self) -> bool {
        self.state.lock().isr.is_some()
    }
}

impl Default for LoopbackInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoopbackInterrupts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackInterrupts")
            .field("pending", &format_args!("{:#06x}", state.pending))
            .field("masked", &format_args!("{:#06x}", state.masked))
            .field("raise_seq", &state.raise_seq)
            .finish()
    }
}

impl InterruptController for LoopbackInterrupts {
    fn raise(&self, bit: IntrBit, target: Target) {
        let mut state = self.state.lock();
        state.raised[target.index()][bit.index()] += 1;
        state.raise_seq += 1;
        self.raised.notify_all();
    }

    fn clear(&self, bit: IntrBit) {
        self.state.lock().pending &= !bit.mask();
    }

    fn mask(&self, bit: IntrBit) {
        self.state.lock().masked |= bit.mask();
    }

    fn unmask(&self, bit: IntrBit) {
        self.state.lock().masked &= !bit.mask();
    }

    fn pending(&self) -> u16 {
        let state = self.state.lock();
        state.pending & !state.masked
    }

    fn register_isr(&self, isr: Isr) {
        self.state.lock().isr = Some(isr);
    }

    fn unregister_isr(&self) {
        self.state.lock().isr = None;
    }
}

/// Co-processor end of one byte stream.
///
/// Writing fires the stream's write line and reading fires its read line,
/// which for a host-inbound and a host-outbound stream respectively are the
/// to-host lines the host listens on.
pub struct PeerStream {
    ring: SharedRingBuffer,
    read_bit: IntrBit,
    write_bit: IntrBit,
    interrupts: Arc<LoopbackInterrupts>,
}

impl PeerStream {
    pub fn attach(
        allocator: Arc<dyn SharedAllocator>,
        desc: &StreamDescriptor,
        interrupts: Arc<LoopbackInterrupts>,
    ) -> MxResult<Self> {
        Ok(Self {
            ring: SharedRingBuffer::attach(allocator, &desc.ring)?,
            read_bit: IntrBit::try_from(desc.read_bit)?,
            write_bit: IntrBit::try_from(desc.write_bit)?,
            interrupts,
        })
    }

    /// Attach from a descriptor as published in shared memory.
    pub fn attach_raw(
        allocator: Arc<dyn SharedAllocator>,
        bytes: &[u8],
        interrupts: Arc<LoopbackInterrupts>,
    ) -> MxResult<Self> {
        Self::attach(allocator, &StreamDescriptor::from_bytes(bytes)?, interrupts)
    }

    pub fn write(&mut self, data: &[u8]) -> bool {
        self.write_gather(&[data])
    }

    pub fn write_gather(&mut self, parts: &[&[u8]]) -> bool {
        if !self.ring.write_gather(parts) {
            return false;
        }
        self.interrupts.fire(self.write_bit);
        true
    }

    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let read = self.ring.read(buf);
        if read > 0 {
            self.interrupts.fire(self.read_bit);
        }
        read
    }

    pub fn ring(&self) -> &SharedRingBuffer {
        &self.ring
    }
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("ring", &self.ring)
            .field("read_bit", &self.read_bit)
            .field("write_bit", &self.write_bit)
            .finish()
    }
}

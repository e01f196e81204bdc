// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Interrupt line registry.
//!
//! Sixteen lines run towards the host (shared by every target) and sixteen
//! run from the host towards each target. Line 0 towards each target is
//! pre-reserved for forcing a firmware panic and never handed out by the
//! allocator.
//!
//! Dispatch may run on whatever context the controller delivers interrupts
//! on, so the line table sits behind a short, non-blocking critical section
//! and handlers are invoked after the lock is dropped.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::IntrBitError;
use crate::types::{IntrBit, Target, NUM_INTR_BITS, NUM_TARGETS};

/// Per-line callback. Receives the line that fired.
pub type IrqHandler = Arc<dyn Fn(IntrBit) + Send + Sync>;

/// Top-level interrupt service routine installed on the controller.
pub type Isr = Arc<dyn Fn() + Send + Sync>;

/// Low-level access to the interrupt hardware.
///
/// Implementations must not call the registered ISR while holding a lock
/// that `mask`/`unmask`/`clear`/`pending` also take.
pub trait InterruptController: Send + Sync {
    /// Drive a from-host line towards `target`.
    fn raise(&self, bit: IntrBit, target: Target);

    /// Acknowledge a pending to-host line.
    fn clear(&self, bit: IntrBit);

    fn mask(&self, bit: IntrBit);

    fn unmask(&self, bit: IntrBit);

    /// Bitmap of pending, unmasked to-host lines.
    fn pending(&self) -> u16;

    fn register_isr(&self, isr: Isr);

    fn unregister_isr(&self);
}

struct LineTable {
    handlers: [Option<IrqHandler>; NUM_INTR_BITS],
    tohost: u16,
    fromhost: [u16; NUM_TARGETS],
}

impl LineTable {
    fn new() -> Self {
        let mut fromhost = [0u16; NUM_TARGETS];
        for target in Target::ALL {
            fromhost[target.index()] |= target.reserved_panic_bit().mask();
        }
        Self {
            handlers: std::array::from_fn(|_| None),
            tohost: 0,
            fromhost,
        }
    }
}

fn first_zero(bitmap: u16) -> Option<IntrBit> {
    let bit = bitmap.trailing_ones() as usize;
    IntrBit::new(bit).ok()
}

/// Allocator and dispatcher for the interrupt lines of one attached device.
pub struct InterruptBitRegistry {
    controller: Arc<dyn InterruptController>,
    lines: Mutex<LineTable>,
}

impl InterruptBitRegistry {
    /// Build the registry and hook its ISR into `controller`.
    ///
    /// Every to-host line starts masked and without a handler.
    pub fn new(controller: Arc<dyn InterruptController>) -> Arc<Self> {
        for index in 0..NUM_INTR_BITS {
            if let Ok(bit) = IntrBit::new(index) {
                controller.mask(bit);
                controller.clear(bit);
            }
        }

        let registry = Arc::new(Self {
            controller,
            lines: Mutex::new(LineTable::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&registry);
        registry.controller.register_isr(Arc::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.handle_irq();
            }
        }));

        tracing::debug!("Interrupt registry attached");
        registry
    }

    pub fn controller(&self) -> &Arc<dyn InterruptController> {
        &self.controller
    }

    /// Service every pending to-host line.
    pub fn handle_irq(&self) {
        let pending = self.controller.pending();
        for index in 0..NUM_INTR_BITS {
            if pending & (1 << index) == 0 {
                continue;
            }
            if let Ok(bit) = IntrBit::new(index) {
                self.dispatch(bit);
            }
        }
    }

    /// Acknowledge `bit` and run its handler, if any.
    pub fn dispatch(&self, bit: IntrBit) {
        let handler = self.lines.lock().handlers[bit.index()].clone();
        self.controller.clear(bit);

        match handler {
            Some(handler) => handler(bit),
            None => tracing::debug!(bit = %bit, "Interrupt on line without handler, dropped"),
        }
    }

    /// Claim the first free to-host line and install `handler` on it.
    pub fn alloc_tohost(&self, handler: IrqHandler) -> Result<IntrBit, IntrBitError> {
        let mut lines = self.lines.lock();

        let Some(bit) = first_zero(lines.tohost) else {
            tracing::error!("No free to-host interrupt line");
            return Err(IntrBitError::ToHostExhausted);
        };

        self.controller.mask(bit);
        self.controller.clear(bit);
        lines.handlers[bit.index()] = Some(handler);
        self.controller.unmask(bit);
        lines.tohost |= bit.mask();

        tracing::debug!(bit = %bit, "Allocated to-host line");
        Ok(bit)
    }

    /// Return a to-host line.
    ///
    /// The handler stays installed so an interrupt already in flight still
    /// finds a live callback; the line is masked so no new one is delivered.
    pub fn free_tohost(&self, bit: IntrBit) {
        let mut lines = self.lines.lock();

        if lines.tohost & bit.mask() == 0 {
            tracing::warn!(bit = %bit, "Freeing to-host line that is not allocated");
        }

        self.controller.mask(bit);
        self.controller.clear(bit);
        lines.tohost &= !bit.mask();

        tracing::debug!(bit = %bit, "Freed to-host line");
    }

    /// Claim the first free from-host line towards `target`.
    pub fn alloc_fromhost(&self, target: Target) -> Result<IntrBit, IntrBitError> {
        let mut lines = self.lines.lock();
        let bitmap = &mut lines.fromhost[target.index()];

        let Some(bit) = first_zero(*bitmap) else {
            tracing::error!(remote = %target, "No free from-host interrupt line");
            return Err(IntrBitError::FromHostExhausted { target });
        };
        *bitmap |= bit.mask();

        tracing::debug!(bit = %bit, remote = %target, "Allocated from-host line");
        Ok(bit)
    }

    /// Return a from-host line. The reserved panic line is never released.
    pub fn free_fromhost(&self, bit: IntrBit, target: Target) {
        if bit == target.reserved_panic_bit() {
            tracing::warn!(bit = %bit, remote = %target, "Refusing to free reserved line");
            return;
        }

        let mut lines = self.lines.lock();
        lines.fromhost[target.index()] &= !bit.mask();
        tracing::debug!(bit = %bit, remote = %target, "Freed from-host line");
    }

    /// Signal the peer on a from-host line.
    pub fn raise(&self, bit: IntrBit, target: Target) {
        self.controller.raise(bit, target);
    }

    /// Acknowledge and mask a to-host line whose events the host ignores.
    pub fn quiesce(&self, bit: IntrBit) {
        self.controller.clear(bit);
        self.controller.mask(bit);
    }

    pub fn tohost_bitmap(&self) -> u16 {
        self.lines.lock().tohost
    }

    pub fn fromhost_bitmap(&self, target: Target) -> u16 {
        self.lines.lock().fromhost[target.index()]
    }
}

impl fmt::Debug for InterruptBitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = self.lines.lock();
        f.debug_struct("InterruptBitRegistry")
            .field("tohost", &format_args!("{:#06x}", lines.tohost))
            .field("fromhost_r4", &format_args!("{:#06x}", lines.fromhost[0]))
            .field("fromhost_m4", &format_args!("{:#06x}", lines.fromhost[1]))
            .finish()
    }
}

impl Drop for InterruptBitRegistry {
    fn drop(&mut self) {
        let lines = self.lines.get_mut();
        for handler in lines.handlers.iter_mut() {
            *handler = None;
        }
        self.controller.unregister_isr();
        tracing::debug!("Interrupt registry detached");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::loopback::LoopbackInterrupts;

    fn registry() -> (Arc<LoopbackInterrupts>, Arc<InterruptBitRegistry>) {
        let controller = Arc::new(LoopbackInterrupts::new());
        let registry = InterruptBitRegistry::new(controller.clone());
        (controller, registry)
    }

    fn counting_handler() -> (Arc<AtomicUsize>, IrqHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        (
            count,
            Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_tohost_first_fit_and_reuse() {
        let (_, registry) = registry();
        let (_, handler) = counting_handler();

        let a = registry.alloc_tohost(handler.clone()).unwrap();
        let b = registry.alloc_tohost(handler.clone()).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);

        registry.free_tohost(a);
        assert_eq!(registry.alloc_tohost(handler).unwrap(), a);
    }

    #[test]
    fn test_tohost_exhaustion() {
        let (_, registry) = registry();
        let (_, handler) = counting_handler();

        let bits: HashSet<_> = (0..NUM_INTR_BITS)
            .map(|_| registry.alloc_tohost(handler.clone()).unwrap())
            .collect();
        assert_eq!(bits.len(), NUM_INTR_BITS);
        assert!(matches!(
            registry.alloc_tohost(handler),
            Err(IntrBitError::ToHostExhausted)
        ));
    }

    #[test]
    fn test_fromhost_skips_reserved_line() {
        let (_, registry) = registry();

        for target in Target::ALL {
            let bits: Vec<_> = (1..NUM_INTR_BITS)
                .map(|_| registry.alloc_fromhost(target).unwrap())
                .collect();
            assert!(!bits.contains(&target.reserved_panic_bit()));
            assert!(registry.alloc_fromhost(target).is_err());
        }
    }

    #[test]
    fn test_fromhost_targets_are_independent() {
        let (_, registry) = registry();
        let r4 = registry.alloc_fromhost(Target::R4).unwrap();
        let m4 = registry.alloc_fromhost(Target::M4).unwrap();
        assert_eq!(r4, m4);

        registry.free_fromhost(r4, Target::R4);
        assert_eq!(registry.fromhost_bitmap(Target::R4), 0b1);
        assert_eq!(registry.fromhost_bitmap(Target::M4), 0b11);
    }

    #[test]
    fn test_reserved_line_cannot_be_freed() {
        let (_, registry) = registry();
        registry.free_fromhost(IntrBit::RESERVED_PANIC, Target::R4);
        assert_eq!(registry.alloc_fromhost(Target::R4).unwrap().index(), 1);
    }

    #[test]
    fn test_dispatch_reaches_handler() {
        let (controller, registry) = registry();
        let (count, handler) = counting_handler();

        let bit = registry.alloc_tohost(handler).unwrap();
        controller.fire(bit);
        controller.fire(bit);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(controller.pending(), 0);
    }

    #[test]
    fn test_unhandled_line_is_dropped() {
        let (controller, registry) = registry();
        let bit = IntrBit::new(7).unwrap();
        controller.unmask(bit);
        controller.fire(bit);
        assert_eq!(controller.pending(), 0);
        drop(registry);
    }

    #[test]
    fn test_free_tohost_keeps_handler_but_masks_line() {
        let (controller, registry) = registry();
        let (count, handler) = counting_handler();

        let bit = registry.alloc_tohost(handler).unwrap();
        registry.free_tohost(bit);
        controller.fire(bit);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // An event already in flight still finds the handler.
        registry.dispatch(bit);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unregisters_isr() {
        let (controller, registry) = registry();
        assert!(controller.has_isr());
        drop(registry);
        assert!(!controller.has_isr());
    }
}

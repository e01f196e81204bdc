// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Debug monitor transport: a single length-prefixed channel per target.
//!
//! Frames are `[len: u32 LE, padded to one packet][payload]`. The outbound
//! stream signals the target's reserved panic line, which is also what
//! [`MonitorTransport::force_panic`] raises.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;

use super::worker::{Drain, Worker, WorkerControl};
use super::{state_of, TransportState};
use crate::config::{RingConfig, WorkerConfig};
use crate::device::Device;
use crate::error::TransportError;
use crate::intrbit::InterruptBitRegistry;
use crate::shm::TransportDescriptor;
use crate::stream::{ByteStream, IntrBitType};
use crate::types::{Direction, Target};

/// Longest message the host sends to the monitor.
pub const MONITOR_MAX_MESSAGE: usize = 300;

const LEN_BYTES: usize = std::mem::size_of::<u32>();

/// Callback receiving one inbound monitor message.
pub type MonitorHandler = Box<dyn FnMut(&[u8]) + Send>;

struct Shared {
    handler: Mutex<Option<MonitorHandler>>,
    outbound: Mutex<Option<ByteStream>>,
    control: Arc<WorkerControl>,
    packet_size: usize,
}

struct MonitorDrain {
    shared: Arc<Shared>,
    buf: Vec<u8>,
    target: Target,
}

impl Drain for MonitorDrain {
    fn drain(&mut self, stream: &mut ByteStream) -> ControlFlow<()> {
        while !self.shared.control.is_blocked() {
            let mut len_bytes = [0u8; LEN_BYTES];
            if stream.read(&mut len_bytes) < LEN_BYTES {
                break;
            }

            let len = u32::from_le_bytes(len_bytes) as usize;
            if len == 0 || len >= self.buf.len() - LEN_BYTES {
                tracing::error!(remote = %self.target, len, "Incorrect monitor message length, skipped");
                continue;
            }

            let read = stream.read(&mut self.buf[..len]);
            if read < len {
                tracing::warn!(remote = %self.target, len, read, "Short monitor message");
            }

            match self.shared.handler.lock().as_mut() {
                Some(handler) => handler(&self.buf[..read]),
                None => tracing::debug!(remote = %self.target, "No monitor handler, message dropped"),
            }
        }
        ControlFlow::Continue(())
    }
}

/// Debug monitor channel towards one target.
pub struct MonitorTransport {
    shared: Arc<Shared>,
    worker: Option<Worker>,
    registry: Arc<InterruptBitRegistry>,
    descriptor: TransportDescriptor,
    target: Target,
}

impl MonitorTransport {
    pub fn new(
        device: &Device,
        target: Target,
        ring: &RingConfig,
        worker: &WorkerConfig,
    ) -> Result<Self, TransportError> {
        let geometry = ring.geometry();
        let control = WorkerControl::new();

        let inbound = ByteStream::new(
            device,
            target,
            Direction::In,
            geometry,
            IntrBitType::Alloc,
            control.irq_handler(),
        )?;

        let outbound = ByteStream::new(
            device,
            target,
            Direction::Out,
            geometry,
            IntrBitType::Reserved,
            Arc::new(|_| {}),
        )?;

        let descriptor = TransportDescriptor {
            to_host: inbound.descriptor()?,
            from_host: outbound.descriptor()?,
        };

        let shared = Arc::new(Shared {
            handler: Mutex::new(None),
            outbound: Mutex::new(Some(outbound)),
            control: control.clone(),
            packet_size: geometry.packet_size as usize,
        });

        let name = match target {
            Target::R4 => "gdb-r4",
            Target::M4 => "gdb-m4",
        };

        let worker = Worker::spawn(
            name,
            control,
            inbound,
            MonitorDrain {
                shared: shared.clone(),
                buf: vec![0u8; ring.mem_length as usize],
                target,
            },
            worker.start_timeout,
            worker.stop_timeout,
        )?;

        tracing::info!(remote = %target, "Monitor transport ready");

        Ok(Self {
            shared,
            worker: Some(worker),
            registry: device.registry().clone(),
            descriptor,
            target,
        })
    }

    /// Send one message, length-prefixed.
    pub fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        if self.shared.control.is_blocked() {
            return Err(TransportError::AlreadyInError);
        }
        if message.len() > MONITOR_MAX_MESSAGE {
            return Err(TransportError::MessageTooLarge {
                len: message.len(),
                max: MONITOR_MAX_MESSAGE,
            });
        }

        // The length sits alone in the first packet so the peer can read it
        // with a single one-packet read.
        let mut header = vec![0u8; self.shared.packet_size.max(LEN_BYTES)];
        header[..LEN_BYTES].copy_from_slice(&(message.len() as u32).to_le_bytes());

        let mut outbound = self.shared.outbound.lock();
        let stream = outbound.as_mut().ok_or(TransportError::Released)?;
        if !stream.write_gather(&[&header, message]) {
            return Err(TransportError::InsufficientSpace {
                len: header.len() + message.len(),
            });
        }
        Ok(())
    }

    pub fn register_handler<F>(&self, handler: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        *self.shared.handler.lock() = Some(Box::new(handler));
    }

    pub fn unregister_handler(&self) {
        *self.shared.handler.lock() = None;
    }

    /// Raise the target's reserved panic line without writing anything.
    pub fn force_panic(&self) {
        tracing::warn!(remote = %self.target, "Forcing firmware panic");
        self.registry
            .raise(self.target.reserved_panic_bit(), self.target);
    }

    pub fn set_error(&self) {
        tracing::warn!(remote = %self.target, "I/O processing suspended on monitor transport");
        self.shared.control.block();
    }

    pub fn state(&self) -> TransportState {
        state_of(self.worker.as_ref().map(|w| w.control().as_ref()))
    }

    pub fn descriptor(&self) -> TransportDescriptor {
        self.descriptor
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Stop the worker, then release both streams.
    ///
    /// A worker stuck in the handler past the stop timeout is detached with
    /// the error latch set; the handler is left to it.
    pub fn release(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        if self.shared.control.is_running() {
            self.shared.control.block();
            tracing::warn!(remote = %self.target, "Monitor handler still busy, left registered");
        } else {
            *self.shared.handler.lock() = None;
        }
        if self.shared.outbound.lock().take().is_some() {
            tracing::info!(remote = %self.target, "Monitor transport released");
        }
    }
}

impl fmt::Debug for MonitorTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorTransport")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for MonitorTransport {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::Config;
    use crate::loopback::{LoopbackInterrupts, PeerStream};
    use crate::types::IntrBit;

    fn setup(target: Target) -> (Device, Arc<LoopbackInterrupts>, MonitorTransport) {
        let config = Config::default();
        let (device, interrupts) = Device::loopback(&config).unwrap();
        let transport =
            MonitorTransport::new(&device, target, &config.monitor, &config.worker).unwrap();
        (device, interrupts, transport)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_outbound_uses_reserved_line() {
        let (_device, interrupts, transport) = setup(Target::M4);
        assert_eq!(
            transport.descriptor().from_host.write_bit,
            IntrBit::RESERVED_PANIC.value()
        );

        transport.send(b"$g#67").unwrap();
        assert_eq!(interrupts.raised_count(IntrBit::RESERVED_PANIC, Target::M4), 1);

        transport.force_panic();
        assert_eq!(interrupts.raised_count(IntrBit::RESERVED_PANIC, Target::M4), 2);
    }

    #[test]
    fn test_send_is_length_prefixed() {
        let (device, interrupts, transport) = setup(Target::R4);
        let mut peer = PeerStream::attach(
            device.allocator(),
            &transport.descriptor().from_host,
            interrupts,
        )
        .unwrap();

        transport.send(b"qSupported").unwrap();

        let mut len = [0u8; 4];
        assert_eq!(peer.read(&mut len), 4);
        assert_eq!(u32::from_le_bytes(len), 10);
        let mut payload = [0u8; 10];
        assert_eq!(peer.read(&mut payload), 10);
        assert_eq!(&payload, b"qSupported");
    }

    #[test]
    fn test_oversized_message_rejected() {
        let (_device, _interrupts, transport) = setup(Target::R4);
        assert!(matches!(
            transport.send(&[0u8; MONITOR_MAX_MESSAGE + 1]),
            Err(TransportError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_inbound_messages_delivered_and_bad_lengths_skipped() {
        let (device, interrupts, transport) = setup(Target::R4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport.register_handler(move |message| sink.lock().push(message.to_vec()));

        let mut peer = PeerStream::attach(
            device.allocator(),
            &transport.descriptor().to_host,
            interrupts,
        )
        .unwrap();

        assert!(peer.write(&0u32.to_le_bytes()));
        assert!(peer.write_gather(&[&3u32.to_le_bytes(), b"OK!"]));

        assert!(wait_for(|| seen.lock().len() == 1));
        assert_eq!(seen.lock()[0], b"OK!".to_vec());
        assert!(wait_for(|| peer.ring().is_empty()));
    }

    #[test]
    fn test_release_returns_with_handler_stuck() {
        let mut config = Config::default();
        config.worker.stop_timeout = Duration::from_millis(50);
        let (device, interrupts) = Device::loopback(&config).unwrap();
        let mut transport =
            MonitorTransport::new(&device, Target::R4, &config.monitor, &config.worker).unwrap();
        let mut peer = PeerStream::attach(
            device.allocator(),
            &transport.descriptor().to_host,
            interrupts,
        )
        .unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let flag = entered.clone();
        let (unstick, stuck) = std::sync::mpsc::channel::<()>();
        transport.register_handler(move |_| {
            flag.store(true, Ordering::SeqCst);
            let _ = stuck.recv();
        });

        assert!(peer.write_gather(&[&2u32.to_le_bytes(), b"$?"]));
        assert!(wait_for(|| entered.load(Ordering::SeqCst)));

        let started = Instant::now();
        transport.release();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.state(), TransportState::Stopped);
        assert!(transport.send(b"$g#67").is_err());

        unstick.send(()).unwrap();
    }

    #[test]
    fn test_release_keeps_reserved_line() {
        let (device, _interrupts, mut transport) = setup(Target::R4);
        transport.release();
        assert_eq!(transport.state(), TransportState::Stopped);
        assert_eq!(device.registry().tohost_bitmap(), 0);
        assert_eq!(device.registry().fromhost_bitmap(Target::R4), 0b1);
    }
}

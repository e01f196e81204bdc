// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Management transport: a few fixed logical channels multiplexed over one
//! stream pair.
//!
//! Each message is a single packet, `[channel id][payload]`. The handler
//! table lock is held during dispatch while outbound writes take their own
//! lock, so a handler may reply through a [`ChannelSender`].

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::worker::{Drain, Worker, WorkerControl};
use super::{state_of, TransportState};
use crate::config::{RingConfig, WorkerConfig};
use crate::device::Device;
use crate::error::TransportError;
use crate::shm::TransportDescriptor;
use crate::stream::{ByteStream, IntrBitType};
use crate::types::{Direction, Target};

/// Number of logical channels.
pub const NUM_CHANNELS: usize = 3;

/// Logical channels carried by the management transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ChannelId {
    MaxwellManager = 0,
    ServiceManager = 1,
    FrameworkMonitor = 2,
}

impl ChannelId {
    pub const ALL: [ChannelId; NUM_CHANNELS] = [
        ChannelId::MaxwellManager,
        ChannelId::ServiceManager,
        ChannelId::FrameworkMonitor,
    ];

    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::MaxwellManager => "maxwell-manager",
            Self::ServiceManager => "service-manager",
            Self::FrameworkMonitor => "framework-monitor",
        }
    }
}

impl TryFrom<u8> for ChannelId {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(TransportError::UnknownChannel { channel: value })
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Callback for one channel. Receives the packet after the id byte.
pub type MessageHandler = Box<dyn FnMut(&[u8]) + Send>;

struct Shared {
    handlers: Mutex<[Option<MessageHandler>; NUM_CHANNELS]>,
    outbound: Mutex<Option<ByteStream>>,
    control: Arc<WorkerControl>,
    max_payload: usize,
}

impl Shared {
    fn send(&self, channel: ChannelId, payload: &[u8]) -> Result<(), TransportError> {
        if self.control.is_blocked() {
            return Err(TransportError::AlreadyInError);
        }
        if payload.len() > self.max_payload {
            return Err(TransportError::MessageTooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }

        let mut outbound = self.outbound.lock();
        let stream = outbound.as_mut().ok_or(TransportError::Released)?;

        if !stream.write_gather(&[&[channel.as_u8()], payload]) {
            tracing::debug!(channel = %channel, len = payload.len(), "No space for message");
            return Err(TransportError::InsufficientSpace {
                len: payload.len() + 1,
            });
        }
        Ok(())
    }

    fn dispatch(&self, channel: u8, payload: &[u8]) {
        let mut handlers = self.handlers.lock();
        match handlers
            .get_mut(channel as usize)
            .and_then(|slot| slot.as_mut())
        {
            Some(handler) => handler(payload),
            None => tracing::debug!(channel, "No handler for channel, message dropped"),
        }
    }
}

struct ChannelDrain {
    shared: Arc<Shared>,
}

impl Drain for ChannelDrain {
    fn drain(&mut self, stream: &mut ByteStream) -> ControlFlow<()> {
        while !self.shared.control.is_blocked() {
            let Some(packet) = stream.peek(None) else {
                break;
            };
            let index = packet.index();

            if let Some((&channel, payload)) = packet.data().split_first() {
                self.shared.dispatch(channel, payload);
            }

            // Hand each slot back to the peer as soon as it is handled.
            stream.peek_complete(index);
        }
        ControlFlow::Continue(())
    }
}

/// Cloneable handle for sending on a transport, usable from handlers.
#[derive(Clone)]
pub struct ChannelSender {
    shared: Arc<Shared>,
}

impl ChannelSender {
    pub fn send(&self, channel: ChannelId, payload: &[u8]) -> Result<(), TransportError> {
        self.shared.send(channel, payload)
    }
}

impl fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSender")
            .field("max_payload", &self.shared.max_payload)
            .finish()
    }
}

/// Management channel multiplexer.
pub struct ChannelTransport {
    shared: Arc<Shared>,
    worker: Option<Worker>,
    descriptor: TransportDescriptor,
    target: Target,
}

impl ChannelTransport {
    /// Set up both streams towards `target` and start the worker.
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
            IntrBitType::Alloc,
            Arc::new(|_| {}),
        )?;
        // The host never waits for the peer to free outbound space.
        device.registry().quiesce(outbound.read_bit());

        let descriptor = TransportDescriptor {
            to_host: inbound.descriptor()?,
            from_host: outbound.descriptor()?,
        };

        let shared = Arc::new(Shared {
            handlers: Mutex::new(std::array::from_fn(|_| None)),
            outbound: Mutex::new(Some(outbound)),
            control: control.clone(),
            max_payload: geometry.packet_size as usize - 1,
        });

        let worker = Worker::spawn(
            "mxmgmt",
            control,
            inbound,
            ChannelDrain {
                shared: shared.clone(),
            },
            worker.start_timeout,
            worker.stop_timeout,
        )?;

        tracing::info!(remote = %target, "Management transport ready");

        Ok(Self {
            shared,
            worker: Some(worker),
            descriptor,
            target,
        })
    }

    /// Send `payload` on `channel` as one framed packet.
    ///
    /// Fails without touching the ring when the transport is blocked, the
    /// payload exceeds one packet, or there is no space.
    pub fn send(&self, channel: ChannelId, payload: &[u8]) -> Result<(), TransportError> {
        self.shared.send(channel, payload)
    }

    pub fn sender(&self) -> ChannelSender {
        ChannelSender {
            shared: self.shared.clone(),
        }
    }

    /// Install the handler for `channel`, replacing any previous one.
    ///
    /// Handlers run on the worker thread. They may send but must not
    /// register or unregister handlers.
    pub fn register_handler<F>(&self, channel: ChannelId, handler: F)
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        self.shared.handlers.lock()[channel as usize] = Some(Box::new(handler));
        tracing::debug!(channel = %channel, "Registered channel handler");
    }

    pub fn unregister_handler(&self, channel: ChannelId) {
        self.shared.handlers.lock()[channel as usize] = None;
        tracing::debug!(channel = %channel, "Unregistered channel handler");
    }

    /// Largest payload a single message can carry.
    pub fn max_payload(&self) -> usize {
        self.shared.max_payload
    }

    /// Latch the error state. Inbound traffic is discarded from now on and
    /// every send fails until the transport is rebuilt.
    pub fn set_error(&self) {
        tracing::warn!(remote = %self.target, "I/O processing suspended on management transport");
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
    /// A worker stuck in a handler past the stop timeout is detached with
    /// the error latch set; its handlers are left to it.
    pub fn release(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        if self.shared.control.is_running() {
            self.shared.control.block();
            tracing::warn!(remote = %self.target, "Channel handlers still busy, left registered");
        } else {
            // Handlers may hold senders back into this transport.
            *self.shared.handlers.lock() = std::array::from_fn(|_| None);
        }
        if self.shared.outbound.lock().take().is_some() {
            tracing::info!(remote = %self.target, "Management transport released");
        }
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("target", &self.target)
            .field("state", &self.state())
            .field("max_payload", &self.shared.max_payload)
            .finish()
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.release();
    }
}

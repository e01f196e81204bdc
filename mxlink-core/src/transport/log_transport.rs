// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Structured firmware log stream.
//!
//! Inbound only. Each record is a 32-bit header, padded to one packet,
//! followed by its payload.
//! The header is decoded by a registered [`HeaderParser`]; a run of more
//! than `max_bad_headers` undecodable headers means the stream is garbage
//! and the worker terminates.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use parking_lot::Mutex;

use super::worker::{Drain, Worker, WorkerControl};
use super::{state_of, TransportState};
use crate::config::{LogConfig, WorkerConfig};
use crate::device::Device;
use crate::error::TransportError;
use crate::shm::StreamDescriptor;
use crate::stream::{ByteStream, IntrBitType};
use crate::types::{Direction, Target};

pub const PHASE_4: u8 = 4;
pub const PHASE_5: u8 = 5;

const SYNC_PHASE_4: u16 = 0xA55A;
const SYNC_PHASE_5: u16 = 0x9669;

/// Firmware level to syslog level. Out of range levels are treated as the last.
const FW_TO_SYSLOG: [u8; 5] = [0, 4, 5, 6, 7];

const HEADER_BYTES: usize = std::mem::size_of::<u32>();

/// Frame `header` the way the peer writes it: alone in a full packet.
pub fn header_packet(header: u32, packet_size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; packet_size.max(HEADER_BYTES)];
    packet[..HEADER_BYTES].copy_from_slice(&header.to_le_bytes());
    packet
}

/// Decoded record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub phase: u8,
    pub level: u8,
    pub num_bytes: usize,
}

/// One record as handed to the log handler.
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    pub phase: u8,
    pub level: u8,
    pub payload: &'a [u8],
}

/// Decodes the 32-bit record header.
pub trait HeaderParser: Send {
    fn parse(&self, header: u32) -> Result<LogHeader, TransportError>;
}

/// Parser for the sync-word framed headers the firmware emits.
///
/// Layout: `sync[31:16] level[15:8] len[7:0]`. Phase 4 counts `len` in
/// bytes, phase 5 in 32-bit words.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncHeaderParser;

impl SyncHeaderParser {
    /// Build a header for `num_bytes` of payload.
    ///
    /// Returns `None` when the length does not fit the phase's encoding.
    pub fn encode(phase: u8, fw_level: u8, num_bytes: usize) -> Option<u32> {
        let (sync, len) = match phase {
            PHASE_4 => (SYNC_PHASE_4, num_bytes),
            PHASE_5 if num_bytes % 4 == 0 => (SYNC_PHASE_5, num_bytes / 4),
            _ => return None,
        };
        let len = u8::try_from(len).ok()?;
        Some((u32::from(sync) << 16) | (u32::from(fw_level) << 8) | u32::from(len))
    }
}

impl HeaderParser for SyncHeaderParser {
    fn parse(&self, header: u32) -> Result<LogHeader, TransportError> {
        let len = (header & 0xFF) as usize;
        let (phase, num_bytes) = match (header >> 16) as u16 {
            SYNC_PHASE_4 => (PHASE_4, len),
            SYNC_PHASE_5 => (PHASE_5, len * 4),
            _ => return Err(TransportError::Decode { header }),
        };

        let fw_level = ((header >> 8) & 0xFF) as usize;
        let level = match FW_TO_SYSLOG.get(fw_level) {
            Some(level) => *level,
            None => {
                tracing::error!(fw_level, "Unknown firmware log level, using lowest");
                FW_TO_SYSLOG[FW_TO_SYSLOG.len() - 1]
            }
        };

        Ok(LogHeader {
            phase,
            level,
            num_bytes,
        })
    }
}

/// Callback receiving each decoded log record.
pub type LogHandler = Box<dyn FnMut(&LogRecord<'_>) + Send>;

struct Sinks {
    parser: Box<dyn HeaderParser>,
    handler: LogHandler,
}

struct Shared {
    sinks: Mutex<Option<Sinks>>,
    control: Arc<WorkerControl>,
}

struct LogDrain {
    shared: Arc<Shared>,
    header: Vec<u8>,
    buf: Vec<u8>,
    bad_headers: u32,
    max_bad_headers: u32,
}

impl Drain for LogDrain {
    fn drain(&mut self, stream: &mut ByteStream) -> ControlFlow<()> {
        if self.shared.sinks.lock().is_none() {
            tracing::error!("No log parser registered");
            return ControlFlow::Break(());
        }

        while !self.shared.control.is_blocked() {
            if stream.read(&mut self.header) < self.header.len() {
                break;
            }
            let header = u32::from_le_bytes([
                self.header[0],
                self.header[1],
                self.header[2],
                self.header[3],
            ]);

            let mut sinks = self.shared.sinks.lock();
            let Some(sinks) = sinks.as_mut() else {
                tracing::error!("Log parser removed, channel released");
                return ControlFlow::Break(());
            };

            let parsed = match sinks.parser.parse(header) {
                Ok(parsed) => parsed,
                Err(_) => {
                    tracing::error!(header = %format!("{header:#010x}"), "Bad sync in header");
                    self.bad_headers += 1;
                    if self.bad_headers > self.max_bad_headers {
                        tracing::error!(
                            count = self.bad_headers,
                            "Too many consecutive bad headers, terminating"
                        );
                        return ControlFlow::Break(());
                    }
                    continue;
                }
            };

            if parsed.num_bytes == 0 || parsed.num_bytes >= self.buf.len() - HEADER_BYTES {
                tracing::error!(
                    num_bytes = parsed.num_bytes,
                    header = %format!("{header:#010x}"),
                    "Bad num_bytes in header"
                );
                continue;
            }

            self.bad_headers = 0;
            let read = stream.read(&mut self.buf[..parsed.num_bytes]);
            (sinks.handler)(&LogRecord {
                phase: parsed.phase,
                level: parsed.level,
                payload: &self.buf[..read],
            });
        }
        ControlFlow::Continue(())
    }
}

/// Firmware log stream from one target.
pub struct LogTransport {
    shared: Arc<Shared>,
    worker: Option<Worker>,
    descriptor: StreamDescriptor,
    target: Target,
}

impl LogTransport {
    pub fn new(
        device: &Device,
        target: Target,
        config: &LogConfig,
        worker: &WorkerConfig,
    ) -> Result<Self, TransportError> {
        let control = WorkerControl::new();
        let inbound = ByteStream::new(
            device,
            target,
            Direction::In,
            config.ring.geometry(),
            IntrBitType::Alloc,
            control.irq_handler(),
        )?;
        let descriptor = inbound.descriptor()?;

        let shared = Arc::new(Shared {
            sinks: Mutex::new(None),
            control: control.clone(),
        });

        let worker = Worker::spawn(
            "mxlog",
            control,
            inbound,
            LogDrain {
                shared: shared.clone(),
                header: header_packet(0, config.ring.packet_size as usize),
                buf: vec![0u8; config.ring.mem_length as usize],
                bad_headers: 0,
                max_bad_headers: config.max_bad_headers,
            },
            worker.start_timeout,
            worker.stop_timeout,
        )?;

        tracing::info!(remote = %target, "Log transport ready");

        Ok(Self {
            shared,
            worker: Some(worker),
            descriptor,
            target,
        })
    }

    /// Install the header parser and record handler.
    ///
    /// Must happen before the peer starts logging: a wakeup with nothing
    /// registered terminates the worker.
    pub fn register<P, F>(&self, parser: P, handler: F)
    where
        P: HeaderParser + 'static,
        F: FnMut(&LogRecord<'_>) + Send + 'static,
    {
        *self.shared.sinks.lock() = Some(Sinks {
            parser: Box::new(parser),
            handler: Box::new(handler),
        });
    }

    pub fn unregister(&self) {
        *self.shared.sinks.lock() = None;
    }

    pub fn set_error(&self) {
        tracing::warn!(remote = %self.target, "I/O processing suspended on log transport");
        self.shared.control.block();
    }

    pub fn state(&self) -> TransportState {
        state_of(self.worker.as_ref().map(|w| w.control().as_ref()))
    }

    pub fn descriptor(&self) -> StreamDescriptor {
        self.descriptor
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Stop the worker and drop the sinks.
    ///
    /// A worker stuck in the handler past the stop timeout is detached with
    /// the error latch set; the sinks are left to it.
    pub fn release(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            tracing::info!(remote = %self.target, "Log transport released");
        }
        if self.shared.control.is_running() {
            self.shared.control.block();
            tracing::warn!(remote = %self.target, "Log handler still busy, left registered");
        } else {
            self.unregister();
        }
    }
}

impl fmt::Debug for LogTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogTransport")
            .field("target", &self.target)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for LogTransport {
    fn drop(&mut self) {
        self.release();
    }
}

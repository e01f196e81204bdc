// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Framed transports built on a pair of byte streams.
//!
//! Every transport owns one worker thread that drains its inbound stream
//! and dispatches to registered handlers. Handlers run on that thread,
//! one at a time, and must not block.

mod channel;
mod log_transport;
mod monitor;
mod worker;

use std::fmt;

use serde::Serialize;

pub use channel::{ChannelId, ChannelSender, ChannelTransport, MessageHandler, NUM_CHANNELS};
pub use log_transport::{
    header_packet, HeaderParser, LogHandler, LogHeader, LogRecord, LogTransport, SyncHeaderParser,
    PHASE_4, PHASE_5,
};
pub use monitor::{MonitorHandler, MonitorTransport, MONITOR_MAX_MESSAGE};

/// Lifecycle of a transport as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    /// Worker alive and dispatching.
    Running,
    /// Error latch set; inbound traffic is discarded.
    Blocked,
    /// Worker gone, either released or terminated on a fatal stream error.
    Stopped,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Running => "Running",
            Self::Blocked => "Blocked",
            Self::Stopped => "Stopped",
        })
    }
}

fn state_of(control: Option<&worker::WorkerControl>) -> TransportState {
    match control {
        Some(control) if control.is_running() => {
            if control.is_blocked() {
                TransportState::Blocked
            } else {
                TransportState::Running
            }
        }
        _ => TransportState::Stopped,
    }
}

//! Custom error types for mxlink.
//!
//! Explicit enum error types for every layer. No `Box<dyn Error>`, no
//! `anyhow::Result`. Ring-level primitives return plain values (`bool`,
//! byte counts, `Option`) and the stream/transport layers lift those into
//! [`TransportError`].

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Target;

/// Top-level error type for the transport stack.
#[derive(Debug, Error)]
pub enum MxError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Shared Memory Errors
    // =========================================================================
    #[error("Shared region error: {0}")]
    Region(#[from] RegionError),

    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingError),

    // =========================================================================
    // Signalling and Transport Errors
    // =========================================================================
    #[error("Interrupt bit error: {0}")]
    IntrBit(#[from] IntrBitError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration values rejected at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid field value: {section}.{field} = {value} - {reason}")]
    InvalidFieldValue {
        section: &'static str,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Shared region too small: {available} bytes, at least {required} required")]
    RegionTooSmall { required: usize, available: usize },
}

/// Shared mapping and region allocator failures.
#[derive(Debug, Error)]
pub enum RegionError {
    #[error("Failed to create shared memory region: {name} - {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Failed to map shared memory: {reason}")]
    MapFailed { reason: String },

    #[error("Shared region out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Invalid allocation request: {size} bytes aligned to {align}")]
    InvalidRequest { size: usize, align: usize },

    #[error("Peer reference {peer_ref:#010x} does not resolve inside the region")]
    UnresolvedPeerRef { peer_ref: u32 },
}

/// Ring buffer construction and descriptor failures.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("Invalid ring geometry: {num_packets} packets of {packet_size} bytes - {reason}")]
    InvalidGeometry {
        num_packets: u32,
        packet_size: u32,
        reason: &'static str,
    },

    #[error("Ring allocation failed: {0}")]
    Region(#[from] RegionError),

    #[error("Invalid descriptor: {reason}")]
    InvalidDescriptor { reason: String },
}

/// Interrupt line allocation failures.
#[derive(Debug, Error)]
pub enum IntrBitError {
    #[error("Interrupt line {bit} out of range")]
    OutOfRange { bit: usize },

    #[error("No free to-host interrupt line")]
    ToHostExhausted,

    #[error("No free from-host interrupt line for target {target}")]
    FromHostExhausted { target: Target },
}

/// Errors surfaced by byte streams and channel transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Insufficient space in ring for a {len} byte message")]
    InsufficientSpace { len: usize },

    #[error("No handler for channel {channel}")]
    UnknownChannel { channel: u8 },

    #[error("Bad framing header {header:#010x}")]
    Decode { header: u32 },

    #[error("Message of {len} bytes exceeds maximum {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("Transport is in error state, I/O is suspended")]
    AlreadyInError,

    #[error("Transport has been released")]
    Released,

    #[error("Setup failed, ring unavailable: {0}")]
    Ring(#[from] RingError),

    #[error("Setup failed, interrupt line unavailable: {0}")]
    IntrBit(#[from] IntrBitError),

    #[error("Failed to spawn worker {name}: {source}")]
    WorkerSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {name} did not start within {timeout_ms}ms")]
    WorkerStartTimeout { name: &'static str, timeout_ms: u64 },
}

impl TransportError {
    /// Setup failed because a finite resource (line or shared memory) ran out.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            Self::Ring(RingError::Region(RegionError::OutOfMemory { .. }))
                | Self::IntrBit(IntrBitError::ToHostExhausted)
                | Self::IntrBit(IntrBitError::FromHostExhausted { .. })
        )
    }
}

/// Result type alias using MxError.
pub type MxResult<T> = Result<T, MxError>;

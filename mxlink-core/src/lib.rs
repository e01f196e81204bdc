//! MxLink Core Library
//!
//! Host side of the shared-memory transport to a co-processor: packet ring
//! buffers in a shared region, interrupt line allocation and dispatch,
//! byte streams, and the framed management, monitor and log transports
//! built on top of them.

pub mod config;
pub mod device;
pub mod error;
pub mod intrbit;
pub mod loopback;
pub mod shm;
pub mod stream;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, LogConfig, RegionConfig, RingConfig, WorkerConfig};
pub use device::Device;
pub use error::{
    ConfigError, IntrBitError, MxError, MxResult, RegionError, RingError, TransportError,
};
pub use intrbit::{InterruptBitRegistry, InterruptController, IrqHandler};
pub use stream::{ByteStream, IntrBitType};
pub use transport::{ChannelId, ChannelTransport, LogTransport, MonitorTransport, TransportState};
pub use types::{Direction, IntrBit, Target};

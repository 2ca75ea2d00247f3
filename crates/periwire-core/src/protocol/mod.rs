//! Template-driven serial protocol
//!
//! Frames are described by a [`MessageTemplate`] and built or reconstructed
//! element by element. The [`ProtocolEngine`] layers polling, attach/detach
//! tracking and generic command dispatch on top.

pub mod checksum;
pub mod commands;
pub mod config;
mod connection;
mod error;
pub mod frame;
pub mod poll;
pub mod reconstruct;
mod runner;
pub mod serial;
pub mod stream;
pub mod template;

pub use checksum::{ChecksumEngine, ChecksumFactory, ChecksumKind, Crc32Checksum, NullChecksum, XorChecksum};
pub use commands::{Command, DeviceIdentity};
pub use config::{DeliveryMode, EngineConfig, ResponseTiming, SerialSettings};
pub use connection::{DeviceAdapter, DeviceLink, EngineEvent, LinkCounters, ProtocolEngine};
pub use error::{FrameError, ProtocolError, TemplateError};
pub use frame::{build_frame, write_chunked, PayloadBuilder};
pub use poll::{LinkEvent, PollSchedule, PollTracker};
pub use reconstruct::{Outcome, Phase, ReconstructionState, Reconstructor};
pub use runner::EngineRunner;
pub use serial::{clear_buffers, configure_port, list_ports, open_port, PortInfo};
pub use stream::{DataCallback, MemoryChannel, SerialChannel, Transport};
pub use template::{Element, ElementKind, Endianness, Mask, MaskOp, MessageTemplate, TemplateBuilder, TemplateSpec};

/// Default baud rate for peripheral communication
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default timeout for an incomplete frame in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Default data-length ceiling for a single message
pub const MAX_FRAME_SIZE: usize = 8192;

/// Default largest single transport write
pub const DEFAULT_WRITE_CHUNK: usize = 256;

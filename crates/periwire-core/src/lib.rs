//! # periwire Core Library
//!
//! Template-driven serial protocol engine for gaming-machine peripherals
//! (bill validators, coin hoppers, ticket printers, reel controllers).

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Message templates: declarative frame layouts validated once at startup
//! - Pluggable checksum engines (none, XOR, CRC-32)
//! - Outbound frame building and chunked writes
//! - Incremental inbound frame reconstruction with resynchronization
//! - Status polling with attach/detach tracking and generic command dispatch
//! - A tokio runner for event-driven delivery and supervised reconnects
//!
//! ## Example
//!
//! ```rust,ignore
//! use periwire_core::prelude::*;
//!
//! let template = TemplateBuilder::new(ChecksumKind::Xor)
//!     .element(Element::constant(&[0x02]).unchecked())
//!     .element(Element::data_length(1))
//!     .element(Element::fixed_data(1))
//!     .element(Element::variable_data())
//!     .element(Element::crc(1))
//!     .build()?;
//!
//! let channel = SerialChannel::new(SerialSettings {
//!     port_name: "/dev/ttyUSB0".into(),
//!     baud_rate: 9600,
//! });
//! let engine = ProtocolEngine::new(channel, Arc::new(template), MyHopper::default());
//! engine.configure(EngineConfig::from_file("hopper.json")?)?;
//!
//! let runner = EngineRunner::start(engine.clone())?;
//! let mut events = engine.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        build_frame, ChecksumKind, Command, DeliveryMode, DeviceAdapter, DeviceIdentity,
        DeviceLink, Element, EngineConfig, EngineEvent, EngineRunner, MemoryChannel,
        MessageTemplate, ProtocolEngine, ProtocolError, Reconstructor, SerialChannel,
        SerialSettings, TemplateBuilder, Transport,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

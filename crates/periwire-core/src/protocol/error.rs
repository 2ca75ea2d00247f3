//! Protocol errors

use thiserror::Error;

/// Errors raised while authoring a [`MessageTemplate`](super::MessageTemplate).
///
/// These only ever occur at startup; a template that constructs successfully
/// is valid for every frame it describes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("duplicate length element at index {index}")]
    DuplicateLengthElement { index: usize },

    #[error("duplicate CRC element at index {index}")]
    DuplicateCrcElement { index: usize },

    #[error("duplicate variable-data element at index {index}")]
    DuplicateVariableData { index: usize },

    #[error("fixed-data element at index {index} follows the variable-data element")]
    FixedDataAfterVariable { index: usize },

    #[error("constant at index {index} declares {declared} bytes but carries {actual}")]
    ConstantValueMismatch {
        index: usize,
        declared: usize,
        actual: usize,
    },

    #[error("element at index {index} has unsupported integer width {width}")]
    InvalidWidth { index: usize, width: usize },
}

/// Errors detected while reconstructing an inbound frame.
///
/// None of these escape the reconstructor as a failure; they are reported
/// alongside the resynchronization that discarded the frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch: computed {computed:#010x}, received {received:#010x}")]
    ChecksumMismatch { computed: u64, received: u64 },

    #[error("decoded length {decoded} is invalid for this template")]
    InvalidLength { decoded: u64 },

    #[error("decoded data length {length} exceeds maximum {max}")]
    LengthOverflow { length: usize, max: usize },

    #[error("transport returned {read} of {wanted} bytes")]
    ShortRead { read: usize, wanted: usize },

    #[error("frame incomplete after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("all elements consumed but message holds {filled} of {expected} bytes")]
    Incomplete { filled: usize, expected: usize },

    #[error("transport error: {0}")]
    Io(String),
}

/// Errors that can occur during protocol communication
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Transport is not open")]
    NotOpen,

    #[error("Engine has been disposed")]
    Disposed,

    #[error("Engine lock poisoned")]
    LockPoisoned,

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Payload of {len} bytes does not fit this template")]
    PayloadMismatch { len: usize },

    #[error("Value {value} does not fit a {width}-byte field")]
    FieldOverflow { value: u64, width: usize },

    #[error("Checksum range {offset}+{count} exceeds buffer of {len} bytes")]
    ChecksumRange {
        offset: usize,
        count: usize,
        len: usize,
    },

    #[error("Device reports a fault that prevents enabling")]
    DisablingFault,

    #[error("Device does not support {0}")]
    Unsupported(&'static str),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

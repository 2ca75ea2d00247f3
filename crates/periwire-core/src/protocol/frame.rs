//! Outbound frame construction
//!
//! Lays a flat caller payload out according to a [`MessageTemplate`]: fixed
//! data first, then the variable remainder, with constants, length fields
//! and the checksum filled in around them. The same payload and template
//! always produce the same bytes.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::trace;

use super::stream::Transport;
use super::template::{width_mask, ElementKind, Endianness, MessageTemplate};
use super::ProtocolError;

/// Build the wire bytes for `payload`
pub fn build_frame(template: &MessageTemplate, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let fixed = template.fixed_data_length();
    let fits = match template.general_data_index() {
        Some(_) => payload.len() >= fixed,
        None => payload.len() == fixed,
    };
    if !fits {
        return Err(ProtocolError::PayloadMismatch { len: payload.len() });
    }

    let data_length = payload.len();
    let total = data_length + template.non_data_length();
    let mut frame = vec![0u8; total];
    let mut checksum = template.outbound_checksum();
    let mut out = 0;
    let mut src = 0;

    for element in template.elements() {
        let len = match element.kind {
            ElementKind::VariableData => payload.len() - src,
            _ => element.length,
        };
        let field = &mut frame[out..out + len];

        match &element.kind {
            ElementKind::Constant { value } => field.copy_from_slice(value),
            ElementKind::FixedData | ElementKind::VariableData => {
                field.copy_from_slice(&payload[src..src + len]);
                src += len;
            }
            ElementKind::FullLength => element.encode_uint(total as u64, field)?,
            ElementKind::DataLength => element.encode_uint(data_length as u64, field)?,
            ElementKind::LengthPlusDataLength => {
                element.encode_uint((element.length + data_length) as u64, field)?
            }
            ElementKind::ConstantDataLengthMask { mask } => {
                element.encode_uint(mask.apply(data_length as u64), field)?
            }
            ElementKind::ConstantMask { literal, mask } => {
                element.encode_uint(mask.apply(*literal), field)?
            }
            // Covers the flagged elements before it
            ElementKind::Crc => {
                let value = u64::from(checksum.value()) & width_mask(element.length);
                element.encode_uint(value, field)?
            }
        }

        if element.include_in_crc && element.kind != ElementKind::Crc {
            checksum.hash(&frame, out, len)?;
        }
        out += len;
    }

    trace!(len = frame.len(), "built frame");
    Ok(frame)
}

/// Write `frame` through `transport` in order, at most `max_chunk` bytes per write
pub fn write_chunked(
    transport: &mut dyn Transport,
    frame: &[u8],
    max_chunk: usize,
) -> Result<usize, ProtocolError> {
    let mut written = 0;
    for chunk in frame.chunks(max_chunk.max(1)) {
        transport.write_bytes(chunk)?;
        written += chunk.len();
    }
    Ok(written)
}

/// Builder for flat command payloads
///
/// ```rust,ignore
/// let payload = PayloadBuilder::new(Endianness::Little)
///     .command(0x41)
///     .u16(500)
///     .bytes(b"TICKET")
///     .build();
/// ```
pub struct PayloadBuilder {
    payload: Vec<u8>,
    endianness: Endianness,
}

impl PayloadBuilder {
    /// Create a new payload builder writing multi-byte values in `endianness`
    pub fn new(endianness: Endianness) -> Self {
        Self {
            payload: Vec::new(),
            endianness,
        }
    }

    /// Add a command byte
    pub fn command(self, cmd: u8) -> Self {
        self.byte(cmd)
    }

    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value
    pub fn u16(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        match self.endianness {
            Endianness::Big => BigEndian::write_u16(&mut bytes, value),
            Endianness::Little => LittleEndian::write_u16(&mut bytes, value),
        }
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit value
    pub fn u32(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        match self.endianness {
            Endianness::Big => BigEndian::write_u32(&mut bytes, value),
            Endianness::Little => LittleEndian::write_u32(&mut bytes, value),
        }
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.payload
    }
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self::new(Endianness::Big)
    }
}

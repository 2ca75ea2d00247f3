//! Message templates
//!
//! A [`MessageTemplate`] describes the byte layout of one message kind as an
//! ordered list of typed [`Element`]s. Templates are validated once, at
//! construction, and then shared (usually behind an `Arc`) by the outbound
//! builder and the inbound reconstructor for every frame of that kind.
//!
//! Example layout for a length-prefixed, XOR-checked command frame:
//!
//! ```text
//! | STX | LEN | CMD | DATA ... | XOR |
//!   Constant DataLength FixedData VariableData Crc
//! ```

use std::fmt;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::checksum::{ChecksumEngine, ChecksumFactory, ChecksumKind};
use super::{ProtocolError, TemplateError, MAX_FRAME_SIZE};

/// Byte order of an integer element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// How a [`Mask`] is combined with a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskOp {
    Or,
    And,
}

/// Fixed bit pattern combined with a length or literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    pub bits: u64,
    pub op: MaskOp,
}

impl Mask {
    pub fn or(bits: u64) -> Self {
        Self {
            bits,
            op: MaskOp::Or,
        }
    }

    pub fn and(bits: u64) -> Self {
        Self {
            bits,
            op: MaskOp::And,
        }
    }

    /// Combine `value` with the mask for transmission
    pub fn apply(&self, value: u64) -> u64 {
        match self.op {
            MaskOp::Or => value | self.bits,
            MaskOp::And => value & self.bits,
        }
    }

    /// Strip the constant portion from a received value
    pub fn remove(&self, value: u64) -> u64 {
        match self.op {
            MaskOp::Or => value & !self.bits,
            MaskOp::And => value & self.bits,
        }
    }
}

/// The closed set of element kinds a template can hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ElementKind {
    /// Known bytes, never part of the caller's payload
    Constant { value: Vec<u8> },
    /// Bytes copied verbatim from the caller's payload
    FixedData,
    /// The remainder of the payload; sized at build or parse time
    VariableData,
    /// Total frame length
    FullLength,
    /// Length of the payload portion only
    DataLength,
    /// Size of the length field itself plus the payload length
    LengthPlusDataLength,
    /// Payload length combined with a constant mask
    ConstantDataLengthMask { mask: Mask },
    /// Literal combined with a constant mask
    ConstantMask { literal: u64, mask: Mask },
    /// Checksum value; written last and never hashed itself
    Crc,
}

impl ElementKind {
    /// Whether this kind occupies the template's single length slot
    pub fn is_length(&self) -> bool {
        matches!(
            self,
            ElementKind::FullLength
                | ElementKind::DataLength
                | ElementKind::LengthPlusDataLength
                | ElementKind::ConstantDataLengthMask { .. }
                | ElementKind::ConstantMask { .. }
        )
    }

    /// Whether this kind carries caller payload bytes
    pub fn is_payload(&self) -> bool {
        matches!(self, ElementKind::FixedData | ElementKind::VariableData)
    }

    fn is_integer(&self) -> bool {
        self.is_length() || matches!(self, ElementKind::Crc)
    }
}

/// One typed field within a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    #[serde(flatten)]
    pub kind: ElementKind,
    /// Byte width. Ignored for `VariableData`.
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub endianness: Endianness,
    /// Whether the element's bytes are folded into the running checksum
    #[serde(default = "default_include_in_crc")]
    pub include_in_crc: bool,
}

fn default_include_in_crc() -> bool {
    true
}

impl Element {
    fn new(kind: ElementKind, length: usize) -> Self {
        let include_in_crc = !matches!(kind, ElementKind::Crc);
        Self {
            kind,
            length,
            endianness: Endianness::Big,
            include_in_crc,
        }
    }

    pub fn constant(value: &[u8]) -> Self {
        Self::new(
            ElementKind::Constant {
                value: value.to_vec(),
            },
            value.len(),
        )
    }

    pub fn fixed_data(length: usize) -> Self {
        Self::new(ElementKind::FixedData, length)
    }

    pub fn variable_data() -> Self {
        Self::new(ElementKind::VariableData, 0)
    }

    pub fn full_length(width: usize) -> Self {
        Self::new(ElementKind::FullLength, width)
    }

    pub fn data_length(width: usize) -> Self {
        Self::new(ElementKind::DataLength, width)
    }

    pub fn length_plus_data_length(width: usize) -> Self {
        Self::new(ElementKind::LengthPlusDataLength, width)
    }

    pub fn data_length_mask(width: usize, mask: Mask) -> Self {
        Self::new(ElementKind::ConstantDataLengthMask { mask }, width)
    }

    pub fn constant_mask(width: usize, literal: u64, mask: Mask) -> Self {
        Self::new(ElementKind::ConstantMask { literal, mask }, width)
    }

    pub fn crc(width: usize) -> Self {
        Self::new(ElementKind::Crc, width)
    }

    pub fn little_endian(mut self) -> Self {
        self.endianness = Endianness::Little;
        self
    }

    pub fn big_endian(mut self) -> Self {
        self.endianness = Endianness::Big;
        self
    }

    /// Exclude this element from the checksum
    pub fn unchecked(mut self) -> Self {
        self.include_in_crc = false;
        self
    }

    /// Serialize `value` into `out` (exactly `self.length` bytes)
    pub fn encode_uint(&self, value: u64, out: &mut [u8]) -> Result<(), ProtocolError> {
        let width = self.length;
        if value & !width_mask(width) != 0 {
            return Err(ProtocolError::FieldOverflow { value, width });
        }
        match self.endianness {
            Endianness::Big => BigEndian::write_uint(out, value, width),
            Endianness::Little => LittleEndian::write_uint(out, value, width),
        }
        Ok(())
    }

    /// Deserialize an integer of `self.length` bytes
    pub fn decode_uint(&self, bytes: &[u8]) -> u64 {
        match self.endianness {
            Endianness::Big => BigEndian::read_uint(bytes, self.length),
            Endianness::Little => LittleEndian::read_uint(bytes, self.length),
        }
    }
}

/// All-ones mask covering `width` bytes
pub(crate) fn width_mask(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// Immutable description of one message kind
#[derive(Clone)]
pub struct MessageTemplate {
    elements: Vec<Element>,
    crc_seed: u32,
    checksum: ChecksumFactory,
    non_data_length: usize,
    fixed_data_length: usize,
    length_index: Option<usize>,
    length_offset_inclusive: Option<usize>,
    crc_index: Option<usize>,
    general_data_index: Option<usize>,
    expected_data_length: Option<usize>,
    length_tolerance: usize,
    max_data_length: usize,
}

impl fmt::Debug for MessageTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageTemplate")
            .field("elements", &self.elements)
            .field("crc_seed", &self.crc_seed)
            .field("non_data_length", &self.non_data_length)
            .field("length_index", &self.length_index)
            .field("general_data_index", &self.general_data_index)
            .finish_non_exhaustive()
    }
}

impl MessageTemplate {
    /// Validate `elements` and compute the derived layout.
    pub fn new(
        elements: Vec<Element>,
        crc_seed: u32,
        checksum: ChecksumFactory,
    ) -> Result<Self, TemplateError> {
        let mut non_data_length = 0;
        let mut fixed_data_length = 0;
        let mut length_index = None;
        let mut length_offset_inclusive = None;
        let mut crc_index = None;
        let mut general_data_index = None;
        // Byte offset from frame start; unknown once variable data has been passed
        let mut offset = Some(0usize);

        for (index, element) in elements.iter().enumerate() {
            if element.kind.is_integer() && !(1..=8).contains(&element.length) {
                return Err(TemplateError::InvalidWidth {
                    index,
                    width: element.length,
                });
            }

            match &element.kind {
                ElementKind::Constant { value } if value.len() != element.length => {
                    return Err(TemplateError::ConstantValueMismatch {
                        index,
                        declared: element.length,
                        actual: value.len(),
                    });
                }
                ElementKind::FixedData if general_data_index.is_some() => {
                    return Err(TemplateError::FixedDataAfterVariable { index });
                }
                ElementKind::VariableData if general_data_index.is_some() => {
                    return Err(TemplateError::DuplicateVariableData { index });
                }
                ElementKind::Crc if crc_index.is_some() => {
                    return Err(TemplateError::DuplicateCrcElement { index });
                }
                kind if kind.is_length() && length_index.is_some() => {
                    return Err(TemplateError::DuplicateLengthElement { index });
                }
                _ => {}
            }

            match &element.kind {
                ElementKind::FixedData => fixed_data_length += element.length,
                ElementKind::VariableData => general_data_index = Some(index),
                ElementKind::Crc => crc_index = Some(index),
                kind if kind.is_length() => length_index = Some(index),
                _ => {}
            }
            if !element.kind.is_payload() {
                non_data_length += element.length;
            }

            offset = match element.kind {
                ElementKind::VariableData => None,
                _ => offset.map(|o| o + element.length),
            };
            if element.kind.is_length() {
                length_offset_inclusive = offset;
            }
        }

        Ok(Self {
            elements,
            crc_seed,
            checksum,
            non_data_length,
            fixed_data_length,
            length_index,
            length_offset_inclusive,
            crc_index,
            general_data_index,
            expected_data_length: None,
            length_tolerance: 0,
            max_data_length: MAX_FRAME_SIZE,
        })
    }

    /// Declare the usual payload length of this message kind
    pub fn with_expected_data_length(mut self, length: usize) -> Self {
        self.expected_data_length = Some(length);
        self
    }

    /// How far a `LengthPlusDataLength` value may stray from the expected
    /// data length and still have the expected length win
    pub fn with_length_tolerance(mut self, tolerance: usize) -> Self {
        self.length_tolerance = tolerance;
        self
    }

    pub fn with_max_data_length(mut self, max: usize) -> Self {
        self.max_data_length = max;
        self
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn crc_seed(&self) -> u32 {
        self.crc_seed
    }

    /// Sum of every non-payload element's width
    pub fn non_data_length(&self) -> usize {
        self.non_data_length
    }

    /// Sum of every `FixedData` element's width
    pub fn fixed_data_length(&self) -> usize {
        self.fixed_data_length
    }

    pub fn includes_length_element(&self) -> bool {
        self.length_index.is_some()
    }

    pub fn length_element(&self) -> Option<&Element> {
        self.length_index.and_then(|i| self.elements.get(i))
    }

    /// Bytes from frame start through the end of the length element, when
    /// that position does not depend on variable data
    pub fn length_element_offset_inclusive(&self) -> Option<usize> {
        self.length_offset_inclusive
    }

    pub fn includes_crc(&self) -> bool {
        self.crc_index.is_some()
    }

    /// Position of the `VariableData` element
    pub fn general_data_index(&self) -> Option<usize> {
        self.general_data_index
    }

    pub fn expected_data_length(&self) -> Option<usize> {
        self.expected_data_length
    }

    pub fn length_tolerance(&self) -> usize {
        self.length_tolerance
    }

    pub fn max_data_length(&self) -> usize {
        self.max_data_length
    }

    /// Inbound message allocation before any length field is decoded
    pub fn initial_data_length(&self) -> usize {
        self.expected_data_length.unwrap_or(self.fixed_data_length)
    }

    /// Seeded engine for building an outbound frame
    pub fn outbound_checksum(&self) -> Box<dyn ChecksumEngine> {
        self.seeded_engine()
    }

    /// Seeded engine for verifying an inbound frame
    pub fn inbound_checksum(&self) -> Box<dyn ChecksumEngine> {
        self.seeded_engine()
    }

    fn seeded_engine(&self) -> Box<dyn ChecksumEngine> {
        let mut engine = (self.checksum)();
        engine.initialize(self.crc_seed);
        engine
    }
}

/// Fluent template authoring
///
/// ```rust,ignore
/// let template = TemplateBuilder::new(ChecksumKind::Xor)
///     .element(Element::constant(&[0x02]).unchecked())
///     .element(Element::data_length(1))
///     .element(Element::fixed_data(1))
///     .element(Element::variable_data())
///     .element(Element::crc(1))
///     .build()?;
/// ```
pub struct TemplateBuilder {
    elements: Vec<Element>,
    crc_seed: u32,
    checksum: ChecksumFactory,
    expected_data_length: Option<usize>,
    length_tolerance: usize,
    max_data_length: usize,
}

impl TemplateBuilder {
    pub fn new(kind: ChecksumKind) -> Self {
        Self::with_factory(kind.factory())
    }

    pub fn with_factory(checksum: ChecksumFactory) -> Self {
        Self {
            elements: Vec::new(),
            crc_seed: 0,
            checksum,
            expected_data_length: None,
            length_tolerance: 0,
            max_data_length: MAX_FRAME_SIZE,
        }
    }

    pub fn element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn crc_seed(mut self, seed: u32) -> Self {
        self.crc_seed = seed;
        self
    }

    pub fn expected_data_length(mut self, length: usize) -> Self {
        self.expected_data_length = Some(length);
        self
    }

    pub fn length_tolerance(mut self, tolerance: usize) -> Self {
        self.length_tolerance = tolerance;
        self
    }

    pub fn max_data_length(mut self, max: usize) -> Self {
        self.max_data_length = max;
        self
    }

    pub fn build(self) -> Result<MessageTemplate, TemplateError> {
        let mut template = MessageTemplate::new(self.elements, self.crc_seed, self.checksum)?
            .with_length_tolerance(self.length_tolerance)
            .with_max_data_length(self.max_data_length);
        if let Some(expected) = self.expected_data_length {
            template = template.with_expected_data_length(expected);
        }
        Ok(template)
    }
}

/// Serializable template description, for loading layouts from configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub elements: Vec<Element>,
    #[serde(default)]
    pub checksum: ChecksumKind,
    #[serde(default)]
    pub crc_seed: u32,
    #[serde(default)]
    pub expected_data_length: Option<usize>,
    #[serde(default)]
    pub length_tolerance: usize,
    #[serde(default)]
    pub max_data_length: Option<usize>,
}

impl TemplateSpec {
    pub fn build(&self) -> Result<MessageTemplate, TemplateError> {
        let mut builder = TemplateBuilder::new(self.checksum)
            .crc_seed(self.crc_seed)
            .length_tolerance(self.length_tolerance)
            .max_data_length(self.max_data_length.unwrap_or(MAX_FRAME_SIZE));
        if let Some(expected) = self.expected_data_length {
            builder = builder.expected_data_length(expected);
        }
        self.elements
            .iter()
            .cloned()
            .fold(builder, TemplateBuilder::element)
            .build()
    }
}

//! Generic commands
//!
//! The small command set every peripheral understands regardless of its
//! device-specific message catalogue.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

/// Universal command understood by every device adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Acknowledge the last message, optionally resynchronizing the
    /// transaction sequence
    Acknowledge { resync: bool },

    /// Enable the device (refused while it reports a disabling fault)
    Enable,

    /// Disable the device
    Disable,

    /// Run the device's self test
    SelfTest,

    /// Report manufacturer, model and firmware
    RequestIdentity,

    /// Compute a CRC over the device firmware starting from `seed`
    QueryFirmwareCrc { seed: u32 },

    /// A command this engine does not understand; ignored
    Unknown(u8),
}

impl Command {
    /// Wire code of the command
    pub fn code(&self) -> u8 {
        match self {
            Command::Acknowledge { .. } => 0x06,
            Command::Enable => b'E',
            Command::Disable => b'D',
            Command::SelfTest => b'T',
            Command::RequestIdentity => b'I',
            Command::QueryFirmwareCrc { .. } => b'C',
            Command::Unknown(code) => *code,
        }
    }

    /// Decode a command from its code and argument bytes.
    ///
    /// A missing argument decodes as zero. Unrecognized codes become
    /// [`Command::Unknown`].
    pub fn from_code(code: u8, arg: &[u8]) -> Self {
        match code {
            0x06 => Command::Acknowledge {
                resync: arg.first().is_some_and(|b| *b != 0),
            },
            b'E' => Command::Enable,
            b'D' => Command::Disable,
            b'T' => Command::SelfTest,
            b'I' => Command::RequestIdentity,
            b'C' => {
                let mut seed = [0u8; 4];
                let n = arg.len().min(4);
                seed[4 - n..].copy_from_slice(&arg[..n]);
                Command::QueryFirmwareCrc {
                    seed: BigEndian::read_u32(&seed),
                }
            }
            other => Command::Unknown(other),
        }
    }
}

/// Identity reported by a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub firmware_revision: String,
}

impl DeviceIdentity {
    pub fn new(
        manufacturer: impl Into<String>,
        model: impl Into<String>,
        firmware_version: impl Into<String>,
        firmware_revision: impl Into<String>,
    ) -> Self {
        Self {
            manufacturer: manufacturer.into(),
            model: model.into(),
            firmware_version: firmware_version.into(),
            firmware_revision: firmware_revision.into(),
        }
    }

    /// Build from raw device-reported fields, trimming padding
    pub fn from_fields(manufacturer: &[u8], model: &[u8], version: &[u8], revision: &[u8]) -> Self {
        let field = |raw: &[u8]| {
            String::from_utf8_lossy(raw)
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string()
        };
        Self::new(field(manufacturer), field(model), field(version), field(revision))
    }

    pub fn is_empty(&self) -> bool {
        self.manufacturer.is_empty()
            && self.model.is_empty()
            && self.firmware_version.is_empty()
            && self.firmware_revision.is_empty()
    }
}

impl fmt::Display for DeviceIdentity {
    /// e.g. `Acme Hopper fw 1.20 rev B`; empty fields are skipped
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::with_capacity(4);
        for name in [&self.manufacturer, &self.model] {
            if !name.is_empty() {
                parts.push(name.clone());
            }
        }
        if !self.firmware_version.is_empty() {
            parts.push(format!("fw {}", self.firmware_version));
        }
        if !self.firmware_revision.is_empty() {
            parts.push(format!("rev {}", self.firmware_revision));
        }
        write!(f, "{}", parts.join(" "))
    }
}

//! Dongle info header
//!
//! rtl_tcp opens every connection with a fixed 12-byte structure:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |  'R'   |  'T'   |  'L'   |  '0'   |   magic
//! +--------+--------+--------+--------+
//! |        tuner type (u32 BE)        |
//! +--------+--------+--------+--------+
//! |     tuner gain count (u32 BE)     |
//! +--------+--------+--------+--------+
//! ```
//!
//! The relay forwards these bytes verbatim to every client. Decoding is only
//! used for logging and sanity checks.

use bytes::{Buf, Bytes};

use super::constants::{HEADER_MAGIC, HEADER_SIZE};

/// Tuner chip reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunerType {
    Unknown,
    E4000,
    Fc0012,
    Fc0013,
    Fc2580,
    R820t,
    R828d,
    /// Code not in the known table
    Other(u32),
}

impl TunerType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => TunerType::Unknown,
            1 => TunerType::E4000,
            2 => TunerType::Fc0012,
            3 => TunerType::Fc0013,
            4 => TunerType::Fc2580,
            5 => TunerType::R820t,
            6 => TunerType::R828d,
            other => TunerType::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            TunerType::Unknown => 0,
            TunerType::E4000 => 1,
            TunerType::Fc0012 => 2,
            TunerType::Fc0013 => 3,
            TunerType::Fc2580 => 4,
            TunerType::R820t => 5,
            TunerType::R828d => 6,
            TunerType::Other(code) => *code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TunerType::Unknown => "unknown",
            TunerType::E4000 => "E4000",
            TunerType::Fc0012 => "FC0012",
            TunerType::Fc0013 => "FC0013",
            TunerType::Fc2580 => "FC2580",
            TunerType::R820t => "R820T",
            TunerType::R828d => "R828D",
            TunerType::Other(_) => "other",
        }
    }
}

impl std::fmt::Display for TunerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunerType::Other(code) => write!(f, "other({})", code),
            _ => f.write_str(self.name()),
        }
    }
}

/// Header captured once per upstream connection
///
/// Cheap to clone: the raw bytes are reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DongleInfo {
    raw: Bytes,
    magic: [u8; 4],
    tuner_type: TunerType,
    gain_count: u32,
}

impl DongleInfo {
    /// Decode a header from exactly [`HEADER_SIZE`] bytes
    pub fn from_bytes(raw: [u8; HEADER_SIZE]) -> Self {
        let mut buf = &raw[..];

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        let tuner_type = TunerType::from_code(buf.get_u32());
        let gain_count = buf.get_u32();

        Self {
            raw: Bytes::copy_from_slice(&raw),
            magic,
            tuner_type,
            gain_count,
        }
    }

    /// The header exactly as received
    pub fn bytes(&self) -> Bytes {
        self.raw.clone()
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    /// Whether the magic tag reads "RTL0"
    pub fn has_valid_magic(&self) -> bool {
        self.magic == HEADER_MAGIC
    }

    pub fn tuner_type(&self) -> TunerType {
        self.tuner_type
    }

    /// Number of discrete gain steps the tuner supports
    pub fn gain_count(&self) -> u32 {
        self.gain_count
    }
}

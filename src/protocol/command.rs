//! Client command frames
//!
//! Each frame is 5 bytes: a 1-byte opcode followed by a big-endian `u32`
//! parameter. Clients write them back-to-back on the same socket that
//! carries samples in the other direction.

use std::time::Instant;

use bytes::{Buf, BufMut, BytesMut};

use super::constants::COMMAND_SIZE;
use crate::error::ProtocolError;
use crate::session::SessionId;

/// rtl_tcp command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    SetFrequency = 0x01,
    SetSampleRate = 0x02,
    SetGainMode = 0x03,
    SetGain = 0x04,
    SetFrequencyCorrection = 0x05,
    /// Parameter packs the stage in the high 16 bits and the gain in the low 16
    SetIfGain = 0x06,
    SetTestMode = 0x07,
    SetAgcMode = 0x08,
    SetDirectSampling = 0x09,
    SetOffsetTuning = 0x0a,
    SetRtlXtal = 0x0b,
    SetTunerXtal = 0x0c,
    SetGainByIndex = 0x0d,
    SetBiasTee = 0x0e,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        let op = match byte {
            0x01 => Opcode::SetFrequency,
            0x02 => Opcode::SetSampleRate,
            0x03 => Opcode::SetGainMode,
            0x04 => Opcode::SetGain,
            0x05 => Opcode::SetFrequencyCorrection,
            0x06 => Opcode::SetIfGain,
            0x07 => Opcode::SetTestMode,
            0x08 => Opcode::SetAgcMode,
            0x09 => Opcode::SetDirectSampling,
            0x0a => Opcode::SetOffsetTuning,
            0x0b => Opcode::SetRtlXtal,
            0x0c => Opcode::SetTunerXtal,
            0x0d => Opcode::SetGainByIndex,
            0x0e => Opcode::SetBiasTee,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::SetFrequency => "set_frequency",
            Opcode::SetSampleRate => "set_sample_rate",
            Opcode::SetGainMode => "set_gain_mode",
            Opcode::SetGain => "set_gain",
            Opcode::SetFrequencyCorrection => "set_freq_correction",
            Opcode::SetIfGain => "set_if_gain",
            Opcode::SetTestMode => "set_test_mode",
            Opcode::SetAgcMode => "set_agc_mode",
            Opcode::SetDirectSampling => "set_direct_sampling",
            Opcode::SetOffsetTuning => "set_offset_tuning",
            Opcode::SetRtlXtal => "set_rtl_xtal",
            Opcode::SetTunerXtal => "set_tuner_xtal",
            Opcode::SetGainByIndex => "set_gain_by_index",
            Opcode::SetBiasTee => "set_bias_tee",
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Opcode::from_u8(byte).ok_or(ProtocolError::UnknownOpcode(byte))
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one independent piece of device state
///
/// Most opcodes control a single setting. IF gain is per stage, so each stage
/// is arbitrated separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControlKey {
    pub opcode: Opcode,
    pub stage: Option<u16>,
}

/// A command as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: Opcode,
    pub param: u32,
}

impl CommandFrame {
    pub fn new(opcode: Opcode, param: u32) -> Self {
        Self { opcode, param }
    }

    pub fn encode(&self) -> [u8; COMMAND_SIZE] {
        let mut out = [0u8; COMMAND_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.opcode.as_u8());
        buf.put_u32(self.param);
        out
    }

    /// Decode one frame; the opcode must be known
    pub fn decode(raw: [u8; COMMAND_SIZE]) -> Result<Self, ProtocolError> {
        let mut buf = &raw[..];
        let opcode = Opcode::try_from(buf.get_u8())?;
        let param = buf.get_u32();
        Ok(Self { opcode, param })
    }

    pub fn control_key(&self) -> ControlKey {
        let stage = match self.opcode {
            Opcode::SetIfGain => Some((self.param >> 16) as u16),
            _ => None,
        };
        ControlKey {
            opcode: self.opcode,
            stage,
        }
    }
}

impl std::fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.opcode, self.param)
    }
}

/// A decoded frame tagged with where and when it came from
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub frame: CommandFrame,
    pub origin: SessionId,
    pub received_at: Instant,
}

impl Command {
    pub fn new(frame: CommandFrame, origin: SessionId) -> Self {
        Self {
            frame,
            origin,
            received_at: Instant::now(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.frame.opcode
    }

    pub fn param(&self) -> u32 {
        self.frame.param
    }
}

/// Reassembles command frames from a client byte stream
///
/// Bytes are consumed on the 5-byte grid. A frame with an unknown opcode is
/// dropped whole so the stream stays aligned for the frames that follow.
#[derive(Debug, Default)]
pub struct CommandDecoder {
    buf: BytesMut,
}

impl CommandDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(COMMAND_SIZE * 16),
        }
    }

    /// Buffer for socket reads to append into
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, if any
    ///
    /// Returns `None` until 5 bytes are available.
    pub fn next_frame(&mut self) -> Option<Result<CommandFrame, ProtocolError>> {
        if self.buf.len() < COMMAND_SIZE {
            return None;
        }

        let mut raw = [0u8; COMMAND_SIZE];
        self.buf.copy_to_slice(&mut raw);
        Some(CommandFrame::decode(raw))
    }

    /// Bytes of an incomplete trailing frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Report a trailing partial frame when the stream ends
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        let remaining = self.buf.len();
        self.buf.clear();
        if remaining == 0 {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedFrame { remaining })
        }
    }
}

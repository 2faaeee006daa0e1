//! rtl_tcp wire protocol
//!
//! The server side of rtl_tcp speaks two things:
//!
//! ```text
//! server → client:  [12-byte dongle info header][raw IQ samples ...]
//! client → server:  [opcode:u8][param:u32 BE]  (repeated, 5 bytes each)
//! ```
//!
//! Samples are relayed without interpretation; only the header and the
//! command frames are decoded here.

pub mod command;
pub mod constants;
pub mod header;

pub use command::{Command, CommandDecoder, CommandFrame, ControlKey, Opcode};
pub use header::{DongleInfo, TunerType};

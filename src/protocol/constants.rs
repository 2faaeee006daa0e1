//! rtl_tcp protocol constants

/// Size of the dongle info header sent by the server on connect
pub const HEADER_SIZE: usize = 12;

/// Magic tag at the start of the header
pub const HEADER_MAGIC: [u8; 4] = *b"RTL0";

/// Size of a client command frame (1-byte opcode + 4-byte parameter)
pub const COMMAND_SIZE: usize = 5;

/// Default rtl_tcp port
pub const DEFAULT_PORT: u16 = 1234;

/// Default upstream read size
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default per-session queue capacity
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 16 * 1024 * 1024;

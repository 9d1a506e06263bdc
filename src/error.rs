use std::io;

use thiserror::Error;

/// The error taxonomy for the whole crate.
///
/// Variants map 1:1 onto the error kinds enumerated in the protocol design:
/// low-level wire errors are retried internally and only surface once a
/// retry budget is exhausted; high-level flash errors are never retried at
/// their own layer; dissector errors are reported per-artifact and never
/// abort a whole dump analysis.
#[derive(Error, Debug)]
pub enum Error {
    /// No valid frame arrived before the command/link deadline.
    #[error("timed out waiting for a response")]
    Timeout,

    /// Bytes kept arriving but never produced a valid frame before the
    /// channel ran dry.
    #[error("could not resynchronize to a valid frame before the channel was exhausted")]
    FrameResync,

    /// The session's current `ProtocolType` does not contain this
    /// (code, is_long) pair.
    #[error("command 0x{code:02X} (long={is_long}) is not supported by the current protocol")]
    Unsupported { code: u8, is_long: bool },

    /// `HAS_RESP_SAME` echo did not match the command payload slice.
    #[error("device echoed an unexpected payload")]
    WrongEcho,

    /// A declared length disagreed with the bytes actually received.
    #[error("expected {expected} bytes but received {actual}")]
    WrongLength { expected: usize, actual: usize },

    /// `flash_write_bytes` reported writing fewer bytes than requested.
    #[error("short write: wrote {written} of {requested} bytes")]
    ShortWrite { written: usize, requested: usize },

    /// A status-register write did not stick under its mask.
    #[error("status register write failed: wrote 0x{wrote:04X}, read back 0x{read:04X} (mask 0x{mask:04X})")]
    SrMismatch { wrote: u16, read: u16, mask: u16 },

    /// Chip-computed CRC disagreed with the host's running CRC after a
    /// program or verify pass.
    #[error("chip CRC 0x{chip:08X} does not match calculated CRC 0x{calculated:08X}")]
    ChipCrcMismatch { chip: u32, calculated: u32 },

    /// Verified erase found non-`0xFF` bytes after issuing the erase.
    #[error("erase verification failed at 0x{addr:06X}: flash is still protected")]
    EraseVerifyFailed { addr: u32 },

    /// A request violated sector alignment, partition bounds, or flash size.
    #[error("{0}")]
    LayoutViolation(String),

    /// An RBL header or payload CRC mismatched; reported, not fatal.
    #[error("{0}")]
    BadContainer(String),

    /// KV storage magic/checksum mismatch; fatal for the store, not the
    /// process.
    #[error("{0}")]
    CorruptStorage(String),

    /// The flash ID has no known entry in the status-register-size table.
    #[error("flash ID {0:02X?} is not a recognized JEDEC ID")]
    UnknownFlashId([u8; 3]),

    /// Flash size could not be determined by wraparound probing.
    #[error("could not detect flash size: no wraparound candidate matched")]
    NoWraparound,

    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

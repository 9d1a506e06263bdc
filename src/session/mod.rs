//! A BK72xx serial session: owns the transport and protocol engine, and
//! accumulates everything learned about the attached chip as capabilities
//! are used.
//!
//! The public surface is spread across `impl Session` blocks in sibling
//! modules (`chip`, `linking`, `flash_ll`, `flash_hl`) rather than built
//! from trait inheritance — each module contributes the operations it
//! owns to the same concrete type.

pub mod chip;
pub mod flash_hl;
pub mod flash_ll;
pub mod linking;

use std::time::Duration;

use log::Level;

use crate::proto::{Engine, Transport};
use chip::{BootloaderDescriptor, ChipType, ProtocolType};

/// How many times a failed 4K flash read is retried before giving up.
pub const DEFAULT_READ_RETRIES: u32 = 20;
/// How many times a failed 4K flash write/erase is retried. Kept low: flash
/// wears out.
pub const DEFAULT_WRITE_RETRIES: u32 = 3;
/// Assumed throughput of a `CheckCRC` sweep, used to size the read timeout
/// before issuing a large range check.
pub const DEFAULT_CRC_SPEED_BPS: u32 = 400_000;

#[derive(Debug, Clone, Copy)]
pub struct FlashParams {
    pub id: [u8; 3],
    pub manufacturer_id: u8,
    pub chip_id: u8,
    pub size_code: u8,
    pub size: u32,
}

pub struct Session<T: Transport> {
    pub(crate) engine: Engine<T>,
    /// Target baud rate to negotiate up to once linked.
    pub baudrate: u32,
    /// The port's actual current baud rate; starts at the link rate the
    /// port was opened at and follows `set_baudrate` thereafter.
    pub current_baudrate: u32,
    pub link_timeout: Duration,

    pub protocol_type: Option<ProtocolType>,
    pub chip_type: Option<ChipType>,
    pub bootloader: Option<&'static BootloaderDescriptor>,
    pub bk_boot_version: Option<String>,
    pub bk_chip_id: Option<u32>,

    pub flash_params: Option<FlashParams>,
    pub flash_id: Option<[u8; 3]>,
    pub flash_size: u32,
    pub crc_speed_bps: u32,

    pub read_retries: u32,
    pub write_retries: u32,

    /// Set once a verified erase has actually happened, so subsequent
    /// erases in the same programming run skip the (slow) readback check.
    pub flash_erase_checked: bool,
    /// Disabled only while probing for flash size, so probe reads aren't
    /// translated into the upper mirror the bootloader otherwise protects.
    pub boot_protection_bypass: bool,
}

impl<T: Transport> Session<T> {
    /// `link_baudrate` is the rate the port was already opened at (the
    /// bootloader's handshake rate); `baudrate` is the rate to switch to
    /// once linked.
    pub fn new(port: T, baudrate: u32, link_baudrate: u32, cmnd_timeout: Duration, link_timeout: Duration) -> Self {
        Session {
            engine: Engine::new(port, cmnd_timeout),
            baudrate,
            current_baudrate: link_baudrate,
            link_timeout,
            protocol_type: None,
            chip_type: None,
            bootloader: None,
            bk_boot_version: None,
            bk_chip_id: None,
            flash_params: None,
            flash_id: None,
            flash_size: 0,
            crc_speed_bps: DEFAULT_CRC_SPEED_BPS,
            read_retries: DEFAULT_READ_RETRIES,
            write_retries: DEFAULT_WRITE_RETRIES,
            flash_erase_checked: false,
            boot_protection_bypass: true,
        }
    }

    fn log(&self, level: Level, msg: std::fmt::Arguments) {
        log::log!(level, "{}", msg);
    }

    pub(crate) fn info(&self, args: std::fmt::Arguments) {
        self.log(Level::Info, args);
    }

    pub(crate) fn warn(&self, args: std::fmt::Arguments) {
        self.log(Level::Warn, args);
    }

    /// Returns the currently detected protocol, or `ProtocolType::Full` as
    /// a conservative default before a link has been established.
    pub(crate) fn require_protocol(&self, code: u8, is_long: bool) -> Result<(), crate::Error> {
        let protocol = self.protocol_type.unwrap_or(ProtocolType::Full);
        if protocol.supports(code, is_long) {
            Ok(())
        } else {
            Err(crate::Error::Unsupported { code, is_long })
        }
    }

    pub fn check_protocol(&self, code: u8, is_long: bool) -> bool {
        self.protocol_type
            .map(|p| p.supports(code, is_long))
            .unwrap_or(false)
    }

    /// Whether the current bootloader re-protects flash after every
    /// `CheckCRC`, requiring a `LinkCheck` to unlock it again.
    pub fn has_crc_flash_protect_lock(&self) -> bool {
        self.bootloader
            .map(|b| b.crc_flash_protect_lock)
            .unwrap_or(false)
    }
}

//! Chip, protocol and known-bootloader identification tables.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ChipType {
    Bk7231Q = 0x7231,
    Bk7231U = 0x0001,
    Bk7231T = 0x7231A,
    Bk7231N = 0x7231C,
    Bk7238 = 0x7238,
    Bk7252 = 0x7252,
}

/// A (opcode, is_long) pair identifying one supported command in a
/// [`ProtocolType`].
pub type OpcodePair = (u8, bool);

const SHORT: bool = false;
const LONG: bool = true;

/// The set of wire commands a bootloader actually understands.
///
/// Distinct BK72xx bootloader generations expose different subsets of the
/// opcode space; the session never sends a command its current protocol
/// does not list.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProtocolType {
    /// BK7231N BootROM protocol: the full opcode set, including registers.
    Full,
    /// Minimal opcode set exposed by Beken's own bootloaders.
    BasicBeken,
    /// Minimal opcode set exposed by Tuya's customized bootloaders.
    BasicTuya,
}

impl ProtocolType {
    pub const fn opcodes(self) -> &'static [OpcodePair] {
        match self {
            ProtocolType::Full => &[
                (0x00, SHORT),
                (0x01, SHORT),
                (0x03, SHORT),
                (0x0E, SHORT),
                (0x0F, SHORT),
                (0x10, SHORT),
                (0x70, SHORT),
                (0xAA, SHORT),
                (0x06, LONG),
                (0x07, LONG),
                (0x08, LONG),
                (0x09, LONG),
                (0x0A, LONG),
                (0x0B, LONG),
                (0x0C, LONG),
                (0x0D, LONG),
                (0x0E, LONG),
                (0x0F, LONG),
            ],
            ProtocolType::BasicBeken => &[
                (0x00, SHORT),
                (0x0E, SHORT),
                (0x0F, SHORT),
                (0x10, SHORT),
                (0x06, LONG),
                (0x07, LONG),
                (0x09, LONG),
                (0x0F, LONG),
            ],
            ProtocolType::BasicTuya => &[
                (0x00, SHORT),
                (0x0E, SHORT),
                (0x0F, SHORT),
                (0x10, SHORT),
                (0x11, SHORT),
                (0x06, LONG),
                (0x07, LONG),
                (0x09, LONG),
                (0x0F, LONG),
            ],
        }
    }

    /// Whether this protocol variant lists `(code, is_long)` as a supported
    /// command.
    pub fn supports(self, code: u8, is_long: bool) -> bool {
        self.opcodes().contains(&(code, is_long))
    }
}

/// A known bootloader build, fingerprinted by the CRC-32 of its first 256
/// (BK7231N: 257) bytes.
#[derive(Debug, Copy, Clone)]
pub struct BootloaderDescriptor {
    pub crc: u32,
    pub chip: ChipType,
    pub protocol: ProtocolType,
    pub version: Option<&'static str>,
    pub flash_size: u32,
    /// Set for bootloaders that re-protect flash after every `CheckCRC`; it
    /// can only be lifted again by a fresh `LinkCheck`.
    pub crc_flash_protect_lock: bool,
}

/// All bootloader builds known well enough to fingerprint by CRC.
pub const KNOWN_BOOTLOADERS: &[BootloaderDescriptor] = &[
    BootloaderDescriptor {
        crc: 0xE14191BA,
        chip: ChipType::Bk7231N,
        protocol: ProtocolType::Full,
        version: Some("1.0.1"),
        flash_size: 0,
        crc_flash_protect_lock: false,
    },
    BootloaderDescriptor {
        crc: 0xF0231EF6,
        chip: ChipType::Bk7231Q,
        protocol: ProtocolType::BasicBeken,
        version: None,
        flash_size: 0,
        crc_flash_protect_lock: true,
    },
    BootloaderDescriptor {
        crc: 0xFF5A3EAC,
        chip: ChipType::Bk7231Q,
        protocol: ProtocolType::BasicBeken,
        version: None,
        flash_size: 0,
        crc_flash_protect_lock: true,
    },
    BootloaderDescriptor {
        crc: 0xC1ECA871,
        chip: ChipType::Bk7231T,
        protocol: ProtocolType::BasicTuya,
        version: Some("1.0.1"),
        flash_size: 0x200_000,
        crc_flash_protect_lock: true,
    },
    BootloaderDescriptor {
        crc: 0x4B31E44D,
        chip: ChipType::Bk7231T,
        protocol: ProtocolType::BasicTuya,
        version: Some("1.0.3"),
        flash_size: 0x200_000,
        crc_flash_protect_lock: true,
    },
    BootloaderDescriptor {
        crc: 0xBA54C1B8,
        chip: ChipType::Bk7231T,
        protocol: ProtocolType::BasicTuya,
        version: Some("1.0.5"),
        flash_size: 0x200_000,
        crc_flash_protect_lock: true,
    },
    BootloaderDescriptor {
        crc: 0xE5CBC953,
        chip: ChipType::Bk7231T,
        protocol: ProtocolType::BasicTuya,
        version: Some("1.0.6"),
        flash_size: 0x200_000,
        crc_flash_protect_lock: true,
    },
    BootloaderDescriptor {
        crc: 0x2739019F,
        chip: ChipType::Bk7231U,
        protocol: ProtocolType::BasicBeken,
        version: Some("1.0.6"),
        flash_size: 0x200_000,
        crc_flash_protect_lock: true,
    },
    BootloaderDescriptor {
        crc: 0x39F9B50C,
        chip: ChipType::Bk7252,
        protocol: ProtocolType::BasicBeken,
        version: Some("0.1.3"),
        flash_size: 0,
        crc_flash_protect_lock: true,
    },
    BootloaderDescriptor {
        crc: 0xE3A27C26,
        chip: ChipType::Bk7252,
        protocol: ProtocolType::BasicBeken,
        version: None,
        flash_size: 0,
        crc_flash_protect_lock: true,
    },
];

/// Looks up a known bootloader by the CRC-32 fingerprint of its first
/// 256/257 bytes.
pub fn bootloader_by_crc(crc: u32) -> Option<&'static BootloaderDescriptor> {
    KNOWN_BOOTLOADERS.iter().find(|b| b.crc == crc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_find_known_bootloader_by_crc() {
        let descriptor = bootloader_by_crc(0xC1ECA871).unwrap();
        assert_eq!(descriptor.chip, ChipType::Bk7231T);
        assert_eq!(descriptor.version, Some("1.0.1"));
    }

    #[test]
    fn it_should_return_none_for_unknown_crc() {
        assert!(bootloader_by_crc(0xDEAD_BEEF).is_none());
    }

    #[test]
    fn it_should_restrict_basic_protocols_to_their_opcode_set() {
        assert!(ProtocolType::BasicBeken.supports(0x00, false));
        assert!(!ProtocolType::BasicBeken.supports(0x03, false));
        assert!(ProtocolType::Full.supports(0x03, false));
    }
}

//! Wire packets for the BK72xx serial ISP protocol.
//!
//! Every request is a small struct implementing [`Command`]; every
//! response, one implementing [`Response`]. Framing (preamble, length,
//! long/short distinction) is handled once by [`crate::proto::engine`] —
//! these types only know how to serialize/deserialize their own payload.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::Error;

pub const CMND_PREAMBLE: [u8; 3] = [0x01, 0xE0, 0xFC];
pub const CMND_LONG: [u8; 2] = [0xFF, 0xF4];
pub const RESP_PREAMBLE: [u8; 2] = [0x04, 0x0E];
pub const RESP_DATA: [u8; 3] = [0x01, 0xE0, 0xFC];
pub const RESP_LONG: u8 = 0xF4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum EraseSize {
    Sector4K = 0x20,
    Block64K = 0xD8,
}

/// A request packet: knows its opcode, whether it rides the "long" framing,
/// and how to serialize its own body.
pub trait Command {
    /// The packet opcode, shared by the matching response.
    const CODE: u8;
    /// Whether this command uses the long (`FF F4` + u16 length) framing.
    const IS_LONG: bool;

    /// Serializes the command-specific payload (without preamble/length/code).
    fn payload(&self) -> Vec<u8>;

    /// Byte range of `payload()` that the response is expected to echo back,
    /// if this command's response shares its own `HAS_RESP_SAME` framing.
    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        None
    }
}

/// A response packet, decoded from the payload bytes the engine extracted
/// after validating framing and opcode.
pub trait Response: Sized {
    const CODE: u8;

    fn decode(data: &[u8]) -> Result<Self, Error>;
}

fn require_len(data: &[u8], expected: usize) -> Result<(), Error> {
    if data.len() != expected {
        return Err(Error::WrongLength {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

// -- LinkCheck ---------------------------------------------------------

pub struct LinkCheckCmnd;

impl Command for LinkCheckCmnd {
    const CODE: u8 = 0x00;
    const IS_LONG: bool = false;

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }
}

pub struct LinkCheckResp {
    pub value: u8,
}

impl Response for LinkCheckResp {
    const CODE: u8 = 0x01;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 1)?;
        Ok(LinkCheckResp { value: data[0] })
    }
}

// -- WriteReg ------------------------------------------------------------

pub struct WriteRegCmnd {
    pub address: u32,
    pub value: u32,
}

impl Command for WriteRegCmnd {
    const CODE: u8 = 0x01;
    const IS_LONG: bool = false;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        LittleEndian::write_u32(&mut buf[0..4], self.address);
        LittleEndian::write_u32(&mut buf[4..8], self.value);
        buf
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(0..8)
    }
}

pub struct WriteRegResp {
    pub address: u32,
    pub value: u32,
}

impl Response for WriteRegResp {
    const CODE: u8 = 0x01;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 8)?;
        Ok(WriteRegResp {
            address: LittleEndian::read_u32(&data[0..4]),
            value: LittleEndian::read_u32(&data[4..8]),
        })
    }
}

// -- ReadReg ---------------------------------------------------------------

pub struct ReadRegCmnd {
    pub address: u32,
}

impl Command for ReadRegCmnd {
    const CODE: u8 = 0x03;
    const IS_LONG: bool = false;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4];
        LittleEndian::write_u32(&mut buf, self.address);
        buf
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(0..4)
    }
}

pub struct ReadRegResp {
    pub address: u32,
    pub value: u32,
}

impl Response for ReadRegResp {
    const CODE: u8 = 0x03;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 8)?;
        Ok(ReadRegResp {
            address: LittleEndian::read_u32(&data[0..4]),
            value: LittleEndian::read_u32(&data[4..8]),
        })
    }
}

// -- Reboot ----------------------------------------------------------------

pub struct RebootCmnd {
    pub value: u8,
}

impl Command for RebootCmnd {
    const CODE: u8 = 0x0E;
    const IS_LONG: bool = false;

    fn payload(&self) -> Vec<u8> {
        vec![self.value]
    }
}

// -- SetBaudRate -------------------------------------------------------------

pub struct SetBaudRateCmnd {
    pub baudrate: u32,
    pub delay_ms: u8,
}

impl Command for SetBaudRateCmnd {
    const CODE: u8 = 0x0F;
    const IS_LONG: bool = false;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 5];
        LittleEndian::write_u32(&mut buf[0..4], self.baudrate);
        buf[4] = self.delay_ms;
        buf
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(0..5)
    }
}

// -- CheckCrc ----------------------------------------------------------------

pub struct CheckCrcCmnd {
    pub start: u32,
    pub end: u32,
}

impl Command for CheckCrcCmnd {
    const CODE: u8 = 0x10;
    const IS_LONG: bool = false;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 8];
        LittleEndian::write_u32(&mut buf[0..4], self.start);
        LittleEndian::write_u32(&mut buf[4..8], self.end);
        buf
    }
}

pub struct CheckCrcResp {
    pub crc32: u32,
}

impl Response for CheckCrcResp {
    const CODE: u8 = 0x10;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 4)?;
        Ok(CheckCrcResp {
            crc32: LittleEndian::read_u32(data),
        })
    }
}

// -- ReadBootVersion ---------------------------------------------------------

pub struct BootVersionCmnd;

impl Command for BootVersionCmnd {
    const CODE: u8 = 0x11;
    const IS_LONG: bool = false;

    fn payload(&self) -> Vec<u8> {
        Vec::new()
    }
}

pub struct BootVersionResp {
    pub version: Vec<u8>,
}

impl Response for BootVersionResp {
    const CODE: u8 = 0x11;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        Ok(BootVersionResp {
            version: data.to_vec(),
        })
    }
}

// -- FlashWrite (<=256 bytes, unaligned) -------------------------------------

pub struct FlashWriteCmnd {
    pub start: u32,
    pub data: Vec<u8>,
}

impl Command for FlashWriteCmnd {
    const CODE: u8 = 0x06;
    const IS_LONG: bool = true;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4 + self.data.len()];
        LittleEndian::write_u32(&mut buf[0..4], self.start);
        buf[4..].copy_from_slice(&self.data);
        buf
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(1..5)
    }
}

pub struct FlashWriteResp {
    pub status: u8,
    pub start: u32,
    pub written: u8,
}

impl Response for FlashWriteResp {
    const CODE: u8 = 0x06;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 6)?;
        Ok(FlashWriteResp {
            status: data[0],
            start: LittleEndian::read_u32(&data[1..5]),
            written: data[5],
        })
    }
}

// -- FlashWrite4K -------------------------------------------------------------

pub struct FlashWrite4KCmnd {
    pub start: u32,
    pub data: [u8; 4096],
}

impl Command for FlashWrite4KCmnd {
    const CODE: u8 = 0x07;
    const IS_LONG: bool = true;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4 + self.data.len()];
        LittleEndian::write_u32(&mut buf[0..4], self.start);
        buf[4..].copy_from_slice(&self.data);
        buf
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(1..5)
    }
}

pub struct FlashWrite4KResp {
    pub status: u8,
    pub start: u32,
}

impl Response for FlashWrite4KResp {
    const CODE: u8 = 0x07;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 5)?;
        Ok(FlashWrite4KResp {
            status: data[0],
            start: LittleEndian::read_u32(&data[1..5]),
        })
    }
}

// -- FlashRead4K --------------------------------------------------------------

pub struct FlashRead4KCmnd {
    pub start: u32,
}

impl Command for FlashRead4KCmnd {
    const CODE: u8 = 0x09;
    const IS_LONG: bool = true;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4];
        LittleEndian::write_u32(&mut buf, self.start);
        buf
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(1..5)
    }
}

pub struct FlashRead4KResp {
    pub status: u8,
    pub start: u32,
    pub data: Vec<u8>,
}

impl Response for FlashRead4KResp {
    const CODE: u8 = 0x09;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 5 {
            return Err(Error::WrongLength {
                expected: 5,
                actual: data.len(),
            });
        }
        Ok(FlashRead4KResp {
            status: data[0],
            start: LittleEndian::read_u32(&data[1..5]),
            data: data[5..].to_vec(),
        })
    }
}

// -- Flash status register (8-bit) -------------------------------------------

pub struct FlashReg8ReadCmnd {
    pub cmd: u8,
}

impl Command for FlashReg8ReadCmnd {
    const CODE: u8 = 0x0C;
    const IS_LONG: bool = true;

    fn payload(&self) -> Vec<u8> {
        vec![self.cmd]
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(1..2)
    }
}

pub struct FlashReg8ReadResp {
    pub status: u8,
    pub cmd: u8,
    pub data0: u8,
}

impl Response for FlashReg8ReadResp {
    const CODE: u8 = 0x0C;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 3)?;
        Ok(FlashReg8ReadResp {
            status: data[0],
            cmd: data[1],
            data0: data[2],
        })
    }
}

pub struct FlashReg8WriteCmnd {
    pub cmd: u8,
    pub data: u8,
}

impl Command for FlashReg8WriteCmnd {
    const CODE: u8 = 0x0D;
    const IS_LONG: bool = true;

    fn payload(&self) -> Vec<u8> {
        vec![self.cmd, self.data]
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(1..3)
    }
}

pub struct FlashReg8WriteResp {
    pub status: u8,
    pub cmd: u8,
    pub data: u8,
}

impl Response for FlashReg8WriteResp {
    const CODE: u8 = 0x0D;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 3)?;
        Ok(FlashReg8WriteResp {
            status: data[0],
            cmd: data[1],
            data: data[2],
        })
    }
}

pub struct FlashReg16WriteCmnd {
    pub cmd: u8,
    pub data: u16,
}

impl Command for FlashReg16WriteCmnd {
    const CODE: u8 = 0x0D;
    const IS_LONG: bool = true;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 3];
        buf[0] = self.cmd;
        LittleEndian::write_u16(&mut buf[1..3], self.data);
        buf
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(1..4)
    }
}

pub struct FlashReg16WriteResp {
    pub status: u8,
    pub cmd: u8,
    pub data: u16,
}

impl Response for FlashReg16WriteResp {
    const CODE: u8 = 0x0D;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        require_len(data, 4)?;
        Ok(FlashReg16WriteResp {
            status: data[0],
            cmd: data[1],
            data: LittleEndian::read_u16(&data[2..4]),
        })
    }
}

// -- FlashGetMID (24-bit JEDEC ID read) ---------------------------------------

pub struct FlashReg24ReadCmnd {
    pub cmd: u32,
}

impl Command for FlashReg24ReadCmnd {
    const CODE: u8 = 0x0E;
    const IS_LONG: bool = true;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 4];
        LittleEndian::write_u32(&mut buf, self.cmd);
        buf
    }
}

pub struct FlashReg24ReadResp {
    pub status: u8,
    pub data0: u8,
    pub data1: u8,
    pub data2: u8,
}

impl Response for FlashReg24ReadResp {
    const CODE: u8 = 0x0E;

    fn decode(data: &[u8]) -> Result<Self, Error> {
        // wire format is `<BxBBB`: status, pad byte, then 3 ID bytes.
        require_len(data, 5)?;
        Ok(FlashReg24ReadResp {
            status: data[0],
            data0: data[2],
            data1: data[3],
            data2: data[4],
        })
    }
}

// -- FlashErase ----------------------------------------------------------------

pub struct FlashEraseBlockCmnd {
    pub erase_size: EraseSize,
    pub start: u32,
}

impl Command for FlashEraseBlockCmnd {
    const CODE: u8 = 0x0F;
    const IS_LONG: bool = true;

    fn payload(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 5];
        buf[0] = self.erase_size as u8;
        LittleEndian::write_u32(&mut buf[1..5], self.start);
        buf
    }

    fn echo_range(&self) -> Option<std::ops::Range<usize>> {
        Some(1..6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_should_encode_write_reg_payload_little_endian() {
        let cmd = WriteRegCmnd {
            address: 0x800000,
            value: 0x1234,
        };
        let payload = cmd.payload();
        assert_eq!(&payload[0..4], &0x800000u32.to_le_bytes());
        assert_eq!(&payload[4..8], &0x1234u32.to_le_bytes());
    }

    #[test]
    fn it_should_decode_check_crc_response() {
        let resp = CheckCrcResp::decode(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        assert_eq!(resp.crc32, 0xDEADBEEF);
    }

    #[test]
    fn it_should_reject_wrong_length_response() {
        let err = CheckCrcResp::decode(&[0, 1]).unwrap_err();
        assert!(matches!(err, Error::WrongLength { .. }));
    }

    #[test]
    fn it_should_decode_mid_response_skipping_pad_byte() {
        let resp = FlashReg24ReadResp::decode(&[0x00, 0xAA, 0xC8, 0x40, 0x16]).unwrap();
        assert_eq!((resp.data0, resp.data1, resp.data2), (0xC8, 0x40, 0x16));
    }
}

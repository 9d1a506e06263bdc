use crate::codec::crc32;
use crate::error::Error;
use crate::proto::packet::{
    CheckCrcCmnd, CheckCrcResp, EraseSize, FlashEraseBlockCmnd, FlashReg24ReadCmnd, FlashReg24ReadResp,
    FlashReg8ReadCmnd, FlashReg8ReadResp, FlashReg8WriteCmnd, FlashReg8WriteResp, FlashReg16WriteCmnd,
    FlashReg16WriteResp, ReadRegCmnd, ReadRegResp, RebootCmnd, WriteRegCmnd, WriteRegResp,
};
use crate::proto::Transport;

use super::{FlashParams, Session};

/// CRC-32 of a 4K block whose content is entirely `0xFF` — what a
/// successfully erased sector reads back as.
pub const CRC32_FF_4K: u32 = 0xF154_670A;

impl<T: Transport> Session<T> {
    /// Translates a logical flash address into the bus address the
    /// bootloader expects, mapping into its boot-protection mirror once the
    /// flash size is known.
    pub fn fix_addr(&self, addr: u32) -> u32 {
        if self.flash_size == 0 {
            return addr;
        }
        (addr & 0x1F_FFFF) | 0x20_0000
    }

    pub fn reboot_chip(&mut self) -> Result<(), Error> {
        self.engine.send(&RebootCmnd { value: 0xA5 })
    }

    pub fn register_read(&mut self, address: u32) -> Result<u32, Error> {
        let resp: ReadRegResp = self.engine.command(&ReadRegCmnd { address })?;
        Ok(resp.value)
    }

    pub fn register_write(&mut self, address: u32, value: u32) -> Result<(), Error> {
        let _: WriteRegResp = self.engine.command(&WriteRegCmnd { address, value })?;
        Ok(())
    }

    /// Asks the chip to compute the CRC-32 of `[start, end)` and returns it
    /// un-finalized-XORed back to the standard convention.
    pub fn read_flash_range_crc(&mut self, start: u32, end: u32) -> Result<u32, Error> {
        let mut start = self.fix_addr(start);
        let mut end = self.fix_addr(end);
        if end == 0x20_0000 {
            end += 0x20_0000;
        }
        if start == end {
            return Err(Error::LayoutViolation("start and end must differ".into()));
        }
        if start > end {
            return Err(Error::LayoutViolation("start must be less than end".into()));
        }

        let minimum_secs = (end - start) as f64 / self.crc_speed_bps as f64;
        let current = self.engine.cmnd_timeout;
        if minimum_secs > current.as_secs_f64() {
            let secs = minimum_secs.ceil() as u64;
            self.warn(format_args!(
                "current command timeout of {:?} is too low for reading {} byte(s) CRC, increasing to {}s",
                current,
                end - start,
                secs
            ));
            self.engine.cmnd_timeout = std::time::Duration::from_secs(secs);
        }

        // BK7231N additionally counts the end offset itself.
        if matches!(self.protocol_type, Some(super::chip::ProtocolType::Full)) {
            end -= 1;
        }
        let resp: CheckCrcResp = self.engine.command(&CheckCrcCmnd { start, end })?;
        self.engine.cmnd_timeout = current;
        let _ = start;
        Ok(resp.crc32 ^ 0xFFFF_FFFF)
    }

    pub fn check_crc(&mut self, start: u32, data: &[u8]) -> Result<(), Error> {
        let chip = self.read_flash_range_crc(start, start + data.len() as u32)?;
        let calculated = crc32(data);
        if chip != calculated {
            return Err(Error::ChipCrcMismatch { chip, calculated });
        }
        Ok(())
    }

    pub fn flash_read_reg8(&mut self, cmd: u8) -> Result<u8, Error> {
        let resp: FlashReg8ReadResp = self.engine.command(&FlashReg8ReadCmnd { cmd })?;
        Ok(resp.data0)
    }

    pub fn flash_write_reg8(&mut self, cmd: u8, data: u8) -> Result<bool, Error> {
        let resp: FlashReg8WriteResp = self.engine.command(&FlashReg8WriteCmnd { cmd, data })?;
        Ok(resp.data == data)
    }

    pub fn flash_write_reg16(&mut self, cmd: u8, data: u16) -> Result<bool, Error> {
        let resp: FlashReg16WriteResp = self.engine.command(&FlashReg16WriteCmnd { cmd, data })?;
        Ok(resp.data == data)
    }

    pub fn flash_read_reg24(&mut self, cmd: u32) -> Result<(u8, u8, u8), Error> {
        let resp: FlashReg24ReadResp = self.engine.command(&FlashReg24ReadCmnd { cmd })?;
        Ok((resp.data0, resp.data1, resp.data2))
    }

    pub fn flash_read_sr(&mut self, size: u8) -> Result<u16, Error> {
        let mut sr = self.flash_read_reg8(0x05)? as u16;
        if size == 2 {
            sr |= (self.flash_read_reg8(0x35)? as u16) << 8;
        }
        Ok(sr)
    }

    pub fn flash_write_sr(&mut self, sr: u16, size: u8, mask: u16) -> Result<(), Error> {
        if size == 1 {
            self.flash_write_reg8(0x01, sr as u8)?;
        } else {
            self.flash_write_reg16(0x01, sr)?;
        }
        let read_back = self.flash_read_sr(size)?;
        if (sr & mask) != (read_back & mask) {
            return Err(Error::SrMismatch {
                wrote: sr,
                read: read_back,
                mask,
            });
        }
        Ok(())
    }

    pub fn flash_read_id(&mut self) -> Result<FlashParams, Error> {
        if self.flash_id.is_none() {
            let (a, b, c) = self.flash_read_reg24(0x9F)?;
            self.flash_id = Some([a, b, c]);
        }
        let id = self.flash_id.unwrap();
        let params = FlashParams {
            id,
            manufacturer_id: id[0],
            chip_id: id[1],
            size_code: id[2],
            size: 1u32 << id[2],
        };
        self.flash_params = Some(params);
        Ok(params)
    }

    pub fn flash_erase_block(&mut self, start: u32, size: EraseSize) -> Result<(), Error> {
        let do_erase = |session: &mut Self| -> Result<(), Error> {
            session
                .engine
                .command_ack(&FlashEraseBlockCmnd { erase_size: size, start })
        };

        let mut attempt = 0u32;
        loop {
            let result = if !self.flash_erase_checked {
                if size != EraseSize::Sector4K {
                    self.warn(format_args!("cannot verify erasing in 64K block mode"));
                    do_erase(self)
                } else {
                    self.erase_verified(start, do_erase)
                }
            } else {
                do_erase(self)
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.warn(format_args!(
                        "erasing failure @ 0x{:06X} ({}), retrying (attempt {})",
                        start, e, attempt
                    ));
                    attempt += 1;
                    if attempt > self.write_retries {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn erase_verified(
        &mut self,
        start: u32,
        do_erase: impl Fn(&mut Self) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let pre = self.read_flash_range_crc(start, start + 0x1000)?;
        if pre == CRC32_FF_4K {
            self.info(format_args!("deferring, block @ 0x{:06X} is already erased", start));
            return Ok(());
        }
        do_erase(self)?;
        let post = self.read_flash_range_crc(start, start + 0x1000)?;
        if post != CRC32_FF_4K {
            return Err(Error::EraseVerifyFailed { addr: start });
        }
        self.flash_erase_checked = true;
        Ok(())
    }
}

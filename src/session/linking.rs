use std::time::{Duration, Instant};

use crate::codec::crc32;
use crate::error::Error;
use crate::proto::packet::{BootVersionCmnd, BootVersionResp, LinkCheckCmnd, LinkCheckResp, SetBaudRateCmnd};
use crate::proto::Transport;

use super::chip::{bootloader_by_crc, ChipType, ProtocolType};
use super::Session;

impl<T: Transport> Session<T> {
    /// Establishes a link, negotiates the working baud rate, fingerprints
    /// the bootloader, and determines the flash size.
    pub fn connect(&mut self) -> Result<(), Error> {
        if !self.wait_for_link(self.link_timeout)? {
            return Err(Error::Timeout);
        }
        if self.current_baudrate != self.baudrate {
            self.set_baudrate(self.baudrate)?;
        }
        self.detect_chip()?;

        if self.flash_read_id().is_err() {
            // not every bootloader answers CMD_FlashGetMID.
        }
        if self.flash_size == 0 {
            if let Some(params) = self.flash_params {
                self.flash_size = params.size;
            }
        }
        if self.flash_size == 0 {
            if let Some(bootloader) = self.bootloader {
                self.flash_size = bootloader.flash_size;
            }
        }
        if self.flash_size == 0 {
            self.flash_size = self.flash_detect_size()?;
        }
        Ok(())
    }

    /// Repeatedly issues `LinkCheck` until the chip answers with `value ==
    /// 0`, or `timeout` elapses.
    pub fn wait_for_link(&mut self, timeout: Duration) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        let prev_timeout = self.engine.cmnd_timeout;
        self.engine.cmnd_timeout = Duration::from_millis(5);

        let mut connected = false;
        while Instant::now() < deadline {
            match self.engine.command::<LinkCheckCmnd, LinkCheckResp>(&LinkCheckCmnd) {
                Ok(resp) if resp.value == 0 => {
                    connected = true;
                    break;
                }
                _ => continue,
            }
        }

        self.engine.drain()?;
        self.engine.cmnd_timeout = prev_timeout;
        Ok(connected)
    }

    /// Tells the chip to switch baud rates, then switches the host side to
    /// match once the chip's own delay has elapsed.
    pub fn set_baudrate(&mut self, baudrate: u32) -> Result<(), Error> {
        let delay_ms = 20u8;
        let cmd = SetBaudRateCmnd { baudrate, delay_ms };
        self.engine.command_ack_with(&cmd, |engine| {
            std::thread::sleep(Duration::from_millis(delay_ms as u64 / 2));
            let _ = engine.port().set_baud_rate(baudrate);
        })?;
        self.baudrate = baudrate;
        self.current_baudrate = baudrate;
        Ok(())
    }

    /// Fingerprints the attached bootloader by the CRC-32 of its first 256
    /// (BK7231N: 257) bytes, falling back to guessing the chip family from
    /// that same CRC against both conventions if it's unrecognized.
    pub fn detect_chip(&mut self) -> Result<(), Error> {
        let crc = self.read_flash_range_crc(0, 256)?;
        if let Some(bootloader) = bootloader_by_crc(crc) {
            self.bootloader = Some(bootloader);
            self.protocol_type = Some(bootloader.protocol);
            self.chip_type = Some(bootloader.chip);
        } else {
            let data = self.flash_read_bytes(0, 257, false)?;
            if crc == crc32(&data[0..257]) {
                self.protocol_type = Some(ProtocolType::Full);
                self.chip_type = Some(ChipType::Bk7231N);
            } else if crc == crc32(&data[0..256]) {
                self.protocol_type = Some(ProtocolType::BasicBeken);
                self.chip_type = None;
            } else {
                return Err(Error::ChipCrcMismatch {
                    chip: crc,
                    calculated: crc32(&data[0..256]),
                });
            }
        }

        if self.check_protocol(0x11, false) {
            let resp: BootVersionResp = self.engine.command(&BootVersionCmnd)?;
            if resp.version != [0x07] {
                let text = String::from_utf8_lossy(&resp.version);
                let trimmed = text.trim_matches(|c| c == '\u{0}' || c == ' ');
                self.bk_boot_version = Some(trimmed.to_string());
            }
        }
        if self.check_protocol(0x03, false) {
            self.bk_chip_id = Some(self.register_read(0x800000)?);
        }
        Ok(())
    }
}

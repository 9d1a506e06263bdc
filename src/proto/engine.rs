//! Framing, resynchronization and retry logic for the BK72xx serial ISP
//! protocol.
//!
//! [`Engine::command`] and [`Engine::command_ack`] implement the same
//! "scan for a valid frame, give up only once the deadline passes" dance
//! as the rest of the protocol: noise on the wire (stray bytes, partial
//! frames from a previous attempt) never aborts a command outright, it
//! just costs another lap around the resync loop.

use std::io::{self, Read, Write};
use std::ops::Range;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::Error;
use crate::proto::packet::{Command, Response, CMND_LONG, CMND_PREAMBLE, RESP_DATA, RESP_LONG, RESP_PREAMBLE};

/// A serial port, or anything that looks enough like one to drive the
/// protocol: a duplex byte stream plus the ability to change its own baud
/// rate and toggle RTS/DTR for a hardware reset.
pub trait Transport: Read + Write {
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), serialport::Error>;
    fn write_request_to_send(&mut self, level: bool) -> Result<(), serialport::Error>;
    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), serialport::Error>;
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), serialport::Error>;
    fn bytes_to_read(&self) -> Result<u32, serialport::Error>;
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), serialport::Error> {
        serialport::SerialPort::set_baud_rate(self.as_mut(), baud_rate)
    }

    fn write_request_to_send(&mut self, level: bool) -> Result<(), serialport::Error> {
        serialport::SerialPort::write_request_to_send(self.as_mut(), level)
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), serialport::Error> {
        serialport::SerialPort::write_data_terminal_ready(self.as_mut(), level)
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), serialport::Error> {
        serialport::SerialPort::set_timeout(self.as_mut(), timeout)
    }

    fn bytes_to_read(&self) -> Result<u32, serialport::Error> {
        serialport::SerialPort::bytes_to_read(self.as_ref())
    }
}

/// Drives the wire protocol over a [`Transport`].
pub struct Engine<T: Transport> {
    port: T,
    /// Upper bound on a single `command()` round trip, including resync
    /// attempts.
    pub cmnd_timeout: Duration,
}

impl<T: Transport> Engine<T> {
    pub fn new(port: T, cmnd_timeout: Duration) -> Self {
        Engine { port, cmnd_timeout }
    }

    pub fn port(&mut self) -> &mut T {
        &mut self.port
    }

    /// Toggles RTS/DTR to reset the target into its bootloader, the same
    /// sequence used by standalone flashing tools for this chip family.
    pub fn hw_reset(&mut self) -> Result<(), Error> {
        self.port.write_request_to_send(true)?;
        self.port.write_data_terminal_ready(true)?;
        std::thread::sleep(Duration::from_millis(100));
        self.port.write_request_to_send(false)?;
        self.port.write_data_terminal_ready(false)?;
        Ok(())
    }

    /// Discards whatever is sitting in the input buffer.
    pub fn drain(&mut self) -> Result<(), Error> {
        let prev = self.cmnd_timeout;
        self.port.set_timeout(Duration::from_millis(1))?;
        let mut buf = [0u8; 1024];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        self.port.set_timeout(prev)?;
        Ok(())
    }

    fn encode<C: Command>(cmd: &C) -> Vec<u8> {
        let data = cmd.payload();
        let size = data.len() + 1;
        let mut out = Vec::with_capacity(size + 6);
        out.extend_from_slice(&CMND_PREAMBLE);
        if size >= 0xFF || C::IS_LONG {
            out.extend_from_slice(&CMND_LONG);
            out.extend_from_slice(&(size as u16).to_le_bytes());
        } else {
            out.push(size as u8);
        }
        out.push(C::CODE);
        out.extend_from_slice(&data);
        out
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        trace!("TX: {:02x?}", frame);
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, deadline: Instant) -> Result<u8, Error> {
        if Instant::now() > deadline {
            return Err(Error::FrameResync);
        }
        let mut buf = [0u8; 1];
        match self.port.read_exact(&mut buf) {
            Ok(()) => Ok(buf[0]),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::FrameResync),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Reads bytes one at a time until the trailing window matches `needle`,
    /// or the deadline passes.
    fn read_until(&mut self, needle: &[u8], deadline: Instant) -> Result<(), Error> {
        let mut window = vec![0u8; needle.len()];
        loop {
            let byte = self.read_byte(deadline)?;
            window.remove(0);
            window.push(byte);
            if window == needle {
                return Ok(());
            }
        }
    }

    fn read_exact_bytes(&mut self, count: usize, deadline: Instant) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            buf[filled] = self.read_byte(deadline)?;
            filled += 1;
        }
        Ok(buf)
    }

    /// Scans the wire for a response frame addressed to `C::CODE`,
    /// returning the body bytes (status/echo/data, with preamble, length
    /// and opcode already stripped).
    fn read_response_frame(&mut self, is_long: bool, response_code: u8) -> Result<Vec<u8>, Error> {
        let deadline = Instant::now() + self.cmnd_timeout;
        loop {
            self.read_until(&RESP_PREAMBLE, deadline)?;

            let size_byte = self.read_byte(deadline)?;
            if is_long != (size_byte == 0xFF) {
                continue;
            }

            if self.read_until(&RESP_DATA, deadline).is_err() {
                continue;
            }

            let (mut size, code) = if is_long {
                if self.read_until(&[RESP_LONG], deadline).is_err() {
                    continue;
                }
                let header = self.read_exact_bytes(3, deadline)?;
                let size = u16::from_le_bytes([header[0], header[1]]) as usize;
                (size.saturating_sub(1), header[2])
            } else {
                let code = self.read_byte(deadline)?;
                (size_byte as usize, code)
            };
            if !is_long {
                // short frames: size includes code + the 3-byte RESP_DATA marker.
                size = size.saturating_sub(4);
            }

            if code != response_code {
                continue;
            }

            debug!("RX: frame for code 0x{:02X}, {} body byte(s)", code, size);
            return self.read_exact_bytes(size, deadline);
        }
    }

    fn verify_echo<C: Command>(cmd: &C, body: &[u8]) -> Result<(), Error> {
        if let Some(range) = cmd.echo_range() {
            let Range { start, end } = range;
            if body.len() < end {
                return Err(Error::WrongLength {
                    expected: end,
                    actual: body.len(),
                });
            }
            let payload = cmd.payload();
            let check_len = end - start;
            if payload.len() < check_len || body[start..end] != payload[..check_len] {
                return Err(Error::WrongEcho);
            }
        }
        Ok(())
    }

    /// Sends `cmd` and does not wait for any reply (e.g. reboot).
    pub fn send<C: Command>(&mut self, cmd: &C) -> Result<(), Error> {
        let frame = Self::encode(cmd);
        self.write_frame(&frame)
    }

    /// Sends `cmd`, waits for its echoed-payload acknowledgement, but does
    /// not decode a distinct response payload.
    pub fn command_ack<C: Command>(&mut self, cmd: &C) -> Result<(), Error> {
        let frame = Self::encode(cmd);
        self.write_frame(&frame)?;
        let body = self.read_response_frame(C::IS_LONG, C::CODE)?;
        Self::verify_echo(cmd, &body)
    }

    /// Sends `cmd`, waits for its reply, verifies any echoed payload, and
    /// decodes the reply as `R`.
    pub fn command<C: Command, R: Response>(&mut self, cmd: &C) -> Result<R, Error> {
        let frame = Self::encode(cmd);
        self.write_frame(&frame)?;
        let body = self.read_response_frame(C::IS_LONG, R::CODE)?;
        Self::verify_echo(cmd, &body)?;
        R::decode(&body)
    }

    /// Sends `cmd` and, before waiting for the reply, runs `after_send`.
    /// Used for `SetBaudRate`, whose reply only arrives after the host
    /// itself switches baud rates mid-flight.
    pub fn command_ack_with<C: Command>(
        &mut self,
        cmd: &C,
        after_send: impl FnOnce(&mut Self),
    ) -> Result<(), Error> {
        let frame = Self::encode(cmd);
        self.write_frame(&frame)?;
        after_send(self);
        let body = self.read_response_frame(C::IS_LONG, C::CODE)?;
        Self::verify_echo(cmd, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::packet::{LinkCheckCmnd, LinkCheckResp, WriteRegCmnd};
    use std::collections::VecDeque;

    struct MockTransport {
        inbound: VecDeque<u8>,
        outbound: Vec<u8>,
        baud: u32,
    }

    impl MockTransport {
        fn new(inbound: Vec<u8>) -> Self {
            MockTransport {
                inbound: inbound.into(),
                outbound: Vec::new(),
                baud: 115200,
            }
        }
    }

    impl Read for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inbound.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let mut n = 0;
            while n < buf.len() {
                match self.inbound.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }
    }

    impl Write for MockTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for MockTransport {
        fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), serialport::Error> {
            self.baud = baud_rate;
            Ok(())
        }

        fn write_request_to_send(&mut self, _level: bool) -> Result<(), serialport::Error> {
            Ok(())
        }

        fn write_data_terminal_ready(&mut self, _level: bool) -> Result<(), serialport::Error> {
            Ok(())
        }

        fn set_timeout(&mut self, _timeout: Duration) -> Result<(), serialport::Error> {
            Ok(())
        }

        fn bytes_to_read(&self) -> Result<u32, serialport::Error> {
            Ok(self.inbound.len() as u32)
        }
    }

    #[test]
    fn it_should_decode_link_check_response() {
        let mut frame = vec![0x04, 0x0E, 0x05, 0x01, 0xE0, 0xFC, 0x01, 0x00];
        // leading noise byte should be skipped by the resync scan.
        frame.insert(0, 0xAA);
        let transport = MockTransport::new(frame);
        let mut engine = Engine::new(transport, Duration::from_millis(200));
        let resp: LinkCheckResp = engine.command(&LinkCheckCmnd).unwrap();
        assert_eq!(resp.value, 0);
    }

    #[test]
    fn it_should_verify_write_reg_echo() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x800000u32.to_le_bytes());
        body.extend_from_slice(&0x1234u32.to_le_bytes());
        let mut frame = vec![0x04, 0x0E];
        frame.push((body.len() + 4) as u8);
        frame.extend_from_slice(&RESP_DATA);
        frame.push(0x01);
        frame.extend_from_slice(&body);

        let transport = MockTransport::new(frame);
        let mut engine = Engine::new(transport, Duration::from_millis(200));
        let cmd = WriteRegCmnd {
            address: 0x800000,
            value: 0x1234,
        };
        let resp: crate::proto::packet::WriteRegResp = engine.command(&cmd).unwrap();
        assert_eq!(resp.address, 0x800000);
        assert_eq!(resp.value, 0x1234);
    }

    #[test]
    fn it_should_time_out_on_empty_channel() {
        let transport = MockTransport::new(vec![]);
        let mut engine = Engine::new(transport, Duration::from_millis(10));
        let result: Result<LinkCheckResp, Error> = engine.command(&LinkCheckCmnd);
        assert!(matches!(result, Err(Error::FrameResync)));
    }
}

/*! Host serial port access */

/*
    Copyright (C) 2020  John Goerzen <jgoerzen@complete.org

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <http://www.gnu.org/licenses/>.

*/

use log::*;
use std::io;
use std::io::{Read, Write};
use std::time::Duration;

/// Receive timeout for each blocking read.  Wireless is lossier than
/// normal serial, so this is generous; the retry loops above convert
/// timeouts into resends.
pub const SERIAL_RECV_TIMEOUT: Duration = Duration::from_millis(1000);

/// The byte device the transport runs over.
///
/// Normally a local serial port with an XBee on the other end, but the
/// seam lets tests substitute a scripted device.
pub trait SerialDevice {
    /// Deliver all of `data` to the device.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Fill `buf` completely, or fail with `TimedOut` if the device goes
    /// quiet for longer than the receive timeout.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// Drive the DTR and RTS control lines together.
    fn set_dtr_rts(&mut self, on: bool) -> io::Result<()>;
}

/// A `SerialDevice` backed by a real serial port.
pub struct XBSerialPort {
    port: Box<dyn serialport::SerialPort>,
    portname: String,
}

impl XBSerialPort {
    /// Open and configure the named port at the given baud rate.
    pub fn open(portname: &str, baud: u32) -> io::Result<XBSerialPort> {
        let port = serialport::new(portname, baud)
            .timeout(SERIAL_RECV_TIMEOUT)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        debug!("{}: opened at {} baud", portname, baud);
        Ok(XBSerialPort {
            port,
            portname: portname.to_string(),
        })
    }
}

impl SerialDevice for XBSerialPort {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        trace!("{} SEROUT: {}", self.portname, hex::encode(data));
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let n = self.port.read(&mut buf[pos..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF from serial port",
                ));
            }
            pos += n;
        }
        trace!("{} SERIN: {}", self.portname, hex::encode(&buf[..]));
        Ok(())
    }

    fn set_dtr_rts(&mut self, on: bool) -> io::Result<()> {
        debug!("{}: DTR/RTS -> {}", self.portname, on);
        self.port
            .write_data_terminal_ready(on)
            .and_then(|_| self.port.write_request_to_send(on))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

/*! XBeeBoot session lifecycle and XBee AT command drivers */

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
use std::thread;
use std::time::Duration;

use crate::error::{XbbError, XbbResult};
use crate::route::SourceRoute;
use crate::ser::{SerialDevice, XBSerialPort};
use crate::stats::{Stats, StatsGroup};
use crate::transport::{next_sequence, InputRing, PollWait};
use crate::xbpacket::{Deframer, API_LOCAL_AT, API_REMOTE_AT};

/// XBee IO port wired to the target's reset pin.  Port 7 is excluded
/// because it is the only pin that can act as a CTS flow control
/// output, and port 6 is the only possible RTS input.
pub const DEFAULT_RESET_PIN: u8 = 3;

/// STK500 sync request and its expected response, sent once at open.
/// The reliable channel already retries, so a single sync suffices.
pub const STK_GET_SYNC: u8 = 0x30;
pub const STK_CRC_EOP: u8 = 0x20;
pub const STK_INSYNC: u8 = 0x14;
pub const STK_OK: u8 = 0x10;

const LOCAL_AT_ATTEMPTS: usize = 5;
const REMOTE_AT_ATTEMPTS: usize = 30;

/// One open programming session against a remote (or directly wired)
/// XBeeBoot bootloader.
///
/// All state lives here; the session owns the serial device exclusively
/// and everything runs on the caller's thread.
pub struct XBBootSession {
    pub(crate) serial: Box<dyn SerialDevice>,
    /// 64-bit IEEE address followed by the 16-bit network address.  The
    /// 16-bit part starts out as the "unknown" value FFFE and is
    /// refreshed from any inbound frame sent by the target.
    pub(crate) address: [u8; 10],
    pub(crate) direct_mode: bool,
    pub(crate) reset_pin: u8,

    /// XBee API frame id counter.
    pub(crate) tx_sequence: u8,
    /// XBeeBoot outbound chunk sequence.
    pub(crate) out_sequence: u8,
    /// Most recently accepted inbound chunk sequence; 0 until the first
    /// chunk arrives.
    pub(crate) in_sequence: u8,

    pub(crate) transport_unusable: bool,
    pub(crate) in_ring: InputRing,
    pub(crate) route: SourceRoute,
    pub(crate) deframer: Deframer,
    pub(crate) stats: Stats,
}

/// Parse a `[<16-hex>]@<serial-device>` port specification.  An empty
/// address part selects direct mode.
pub fn parse_port_spec(port: &str) -> XbbResult<(Option<[u8; 8]>, &str)> {
    let separator = port.find('@').ok_or(XbbError::BadAddress)?;
    let (address, tty) = (&port[..separator], &port[separator + 1..]);
    if address.is_empty() {
        return Ok((None, tty));
    }
    if address.len() != 16 {
        return Err(XbbError::BadAddress);
    }
    let decoded = hex::decode(address).map_err(|_| XbbError::BadAddress)?;
    let mut addr64 = [0u8; 8];
    addr64.copy_from_slice(&decoded);
    Ok((Some(addr64), tty))
}

/// The baud rate used when the user does not supply one.
///
/// Direct mode talks straight to an AVR that believes it is wired to a
/// 9600-baud XBee; a 16 MHz part doubles the 8 MHz part's serial rate,
/// hence 19200.  Over the air we talk to the local XBee itself, whose
/// factory default is 9600.
pub fn default_baud(direct_mode: bool) -> u32 {
    if direct_mode {
        19200
    } else {
        9600
    }
}

impl XBBootSession {
    /// Build a session over an already-open serial device.  `address`
    /// of `None` selects direct mode.  No I/O happens here; call
    /// [`initialize`](Self::initialize) to bring the link up.
    pub fn new(
        serial: Box<dyn SerialDevice>,
        address: Option<[u8; 8]>,
        reset_pin: u8,
    ) -> XbbResult<XBBootSession> {
        if !(1..=6).contains(&reset_pin) {
            return Err(XbbError::BadConfig(format!(
                "invalid xbeeresetpin {}: must be 1..6",
                reset_pin
            )));
        }

        let mut addr = [0u8; 10];
        if let Some(addr64) = &address {
            addr[..8].copy_from_slice(addr64);
        }
        // Unknown 16-bit address until the target tells us otherwise.
        addr[8] = 0xff;
        addr[9] = 0xfe;

        trace!("XBee address: {}", hex::encode(&addr[..8]));

        Ok(XBBootSession {
            serial,
            address: addr,
            direct_mode: address.is_none(),
            reset_pin,
            tx_sequence: 0,
            out_sequence: 0,
            in_sequence: 0,
            transport_unusable: false,
            in_ring: InputRing::new(),
            route: SourceRoute::new(),
            deframer: Deframer::new(),
            stats: Stats::new(),
        })
    }

    /// Open the named port and bring up a fully initialised session.
    pub fn open(port_spec: &str, baud: Option<u32>, reset_pin: u8) -> XbbResult<XBBootSession> {
        let (address, tty) = parse_port_spec(port_spec)?;
        let baud = baud.unwrap_or_else(|| default_baud(address.is_none()));
        info!("opening {} at {} baud", tty, baud);

        let serial = XBSerialPort::open(tty, baud)?;
        let mut session = XBBootSession::new(Box::new(serial), address, reset_pin)?;
        session.initialize()?;
        Ok(session)
    }

    /// Configure the radios, pulse the target's reset line and perform
    /// the initial STK500 sync.  Each step aborts the open on failure.
    pub fn initialize(&mut self) -> XbbResult<()> {
        if !self.direct_mode {
            // Force API mode 2 (escaped) on the local XBee.
            self.local_at("AT AP=2", *b"AP", Some(2)).map_err(|e| {
                error!("local XBee is not responding");
                e
            })?;

            /*
             * Issue an Aggregate Routing Notification to enable
             * many-to-one routing to this device.  This establishes a
             * return path from the remote XBee, and enables the 0xA1
             * Route Record frames that feed our source-route cache.
             */
            self.local_at("AT AR=0", *b"AR", Some(0)).map_err(|e| {
                error!("local XBee is not responding");
                e
            })?;

            // Disable RTS on the remote XBee; the bootloader does not
            // drive flow control.  Port 6 is the only RTS-capable pin.
            self.remote_at("AT D6=0", *b"D6", Some(0)).map_err(|e| {
                match &e {
                    XbbError::RemoteAt(_) => error!("{}", e),
                    _ => error!("remote XBee is not responding"),
                }
                e
            })?;
        }

        // Pulse the reset line, then give the bootloader a moment to
        // start before the sync request.
        self.set_dtr_rts(false)?;
        thread::sleep(Duration::from_millis(250));
        self.set_dtr_rts(true)?;
        thread::sleep(Duration::from_millis(50));

        self.get_sync()
    }

    /// Issue a single STK500 sync request through the reliable channel.
    fn get_sync(&mut self) -> XbbResult<()> {
        self.send(&[STK_GET_SYNC, STK_CRC_EOP]).map_err(|e| {
            error!("failed to deliver sync request to the remote bootloader");
            e
        })?;

        let mut resp = [0u8; 2];
        self.recv(&mut resp).map_err(|e| {
            error!("no response to sync request from the remote bootloader");
            e
        })?;

        if resp[0] != STK_INSYNC {
            return Err(XbbError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bootloader not in sync: resp=0x{:02x}", resp[0]),
            )));
        }
        if resp[1] != STK_OK {
            return Err(XbbError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bootloader in sync but not OK: resp=0x{:02x}", resp[1]),
            )));
        }
        debug!("bootloader in sync");
        Ok(())
    }

    /// Drive the target's reset line.  `true` asserts reset.
    ///
    /// In direct mode this drives the real DTR/RTS lines.  Over the air
    /// it drives the configured XBee IO port as a digital output: the
    /// reset line is active-low at the MCU, so asserting maps to output
    /// low (4) and releasing to output high (5).
    pub fn set_dtr_rts(&mut self, on: bool) -> XbbResult<()> {
        if self.transport_unusable {
            return Err(XbbError::TransportUnusable);
        }
        if self.direct_mode {
            return self.serial.set_dtr_rts(on).map_err(XbbError::from);
        }

        let command = [b'D', b'0' + self.reset_pin];
        let value = if on { 4 } else { 5 };
        self.remote_at(
            if on { "AT [DTR]=low" } else { "AT [DTR]=high" },
            command,
            Some(value),
        )
    }

    /// Release the target, restore the remote XBee and report
    /// statistics.  Consumes the session; the serial port closes when
    /// the session drops.
    pub fn close(mut self) {
        if let Err(e) = self.set_dtr_rts(false) {
            error!("releasing target reset: {}", e);
        }

        /*
         * We have tweaked the remote XBee's RTS mode and reset pin
         * configuration.  A soft full reset restores its power-on
         * settings; the device drops off the mesh until it has
         * rejoined, so this is done only at the very end.
         */
        if !self.direct_mode {
            if let Err(e) = self.remote_at("AT FR", *b"FR", None) {
                error!("resetting remote XBee: {}", e);
            }
        }

        self.stats.summarise();
    }

    /// Send a local AT command (API 0x08) and wait for its 0x88
    /// response by frame id.
    pub(crate) fn local_at(
        &mut self,
        detail: &str,
        command: [u8; 2],
        value: Option<u8>,
    ) -> XbbResult<()> {
        if self.direct_mode {
            // No local XBee to talk to.
            return Ok(());
        }
        if self.transport_unusable {
            return Err(XbbError::TransportUnusable);
        }

        self.tx_sequence = next_sequence(self.tx_sequence);
        let sequence = self.tx_sequence;

        let mut data = command.to_vec();
        if let Some(v) = value {
            data.push(v);
        }

        debug!(
            "local AT command: {}{}",
            command[0] as char, command[1] as char
        );
        self.send_api_request(
            API_LOCAL_AT,
            Some(sequence),
            false,
            None,
            None,
            None,
            None,
            None,
            StatsGroup::FrameLocal,
            detail,
            &data,
        )?;

        for _ in 0..LOCAL_AT_ATTEMPTS {
            match self.poll(PollWait::FrameId(sequence), None) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(XbbError::timeout("local AT command timed out"))
    }

    /// Send a remote AT command (API 0x17, Apply Changes) to the target
    /// XBee and wait for its 0x97 response.  A nonzero status from the
    /// remote surfaces as [`XbbError::RemoteAt`].
    pub(crate) fn remote_at(
        &mut self,
        detail: &str,
        command: [u8; 2],
        value: Option<u8>,
    ) -> XbbResult<()> {
        if self.direct_mode {
            return Ok(());
        }
        if self.transport_unusable {
            return Err(XbbError::TransportUnusable);
        }

        self.tx_sequence = next_sequence(self.tx_sequence);
        let sequence = self.tx_sequence;

        let mut data = command.to_vec();
        if let Some(v) = value {
            data.push(v);
        }

        debug!(
            "remote AT command: {}{}",
            command[0] as char, command[1] as char
        );
        self.send_api_request(
            API_REMOTE_AT,
            Some(sequence),
            true,
            Some(0x02), // Apply Changes
            None,
            None,
            None,
            None,
            StatsGroup::FrameRemote,
            detail,
            &data,
        )?;

        for _ in 0..REMOTE_AT_ATTEMPTS {
            match self.poll(PollWait::FrameId(sequence), None) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(XbbError::timeout("remote AT command timed out"))
    }

    /// Adopt the 16-bit network address reported by the target.
    pub(crate) fn record_16bit(&mut self, rx16: &[u8]) {
        if rx16 != &self.address[8..10] {
            debug!("new 16-bit address: {}", hex::encode(rx16));
            self.address[8..10].copy_from_slice(rx16);
        }
    }
}

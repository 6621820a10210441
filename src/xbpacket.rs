/*! XBee API frame encoding and decoding (API mode 2, escaped) */

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

use bytes::{BufMut, Bytes, BytesMut};
use log::*;

/// Frame start delimiter.
pub const START_DELIM: u8 = 0x7e;

/// Escape introducer; the escaped byte follows, XORed with 0x20.
pub const ESCAPE: u8 = 0x7d;

const ESCAPE_XOR: u8 = 0x20;

/* API frame types */
pub const API_LOCAL_AT: u8 = 0x08;
pub const API_TX_REQUEST: u8 = 0x10;
pub const API_REMOTE_AT: u8 = 0x17;
pub const API_CREATE_SOURCE_ROUTE: u8 = 0x21;
pub const API_LOCAL_AT_RESPONSE: u8 = 0x88;
pub const API_TX_STATUS: u8 = 0x8b;
pub const API_RX_PACKET: u8 = 0x90;
pub const API_REMOTE_AT_RESPONSE: u8 = 0x97;
pub const API_ROUTE_RECORD: u8 = 0xa1;

/// Receive-side frame buffer size.  A frame whose declared length would
/// not fit (payload plus the two length bytes and the checksum) is
/// discarded outright.
pub const MAX_FRAME: usize = 256;

/// Largest payload that fits in the frame buffer.
pub const MAX_PAYLOAD: usize = MAX_FRAME - 3;

fn needs_escape(byte: u8) -> bool {
    byte == START_DELIM || byte == ESCAPE || byte == 0x11 || byte == 0x13
}

/// Calculate an XBee checksum over unescaped payload bytes.
pub fn xbchecksum(data: &[u8]) -> u8 {
    let sumu64: u64 = data.iter().map(|x| u64::from(*x)).sum();
    0xffu8.wrapping_sub(sumu64 as u8)
}

/** Accumulates one outbound API frame, maintaining the running length
and checksum over unescaped bytes while writing the escaped form.

The length and checksum fields of the wire format are themselves subject
to escaping, so `finish` routes them through the same escaping path. */
pub struct FrameBuilder {
    body: BytesMut,
    length: u8,
    checksum: u8,
}

impl FrameBuilder {
    pub fn new() -> Self {
        FrameBuilder {
            body: BytesMut::new(),
            length: 0,
            checksum: 0xff,
        }
    }

    /// Append one unescaped payload byte.
    pub fn put(&mut self, byte: u8) {
        Self::put_escaped(&mut self.body, byte);
        self.checksum = self.checksum.wrapping_sub(byte);
        self.length = self.length.wrapping_add(1);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        for &byte in data {
            self.put(byte);
        }
    }

    fn put_escaped(out: &mut BytesMut, byte: u8) {
        if needs_escape(byte) {
            out.put_u8(ESCAPE);
            out.put_u8(byte ^ ESCAPE_XOR);
        } else {
            out.put_u8(byte);
        }
    }

    /// Produce the complete wire frame: delimiter, escaped length,
    /// escaped payload, escaped checksum.
    pub fn finish(self) -> Bytes {
        let mut frame = BytesMut::with_capacity(self.body.len() + 6);
        frame.put_u8(START_DELIM);
        Self::put_escaped(&mut frame, 0);
        Self::put_escaped(&mut frame, self.length);
        frame.extend_from_slice(&self.body);
        Self::put_escaped(&mut frame, self.checksum);
        frame.freeze()
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/** One outbound API request.

Each optional slot corresponds to one position of the wire payload; a
`None` slot is simply absent.  The two pre-payload slots carry broadcast
radius and transmit options for a 0x10 Transmit Request, or route options
and hop count for a 0x21 Create Source Route. */
pub struct ApiRequest<'a> {
    pub api_type: u8,
    pub frame_id: Option<u8>,
    /// 64-bit IEEE address followed by the 16-bit network address.
    pub address: Option<&'a [u8; 10]>,
    pub pre_payload1: Option<u8>,
    pub pre_payload2: Option<u8>,
    pub packet_type: Option<u8>,
    pub sequence: Option<u8>,
    pub app_type: Option<u8>,
    pub data: &'a [u8],
}

impl<'a> ApiRequest<'a> {
    pub fn encode(&self) -> Bytes {
        let mut fb = FrameBuilder::new();
        fb.put(self.api_type);
        if let Some(frame_id) = self.frame_id {
            fb.put(frame_id);
        }
        if let Some(address) = self.address {
            fb.put_slice(address);
        }
        if let Some(v) = self.pre_payload1 {
            fb.put(v);
        }
        if let Some(v) = self.pre_payload2 {
            fb.put(v);
        }
        if let Some(v) = self.packet_type {
            fb.put(v);
        }
        if let Some(v) = self.sequence {
            fb.put(v);
        }
        if let Some(v) = self.app_type {
            fb.put(v);
        }
        fb.put_slice(self.data);
        fb.finish()
    }
}

enum DeframeState {
    /// Hunting for a start delimiter; everything else is junk.
    SeekDelim,
    ReadLen,
    ReadPayload,
    ReadChecksum,
}

/** Push-based API frame decoder.

Feed raw serial bytes one at a time; a completed, checksum-verified
payload (api type onward, without length or checksum) is returned as it
arrives.  A start delimiter at any point abandons the current frame and
begins a fresh one, so a corrupted frame can never swallow the start of
the next.  Bad checksums and oversized frames are discarded silently. */
pub struct Deframer {
    state: DeframeState,
    escaped: bool,
    length_high: Option<u8>,
    length: usize,
    payload: Vec<u8>,
}

impl Deframer {
    pub fn new() -> Self {
        Deframer {
            state: DeframeState::SeekDelim,
            escaped: false,
            length_high: None,
            length: 0,
            payload: Vec::new(),
        }
    }

    fn restart(&mut self) {
        self.state = DeframeState::ReadLen;
        self.escaped = false;
        self.length_high = None;
        self.payload.clear();
    }

    /// Process one raw byte from the serial stream.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        if byte == START_DELIM {
            // No matter when a start delimiter arrives, abandon the
            // current frame and parse a fresh one.
            self.restart();
            return None;
        }

        if let DeframeState::SeekDelim = self.state {
            return None;
        }

        let byte = if self.escaped {
            self.escaped = false;
            byte ^ ESCAPE_XOR
        } else if byte == ESCAPE {
            self.escaped = true;
            return None;
        } else {
            byte
        };

        match self.state {
            DeframeState::SeekDelim => None,
            DeframeState::ReadLen => {
                match self.length_high.take() {
                    None => {
                        self.length_high = Some(byte);
                    }
                    Some(high) => {
                        self.length = usize::from(high) << 8 | usize::from(byte);
                        if self.length == 0 || self.length > MAX_PAYLOAD {
                            // Too long for the frame buffer; give up on
                            // this frame entirely.
                            self.state = DeframeState::SeekDelim;
                        } else {
                            self.state = DeframeState::ReadPayload;
                        }
                    }
                }
                None
            }
            DeframeState::ReadPayload => {
                self.payload.push(byte);
                if self.payload.len() == self.length {
                    self.state = DeframeState::ReadChecksum;
                }
                None
            }
            DeframeState::ReadChecksum => {
                self.state = DeframeState::SeekDelim;
                if xbchecksum(&self.payload) == byte {
                    Some(std::mem::take(&mut self.payload))
                } else {
                    debug!(
                        "deframe: bad checksum {:02x} on frame {}",
                        byte,
                        hex::encode(&self.payload)
                    );
                    self.payload.clear();
                    None
                }
            }
        }
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

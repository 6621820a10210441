/*! Scripted serial device and frame constructors for tests */

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

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::ser::SerialDevice;
use crate::xbpacket::{Deframer, FrameBuilder};

/// Scripted reaction to each complete frame the session writes; the
/// returned bytes are appended to the fake's inbound queue.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

pub type FakeHandle = Rc<RefCell<FakeState>>;

/// Shared observable state of a [`FakeSerial`].
pub struct FakeState {
    /// Bytes the session will read next.
    pub rx: VecDeque<u8>,
    /// Every raw byte the session wrote.
    pub raw_tx: Vec<u8>,
    /// The decoded frames the session wrote, in order.
    pub frames: Vec<Vec<u8>>,
    /// History of DTR/RTS line changes.
    pub dtr: Vec<bool>,
    pub responder: Option<Responder>,
}

/// A `SerialDevice` with a scripted peer on the other end.  Reads time
/// out as soon as the inbound queue is empty, which keeps retry-heavy
/// tests fast.
pub struct FakeSerial {
    state: FakeHandle,
    deframer: Deframer,
}

pub fn fake_serial() -> (FakeSerial, FakeHandle) {
    let state = Rc::new(RefCell::new(FakeState {
        rx: VecDeque::new(),
        raw_tx: Vec::new(),
        frames: Vec::new(),
        dtr: Vec::new(),
        responder: None,
    }));
    (
        FakeSerial {
            state: state.clone(),
            deframer: Deframer::new(),
        },
        state,
    )
}

impl SerialDevice for FakeSerial {
    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.state.borrow_mut().raw_tx.extend_from_slice(data);

        let mut completed = Vec::new();
        for &byte in data {
            if let Some(frame) = self.deframer.push(byte) {
                completed.push(frame);
            }
        }

        for frame in completed {
            // The responder runs with the state unborrowed so it may
            // capture and mutate its own bookkeeping freely.
            let mut responder = self.state.borrow_mut().responder.take();
            let reply = responder.as_mut().map(|r| r(&frame));

            let mut st = self.state.borrow_mut();
            st.responder = responder;
            if let Some(reply) = reply {
                st.rx.extend(reply);
            }
            st.frames.push(frame);
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut st = self.state.borrow_mut();
        for slot in buf.iter_mut() {
            match st.rx.pop_front() {
                Some(byte) => *slot = byte,
                None => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "fake serial quiet"))
                }
            }
        }
        Ok(())
    }

    fn set_dtr_rts(&mut self, on: bool) -> io::Result<()> {
        self.state.borrow_mut().dtr.push(on);
        Ok(())
    }
}

/// Wrap a raw payload as a complete escaped wire frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut fb = FrameBuilder::new();
    fb.put_slice(payload);
    fb.finish().to_vec()
}

pub fn local_at_response(frame_id: u8, command: &[u8; 2], status: u8) -> Vec<u8> {
    let mut payload = vec![0x88, frame_id];
    payload.extend_from_slice(command);
    payload.push(status);
    encode_frame(&payload)
}

pub fn remote_at_response(frame_id: u8, addr64: &[u8; 8], command: &[u8; 2], status: u8) -> Vec<u8> {
    let mut payload = vec![0x97, frame_id];
    payload.extend_from_slice(addr64);
    payload.extend_from_slice(&[0xff, 0xfe]);
    payload.extend_from_slice(command);
    payload.push(status);
    encode_frame(&payload)
}

/// An XBeeBoot ACK arriving as a 0x90 Receive Packet from the target.
pub fn ack_frame(addr64: &[u8; 8], sequence: u8) -> Vec<u8> {
    let mut payload = vec![0x90];
    payload.extend_from_slice(addr64);
    payload.extend_from_slice(&[0xff, 0xfe]);
    payload.push(0x01); // receive options
    payload.extend_from_slice(&[0, sequence]);
    encode_frame(&payload)
}

/// A target-to-host REQUEST (FRAME_REPLY) as a 0x90 Receive Packet.
pub fn reply_frame(addr64: &[u8; 8], sequence: u8, data: &[u8]) -> Vec<u8> {
    reply_frame_with_addr16(addr64, [0xff, 0xfe], sequence, data)
}

pub fn reply_frame_with_addr16(
    addr64: &[u8; 8],
    addr16: [u8; 2],
    sequence: u8,
    data: &[u8],
) -> Vec<u8> {
    let mut payload = vec![0x90];
    payload.extend_from_slice(addr64);
    payload.extend_from_slice(&addr16);
    payload.push(0x01);
    payload.extend_from_slice(&[1, sequence, 24]);
    payload.extend_from_slice(data);
    encode_frame(&payload)
}

/// A 0x8B Transmit Status with a successful delivery status.
pub fn tx_status_frame(frame_id: u8) -> Vec<u8> {
    encode_frame(&[0x8b, frame_id, 0xff, 0xfe, 0x00, 0x00, 0x00])
}

/// A 0xA1 Route Record Indicator from the target.
pub fn route_record_frame(addr64: &[u8; 8], hops: &[u16]) -> Vec<u8> {
    let mut payload = vec![0xa1];
    payload.extend_from_slice(addr64);
    payload.extend_from_slice(&[0xff, 0xfe]);
    payload.push(0x01); // receive options
    payload.push(hops.len() as u8);
    for hop in hops {
        payload.extend_from_slice(&hop.to_be_bytes());
    }
    encode_frame(&payload)
}

/// A remote XBee + bootloader that configures cleanly, acknowledges
/// every data chunk, and answers the STK500 sync request.
pub fn ota_target_responder(addr64: [u8; 8]) -> Responder {
    Box::new(move |frame: &[u8]| match frame[0] {
        0x08 => local_at_response(frame[1], &[frame[2], frame[3]], 0),
        0x17 => remote_at_response(frame[1], &addr64, &[frame[13], frame[14]], 0),
        0x10 if frame.len() >= 16 && frame[14] == 1 => {
            let mut out = ack_frame(&addr64, frame[15]);
            if frame.len() >= 19 && frame[17..] == [0x30, 0x20] {
                out.extend(reply_frame(&addr64, 1, &[0x14, 0x10]));
            }
            out
        }
        _ => Vec::new(),
    })
}

/// An XBeeBoot ACK as the direct-mode target emits it: a real 0x10
/// Transmit Request aimed at the host.
pub fn direct_ack_frame(sequence: u8) -> Vec<u8> {
    let mut payload = vec![0x10, 0x01];
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&[0xff, 0xfe]);
    payload.extend_from_slice(&[0, 0]); // radius, options
    payload.extend_from_slice(&[0, sequence]);
    encode_frame(&payload)
}

pub fn direct_reply_frame(sequence: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x10, 0x01];
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&[0xff, 0xfe]);
    payload.extend_from_slice(&[0, 0]);
    payload.extend_from_slice(&[1, sequence, 24]);
    payload.extend_from_slice(data);
    encode_frame(&payload)
}

/// A directly wired AVR running the bootloader: acknowledges every
/// synthetic 0x90 chunk and answers the sync request.
pub fn direct_target_responder() -> Responder {
    Box::new(move |frame: &[u8]| {
        if frame[0] == 0x90 && frame.len() >= 13 && frame[11] == 1 {
            let mut out = direct_ack_frame(frame[12]);
            if frame.len() >= 16 && frame[14..] == [0x30, 0x20] {
                out.extend(direct_reply_frame(1, &[0x14, 0x10]));
            }
            out
        } else {
            Vec::new()
        }
    })
}

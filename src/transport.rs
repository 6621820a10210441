/*! XBeeBoot reliable channel: chunked stop-and-wait delivery */

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

use format_escape_default::format_escape_default;
use log::*;
use std::time::Instant;

use crate::error::{XbbError, XbbResult};
use crate::session::XBBootSession;
use crate::stats::StatsGroup;
use crate::xbpacket::{
    ApiRequest, API_CREATE_SOURCE_ROUTE, API_LOCAL_AT_RESPONSE, API_REMOTE_AT_RESPONSE,
    API_ROUTE_RECORD, API_RX_PACKET, API_TX_REQUEST, API_TX_STATUS,
};

/*
 * After eight seconds the AVR bootloader watchdog will kick in.  But to
 * allow for the possibility of eight seconds upstream and another eight
 * seconds downstream, allow for 16 retries of roughly one second each.
 */
pub const MAX_RETRIES: usize = 16;

/*
 * Maximum encapsulated payload delivered to the remote CPU.
 *
 * The ZigBee maximum unfragmented payload is 84 bytes.  Network layer
 * encryption costs 18 bytes and APS end-to-end encryption another 9,
 * leaving 57; the three XBeeBoot header bytes (packet type, sequence,
 * request type) bring the chunk down to 54.
 */
pub const MAX_CHUNK: usize = 54;

/* XBeeBoot inner protocol */
pub const PACKET_TYPE_ACK: u8 = 0;
pub const PACKET_TYPE_REQUEST: u8 = 1;
pub const APP_FIRMWARE_DELIVER: u8 = 23;
pub const APP_FRAME_REPLY: u8 = 24;

const RING_SIZE: usize = 256;

/// Advance an 8-bit sequence counter, skipping the illegal value 0.
pub(crate) fn next_sequence(sequence: u8) -> u8 {
    match sequence {
        0xff => 1,
        n => n + 1,
    }
}

/// Ring buffer for inbound payload bytes that arrive while no recv is
/// in progress.  The stop-and-wait protocol keeps at most one chunk in
/// flight, so an overrun indicates a broken peer.
pub(crate) struct InputRing {
    buffer: [u8; RING_SIZE],
    in_index: usize,
    out_index: usize,
}

impl InputRing {
    pub(crate) fn new() -> Self {
        InputRing {
            buffer: [0; RING_SIZE],
            in_index: 0,
            out_index: 0,
        }
    }

    /// Append a byte; `false` means the ring wrapped onto unread data.
    pub(crate) fn push(&mut self, byte: u8) -> bool {
        self.buffer[self.in_index] = byte;
        self.in_index = (self.in_index + 1) % RING_SIZE;
        self.in_index != self.out_index
    }

    pub(crate) fn pop(&mut self) -> Option<u8> {
        if self.in_index == self.out_index {
            None
        } else {
            let byte = self.buffer[self.out_index];
            self.out_index = (self.out_index + 1) % RING_SIZE;
            Some(byte)
        }
    }

    pub(crate) fn clear(&mut self) {
        self.in_index = 0;
        self.out_index = 0;
    }
}

/// What the inbound demultiplexer is being polled for.
#[derive(Clone, Copy)]
pub(crate) enum PollWait {
    /// An XBeeBoot ACK with this sequence.
    Ack(u8),
    /// A local or remote AT response with this frame id.
    FrameId(u8),
    /// Nothing in particular; run until the line goes quiet.
    Nothing,
}

/// Destination for inbound payload bytes during an active recv.
pub(crate) struct RecvCursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> RecvCursor<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        RecvCursor { buf, pos: 0 }
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.pos] = byte;
        self.pos += 1;
    }

    fn is_full(&self) -> bool {
        self.pos == self.buf.len()
    }
}

impl XBBootSession {
    /// Deliver application bytes to the target, chunked and
    /// individually acknowledged.  Any failure latches the transport
    /// unusable.
    pub fn send(&mut self, mut buf: &[u8]) -> XbbResult<()> {
        if self.transport_unusable {
            return Err(XbbError::TransportUnusable);
        }

        while !buf.is_empty() {
            let sequence = next_sequence(self.out_sequence);
            self.out_sequence = sequence;

            /*
             * Sending may trigger a reply before the next recv call
             * starts its clock, so stamp the expected inbound sequence
             * now.
             */
            self.stats.record_send(
                StatsGroup::Receive,
                next_sequence(self.in_sequence),
                Instant::now(),
                "send",
            );

            /*
             * Source routing costs two bytes fixed overhead plus two
             * per intermediate hop.  Shrink the chunk to avoid
             * fragmentation; if that would leave nothing, keep the full
             * chunk and hope fragmentation saves us.
             */
            let mut maximum_chunk = MAX_CHUNK;
            let hops = self.route.hop_count();
            if hops > 0 && hops * 2 + 2 < MAX_CHUNK {
                maximum_chunk -= hops * 2 + 2;
            }

            let block = buf.len().min(maximum_chunk);
            let chunk = &buf[..block];

            let mut outcome = Err(XbbError::timeout("no ACK within retry budget"));
            for _ in 0..MAX_RETRIES {
                if let Err(e) = self.send_packet(
                    "Transmit Request Data",
                    PACKET_TYPE_REQUEST,
                    sequence,
                    Some(APP_FIRMWARE_DELIVER),
                    chunk,
                ) {
                    // No recovery from a failure mid-send.
                    self.transport_unusable = true;
                    return Err(e);
                }

                match self.poll(PollWait::Ack(sequence), None) {
                    Ok(()) => {
                        outcome = Ok(());
                        break;
                    }
                    Err(e) if e.is_timeout() => {
                        outcome = Err(e);
                        /*
                         * The missing ACK may mean the peer never saw
                         * our ACK to its last reply and is stuck
                         * retransmitting it.  Re-ACK after each
                         * timeout, unless no inbound sequence has been
                         * seen yet.
                         */
                        if self.in_sequence != 0 {
                            if let Err(e) = self.send_packet(
                                "Transmit Request ACK [retry in send]",
                                PACKET_TYPE_ACK,
                                self.in_sequence,
                                None,
                                &[],
                            ) {
                                self.transport_unusable = true;
                                return Err(e);
                            }
                        }
                    }
                    Err(e) => {
                        self.transport_unusable = true;
                        return Err(e);
                    }
                }
            }

            match outcome {
                Ok(()) => buf = &buf[block..],
                Err(e) => {
                    self.transport_unusable = true;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Fill `buf` with application bytes from the target, consuming any
    /// previously buffered input first.
    pub fn recv(&mut self, buf: &mut [u8]) -> XbbResult<()> {
        // De-buffer anything received in a chunk that could not be
        // delivered at the time.
        let mut pos = 0;
        while pos < buf.len() {
            match self.in_ring.pop() {
                Some(byte) => {
                    buf[pos] = byte;
                    pos += 1;
                }
                None => break,
            }
        }
        if pos == buf.len() {
            return Ok(());
        }

        if self.transport_unusable {
            return Err(XbbError::TransportUnusable);
        }

        // Expecting data is the moment to start the reply clock.
        self.stats.record_send(
            StatsGroup::Receive,
            next_sequence(self.in_sequence),
            Instant::now(),
            "recv",
        );

        let mut cursor = RecvCursor::new(&mut buf[pos..]);
        for _ in 0..MAX_RETRIES {
            match self.poll(PollWait::Nothing, Some(&mut cursor)) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() => {
                    // The peer may have missed our ACK; resend it after
                    // each quiet timeout.
                    if self.in_sequence != 0 {
                        if let Err(e) = self.send_packet(
                            "Transmit Request ACK [retry in recv]",
                            PACKET_TYPE_ACK,
                            self.in_sequence,
                            None,
                            &[],
                        ) {
                            self.transport_unusable = true;
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    self.transport_unusable = true;
                    return Err(e);
                }
            }
        }

        self.transport_unusable = true;
        Err(XbbError::timeout("no data within retry budget"))
    }

    /// Discard buffered input, then poll until the line is quiet for a
    /// full receive timeout.
    pub fn drain(&mut self) -> XbbResult<()> {
        if self.transport_unusable {
            return Err(XbbError::TransportUnusable);
        }

        self.in_ring.clear();
        loop {
            match self.poll(PollWait::Nothing, None) {
                Err(e) if e.is_timeout() => return Ok(()),
                Err(e) => return Err(e),
                Ok(()) => self.in_ring.clear(),
            }
        }
    }

    /// Collect whatever the target has already sent: poll until the
    /// line goes quiet, then hand over the buffered bytes.
    pub fn recv_available(&mut self, out: &mut Vec<u8>) -> XbbResult<()> {
        if self.transport_unusable {
            return Err(XbbError::TransportUnusable);
        }

        match self.poll(PollWait::Nothing, None) {
            Err(e) if e.is_timeout() => {}
            Err(e) => return Err(e),
            Ok(()) => {}
        }
        while let Some(byte) = self.in_ring.pop() {
            out.push(byte);
        }
        Ok(())
    }

    /// Wrap one XBeeBoot packet for the wire.  Over the air this is a
    /// 0x10 Transmit Request; in direct mode we pretend to be the
    /// remote XBee and emit the inbound-shaped 0x90 frame the target
    /// expects, with no frame id and no pre-payload bytes.
    pub(crate) fn send_packet(
        &mut self,
        detail: &str,
        packet_type: u8,
        sequence: u8,
        app_type: Option<u8>,
        data: &[u8],
    ) -> XbbResult<()> {
        let (api_type, frame_id, pre_payload1, pre_payload2) = if self.direct_mode {
            (API_RX_PACKET, None, None, None)
        } else {
            self.tx_sequence = next_sequence(self.tx_sequence);
            (API_TX_REQUEST, Some(self.tx_sequence), Some(0), Some(0))
        };

        self.send_api_request(
            api_type,
            frame_id,
            true,
            pre_payload1,
            pre_payload2,
            Some(packet_type),
            Some(sequence),
            app_type,
            StatsGroup::FrameRemote,
            detail,
            data,
        )
    }

    /// Emit one API frame, stamping send statistics and interleaving a
    /// Create Source Route frame when the cached route has changed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_api_request(
        &mut self,
        api_type: u8,
        frame_id: Option<u8>,
        addressed: bool,
        pre_payload1: Option<u8>,
        pre_payload2: Option<u8>,
        packet_type: Option<u8>,
        sequence: Option<u8>,
        app_type: Option<u8>,
        frame_group: StatsGroup,
        detail: &str,
        data: &[u8],
    ) -> XbbResult<()> {
        let now = Instant::now();

        if let Some(id) = frame_id {
            self.stats.record_send(frame_group, id, now, detail);
        }

        /*
         * An addressed API call other than Create Source Route itself
         * must deliver the new route first, or the mesh may take the
         * stale path.
         */
        if addressed && api_type != API_CREATE_SOURCE_ROUTE && self.route.is_changed() {
            let hops = self.route.hop_count();
            debug!("issuing Create Source Route request with {} hops", hops);
            let route_bytes = self.route.wire_bytes();
            self.send_api_request(
                API_CREATE_SOURCE_ROUTE,
                Some(0), // fire and forget, no response
                true,
                Some(0), // route options
                Some(hops as u8),
                None,
                None,
                None,
                StatsGroup::FrameLocal,
                "Create Source Route",
                &route_bytes,
            )?;
            self.route.clear_changed();
        }

        if let (Some(ptype), Some(seq)) = (packet_type, sequence) {
            trace!("sending packet type {} #{} {}", ptype, seq, detail);
            if ptype == PACKET_TYPE_REQUEST {
                self.stats
                    .record_send(StatsGroup::Transmit, seq, now, detail);
            }
        }

        let request = ApiRequest {
            api_type,
            frame_id,
            address: if addressed { Some(&self.address) } else { None },
            pre_payload1,
            pre_payload2,
            packet_type,
            sequence,
            app_type,
            data,
        };
        self.serial.send(&request.encode()).map_err(XbbError::from)
    }

    /// Read serial bytes through the deframer until one complete,
    /// checksum-verified frame arrives.
    fn read_frame(&mut self) -> XbbResult<Vec<u8>> {
        loop {
            let mut byte = [0u8; 1];
            self.serial.recv(&mut byte)?;
            if let Some(frame) = self.deframer.push(byte[0]) {
                return Ok(frame);
            }
        }
    }

    /// The inbound demultiplexer.  Reads and dispatches frames until
    /// the awaited event fires (`Ok`), the recv cursor fills (`Ok`), or
    /// a serial timeout or fatal error surfaces (`Err`).
    pub(crate) fn poll(
        &mut self,
        wait: PollWait,
        mut cursor: Option<&mut RecvCursor>,
    ) -> XbbResult<()> {
        loop {
            let frame = self.read_frame()?;
            let now = Instant::now();
            trace!(
                "received frame type {:02x}: {}",
                frame[0],
                format_escape_default(&frame)
            );

            match frame[0] {
                API_REMOTE_AT_RESPONSE if frame.len() >= 15 => {
                    let frame_id = frame[1];
                    let status = frame[14];
                    self.stats.record_receive(
                        StatsGroup::FrameRemote,
                        frame_id,
                        now,
                        "remote AT command response",
                    );
                    debug!("remote command {} result code {}", frame_id, status);

                    if let PollWait::FrameId(id) = wait {
                        if id == frame_id {
                            return if status == 0 {
                                Ok(())
                            } else {
                                Err(XbbError::RemoteAt(status))
                            };
                        }
                    }
                }

                API_LOCAL_AT_RESPONSE if frame.len() >= 5 => {
                    let frame_id = frame[1];
                    self.stats.record_receive(
                        StatsGroup::FrameLocal,
                        frame_id,
                        now,
                        "local AT command response",
                    );
                    debug!(
                        "local command {}{} result code {}",
                        frame[2] as char, frame[3] as char, frame[4]
                    );

                    if let PollWait::FrameId(id) = wait {
                        if id == frame_id {
                            return Ok(());
                        }
                    }
                }

                API_TX_STATUS if frame.len() >= 6 => {
                    self.stats.record_receive(
                        StatsGroup::FrameRemote,
                        frame[1],
                        now,
                        "transmit status",
                    );
                    trace!("transmit status {} result code {}", frame[1], frame[5]);
                }

                API_ROUTE_RECORD if frame.len() >= 13 => {
                    if frame[1..9] != self.address[..8] {
                        trace!("Route Record Indicator from other XBee");
                        continue;
                    }
                    self.record_16bit(&frame[9..11]);

                    let hops = usize::from(frame[12]);
                    debug!(
                        "Route Record Indicator from target: hops={} options={}",
                        hops, frame[11]
                    );

                    if frame.len() < 13 + hops * 2 {
                        // Frame is too small for its own hop count.
                        continue;
                    }

                    let route: Vec<u16> = (0..hops)
                        .map(|i| u16::from_be_bytes([frame[13 + i * 2], frame[14 + i * 2]]))
                        .collect();
                    for (index, hop) in route.iter().enumerate() {
                        trace!("route intermediate hop {} : {:04x}", index, hop);
                    }
                    self.route.observe(&route);
                }

                api_type @ (API_TX_REQUEST | API_RX_PACKET) => {
                    let data_start = if api_type == API_TX_REQUEST {
                        // Direct-mode inbound: the target emits real
                        // Transmit Request frames at us.
                        14
                    } else {
                        if frame.len() > 11 && frame[1..9] != self.address[..8] {
                            // Not from our target device.
                            continue;
                        }
                        if frame.len() > 11 {
                            self.record_16bit(&frame[9..11]);
                        }
                        12
                    };

                    if frame.len() < data_start + 2 {
                        continue;
                    }
                    let packet_type = frame[data_start];
                    let sequence = frame[data_start + 1];
                    trace!("packet {} #{}", packet_type, sequence);

                    if packet_type == PACKET_TYPE_ACK {
                        self.stats.record_receive(
                            StatsGroup::Transmit,
                            sequence,
                            now,
                            "XBeeBoot ACK",
                        );
                        if let PollWait::Ack(want) = wait {
                            if want == sequence {
                                return Ok(());
                            }
                        }
                    } else if packet_type == PACKET_TYPE_REQUEST
                        && frame.len() >= data_start + 4
                        && frame[data_start + 2] == APP_FRAME_REPLY
                    {
                        self.stats.record_receive(
                            StatsGroup::Receive,
                            sequence,
                            now,
                            "XBeeBoot receive",
                        );

                        let expected = next_sequence(self.in_sequence);
                        if sequence != expected {
                            // A retransmission of something already
                            // delivered; the retry paths re-ACK it.
                            continue;
                        }
                        self.in_sequence = expected;

                        for &byte in &frame[data_start + 3..] {
                            match cursor.as_mut().filter(|c| !c.is_full()) {
                                Some(c) => c.push(byte),
                                None => {
                                    if !self.in_ring.push(byte) {
                                        // Impossible under stop-and-wait.
                                        error!("input buffer overrun");
                                        self.transport_unusable = true;
                                        return Err(XbbError::Io(std::io::Error::new(
                                            std::io::ErrorKind::Other,
                                            "input buffer overrun",
                                        )));
                                    }
                                }
                            }
                        }

                        self.send_packet(
                            "Transmit Request ACK",
                            PACKET_TYPE_ACK,
                            sequence,
                            None,
                            &[],
                        )?;

                        if let Some(c) = &cursor {
                            if c.is_full() {
                                return Ok(());
                            }
                        }

                        // Still mid-receive: restart the reply clock
                        // for the next expected chunk.
                        self.stats.record_send(
                            StatsGroup::Receive,
                            next_sequence(expected),
                            now,
                            "poll",
                        );
                    }
                }

                other => {
                    trace!("ignoring frame type {:02x}", other);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::XBBootSession;
    use crate::testutil::*;
    use std::cell::Cell;
    use std::rc::Rc;

    const ADDR64: [u8; 8] = [0x00, 0x13, 0xa2, 0x00, 0x12, 0x34, 0x56, 0x78];

    fn ota_session(state_responder: Responder) -> (XBBootSession, FakeHandle) {
        let (fake, state) = fake_serial();
        state.borrow_mut().responder = Some(state_responder);
        let session = XBBootSession::new(Box::new(fake), Some(ADDR64), 3).unwrap();
        (session, state)
    }

    fn data_frames(state: &FakeHandle) -> Vec<Vec<u8>> {
        state
            .borrow()
            .frames
            .iter()
            .filter(|f| f[0] == API_TX_REQUEST && f[14] == PACKET_TYPE_REQUEST)
            .cloned()
            .collect()
    }

    #[test]
    fn sequence_skips_zero() {
        assert_eq!(next_sequence(0), 1);
        assert_eq!(next_sequence(1), 2);
        assert_eq!(next_sequence(0xfe), 0xff);
        assert_eq!(next_sequence(0xff), 1);
    }

    #[test]
    fn ring_buffers_and_detects_overrun() {
        let mut ring = InputRing::new();
        assert_eq!(ring.pop(), None);
        assert!(ring.push(0x41));
        assert!(ring.push(0x42));
        assert_eq!(ring.pop(), Some(0x41));
        assert_eq!(ring.pop(), Some(0x42));
        assert_eq!(ring.pop(), None);

        // Fill to the wrap point.
        let mut ok = true;
        for i in 0..256 {
            ok = ring.push(i as u8);
        }
        assert!(!ok);
    }

    /// E3: 100 bytes split into a 54-byte and a 46-byte chunk, each with
    /// its own sequence, each acknowledged before the next goes out.
    #[test]
    fn chunked_send() {
        let (mut session, state) = ota_session(ota_target_responder(ADDR64));
        let payload: Vec<u8> = (0..100).map(|i| i as u8).collect();
        session.send(&payload).unwrap();

        let data = data_frames(&state);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].len() - 17, 54);
        assert_eq!(data[1].len() - 17, 46);
        assert_eq!(data[0][15], 1);
        assert_eq!(data[1][15], 2);
        assert_eq!(data[0][16], APP_FIRMWARE_DELIVER);
        assert_eq!(&data[0][17..], &payload[..54]);
        assert_eq!(&data[1][17..], &payload[54..]);
    }

    /// E4: after a Route Record Indicator, the very next data frame is
    /// preceded by a Create Source Route carrying exactly that route,
    /// and only once.
    #[test]
    fn route_record_triggers_create_source_route() {
        let (mut session, state) = ota_session(ota_target_responder(ADDR64));

        // First send completes without any route on file.
        session.send(&[0x01]).unwrap();

        // The target's route arrives: two intermediate hops.
        state
            .borrow_mut()
            .rx
            .extend(route_record_frame(&ADDR64, &[0xabcd, 0x1234]));

        // The route record is consumed during this send's ACK poll;
        // the send after it must be preceded by the 0x21, and later
        // sends must not repeat it.
        session.send(&[0x02]).unwrap();
        session.send(&[0x03]).unwrap();
        session.send(&[0x04]).unwrap();

        let frames = state.borrow().frames.clone();
        let kinds: Vec<u8> = frames.iter().map(|f| f[0]).collect();

        let csr_positions: Vec<usize> = kinds
            .iter()
            .enumerate()
            .filter(|(_, &k)| k == API_CREATE_SOURCE_ROUTE)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(csr_positions.len(), 1);
        let csr = &frames[csr_positions[0]];
        assert_eq!(frames[csr_positions[0] + 1][0], API_TX_REQUEST);

        // 0x21 layout: frame id 0, address, route options, hop count,
        // then the hop addresses nearest-to-target first.
        assert_eq!(csr[1], 0);
        assert_eq!(&csr[2..10], &ADDR64);
        assert_eq!(csr[12], 0);
        assert_eq!(csr[13], 2);
        assert_eq!(&csr[14..], &[0xab, 0xcd, 0x12, 0x34]);
    }

    /// Property 7: with an active route the chunk budget shrinks by
    /// 2h + 2 bytes.
    #[test]
    fn chunk_budget_shrinks_with_hops() {
        let (mut session, state) = ota_session(ota_target_responder(ADDR64));
        state
            .borrow_mut()
            .rx
            .extend(route_record_frame(&ADDR64, &[0xaaaa, 0xbbbb]));

        // An initial byte to absorb the route record.
        session.send(&[0x00]).unwrap();

        let payload = [0x55u8; 60];
        session.send(&payload).unwrap();

        let data = data_frames(&state);
        // One for the probe, then 48 + 12 for the 60-byte payload.
        assert_eq!(data.len(), 3);
        assert_eq!(data[1].len() - 17, 48);
        assert_eq!(data[2].len() - 17, 12);
    }

    /// E5: the peer misses the first REQUEST; one resend succeeds and
    /// the sequence number is reused for the retry.
    #[test]
    fn retry_then_succeed() {
        let drops = Rc::new(Cell::new(1usize));
        let drops_in_responder = drops.clone();
        let responder: Responder = Box::new(move |frame: &[u8]| {
            if frame[0] == API_TX_REQUEST && frame[14] == PACKET_TYPE_REQUEST {
                if drops_in_responder.get() > 0 {
                    drops_in_responder.set(drops_in_responder.get() - 1);
                    return Vec::new();
                }
                return ack_frame(&ADDR64, frame[15]);
            }
            Vec::new()
        });

        let (mut session, state) = ota_session(responder);
        session.send(&[0xde, 0xad]).unwrap();

        let data = data_frames(&state);
        assert_eq!(data.len(), 2);
        // Same sequence, same payload: a retransmission, not a new chunk.
        assert_eq!(data[0][15], data[1][15]);
        assert_eq!(data[0][17..], data[1][17..]);
        assert!(!session.transport_unusable);
    }

    /// Property 5: a duplicate REQUEST is not delivered twice and does
    /// not advance the inbound sequence.
    #[test]
    fn duplicate_request_not_delivered_twice() {
        let (mut session, state) = ota_session(ota_target_responder(ADDR64));
        {
            let mut st = state.borrow_mut();
            st.rx.extend(reply_frame(&ADDR64, 1, b"AB"));
            st.rx.extend(reply_frame(&ADDR64, 1, b"AB")); // retransmission
            st.rx.extend(reply_frame(&ADDR64, 2, b"CD"));
        }

        let mut buf = [0u8; 4];
        session.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"ABCD");
        assert_eq!(session.in_sequence, 2);

        // Exactly one ACK per accepted sequence.
        let acks: Vec<u8> = state
            .borrow()
            .frames
            .iter()
            .filter(|f| f[0] == API_TX_REQUEST && f[14] == PACKET_TYPE_ACK)
            .map(|f| f[15])
            .collect();
        assert_eq!(acks, vec![1, 2]);
    }

    /// Reply bytes that arrive while no recv is active accumulate in
    /// the ring and are handed out by the next recv without touching
    /// the serial device.
    #[test]
    fn unsolicited_reply_is_buffered() {
        // The reply overtakes the ACK, so the send's poll must buffer
        // it before its own completion.
        let responder: Responder = Box::new(move |frame: &[u8]| {
            if frame[0] == API_TX_REQUEST && frame[14] == PACKET_TYPE_REQUEST {
                let mut out = reply_frame(&ADDR64, 1, b"XY");
                out.extend(ack_frame(&ADDR64, frame[15]));
                return out;
            }
            Vec::new()
        });

        let (mut session, state) = ota_session(responder);
        session.send(&[0x01, 0x02]).unwrap();

        // The reply was buffered and acknowledged during the send.
        let acks: Vec<u8> = state
            .borrow()
            .frames
            .iter()
            .filter(|f| f[0] == API_TX_REQUEST && f[14] == PACKET_TYPE_ACK)
            .map(|f| f[15])
            .collect();
        assert_eq!(acks, vec![1]);

        // Nothing is left on the serial side, so a successful recv can
        // only have come from the ring.
        assert!(state.borrow().rx.is_empty());
        let mut buf = [0u8; 2];
        session.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"XY");
    }

    /// A frame from a foreign 64-bit address is ignored entirely.
    #[test]
    fn foreign_sender_ignored() {
        let (mut session, state) = ota_session(ota_target_responder(ADDR64));
        let stranger = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x00, 0x00, 0x01];
        {
            let mut st = state.borrow_mut();
            st.rx.extend(reply_frame(&stranger, 1, b"!!"));
            st.rx.extend(reply_frame(&ADDR64, 1, b"OK"));
        }

        let mut buf = [0u8; 2];
        session.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"OK");
        assert_eq!(session.in_sequence, 1);
    }

    /// The 16-bit network address is adopted from inbound frames and
    /// used in subsequent transmissions.
    #[test]
    fn sixteen_bit_address_learned() {
        let (mut session, state) = ota_session(ota_target_responder(ADDR64));
        state
            .borrow_mut()
            .rx
            .extend(reply_frame_with_addr16(&ADDR64, [0x12, 0xab], 1, b"hi"));

        let mut buf = [0u8; 2];
        session.recv(&mut buf).unwrap();
        assert_eq!(session.address[8..10], [0x12, 0xab]);

        session.send(&[0x00]).unwrap();
        let data = data_frames(&state);
        assert_eq!(&data.last().unwrap()[10..12], &[0x12, 0xab]);
    }

    /// Property 8: after any failure, every call fails fast without
    /// touching the serial device.
    #[test]
    fn transport_unusable_latch() {
        // A peer that never ACKs.
        let (mut session, state) = ota_session(Box::new(|_: &[u8]| Vec::new()));

        assert!(session.send(&[0x01]).is_err());
        assert!(session.transport_unusable);

        let writes = state.borrow().raw_tx.len();
        assert!(matches!(
            session.send(&[0x02]),
            Err(XbbError::TransportUnusable)
        ));
        let mut buf = [0u8; 1];
        assert!(matches!(
            session.recv(&mut buf),
            Err(XbbError::TransportUnusable)
        ));
        assert!(matches!(session.drain(), Err(XbbError::TransportUnusable)));
        assert!(matches!(
            session.set_dtr_rts(false),
            Err(XbbError::TransportUnusable)
        ));
        assert_eq!(state.borrow().raw_tx.len(), writes);
    }

    /// Drain clears what was already buffered; a chunk that arrives
    /// during the drain poll is acknowledged and buffered normally.
    #[test]
    fn drain_discards_buffered_input() {
        let (mut session, state) = ota_session(ota_target_responder(ADDR64));

        // Seed the ring with previously buffered bytes.
        for &byte in b"old" {
            session.in_ring.push(byte);
        }
        session.drain().unwrap();

        let mut out = Vec::new();
        session.recv_available(&mut out).unwrap();
        assert!(out.is_empty());

        // A late reply during a second drain lands in the ring.
        state
            .borrow_mut()
            .rx
            .extend(reply_frame(&ADDR64, 1, b"late"));
        session.drain().unwrap();
        session.recv_available(&mut out).unwrap();
        assert_eq!(out, b"late");
        assert_eq!(session.in_sequence, 1);
    }

    /// Direct-mode sends are synthetic 0x90 frames and inbound 0x10
    /// frames from the target parse correctly.
    #[test]
    fn direct_mode_round_trip() {
        let (fake, state) = fake_serial();
        state.borrow_mut().responder = Some(direct_target_responder());
        let mut session = XBBootSession::new(Box::new(fake), None, 3).unwrap();

        session.send(&[0x30, 0x20]).unwrap();
        let st = state.borrow();
        let sent = st
            .frames
            .iter()
            .find(|f| f[0] == API_RX_PACKET)
            .expect("no synthetic 0x90 frame");
        // No frame id, no pre-payload bytes: address directly follows
        // the API type, then the XBeeBoot header.
        assert_eq!(&sent[1..9], &[0u8; 8]);
        assert_eq!(&sent[9..11], &[0xff, 0xfe]);
        assert_eq!(sent[11], PACKET_TYPE_REQUEST);
        assert_eq!(sent[12], 1);
        assert_eq!(sent[13], APP_FIRMWARE_DELIVER);
        assert_eq!(&sent[14..], &[0x30, 0x20]);
    }

    /// ACK latency lands in the TRANSMIT statistics group.
    #[test]
    fn ack_latency_recorded() {
        let (mut session, _state) = ota_session(ota_target_responder(ADDR64));
        session.send(&[0x01]).unwrap();
        assert_eq!(session.stats.summary(StatsGroup::Transmit).samples(), 1);
    }

    /// Transmit Status frames are consumed and counted against the
    /// frame id that provoked them.
    #[test]
    fn transmit_status_recorded() {
        let responder: Responder = Box::new(move |frame: &[u8]| {
            if frame[0] == API_TX_REQUEST && frame[14] == PACKET_TYPE_REQUEST {
                let mut out = tx_status_frame(frame[1]);
                out.extend(ack_frame(&ADDR64, frame[15]));
                return out;
            }
            Vec::new()
        });

        let (mut session, _state) = ota_session(responder);
        session.send(&[0x01]).unwrap();
        assert_eq!(session.stats.summary(StatsGroup::FrameRemote).samples(), 1);
    }

    /// Sequences wrap 255 -> 1 without ever touching 0.
    #[test]
    fn out_sequence_wraps_past_zero() {
        let (mut session, state) = ota_session(ota_target_responder(ADDR64));
        session.out_sequence = 0xfe;

        session.send(&[0x01]).unwrap();
        session.send(&[0x02]).unwrap();
        session.send(&[0x03]).unwrap();

        let sequences: Vec<u8> = data_frames(&state).iter().map(|f| f[15]).collect();
        assert_eq!(sequences, vec![0xff, 1, 2]);
    }
}

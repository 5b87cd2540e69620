// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Matrix bus link layer.
//!
//! Owns the bus hardware through the [`hw::BusHw`] contract and provides
//! framed transmit and receive on top of it:
//!
//! - **Transmit**: assembles header + length + payload + CRC into one
//!   buffer and DMAs it onto the lines under a hard completion deadline.
//!   Line release is ordered data-first-then-busy with a short discharge
//!   gap; the controller re-arms the busy pulldown afterwards.
//! - **Receive**: a small state machine walks the DMA ring. Frames for
//!   other destinations take the discard path, which skips beats one at a
//!   time behind a full fence so the cursor can never outrun the DMA
//!   writer and desynchronize the framer.
//! - **Link control**: ACK, ping, and topology frames are recognized and
//!   handled right here; they never surface to the caller. A valid
//!   unicast without the no-ack flag is acknowledged within the same
//!   `try_receive` call.
//!
//! Carrier-sense arbitration is deliberately *not* here: the broker above
//! decides when the bus may be taken. This layer only moves frames.

#![cfg_attr(not(test), no_std)]

pub mod hw;

#[cfg(any(test, feature = "sim"))]
extern crate std;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

use core::sync::atomic::{fence, Ordering};

use cluster_topology::Topology;
use hw::{BusHw, RX_RING_WORDS};
use matrix_proto::{
    crc16_frame, link_opcode, Frame, FrameType, Header, BROADCAST_ID,
    CONTROLLER_ID, MAX_FRAME_WORDS, MAX_PAYLOAD_BYTES, MAX_PAYLOAD_WORDS,
};
use tracebuf::TraceBuf;

/// TX DMA completion deadline. A full 603-word frame at the slowest bus
/// clock finishes well inside this.
pub const TX_TIMEOUT_US: u64 = 5_000;

/// Gap between floating the data lines and releasing busy.
pub const DATA_DISCHARGE_US: u32 = 5;

/// Full RX resets are rate-limited to one per this interval.
pub const RX_RESET_INTERVAL_US: u64 = 100_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkError {
    /// Payload exceeds [`MAX_PAYLOAD_WORDS`].
    TooLong,
    /// Node id has not been configured yet.
    NodeIdUnset,
    /// TX DMA missed its completion deadline.
    TxTimeout,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub tx_count: u32,
    pub rx_count: u32,
    pub crc_errors: u32,
    pub tx_timeouts: u32,
    pub rx_resets: u32,
    pub protocol_errors: u32,
    pub last_tx_us: u64,
    pub last_rx_us: u64,
    pub total_tx_us: u64,
    pub total_rx_us: u64,
}

/// A recorded reply to a link-layer ping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PingReply {
    pub src: u8,
    pub seq: u16,
    pub nonce: [u16; 4],
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    TxFrame { dest: u8, words: u16 },
    TxTimeout,
    RxFrame { src: u8, stream: u8 },
    RxCrcError,
    RxReset,
    ProtocolError,
    AckSent { dest: u8 },
    PingReplySent { dest: u8 },
    TopologyApplied,
}

/// Receive framer state. The discard pair keeps the cursor aligned to
/// frame boundaries while rejected traffic streams past.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RxState {
    WaitHeader,
    WaitLength,
    WaitPayload { words_left: usize },
    WaitCrc,
    DiscardWaitLength,
    DiscardSkip { words_left: usize },
}

pub struct LinkLayer<H: BusHw> {
    hw: H,
    node_id: u8,
    is_controller: bool,

    tx_buf: [u16; MAX_FRAME_WORDS],

    rx_state: RxState,
    rx_cursor: usize,
    pending: Frame,
    pending_header_word: u16,
    pending_length_word: u16,
    pending_filled: usize,
    pending_start_us: u64,
    last_rx_reset_us: u64,

    last_ack: Option<(u8, u8)>,
    last_ping_reply: Option<PingReply>,
    topology: Topology,

    stats: BusStats,
    trace: TraceBuf<Trace, 32>,
}

/// Node id sentinel before configuration.
const NODE_ID_UNSET: u8 = 0xFF;

impl<H: BusHw> LinkLayer<H> {
    /// Initializes the link for a worker node. The id comes later, via
    /// [`Self::set_node_id`], once the straps or the scratch latch have
    /// been consulted.
    pub fn new_node(hw: H) -> Self {
        Self::new(hw, false)
    }

    /// Initializes the link for the controller: fixed id 16, and this
    /// device owns the busy line's idle pulldown.
    pub fn new_controller(mut hw: H) -> Self {
        hw.arm_busy_pulldown();
        let mut link = Self::new(hw, true);
        link.node_id = CONTROLLER_ID;
        link
    }

    fn new(hw: H, is_controller: bool) -> Self {
        Self {
            hw,
            node_id: NODE_ID_UNSET,
            is_controller,
            tx_buf: [0; MAX_FRAME_WORDS],
            rx_state: RxState::WaitHeader,
            rx_cursor: 0,
            pending: Frame::empty(),
            pending_header_word: 0,
            pending_length_word: 0,
            pending_filled: 0,
            pending_start_us: 0,
            last_rx_reset_us: 0,
            last_ack: None,
            last_ping_reply: None,
            topology: Topology::new(),
            stats: BusStats::default(),
            trace: TraceBuf::new(),
        }
    }

    pub fn set_node_id(&mut self, id: u8) {
        self.node_id = id & 0x1F;
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn set_speed_khz(&mut self, khz: u32) {
        self.hw.set_speed_khz(khz);
    }

    pub fn now_us(&self) -> u64 {
        self.hw.now_us()
    }

    pub fn delay_us(&mut self, us: u32) {
        self.hw.delay_us(us);
    }

    /// Carrier sense: true while the bus is driven.
    pub fn carrier_sense(&self) -> bool {
        self.hw.busy_line()
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = BusStats::default();
    }

    pub fn is_receiving(&self) -> bool {
        self.rx_state != RxState::WaitHeader
    }

    pub fn is_transmitting(&self) -> bool {
        self.hw.tx_busy()
    }

    /// The worker's local view of cluster membership, updated from
    /// topology broadcasts.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// True if an ACK matching `(src, stream)` has been recorded since the
    /// last [`Self::clear_ack`].
    pub fn check_ack(&self, expected_src: u8, expected_stream: u8) -> bool {
        self.last_ack == Some((expected_src, expected_stream))
    }

    pub fn clear_ack(&mut self) {
        self.last_ack = None;
    }

    /// Takes the most recent ping reply, if any.
    pub fn take_ping_reply(&mut self) -> Option<PingReply> {
        self.last_ping_reply.take()
    }

    /// Sends a link-layer ping: `[PING, seq, n0, n1, n2, n3]`. The reply
    /// is captured by the receive path; poll [`Self::take_ping_reply`].
    pub fn send_ping(
        &mut self,
        dest: u8,
        seq: u16,
        nonce: [u16; 4],
    ) -> Result<(), LinkError> {
        let payload = [
            link_opcode::PING,
            seq,
            nonce[0],
            nonce[1],
            nonce[2],
            nonce[3],
        ];
        self.send_frame(FrameType::Ctrl, dest, 0, true, &payload)
    }

    /// Controller: broadcasts the cluster presence bitmap.
    pub fn broadcast_topology(&mut self, bitmap: u32) -> Result<(), LinkError> {
        let payload = [
            link_opcode::TOPOLOGY,
            (bitmap & 0xFFFF) as u16,
            (bitmap >> 16) as u16,
        ];
        self.send_frame(FrameType::Ctrl, BROADCAST_ID, 0, true, &payload)
    }

    /// Transmits one frame. The caller has already arbitrated for the
    /// bus; this drives the lines, moves the beats, and releases.
    pub fn send_frame(
        &mut self,
        frame_type: FrameType,
        dest: u8,
        stream: u8,
        no_ack: bool,
        payload: &[u16],
    ) -> Result<(), LinkError> {
        if payload.len() > MAX_PAYLOAD_WORDS {
            return Err(LinkError::TooLong);
        }
        if self.node_id == NODE_ID_UNSET {
            return Err(LinkError::NodeIdUnset);
        }

        let header = Header {
            frame_type,
            src: self.node_id,
            dest,
            no_ack,
            stream,
        }
        .pack();
        let length = (payload.len() * 2) as u16;

        self.tx_buf[0] = header;
        self.tx_buf[1] = length;
        self.tx_buf[2..2 + payload.len()].copy_from_slice(payload);
        self.tx_buf[2 + payload.len()] = crc16_frame(header, length, payload);
        let total = payload.len() + 3;

        let start = self.hw.now_us();
        self.hw.acquire();
        self.hw.start_tx(&self.tx_buf[..total]);

        while self.hw.tx_busy() {
            if self.hw.now_us().saturating_sub(start) > TX_TIMEOUT_US {
                self.hw.abort_tx();
                self.release_lines();
                self.stats.tx_timeouts += 1;
                self.trace.record(Trace::TxTimeout);
                return Err(LinkError::TxTimeout);
            }
            self.hw.delay_us(1);
        }

        self.release_lines();

        let elapsed = self.hw.now_us().saturating_sub(start);
        self.stats.tx_count += 1;
        self.stats.last_tx_us = elapsed;
        self.stats.total_tx_us += elapsed;
        self.trace.record(Trace::TxFrame {
            dest,
            words: total as u16,
        });
        Ok(())
    }

    /// Data first, a discharge gap, then busy; the controller re-arms the
    /// idle pulldown once the lines are free.
    fn release_lines(&mut self) {
        self.hw.release_data();
        self.hw.delay_us(DATA_DISCHARGE_US);
        self.hw.release_busy();
        if self.is_controller {
            self.hw.arm_busy_pulldown();
        }
    }

    /// Pulls beats from the DMA ring through the framer. Returns true and
    /// fills `out` when a complete frame addressed to this node (or to
    /// everyone) has been assembled. Link-control frames are consumed
    /// internally and never returned.
    pub fn try_receive(&mut self, out: &mut Frame) -> bool {
        loop {
            let write_index = self.hw.rx_write_index();
            if write_index >= RX_RING_WORDS {
                // DMA writer escaped the ring. Nothing it wrote can be
                // trusted; rebuild the whole receive path.
                self.maybe_rx_reset();
                return false;
            }
            if self.rx_cursor == write_index {
                return false;
            }

            let beat = self.hw.rx_read(self.rx_cursor);
            self.rx_cursor = (self.rx_cursor + 1) & (RX_RING_WORDS - 1);

            match self.rx_state {
                RxState::WaitHeader => self.on_header_beat(beat),
                RxState::WaitLength => {
                    if !self.on_length_beat(beat) {
                        continue;
                    }
                }
                RxState::WaitPayload { words_left } => {
                    self.pending.payload[self.pending_filled] = beat;
                    self.pending_filled += 1;
                    self.rx_state = if words_left == 1 {
                        RxState::WaitCrc
                    } else {
                        RxState::WaitPayload {
                            words_left: words_left - 1,
                        }
                    };
                }
                RxState::WaitCrc => {
                    self.rx_state = RxState::WaitHeader;
                    if self.finish_frame(beat, out) {
                        return true;
                    }
                }
                RxState::DiscardWaitLength => {
                    // Length beat of a rejected frame: skip its payload
                    // and CRC without assembling anything.
                    let words = usize::from(beat).div_ceil(2);
                    if usize::from(beat) > MAX_PAYLOAD_BYTES {
                        self.protocol_error();
                    } else {
                        self.rx_state = RxState::DiscardSkip {
                            words_left: words + 1,
                        };
                    }
                    fence(Ordering::SeqCst);
                }
                RxState::DiscardSkip { words_left } => {
                    self.rx_state = if words_left <= 1 {
                        RxState::WaitHeader
                    } else {
                        RxState::DiscardSkip {
                            words_left: words_left - 1,
                        }
                    };
                    // Keep strictly behind the DMA writer while skipping.
                    fence(Ordering::SeqCst);
                }
            }
        }
    }

    fn on_header_beat(&mut self, beat: u16) {
        let header = Header::unpack(beat);

        let for_us = header.dest == self.node_id
            || header.dest == BROADCAST_ID;
        // A unicast from ourselves to ourselves is our own TX echo.
        let unicast_loopback = header.frame_type != FrameType::Broadcast
            && header.src == self.node_id
            && header.dest == self.node_id;

        if !for_us || unicast_loopback {
            self.rx_state = RxState::DiscardWaitLength;
            return;
        }

        self.pending_header_word = beat;
        self.pending.frame_type = header.frame_type;
        self.pending.src = header.src;
        self.pending.dest = header.dest;
        self.pending.stream = header.stream;
        self.pending.no_ack = header.no_ack;
        self.pending_filled = 0;
        self.pending_start_us = self.hw.now_us();
        self.rx_state = RxState::WaitLength;
    }

    /// Returns false on a protocol error (framer already resynced).
    fn on_length_beat(&mut self, beat: u16) -> bool {
        if usize::from(beat) > MAX_PAYLOAD_BYTES {
            self.protocol_error();
            return false;
        }
        self.pending_length_word = beat;
        self.pending.length = beat;
        let words = usize::from(beat).div_ceil(2);
        self.rx_state = if words == 0 {
            RxState::WaitCrc
        } else {
            RxState::WaitPayload { words_left: words }
        };
        true
    }

    /// CRC check, link-control interception, auto-ACK, delivery.
    fn finish_frame(&mut self, crc_beat: u16, out: &mut Frame) -> bool {
        let payload = &self.pending.payload[..self.pending_filled];
        let computed = crc16_frame(
            self.pending_header_word,
            self.pending_length_word,
            payload,
        );
        let crc_valid = computed == crc_beat;
        self.pending.crc_valid = crc_valid;
        self.pending.rx_time_us =
            self.hw.now_us().saturating_sub(self.pending_start_us);

        if crc_valid && self.intercept_link_control() {
            return false;
        }

        self.stats.rx_count += 1;
        self.stats.last_rx_us = self.pending.rx_time_us;
        self.stats.total_rx_us += self.pending.rx_time_us;
        if !crc_valid {
            self.stats.crc_errors += 1;
            self.trace.record(Trace::RxCrcError);
        } else {
            self.trace.record(Trace::RxFrame {
                src: self.pending.src,
                stream: self.pending.stream,
            });
        }

        // Auto-ACK: valid unicast with the no-ack flag clear, nothing
        // else. The ACK itself carries no-ack, so this cannot recurse.
        if crc_valid
            && self.pending.frame_type == FrameType::Unicast
            && !self.pending.no_ack
        {
            let ack = [link_opcode::ACK, u16::from(self.pending.stream)];
            let dest = self.pending.src;
            let stream = self.pending.stream;
            if self
                .send_frame(FrameType::Ctrl, dest, stream, true, &ack)
                .is_ok()
            {
                self.trace.record(Trace::AckSent { dest });
            }
        }

        out.clone_from(&self.pending);
        true
    }

    /// Handles ACK / PING / PING_REPLY / TOPOLOGY in place. Returns true
    /// if the frame was consumed. These are matched structurally (opcode
    /// plus exact length, and destination class for topology) so they can
    /// never shadow same-numbered management opcodes, whose payload shapes
    /// differ.
    fn intercept_link_control(&mut self) -> bool {
        if self.pending.frame_type != FrameType::Ctrl {
            return false;
        }
        let words = self.pending_filled;
        let p = &self.pending.payload;
        match p[0] {
            link_opcode::ACK if words == 2 => {
                self.last_ack =
                    Some((self.pending.src, (p[1] & 0x7) as u8));
                true
            }
            link_opcode::PING
                if words == 6 && self.pending.dest == self.node_id =>
            {
                let reply = [
                    link_opcode::PING_REPLY,
                    p[1],
                    p[2],
                    p[3],
                    p[4],
                    p[5],
                ];
                let dest = self.pending.src;
                let stream = self.pending.stream;
                if self
                    .send_frame(FrameType::Ctrl, dest, stream, true, &reply)
                    .is_ok()
                {
                    self.trace.record(Trace::PingReplySent { dest });
                }
                true
            }
            link_opcode::PING_REPLY
                if words == 6 && self.pending.dest == self.node_id =>
            {
                self.last_ping_reply = Some(PingReply {
                    src: self.pending.src,
                    seq: p[1],
                    nonce: [p[2], p[3], p[4], p[5]],
                });
                true
            }
            link_opcode::TOPOLOGY
                if words == 3 && self.pending.dest == BROADCAST_ID =>
            {
                let bitmap =
                    u32::from(p[1]) | u32::from(p[2]) << 16;
                let now_ms = (self.hw.now_us() / 1000) as u32;
                self.topology.apply_bitmap(bitmap, now_ms);
                self.trace.record(Trace::TopologyApplied);
                true
            }
            _ => false,
        }
    }

    fn protocol_error(&mut self) {
        // Flush everything buffered and resynchronize on the next beat
        // after the writer's current position.
        self.rx_cursor = self.hw.rx_write_index() & (RX_RING_WORDS - 1);
        self.rx_state = RxState::WaitHeader;
        self.stats.protocol_errors += 1;
        self.trace.record(Trace::ProtocolError);
    }

    fn maybe_rx_reset(&mut self) {
        let now = self.hw.now_us();
        if now.saturating_sub(self.last_rx_reset_us) < RX_RESET_INTERVAL_US
            && self.stats.rx_resets > 0
        {
            return;
        }
        self.hw.rx_reset();
        self.rx_cursor = 0;
        self.rx_state = RxState::WaitHeader;
        self.last_rx_reset_us = now;
        self.stats.rx_resets += 1;
        self.trace.record(Trace::RxReset);
    }
}

#[cfg(test)]
mod tests;

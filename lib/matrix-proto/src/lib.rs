// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire types for the Matrix bus.
//!
//! The Matrix bus moves 16-bit beats over a shared parallel backplane. A
//! frame is one header beat, one length beat (payload size in bytes), up to
//! [`MAX_PAYLOAD_WORDS`] payload beats, and a trailing CRC beat. This crate
//! defines the frame model, the header-word packing, and the frame CRC; it
//! knows nothing about the hardware that carries the beats.
//!
//! Header word layout, most significant bit first:
//!
//! ```text
//! [15:14] frame type   [13:9] source id   [8:4] destination id
//! [3]     no-ack flag  [2:0]  stream
//! ```
//!
//! Destination 31 addresses every listener. The frame CRC is CRC-16/IBM-3740
//! (CCITT polynomial 0x1021, init 0xFFFF, no reflection) computed over the
//! header, length, and payload beats, each fed high byte first to match the
//! bus's big-endian bit ordering across the data lines.

#![cfg_attr(not(test), no_std)]

use crc::{Crc, CRC_16_IBM_3740};

/// Maximum payload, in 16-bit beats. Every payload buffer in the stack is
/// sized from this one number.
pub const MAX_PAYLOAD_WORDS: usize = 600;

/// Maximum payload, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = MAX_PAYLOAD_WORDS * 2;

/// A full frame on the wire: header + length + payload + CRC.
pub const MAX_FRAME_WORDS: usize = MAX_PAYLOAD_WORDS + 3;

/// Destination value addressing every node.
pub const BROADCAST_ID: u8 = 31;

/// The controller's fixed node id.
pub const CONTROLLER_ID: u8 = 16;

/// Node ids 0-15 are workers, 16 is the controller.
pub const MAX_NODES: usize = 17;

/// Logical channels separating traffic classes.
pub mod stream {
    pub const NODE_MGMT: u8 = 0;
    pub const MEMORY: u8 = 1;
    pub const SNN_CONFIG: u8 = 2;
    pub const SNN_CONTROL: u8 = 3;
    pub const SPIKE: u8 = 4;
    pub const FIRMWARE: u8 = 5;
}

/// Control opcodes owned by the link layer itself. These never surface to
/// the broker's callers; the link layer recognizes them structurally (see
/// the receive path) and reacts in place.
pub mod link_opcode {
    /// `[ACK, stream]`, 2 words, no-ack set.
    pub const ACK: u16 = 0x0001;
    /// `[PING, seq, n0, n1, n2, n3]`, 6 words.
    pub const PING: u16 = 0x0002;
    /// Echo of a `PING`, same 6 words.
    pub const PING_REPLY: u16 = 0x0003;
    /// `[TOPOLOGY, bitmap_lo, bitmap_hi]`, 3 words, broadcast.
    pub const TOPOLOGY: u16 = 0x0004;
}

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Computes the frame CRC over a run of beats.
pub fn crc16_words(words: &[u16]) -> u16 {
    let mut digest = CRC16.digest();
    for &w in words {
        digest.update(&w.to_be_bytes());
    }
    digest.finalize()
}

/// Frame CRC: header beat, length beat, then the payload beats.
pub fn crc16_frame(header: u16, length: u16, payload: &[u16]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&header.to_be_bytes());
    digest.update(&length.to_be_bytes());
    for &w in payload {
        digest.update(&w.to_be_bytes());
    }
    digest.finalize()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameType {
    Unicast = 0,
    Broadcast = 1,
    Ack = 2,
    Ctrl = 3,
}

impl FrameType {
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0 => FrameType::Unicast,
            1 => FrameType::Broadcast,
            2 => FrameType::Ack,
            _ => FrameType::Ctrl,
        }
    }
}

/// The decoded header beat.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub frame_type: FrameType,
    pub src: u8,
    pub dest: u8,
    pub no_ack: bool,
    pub stream: u8,
}

impl Header {
    pub fn pack(&self) -> u16 {
        (self.frame_type as u16) << 14
            | u16::from(self.src & 0x1f) << 9
            | u16::from(self.dest & 0x1f) << 4
            | u16::from(self.no_ack) << 3
            | u16::from(self.stream & 0x7)
    }

    pub fn unpack(word: u16) -> Self {
        Self {
            frame_type: FrameType::from_bits(word >> 14),
            src: ((word >> 9) & 0x1f) as u8,
            dest: ((word >> 4) & 0x1f) as u8,
            no_ack: word & 0x8 != 0,
            stream: (word & 0x7) as u8,
        }
    }
}

/// A frame as handed to or received from the link layer.
///
/// Frames are ephemeral: they live in broker queues and receive buffers and
/// are copied in and out wholesale. The payload is inline so that an enqueue
/// is a single copy.
#[derive(Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub src: u8,
    pub dest: u8,
    pub stream: u8,
    pub no_ack: bool,
    /// Payload length in bytes.
    pub length: u16,
    pub payload: [u16; MAX_PAYLOAD_WORDS],
    /// Result of CRC validation on receive. A frame with `crc_valid ==
    /// false` must be treated as corrupt by the caller.
    pub crc_valid: bool,
    /// Time spent receiving this frame, in microseconds.
    pub rx_time_us: u64,
}

impl Frame {
    pub const fn empty() -> Self {
        Self {
            frame_type: FrameType::Unicast,
            src: 0,
            dest: 0,
            stream: 0,
            no_ack: false,
            length: 0,
            payload: [0; MAX_PAYLOAD_WORDS],
            crc_valid: false,
            rx_time_us: 0,
        }
    }

    /// Payload length in beats, rounding a trailing odd byte up.
    pub fn payload_words(&self) -> usize {
        usize::from(self.length).div_ceil(2)
    }

    /// The live portion of the payload.
    pub fn payload(&self) -> &[u16] {
        &self.payload[..self.payload_words().min(MAX_PAYLOAD_WORDS)]
    }

    pub fn header(&self) -> Header {
        Header {
            frame_type: self.frame_type,
            src: self.src,
            dest: self.dest,
            no_ack: self.no_ack,
            stream: self.stream,
        }
    }

    /// First payload word, which for CTRL frames is the opcode.
    pub fn opcode(&self) -> Option<u16> {
        if self.length >= 2 {
            Some(self.payload[0])
        } else {
            None
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::empty()
    }
}

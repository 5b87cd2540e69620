// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command opcodes and payload layouts for the cluster control plane.
//!
//! All commands travel as CTRL frames with the opcode in the first payload
//! word. Opcodes are grouped by stream; replies set bit 7 of the request
//! opcode's group. The numeric values here are load-bearing for interop
//! with deployed firmware; the unit tests pin them.
//!
//! Multi-word payload layouts are expressed as plain structs with
//! `to_words`/`from_words` codecs. 32-bit quantities are split into two
//! beats, low half first.

#![cfg_attr(not(test), no_std)]

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

/// Command opcodes, grouped by stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    // Node management (stream 0)
    Ping = 0x01,
    ResetToBootloader = 0x02,
    ReadStatus = 0x03,
    SetLed = 0x04,
    Discover = 0x05,
    Pong = 0x81,
    ResetAck = 0x82,
    Status = 0x83,
    LedAck = 0x84,
    DiscoverAck = 0x85,

    // Memory operations (stream 1)
    WriteMemory = 0x10,
    ReadMemory = 0x11,
    ClearMemory = 0x12,
    WriteAck = 0x90,
    ReadData = 0x91,

    // SNN configuration (stream 2)
    DeployTopology = 0x20,
    ClearTopology = 0x21,
    SetTimestep = 0x22,
    InjectSpikeBatch = 0x23,
    GetNeuronInfo = 0x24,
    DeployAck = 0xA0,
    ConfigAck = 0xA1,
    NeuronInfo = 0xA2,

    // SNN control (stream 3)
    StartSnn = 0x30,
    StopSnn = 0x31,
    PauseSnn = 0x32,
    ResumeSnn = 0x33,
    GetSnnStatus = 0x34,
    SnnAck = 0xB0,
    SnnStatus = 0xB1,

    // Firmware update (stream 5)
    UpdateStart = 0x40,
    UpdateDataChunk = 0x41,
    UpdatePoll = 0x42,
    UpdateCommit = 0x43,
    UpdateRestart = 0x44,
    UpdateModeEnter = 0x45,
    UpdateModeExit = 0x46,
    BootNow = 0x47,
    UpdateReady = 0xC0,
    UpdateAckChunk = 0xC1,
    UpdateVerifyResp = 0xC2,
    UpdateCommitResp = 0xC3,
    UpdateError = 0xC4,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Option<Self> {
        <Self as num_traits::FromPrimitive>::from_u16(v)
    }

    /// The stream this opcode's traffic belongs on.
    pub fn stream(&self) -> u8 {
        use matrix_proto::stream;
        match (*self as u16) & 0x7f {
            0x01..=0x0f => stream::NODE_MGMT,
            0x10..=0x1f => stream::MEMORY,
            0x20..=0x2f => stream::SNN_CONFIG,
            0x30..=0x3f => stream::SNN_CONTROL,
            _ => stream::FIRMWARE,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload shorter than the layout requires.
    Short,
    /// Opcode word does not match the expected layout.
    WrongOpcode,
    /// A field held a value outside its domain.
    BadValue,
}

#[inline]
pub fn lo(v: u32) -> u16 {
    (v & 0xffff) as u16
}

#[inline]
pub fn hi(v: u32) -> u16 {
    (v >> 16) as u16
}

#[inline]
pub fn join(lo: u16, hi: u16) -> u32 {
    u32::from(lo) | u32::from(hi) << 16
}

/// Packs bytes into beats, little-endian within each beat, zero-padding a
/// trailing odd byte. Returns the number of beats used.
pub fn bytes_to_words(bytes: &[u8], out: &mut [u16]) -> usize {
    let words = bytes.len().div_ceil(2);
    for (i, w) in out[..words].iter_mut().enumerate() {
        let lo = bytes[i * 2];
        let hi = bytes.get(i * 2 + 1).copied().unwrap_or(0);
        *w = u16::from(lo) | u16::from(hi) << 8;
    }
    words
}

/// Unpacks `out.len()` bytes from beats, little-endian within each beat.
pub fn words_to_bytes(words: &[u16], out: &mut [u8]) {
    for (i, b) in out.iter_mut().enumerate() {
        let w = words[i / 2];
        *b = if i % 2 == 0 { w as u8 } else { (w >> 8) as u8 };
    }
}

fn expect(words: &[u16], opcode: Opcode, len: usize) -> Result<(), DecodeError> {
    if words.len() < len {
        return Err(DecodeError::Short);
    }
    if words[0] != opcode as u16 {
        return Err(DecodeError::WrongOpcode);
    }
    Ok(())
}

/// READ_STATUS reply, 11 words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub node_id: u8,
    pub uptime_ms: u32,
    pub free_mem: u32,
    pub led: (u8, u8, u8),
    pub snn_running: bool,
    pub neuron_count: u16,
}

impl Status {
    pub const WORDS: usize = 11;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::Status as u16,
            u16::from(self.node_id),
            lo(self.uptime_ms),
            hi(self.uptime_ms),
            lo(self.free_mem),
            hi(self.free_mem),
            u16::from(self.led.0),
            u16::from(self.led.1),
            u16::from(self.led.2),
            u16::from(self.snn_running),
            self.neuron_count,
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::Status, Self::WORDS)?;
        Ok(Self {
            node_id: words[1] as u8,
            uptime_ms: join(words[2], words[3]),
            free_mem: join(words[4], words[5]),
            led: (words[6] as u8, words[7] as u8, words[8] as u8),
            snn_running: words[9] != 0,
            neuron_count: words[10],
        })
    }
}

/// SET_LED request, 4 words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetLed {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl SetLed {
    pub const WORDS: usize = 4;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::SetLed as u16,
            u16::from(self.r),
            u16::from(self.g),
            u16::from(self.b),
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::SetLed, Self::WORDS)?;
        Ok(Self {
            r: words[1] as u8,
            g: words[2] as u8,
            b: words[3] as u8,
        })
    }
}

/// Header for WRITE_MEMORY / READ_MEMORY / READ_DATA, 6 words, followed by
/// data beats for writes and read replies.
///
/// Addresses are 32-bit offsets relative to the target's external memory
/// base, 32-bit aligned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryHeader {
    pub opcode: Opcode,
    pub length_bytes: u16,
    pub addr: u32,
}

impl MemoryHeader {
    pub const WORDS: usize = 6;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            self.opcode as u16,
            self.length_bytes,
            lo(self.addr),
            hi(self.addr),
            0,
            0,
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        if words.len() < Self::WORDS {
            return Err(DecodeError::Short);
        }
        let opcode = match Opcode::from_u16(words[0]) {
            Some(
                op @ (Opcode::WriteMemory | Opcode::ReadMemory | Opcode::ReadData),
            ) => op,
            _ => return Err(DecodeError::WrongOpcode),
        };
        Ok(Self {
            opcode,
            length_bytes: words[1],
            addr: join(words[2], words[3]),
        })
    }
}

/// CLEAR_MEMORY request, 6 words: zero-fill `len` bytes at `addr`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClearMemory {
    pub addr: u32,
    pub len: u32,
}

impl ClearMemory {
    pub const WORDS: usize = 6;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::ClearMemory as u16,
            0,
            lo(self.addr),
            hi(self.addr),
            lo(self.len),
            hi(self.len),
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::ClearMemory, Self::WORDS)?;
        Ok(Self {
            addr: join(words[2], words[3]),
            len: join(words[4], words[5]),
        })
    }
}

/// GET_SNN_STATUS reply, 8 words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SnnStatus {
    pub running: bool,
    pub neuron_count: u16,
    pub active_neurons: u16,
    pub total_spikes: u32,
    pub spike_rate_hz: u32,
}

impl SnnStatus {
    pub const WORDS: usize = 8;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::SnnStatus as u16,
            u16::from(self.running),
            self.neuron_count,
            self.active_neurons,
            lo(self.total_spikes),
            hi(self.total_spikes),
            lo(self.spike_rate_hz),
            hi(self.spike_rate_hz),
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::SnnStatus, Self::WORDS)?;
        Ok(Self {
            running: words[1] != 0,
            neuron_count: words[2],
            active_neurons: words[3],
            total_spikes: join(words[4], words[5]),
            spike_rate_hz: join(words[6], words[7]),
        })
    }
}

/// UPDATE_START request, 8 words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpdateStart {
    pub target: u8,
    pub size: u32,
    pub crc32: u32,
    pub chunk_size: u16,
    pub total_chunks: u16,
}

impl UpdateStart {
    pub const WORDS: usize = 8;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::UpdateStart as u16,
            u16::from(self.target),
            lo(self.size),
            hi(self.size),
            lo(self.crc32),
            hi(self.crc32),
            self.chunk_size,
            self.total_chunks,
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::UpdateStart, Self::WORDS)?;
        Ok(Self {
            target: words[1] as u8,
            size: join(words[2], words[3]),
            crc32: join(words[4], words[5]),
            chunk_size: words[6],
            total_chunks: words[7],
        })
    }
}

/// UPDATE_READY reply, 4 words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpdateReady {
    pub node_id: u8,
    pub status: u16,
    pub avail_kib: u16,
}

impl UpdateReady {
    pub const WORDS: usize = 4;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::UpdateReady as u16,
            u16::from(self.node_id),
            self.status,
            self.avail_kib,
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::UpdateReady, Self::WORDS)?;
        Ok(Self {
            node_id: words[1] as u8,
            status: words[2],
            avail_kib: words[3],
        })
    }
}

/// UPDATE_DATA_CHUNK header, 4 words, followed by `data_size` bytes of
/// firmware as beats.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub target: u8,
    pub chunk_num: u16,
    pub data_size: u16,
}

impl ChunkHeader {
    pub const WORDS: usize = 4;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::UpdateDataChunk as u16,
            u16::from(self.target),
            self.chunk_num,
            self.data_size,
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::UpdateDataChunk, Self::WORDS)?;
        Ok(Self {
            target: words[1] as u8,
            chunk_num: words[2],
            data_size: words[3],
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum PollType {
    Status = 0,
    Verify = 1,
}

/// UPDATE_POLL request, 3 words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UpdatePoll {
    pub target: u8,
    pub poll_type: PollType,
}

impl UpdatePoll {
    pub const WORDS: usize = 3;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::UpdatePoll as u16,
            u16::from(self.target),
            self.poll_type as u16,
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::UpdatePoll, Self::WORDS)?;
        let poll_type =
            PollType::from_u16(words[2]).ok_or(DecodeError::BadValue)?;
        Ok(Self {
            target: words[1] as u8,
            poll_type,
        })
    }
}

/// UPDATE_VERIFY_RESP reply, 4 words. `status == 0` means the staged image
/// matched the expected CRC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VerifyResp {
    pub status: u16,
    pub crc32: u32,
}

impl VerifyResp {
    pub const WORDS: usize = 4;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            Opcode::UpdateVerifyResp as u16,
            self.status,
            lo(self.crc32),
            hi(self.crc32),
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        expect(words, Opcode::UpdateVerifyResp, Self::WORDS)?;
        Ok(Self {
            status: words[1],
            crc32: join(words[2], words[3]),
        })
    }
}

/// Worker-side error codes carried in UPDATE_ERROR replies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u16)]
pub enum UpdateErrorCode {
    BadMagic = 1,
    CrcMismatch = 2,
    BadSize = 3,
    FlashFault = 4,
    ChunkSequence = 5,
}

/// Spike broadcast payload, 3 words:
/// `[gid & 0xffff, (gid >> 16) & 0xff, value * 1000]`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpikePayload {
    pub global_id: u32,
    pub value: f32,
}

impl SpikePayload {
    pub const WORDS: usize = 3;

    pub fn to_words(&self) -> [u16; Self::WORDS] {
        [
            lo(self.global_id),
            hi(self.global_id) & 0xff,
            (self.value * 1000.0) as u16,
        ]
    }

    pub fn from_words(words: &[u16]) -> Result<Self, DecodeError> {
        if words.len() < Self::WORDS {
            return Err(DecodeError::Short);
        }
        Ok(Self {
            global_id: join(words[0], words[1] & 0xff),
            value: f32::from(words[2]) / 1000.0,
        })
    }
}

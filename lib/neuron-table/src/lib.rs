// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The packed neuron table stored in external memory.
//!
//! A deployed topology is a run of consecutive 256-byte entries starting at
//! the fixed table offset, terminated by an entry whose local id is
//! `0xFFFF`. Each entry carries the neuron's LIF parameters and an inline
//! array of packed synapses.
//!
//! A packed synapse is one 32-bit word: the high 24 bits are the global
//! source neuron id `(node << 16) | local`, the low 8 bits an encoded
//! weight. Weight bytes 0..=127 map to `+b/63.5` (0.0 to +2.0); bytes
//! 128..=255 map to `-(b - 128)/63.5` (0.0 to -2.0).

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use cluster_hw::ExtMem;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{F32, U16, U32};
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
};

/// Size of one table entry.
pub const ENTRY_SIZE: usize = 256;

/// Synapse slots per entry: what remains of the 256-byte envelope after
/// the 28-byte parameter block.
pub const MAX_SYNAPSES: usize = 57;

/// Local id marking the end of the table.
pub const TERMINATOR_ID: u16 = 0xFFFF;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct NeuronFlags: u16 {
        /// Externally driven input neuron.
        const INPUT = 1 << 0;
        /// Spikes from this neuron are of interest to the host; reserved
        /// for the recording path.
        const RECORD = 1 << 1;
    }
}

/// One packed table entry, exactly as stored in external memory.
#[derive(
    FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy,
)]
#[repr(C)]
pub struct RawNeuron {
    pub local_id: U16,
    pub flags: U16,
    pub potential: F32,
    pub threshold: F32,
    pub last_spike_us: U32,
    pub synapse_count: U16,
    pub synapse_capacity: U16,
    pub leak_rate: F32,
    pub refractory_us: U32,
    pub synapses: [U32; MAX_SYNAPSES],
}

const_assert_eq!(core::mem::size_of::<RawNeuron>(), ENTRY_SIZE);

impl RawNeuron {
    /// A terminator entry; everything but the id is zero.
    pub fn terminator() -> Self {
        let mut n = Self::new_zeroed();
        n.local_id = U16::new(TERMINATOR_ID);
        n
    }

    pub fn is_terminator(&self) -> bool {
        self.local_id.get() == TERMINATOR_ID
    }

    pub fn neuron_flags(&self) -> NeuronFlags {
        NeuronFlags::from_bits_truncate(self.flags.get())
    }

    /// The live synapse words.
    pub fn live_synapses(&self) -> &[U32] {
        let count = usize::from(self.synapse_count.get()).min(MAX_SYNAPSES);
        &self.synapses[..count]
    }
}

/// Encodes a weight into the 8-bit wire form. The two zero encodings (0
/// and 128) collapse to byte 0.
pub fn encode_weight(weight: f32) -> u8 {
    if weight >= 0.0 {
        let q = (weight * 63.5 + 0.5) as i32;
        q.min(127) as u8
    } else {
        let q = (-weight * 63.5 + 0.5) as i32;
        128 + q.min(127) as u8
    }
}

/// Decodes an 8-bit weight.
pub fn decode_weight(byte: u8) -> f32 {
    if byte < 128 {
        f32::from(byte) / 63.5
    } else {
        -f32::from(byte - 128) / 63.5
    }
}

/// Packs a synapse word from a 24-bit global source id and a weight byte.
pub fn pack_synapse(source: u32, weight: u8) -> u32 {
    (source & 0x00FF_FFFF) << 8 | u32::from(weight)
}

/// Splits a synapse word into (global source id, weight byte).
pub fn unpack_synapse(word: u32) -> (u32, u8) {
    (word >> 8, (word & 0xFF) as u8)
}

/// Builds a global neuron id.
pub fn global_id(node: u8, local: u16) -> u32 {
    u32::from(node) << 16 | u32::from(local)
}

/// Splits a global neuron id into (node, local).
pub fn split_global_id(gid: u32) -> (u8, u16) {
    ((gid >> 16) as u8, (gid & 0xFFFF) as u16)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TableError {
    /// Ran past `max_entries` without seeing a terminator.
    Unterminated,
    /// An entry declared more synapses than its inline array holds.
    BadSynapseCount { local_id: u16, count: u16 },
}

/// Reads the entry at `index` from the table at `base`.
pub fn read_entry(mem: &impl ExtMem, base: u32, index: usize) -> RawNeuron {
    let mut bytes = [0u8; ENTRY_SIZE];
    mem.read(base + (index * ENTRY_SIZE) as u32, &mut bytes);
    RawNeuron::read_from_bytes(&bytes).unwrap_or_else(|_| RawNeuron::terminator())
}

/// Writes the entry at `index`.
pub fn write_entry(
    mem: &mut impl ExtMem,
    base: u32,
    index: usize,
    entry: &RawNeuron,
) {
    mem.write(base + (index * ENTRY_SIZE) as u32, entry.as_bytes());
}

/// Walks the table at `base`, yielding each live entry to `visit`, and
/// returns the number of entries before the terminator.
pub fn for_each_entry<M: ExtMem>(
    mem: &M,
    base: u32,
    max_entries: usize,
    mut visit: impl FnMut(usize, &RawNeuron) -> Result<(), TableError>,
) -> Result<usize, TableError> {
    for index in 0..max_entries {
        let entry = read_entry(mem, base, index);
        if entry.is_terminator() {
            return Ok(index);
        }
        let count = entry.synapse_count.get();
        if usize::from(count) > MAX_SYNAPSES {
            return Err(TableError::BadSynapseCount {
                local_id: entry.local_id.get(),
                count,
            });
        }
        visit(index, &entry)?;
    }
    Err(TableError::Unterminated)
}

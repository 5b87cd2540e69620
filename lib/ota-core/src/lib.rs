// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware-update session state, for both ends of the bus.
//!
//! The [`target`] module is the worker side: it stages chunks, tracks
//! receipt in a bitmap, verifies the staged image, and programs flash. The
//! [`controller`] module is the sending side: a state machine that walks
//! `UPDATE_START → chunks → VERIFY → COMMIT → RESTART` with per-phase
//! deadlines and chunk retries.
//!
//! Neither side does its own I/O. The controller machine emits
//! [`controller::Action`] values describing the frame to send next; the
//! target takes a [`Staging`] buffer and a flash handle from its caller.
//! This keeps every transition host-testable.

#![cfg_attr(not(test), no_std)]

use cluster_hw::ExtMem;

pub mod controller;
pub mod target;

/// Upper bound on chunks per session; bounds the receipt bitmap.
pub const MAX_CHUNKS: usize = 4096;

/// Receipt bitmap for up to [`MAX_CHUNKS`] chunks.
#[derive(Clone)]
pub struct ChunkBitmap {
    words: [u32; MAX_CHUNKS / 32],
}

impl ChunkBitmap {
    pub const fn new() -> Self {
        Self {
            words: [0; MAX_CHUNKS / 32],
        }
    }

    pub fn clear(&mut self) {
        self.words = [0; MAX_CHUNKS / 32];
    }

    /// Marks `chunk` received; returns whether it was already marked.
    pub fn mark(&mut self, chunk: u16) -> bool {
        let word = usize::from(chunk) / 32;
        let bit = 1 << (chunk % 32);
        let seen = self.words[word] & bit != 0;
        self.words[word] |= bit;
        seen
    }

    pub fn is_marked(&self, chunk: u16) -> bool {
        let word = usize::from(chunk) / 32;
        self.words[word] & (1 << (chunk % 32)) != 0
    }

    /// Index of the first unmarked chunk below `total`, if any.
    pub fn first_missing(&self, total: u16) -> Option<u16> {
        (0..total).find(|&c| !self.is_marked(c))
    }
}

impl Default for ChunkBitmap {
    fn default() -> Self {
        Self::new()
    }
}

/// Where staged firmware bytes live before they are committed to flash.
///
/// The application stages into PSRAM; the bootloader must stage into SRAM
/// (PSRAM is not reliable under the bootloader's XIP cache behavior), which
/// is why the capacity is part of the contract rather than a constant.
pub trait Staging {
    fn capacity(&self) -> u32;
    fn write(&mut self, offset: u32, data: &[u8]);
    fn read(&self, offset: u32, buf: &mut [u8]);
}

/// SRAM staging: a plain borrowed buffer.
pub struct SramStaging<'a> {
    buf: &'a mut [u8],
}

impl<'a> SramStaging<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }
}

impl Staging for SramStaging<'_> {
    fn capacity(&self) -> u32 {
        self.buf.len() as u32
    }

    fn write(&mut self, offset: u32, data: &[u8]) {
        let offset = offset as usize;
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read(&self, offset: u32, buf: &mut [u8]) {
        let offset = offset as usize;
        buf.copy_from_slice(&self.buf[offset..offset + buf.len()]);
    }
}

/// PSRAM staging: a window of external memory. Writes take the uncached
/// path via the `ExtMem` contract.
pub struct PsramStaging<'a, M: ExtMem> {
    mem: &'a mut M,
    base: u32,
    capacity: u32,
}

impl<'a, M: ExtMem> PsramStaging<'a, M> {
    pub fn new(mem: &'a mut M, base: u32, capacity: u32) -> Self {
        Self {
            mem,
            base,
            capacity,
        }
    }
}

impl<M: ExtMem> Staging for PsramStaging<'_, M> {
    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn write(&mut self, offset: u32, data: &[u8]) {
        self.mem.write(self.base + offset, data);
    }

    fn read(&self, offset: u32, buf: &mut [u8]) {
        self.mem.read(self.base + offset, buf);
    }
}

/// CRC-32 over the first `len` staged bytes, read back in page-sized
/// pieces.
pub fn staged_crc(staging: &impl Staging, len: u32) -> u32 {
    let mut crc = app_image::ImageCrc::new();
    let mut buf = [0u8; 256];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(buf.len() as u32);
        staging.read(done, &mut buf[..n as usize]);
        crc.update(&buf[..n as usize]);
        done += n;
    }
    crc.finalize()
}

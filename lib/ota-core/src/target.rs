// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker-side update session.

use crate::{staged_crc, ChunkBitmap, Staging, MAX_CHUNKS};
use cluster_hw::{map, Flash};

/// Session lifecycle on the receiving node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Receiving,
    Committed,
}

/// Wire-visible error codes, reported in UPDATE_ERROR replies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    NoSession,
    /// Declared image does not fit the staging buffer or the partition.
    BadSize,
    /// Chunk number at or past `total_chunks`.
    ChunkOutOfRange,
    /// Chunk data would run past the declared image size.
    ChunkOverrun,
    /// Erase or program reported a hardware fault.
    FlashFault,
    /// Post-flash readback CRC did not match.
    CrcMismatch,
}

/// Parameters announced by UPDATE_START.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Params {
    pub size: u32,
    pub expected_crc32: u32,
    pub chunk_size: u16,
    pub total_chunks: u16,
}

pub struct TargetSession {
    state: State,
    params: Params,
    chunks_received: u16,
    bitmap: ChunkBitmap,
    last_activity_us: u64,
}

impl TargetSession {
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            params: Params {
                size: 0,
                expected_crc32: 0,
                chunk_size: 0,
                total_chunks: 0,
            },
            chunks_received: 0,
            bitmap: ChunkBitmap::new(),
            last_activity_us: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Receiving
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn chunks_received(&self) -> u16 {
        self.chunks_received
    }

    /// True once every announced chunk has arrived.
    pub fn is_complete(&self) -> bool {
        self.state == State::Receiving
            && self.bitmap.first_missing(self.params.total_chunks).is_none()
    }

    /// Sessions die of inactivity; the service loop decides when to call
    /// this and what to do about it.
    pub fn is_stale(&self, now_us: u64, timeout_us: u64) -> bool {
        self.state == State::Receiving
            && now_us.saturating_sub(self.last_activity_us) > timeout_us
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Opens a session. The previous session, if any, is discarded; the
    /// controller's retry of UPDATE_START must not wedge the target.
    pub fn start(
        &mut self,
        params: Params,
        staging_capacity: u32,
        now_us: u64,
    ) -> Result<(), Error> {
        if params.size == 0
            || params.size > staging_capacity
            || params.size > map::APP_PARTITION_SIZE
        {
            return Err(Error::BadSize);
        }
        if params.chunk_size == 0
            || params.total_chunks == 0
            || usize::from(params.total_chunks) > MAX_CHUNKS
        {
            return Err(Error::BadSize);
        }
        // The chunk grid must cover the image.
        let covered =
            u32::from(params.chunk_size) * u32::from(params.total_chunks);
        if covered < params.size {
            return Err(Error::BadSize);
        }

        self.state = State::Receiving;
        self.params = params;
        self.chunks_received = 0;
        self.bitmap.clear();
        self.last_activity_us = now_us;
        Ok(())
    }

    /// Stages one chunk at `chunk_num * chunk_size`. Chunks may arrive in
    /// any order; re-delivery is idempotent.
    pub fn accept_chunk(
        &mut self,
        chunk_num: u16,
        data: &[u8],
        staging: &mut impl Staging,
        now_us: u64,
    ) -> Result<(), Error> {
        if self.state != State::Receiving {
            return Err(Error::NoSession);
        }
        if chunk_num >= self.params.total_chunks {
            return Err(Error::ChunkOutOfRange);
        }
        let offset = u32::from(chunk_num) * u32::from(self.params.chunk_size);
        let end = offset + data.len() as u32;
        if data.len() > usize::from(self.params.chunk_size)
            || end > self.params.size
        {
            return Err(Error::ChunkOverrun);
        }

        staging.write(offset, data);
        if !self.bitmap.mark(chunk_num) {
            self.chunks_received += 1;
        }
        self.last_activity_us = now_us;
        Ok(())
    }

    /// Computes the CRC of the staged image prefix. `(0, crc)` on match,
    /// `(1, crc)` otherwise, which is the wire form of UPDATE_VERIFY_RESP.
    pub fn verify(&self, staging: &impl Staging) -> (u16, u32) {
        let crc = staged_crc(staging, self.params.size);
        let status = u16::from(crc != self.params.expected_crc32);
        (status, crc)
    }

    /// Erases the application partition and programs the staged image,
    /// then proves the flash contents by CRC readback.
    ///
    /// The erase is rounded up to whole sectors; the final partial page is
    /// padded with 0xFF. On success the session is `Committed` and the
    /// readback CRC is returned.
    pub fn commit(
        &mut self,
        staging: &impl Staging,
        flash: &mut impl Flash,
    ) -> Result<u32, Error> {
        if self.state != State::Receiving {
            return Err(Error::NoSession);
        }

        let size = self.params.size;
        let sector = map::FLASH_SECTOR_SIZE;
        let erase_len = size.div_ceil(sector) * sector;
        flash
            .erase(map::APP_PARTITION_OFFSET, erase_len)
            .map_err(|_| Error::FlashFault)?;

        let page = map::FLASH_PAGE_SIZE as usize;
        let mut buf = [0xFFu8; map::FLASH_PAGE_SIZE as usize];
        let mut offset = 0;
        while offset < size {
            let n = (size - offset).min(page as u32) as usize;
            buf.fill(0xFF);
            staging.read(offset, &mut buf[..n]);
            flash
                .program(map::APP_PARTITION_OFFSET + offset, &buf)
                .map_err(|_| Error::FlashFault)?;
            offset += page as u32;
        }

        // Read back what flash actually holds, not what we meant to write.
        let mut crc = app_image::ImageCrc::new();
        let mut offset = 0;
        while offset < size {
            let n = (size - offset).min(page as u32) as usize;
            flash.read(map::APP_PARTITION_OFFSET + offset, &mut buf[..n]);
            crc.update(&buf[..n]);
            offset += n as u32;
        }
        let readback = crc.finalize();
        if readback != self.params.expected_crc32 {
            return Err(Error::CrcMismatch);
        }

        self.state = State::Committed;
        Ok(readback)
    }
}

impl Default for TargetSession {
    fn default() -> Self {
        Self::new()
    }
}

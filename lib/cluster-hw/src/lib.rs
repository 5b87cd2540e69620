// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware contracts shared by the bootloader, worker, and controller.
//!
//! The cluster firmware never touches registers directly from its service
//! logic; everything hardware-shaped sits behind one of the traits in this
//! crate. Real backends implement them against the SoC; host tests use the
//! RAM-backed versions in [`mock`].
//!
//! Also here: the fixed memory map both partitions agree on, and the
//! scratch-register latch that carries the node id across soft resets.

#![cfg_attr(not(test), no_std)]

#[cfg(any(test, feature = "mock"))]
extern crate std;

/// The fixed memory map. Both the bootloader and the application bake these
/// in; changing any of them is a flag-day for the whole cluster.
pub mod map {
    /// External PSRAM size.
    pub const PSRAM_SIZE: u32 = 8 * 1024 * 1024;

    /// PSRAM prefix reserved for driver working buffers.
    pub const DRIVER_RESERVED: u32 = 0x1_0000;

    /// OTA staging buffer offset in PSRAM (application builds).
    pub const OTA_STAGING_OFFSET: u32 = 0x1_0000;

    /// HTTP response staging region offset in PSRAM (controller).
    pub const HTTP_STAGING_OFFSET: u32 = 0x2_1000;

    /// Start of the neuron table in PSRAM.
    pub const NEURON_TABLE_OFFSET: u32 = 0x10_0000;

    /// Bootloader partition: flash offset 0, fixed reservation.
    pub const BOOT_PARTITION_SIZE: u32 = 0x8_0000;

    /// Application partition offset in flash.
    pub const APP_PARTITION_OFFSET: u32 = 0x8_0000;

    /// Application partition capacity (7.5 MiB).
    pub const APP_PARTITION_SIZE: u32 = 7680 * 1024;

    /// Cached XIP alias of external flash.
    pub const XIP_CACHED_BASE: u32 = 0x1000_0000;

    /// Uncached XIP alias. Writes that must outlast a cache eviction go
    /// through this alias; see [`crate::ExtMem`].
    pub const XIP_UNCACHED_BASE: u32 = 0x1500_0000;

    /// Flash erase granule.
    pub const FLASH_SECTOR_SIZE: u32 = 4096;

    /// Flash program granule.
    pub const FLASH_PAGE_SIZE: u32 = 256;

    /// SRAM OTA staging size in the bootloader. PSRAM is not usable as a
    /// staging area while the bootloader's broker is active, so the
    /// bootloader caps staged images at this size.
    pub const BOOT_OTA_STAGING_SIZE: u32 = 48 * 1024;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlashError {
    /// Offset or length violates sector/page alignment.
    Unaligned,
    /// Operation runs past the end of the device.
    OutOfBounds,
    /// The controller reported a program or erase failure.
    Fault,
}

/// On-package flash. `erase` operates on whole sectors, `program` on whole
/// pages. Implementations must mask interrupts for the duration of erase
/// and program calls; callers are running from the other partition's XIP
/// mapping while this happens.
pub trait Flash {
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
    fn read(&self, offset: u32, buf: &mut [u8]);
}

/// External PSRAM, addressed by offset from its base.
///
/// The part is mapped twice, through a cached and an uncached alias. The
/// contract preserved here: `write` goes through the uncached alias, so a
/// later `read` (which may use the cached alias) never observes a stale
/// line evicted over fresh data. Mixing a cached write with an uncached
/// read of the same range is the bug this split exists to prevent.
pub trait ExtMem {
    fn size(&self) -> u32;
    /// Uncached write.
    fn write(&mut self, addr: u32, data: &[u8]);
    /// Read; implementations may serve this from the cached alias.
    fn read(&self, addr: u32, buf: &mut [u8]);

    fn write_word(&mut self, addr: u32, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    fn read_word(&self, addr: u32) -> u32 {
        let mut buf = [0; 4];
        self.read(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Zero-fills `len` bytes starting at `addr`.
    fn clear(&mut self, addr: u32, len: u32) {
        let zeros = [0u8; 64];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(zeros.len() as u32);
            self.write(addr + done, &zeros[..n as usize]);
            done += n;
        }
    }
}

/// A 32-bit register that survives watchdog resets.
pub trait Scratch {
    fn load(&self) -> u32;
    fn store(&mut self, value: u32);
}

/// The four node-id strap GPIOs, read as a 4-bit value.
pub trait Straps {
    fn read_id(&self) -> u8;
}

/// The status RGB LED, 8-bit per channel brightness.
pub trait RgbLed {
    fn set(&mut self, r: u8, g: u8, b: u8);
    fn get(&self) -> (u8, u8, u8);
}

pub trait Watchdog {
    fn feed(&mut self);
    /// Requests a watchdog reset. Scratch registers survive. The reset is
    /// asynchronous; callers should stop doing useful work after this.
    fn trigger_reset(&mut self);
}

/// Vectors for handing control to the application partition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct JumpVectors {
    /// Flash address of the application's vector table.
    pub vector_base: u32,
    /// Initial stack pointer, first word of the vector table.
    pub stack_pointer: u32,
    /// Reset handler, second word of the vector table.
    pub reset_handler: u32,
}

/// The one-way door into the application. A successful jump never returns;
/// a return value means the handoff could not even be attempted.
pub trait Handoff {
    fn jump(&mut self, vectors: JumpVectors) -> HandoffFault;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandoffFault {
    /// The vectors were rejected before the branch (null SP or handler).
    BadVectors,
    /// The branch returned, which must never happen.
    Returned,
}

/// Node-id persistence across soft resets.
///
/// The scratch register holds `MAGIC | id`; the magic occupies the upper 24
/// bits so a cleared or garbage register never masquerades as a latched id.
pub mod node_id {
    use super::{Scratch, Straps};

    pub const MAGIC: u32 = 0xB007_1D00;
    pub const MAGIC_MASK: u32 = 0xFFFF_FF00;

    /// Writes the latch so the next soft reset preserves `id`.
    pub fn latch(scratch: &mut impl Scratch, id: u8) {
        scratch.store(MAGIC | u32::from(id));
    }

    /// Consumes a latched id, if one is present. The register is cleared so
    /// a stale latch cannot outlive one boot.
    pub fn take_latched(scratch: &mut impl Scratch) -> Option<u8> {
        let value = scratch.load();
        if value & MAGIC_MASK == MAGIC {
            scratch.store(0);
            Some((value & 0xFF) as u8)
        } else {
            None
        }
    }

    /// Boot-time id resolution: a latched id wins; otherwise read the
    /// straps and latch the result for the next soft reset.
    pub fn resolve(scratch: &mut impl Scratch, straps: &impl Straps) -> u8 {
        if let Some(id) = take_latched(scratch) {
            // Re-latch: the id must survive the *next* soft reset too.
            latch(scratch, id);
            return id;
        }
        let id = straps.read_id() & 0x0F;
        latch(scratch, id);
        id
    }
}

#[cfg(any(test, feature = "mock"))]
pub mod mock {
    //! RAM-backed hardware for host tests.

    use super::*;
    use std::vec;
    use std::vec::Vec;

    pub struct RamFlash {
        data: Vec<u8>,
        pub erase_count: u32,
        /// Next program call fails with `Fault` (fatal-programming-error
        /// injection).
        pub fail_next_program: bool,
    }

    impl RamFlash {
        pub fn new(size: usize) -> Self {
            Self {
                data: vec![0xFF; size],
                erase_count: 0,
                fail_next_program: false,
            }
        }

        pub fn contents(&self) -> &[u8] {
            &self.data
        }
    }

    impl Flash for RamFlash {
        fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
            if offset % map::FLASH_SECTOR_SIZE != 0
                || len % map::FLASH_SECTOR_SIZE != 0
            {
                return Err(FlashError::Unaligned);
            }
            let (offset, len) = (offset as usize, len as usize);
            if offset + len > self.data.len() {
                return Err(FlashError::OutOfBounds);
            }
            self.data[offset..offset + len].fill(0xFF);
            self.erase_count += 1;
            Ok(())
        }

        fn program(
            &mut self,
            offset: u32,
            data: &[u8],
        ) -> Result<(), FlashError> {
            if self.fail_next_program {
                self.fail_next_program = false;
                return Err(FlashError::Fault);
            }
            if offset % map::FLASH_PAGE_SIZE != 0
                || data.len() % map::FLASH_PAGE_SIZE as usize != 0
            {
                return Err(FlashError::Unaligned);
            }
            let offset = offset as usize;
            if offset + data.len() > self.data.len() {
                return Err(FlashError::OutOfBounds);
            }
            self.data[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn read(&self, offset: u32, buf: &mut [u8]) {
            let offset = offset as usize;
            buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
        }
    }

    pub struct RamExtMem {
        data: Vec<u8>,
    }

    impl RamExtMem {
        pub fn new(size: usize) -> Self {
            Self {
                data: vec![0; size],
            }
        }
    }

    impl ExtMem for RamExtMem {
        fn size(&self) -> u32 {
            self.data.len() as u32
        }

        fn write(&mut self, addr: u32, data: &[u8]) {
            let addr = addr as usize;
            self.data[addr..addr + data.len()].copy_from_slice(data);
        }

        fn read(&self, addr: u32, buf: &mut [u8]) {
            let addr = addr as usize;
            buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
        }
    }

    #[derive(Default)]
    pub struct TestScratch(pub u32);

    impl Scratch for TestScratch {
        fn load(&self) -> u32 {
            self.0
        }

        fn store(&mut self, value: u32) {
            self.0 = value;
        }
    }

    pub struct TestStraps(pub u8);

    impl Straps for TestStraps {
        fn read_id(&self) -> u8 {
            self.0
        }
    }

    #[derive(Default)]
    pub struct TestRgb {
        state: (u8, u8, u8),
    }

    impl RgbLed for TestRgb {
        fn set(&mut self, r: u8, g: u8, b: u8) {
            self.state = (r, g, b);
        }

        fn get(&self) -> (u8, u8, u8) {
            self.state
        }
    }

    #[derive(Default)]
    pub struct TestHandoff {
        pub jumped_to: Option<JumpVectors>,
    }

    impl Handoff for TestHandoff {
        fn jump(&mut self, vectors: JumpVectors) -> HandoffFault {
            if vectors.stack_pointer == 0 || vectors.reset_handler == 0 {
                return HandoffFault::BadVectors;
            }
            self.jumped_to = Some(vectors);
            // A mock cannot actually leave; report the impossible return.
            HandoffFault::Returned
        }
    }

    #[derive(Default)]
    pub struct TestWatchdog {
        pub feeds: u32,
        pub reset_requested: bool,
    }

    impl Watchdog for TestWatchdog {
        fn feed(&mut self) {
            self.feeds += 1;
        }

        fn trigger_reset(&mut self) {
            self.reset_requested = true;
        }
    }
}

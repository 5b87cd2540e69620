// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The application image header and its validation rules.
//!
//! Every application partition starts with a 192-byte packed header. The
//! binary proper (vector table first) follows immediately, so the entry
//! point offset recorded in the header must always equal the header size.
//! The stored CRC-32 covers the binary only, never the header, so the
//! header can be rewritten without re-checksumming the image.
//!
//! The bootloader refuses to jump unless [`AppHeader::validate`] and the
//! CRC check both pass; the OTA engine applies the same rules to a staged
//! image before it ever touches flash.

#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use crc::{Crc, CRC_32_ISO_HDLC};
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// "Z1AP", little-endian.
pub const APP_MAGIC: u32 = 0x5A31_4150;

/// Size of [`AppHeader`] and therefore the fixed entry point offset.
pub const HEADER_SIZE: usize = 192;

/// Expected value of [`AppHeader::entry_point`].
pub const ENTRY_POINT: u32 = HEADER_SIZE as u32;

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AppFlags: u32 {
        /// Image was produced by a debug build.
        const DEBUG_BUILD = 1 << 0;
        /// Image expects the neuron table region to be preserved across
        /// the update.
        const KEEP_TOPOLOGY = 1 << 1;
    }
}

/// The on-flash application header. Exactly 192 bytes, little-endian,
/// no padding.
#[derive(
    FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Clone, Copy,
)]
#[repr(C)]
pub struct AppHeader {
    pub magic: U32,
    pub version_major: U32,
    pub version_minor: U32,
    pub version_patch: U32,
    pub flags: U32,
    /// Size of the binary, excluding this header.
    pub binary_size: U32,
    /// CRC-32 (IEEE 802.3) over the binary only.
    pub crc32: U32,
    /// Offset of the binary from the partition base; must be 0xC0.
    pub entry_point: U32,
    pub name: [u8; 32],
    pub description: [u8; 64],
    pub reserved: [u8; 64],
}

const_assert_eq!(core::mem::size_of::<AppHeader>(), HEADER_SIZE);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValidateError {
    /// Fewer than [`HEADER_SIZE`] bytes available.
    Truncated,
    BadMagic { found: u32 },
    /// Zero, or larger than the partition can hold.
    BadSize { found: u32 },
    BadEntryPoint { found: u32 },
    CrcMismatch { stored: u32, computed: u32 },
}

impl AppHeader {
    /// Reads a header from the start of `bytes` without validating it.
    pub fn parse(bytes: &[u8]) -> Result<&Self, ValidateError> {
        let bytes = bytes.get(..HEADER_SIZE).ok_or(ValidateError::Truncated)?;
        Self::ref_from_bytes(bytes).map_err(|_| ValidateError::Truncated)
    }

    pub fn app_flags(&self) -> AppFlags {
        AppFlags::from_bits_truncate(self.flags.get())
    }

    pub fn version(&self) -> (u32, u32, u32) {
        (
            self.version_major.get(),
            self.version_minor.get(),
            self.version_patch.get(),
        )
    }

    /// The app name, up to the first NUL.
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Structural validation: magic, size bounds, entry point. Does not
    /// touch the binary; pair with [`Self::check_binary`] (or a streamed
    /// CRC) before trusting the image.
    ///
    /// `capacity` is the partition size; the binary must fit after the
    /// header.
    pub fn validate(&self, capacity: u32) -> Result<(), ValidateError> {
        let magic = self.magic.get();
        if magic != APP_MAGIC {
            return Err(ValidateError::BadMagic { found: magic });
        }
        let size = self.binary_size.get();
        if size == 0 || size > capacity.saturating_sub(ENTRY_POINT) {
            return Err(ValidateError::BadSize { found: size });
        }
        let entry = self.entry_point.get();
        if entry != ENTRY_POINT {
            return Err(ValidateError::BadEntryPoint { found: entry });
        }
        Ok(())
    }

    /// Verifies the stored CRC against the actual binary bytes.
    pub fn check_binary(&self, binary: &[u8]) -> Result<(), ValidateError> {
        let computed = crc32(binary);
        let stored = self.crc32.get();
        if computed != stored {
            return Err(ValidateError::CrcMismatch { stored, computed });
        }
        Ok(())
    }

    /// Builds a header describing `binary`, for image packaging and tests.
    pub fn describe(
        name: &str,
        description: &str,
        version: (u32, u32, u32),
        flags: AppFlags,
        binary: &[u8],
    ) -> Self {
        let mut name_buf = [0u8; 32];
        let n = name.len().min(31);
        name_buf[..n].copy_from_slice(&name.as_bytes()[..n]);
        let mut desc_buf = [0u8; 64];
        let n = description.len().min(63);
        desc_buf[..n].copy_from_slice(&description.as_bytes()[..n]);

        Self {
            magic: U32::new(APP_MAGIC),
            version_major: U32::new(version.0),
            version_minor: U32::new(version.1),
            version_patch: U32::new(version.2),
            flags: U32::new(flags.bits()),
            binary_size: U32::new(binary.len() as u32),
            crc32: U32::new(crc32(binary)),
            entry_point: U32::new(ENTRY_POINT),
            name: name_buf,
            description: desc_buf,
            reserved: [0; 64],
        }
    }
}

/// CRC-32 as used for firmware images: polynomial 0xEDB88320 (reflected),
/// init 0xFFFFFFFF, output inverted.
pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Incremental image CRC, for checksumming flash in page-sized reads.
pub struct ImageCrc {
    digest: crc::Digest<'static, u32>,
}

impl ImageCrc {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for ImageCrc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn sample_header(binary: &[u8]) -> AppHeader {
        AppHeader::describe(
            "snn-node",
            "worker firmware",
            (1, 2, 3),
            AppFlags::empty(),
            binary,
        )
    }

    #[test]
    fn crc32_known_answer() {
        // IEEE 802.3 check value for "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn incremental_crc_matches_oneshot() {
        let data: Vec<u8> = (0..=255).cycle().take(4096).collect();
        let mut inc = ImageCrc::new();
        for page in data.chunks(256) {
            inc.update(page);
        }
        assert_eq!(inc.finalize(), crc32(&data));
    }

    #[test]
    fn header_layout() {
        let binary = [0x5Au8; 512];
        let h = sample_header(&binary);
        let bytes = h.as_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        // magic, little-endian, at offset 0
        assert_eq!(&bytes[..4], &[0x50, 0x41, 0x31, 0x5A]);
        // entry point at offset 28
        assert_eq!(&bytes[28..32], &[0xC0, 0, 0, 0]);
        // name field at offset 32
        assert_eq!(&bytes[32..40], b"snn-node");
    }

    #[test]
    fn parse_and_validate_good_image() {
        let binary = [0xA5u8; 1024];
        let h = sample_header(&binary);
        let parsed = AppHeader::parse(h.as_bytes()).unwrap();
        parsed.validate(1024 * 1024).unwrap();
        parsed.check_binary(&binary).unwrap();
        assert_eq!(parsed.name_str(), "snn-node");
        assert_eq!(parsed.version(), (1, 2, 3));
    }

    #[test]
    fn rejects_bad_magic() {
        let binary = [0u8; 256];
        let mut h = sample_header(&binary);
        h.magic = U32::new(0x15130405);
        assert_eq!(
            h.validate(1 << 20),
            Err(ValidateError::BadMagic { found: 0x15130405 })
        );
    }

    #[test]
    fn rejects_bad_sizes() {
        let binary = [0u8; 256];
        let mut h = sample_header(&binary);
        h.binary_size = U32::new(0);
        assert_eq!(
            h.validate(1 << 20),
            Err(ValidateError::BadSize { found: 0 })
        );
        h.binary_size = U32::new((1 << 20) + 1);
        assert!(matches!(
            h.validate(1 << 20),
            Err(ValidateError::BadSize { .. })
        ));
        // Binary must fit after the header, not just inside the partition.
        h.binary_size = U32::new(1 << 20);
        assert!(matches!(
            h.validate(1 << 20),
            Err(ValidateError::BadSize { .. })
        ));
    }

    #[test]
    fn rejects_bad_entry_point() {
        let binary = [0u8; 256];
        let mut h = sample_header(&binary);
        h.entry_point = U32::new(0x100);
        assert_eq!(
            h.validate(1 << 20),
            Err(ValidateError::BadEntryPoint { found: 0x100 })
        );
    }

    #[test]
    fn single_bit_flip_fails_crc() {
        let mut binary = vec![0x11u8; 777];
        let h = sample_header(&binary);
        h.check_binary(&binary).unwrap();
        binary[400] ^= 0x20;
        assert!(matches!(
            h.check_binary(&binary),
            Err(ValidateError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn truncated_header_rejected() {
        assert!(matches!(
            AppHeader::parse(&[0u8; 100]),
            Err(ValidateError::Truncated)
        ));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fixed boot partition.
//!
//! Never overwritten by OTA, so it has to be boring and right. On start
//! it validates the application partition (magic, size, entry point,
//! then a full CRC-32 of the binary) and either hands control over or
//! falls back to safe mode, where the node stays reachable for a
//! firmware update over the bus.
//!
//! Debug builds insert a five-second countdown before the jump so a
//! controller can interrupt with `BOOT_NOW` (skip the wait) or any
//! update opcode (divert to safe mode).
//!
//! Firmware staged here lives in a 48 KiB SRAM buffer, not PSRAM: with
//! the bootloader's XIP cache configuration, PSRAM writes are corrupted
//! under concurrent broker DMA, so the application's big staging window
//! is off limits until the real app owns the hardware.
//!
//! Everything is expressed as an explicit object with a `step` method;
//! the firmware `main` wires up the hardware and calls [`Bootloader::step`]
//! forever; tests drive the same object over the simulated bus.

#![cfg_attr(not(test), no_std)]

use app_image::AppHeader;
use cluster_commands::{
    words_to_bytes, ChunkHeader, Opcode, PollType, Status, UpdatePoll,
    UpdateReady, UpdateStart, VerifyResp,
};
use cluster_hw::{
    map, node_id, Flash, Handoff, JumpVectors, RgbLed, Scratch, Straps,
    Watchdog,
};
use drv_matrix_bus::hw::BusHw;
use drv_matrix_bus::LinkLayer;
use drv_matrix_broker::BootBroker;
use matrix_proto::{Frame, FrameType};
use ota_core::target::{self, TargetSession};
use ota_core::SramStaging;
use tracebuf::TraceBuf;

/// Debug-build countdown before jumping to a valid application.
pub const COUNTDOWN_US: u64 = 5_000_000;

/// Safe-mode red LED blink half-period.
const BLINK_HALF_PERIOD_MS: u32 = 500;

pub const VERSION: (u16, u16, u16) = (1, 0, 0);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Countdown running; an update opcode or the deadline moves us on.
    Countdown,
    /// Serving management and OTA traffic; no valid application.
    SafeMode,
    /// Validation passed; the owner should take the jump vectors and
    /// hand off.
    JumpReady,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    Validated { ok: bool },
    BootNow,
    EnterSafeMode,
    UpdateStarted { chunks: u16 },
    UpdateCommitted,
    UpdateError { code: u16 },
    UnknownOpcode { opcode: u16 },
}

pub struct Bootloader<H, F, L, S, W>
where
    H: BusHw,
    F: Flash,
    L: RgbLed,
    S: Scratch,
    W: Watchdog,
{
    broker: BootBroker<H>,
    flash: F,
    led: L,
    scratch: S,
    watchdog: W,
    node_id: u8,
    debug_delay: bool,

    phase: Phase,
    countdown_deadline: u64,
    jump: Option<JumpVectors>,

    ota: TargetSession,
    staging: [u8; map::BOOT_OTA_STAGING_SIZE as usize],

    blink_last_ms: u32,
    blink_on: bool,

    trace: TraceBuf<Trace, 32>,
}

impl<H, F, L, S, W> Bootloader<H, F, L, S, W>
where
    H: BusHw,
    F: Flash,
    L: RgbLed,
    S: Scratch,
    W: Watchdog,
{
    /// Brings the boot environment up: node id from the scratch latch or
    /// the straps, link configured, red LED on.
    pub fn new(
        link: LinkLayer<H>,
        flash: F,
        mut led: L,
        mut scratch: S,
        straps: &impl Straps,
        watchdog: W,
        debug_delay: bool,
    ) -> Self {
        let id = node_id::resolve(&mut scratch, straps);
        let mut broker = BootBroker::new(link);
        broker.link_mut().set_node_id(id);
        led.set(255, 0, 0);

        Self {
            broker,
            flash,
            led,
            scratch,
            watchdog,
            node_id: id,
            debug_delay,
            phase: Phase::SafeMode,
            countdown_deadline: 0,
            jump: None,
            ota: TargetSession::new(),
            staging: [0; map::BOOT_OTA_STAGING_SIZE as usize],
            blink_last_ms: 0,
            blink_on: true,
            trace: TraceBuf::new(),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The vectors to hand to the jump primitive, once `JumpReady`.
    pub fn jump_vectors(&self) -> Option<JumpVectors> {
        self.jump
    }

    pub fn broker(&self) -> &BootBroker<H> {
        &self.broker
    }

    /// Validates the application partition and picks the initial phase.
    pub fn start(&mut self) {
        match self.validate_app() {
            Ok(vectors) => {
                self.trace.record(Trace::Validated { ok: true });
                self.jump = Some(vectors);
                if self.debug_delay {
                    self.phase = Phase::Countdown;
                    self.countdown_deadline =
                        self.broker.link().now_us() + COUNTDOWN_US;
                } else {
                    self.phase = Phase::JumpReady;
                }
            }
            Err(_) => {
                self.trace.record(Trace::Validated { ok: false });
                self.enter_safe_mode();
            }
        }
    }

    /// Reads and checks the application header, then proves the binary
    /// against its stored CRC, page by page.
    pub fn validate_app(&self) -> Result<JumpVectors, app_image::ValidateError> {
        let mut header_bytes = [0u8; app_image::HEADER_SIZE];
        self.flash.read(map::APP_PARTITION_OFFSET, &mut header_bytes);
        let header = AppHeader::parse(&header_bytes)?;
        header.validate(map::APP_PARTITION_SIZE)?;

        let binary_size = header.binary_size.get();
        let binary_base = map::APP_PARTITION_OFFSET + app_image::ENTRY_POINT;
        let mut crc = app_image::ImageCrc::new();
        let mut buf = [0u8; map::FLASH_PAGE_SIZE as usize];
        let mut offset = 0;
        while offset < binary_size {
            let n = (binary_size - offset).min(buf.len() as u32) as usize;
            self.flash.read(binary_base + offset, &mut buf[..n]);
            crc.update(&buf[..n]);
            offset += n as u32;
        }
        let computed = crc.finalize();
        let stored = header.crc32.get();
        if computed != stored {
            return Err(app_image::ValidateError::CrcMismatch {
                stored,
                computed,
            });
        }

        // The binary's vector table starts right after the header: stack
        // pointer first, reset handler second.
        let mut vt = [0u8; 8];
        self.flash.read(binary_base, &mut vt);
        Ok(JumpVectors {
            vector_base: map::XIP_CACHED_BASE + binary_base,
            stack_pointer: u32::from_le_bytes([vt[0], vt[1], vt[2], vt[3]]),
            reset_handler: u32::from_le_bytes([vt[4], vt[5], vt[6], vt[7]]),
        })
    }

    fn enter_safe_mode(&mut self) {
        self.phase = Phase::SafeMode;
        self.jump = None;
        self.led.set(255, 0, 0);
        self.blink_on = true;
        self.blink_last_ms = (self.broker.link().now_us() / 1000) as u32;
        self.trace.record(Trace::EnterSafeMode);
    }

    /// One pass of the boot service loop.
    pub fn step(&mut self) {
        self.broker.task();

        let mut frame = Frame::empty();
        let received = self.broker.try_receive(&mut frame);

        match self.phase {
            Phase::Countdown => {
                if received && frame.frame_type == FrameType::Ctrl {
                    self.countdown_frame(&frame);
                }
                if self.phase == Phase::Countdown
                    && self.broker.link().now_us() >= self.countdown_deadline
                {
                    self.phase = Phase::JumpReady;
                }
            }
            Phase::SafeMode => {
                if received
                    && frame.frame_type == FrameType::Ctrl
                    && frame.crc_valid
                {
                    self.safe_mode_command(&frame);
                    // Drain the reply promptly; a response stuck in the
                    // queue is indistinguishable from a dead node.
                    self.broker.task();
                }
                self.blink();
            }
            Phase::JumpReady => {}
        }
    }

    fn countdown_frame(&mut self, frame: &Frame) {
        match frame.opcode().and_then(Opcode::from_u16) {
            Some(Opcode::BootNow) => {
                self.trace.record(Trace::BootNow);
                self.phase = Phase::JumpReady;
            }
            Some(
                Opcode::UpdateModeEnter
                | Opcode::UpdateStart
                | Opcode::UpdateDataChunk
                | Opcode::UpdatePoll
                | Opcode::UpdateCommit,
            ) => {
                // An update is coming: stop the countdown and service it
                // from safe mode instead of booting a stale image.
                self.enter_safe_mode();
                self.safe_mode_command(frame);
            }
            _ => {}
        }
    }

    fn reply(&mut self, words: &[u16], dest: u8, stream: u8) {
        // Queue-full here means the peer is flooding us; the reply is
        // the casualty, not the loop.
        let _ = self.broker.send_command(words, dest, stream);
    }

    fn send_update_error(&mut self, dest: u8, code: u16) {
        self.trace.record(Trace::UpdateError { code });
        let words = [Opcode::UpdateError as u16, code];
        self.reply(&words, dest, Opcode::UpdateError.stream());
    }

    fn send_update_ready(&mut self, dest: u8, status: u16) {
        let ready = UpdateReady {
            node_id: self.node_id,
            status,
            avail_kib: (map::BOOT_OTA_STAGING_SIZE / 1024) as u16,
        };
        self.reply(
            &ready.to_words(),
            dest,
            Opcode::UpdateReady.stream(),
        );
    }

    fn safe_mode_command(&mut self, frame: &Frame) {
        let Some(opcode) = frame.opcode().and_then(Opcode::from_u16) else {
            if let Some(raw) = frame.opcode() {
                self.trace.record(Trace::UnknownOpcode { opcode: raw });
            }
            return;
        };
        let src = frame.src;
        let payload = frame.payload();

        match opcode {
            Opcode::Ping => {
                let pong = [Opcode::Pong as u16];
                self.reply(&pong, src, Opcode::Pong.stream());
            }
            Opcode::ReadStatus => {
                let status = Status {
                    node_id: self.node_id,
                    uptime_ms: (self.broker.link().now_us() / 1000) as u32,
                    free_mem: map::PSRAM_SIZE,
                    led: self.led.get(),
                    snn_running: false,
                    neuron_count: 0,
                };
                self.reply(
                    &status.to_words(),
                    src,
                    Opcode::Status.stream(),
                );
            }
            Opcode::UpdateModeEnter => {
                self.ota.clear();
                self.send_update_ready(src, 0);
            }
            Opcode::UpdateStart => {
                let Ok(start) = UpdateStart::from_words(payload) else {
                    return;
                };
                if start.target != self.node_id {
                    return;
                }
                let params = target::Params {
                    size: start.size,
                    expected_crc32: start.crc32,
                    chunk_size: start.chunk_size,
                    total_chunks: start.total_chunks,
                };
                let now = self.broker.link().now_us();
                match self.ota.start(params, map::BOOT_OTA_STAGING_SIZE, now)
                {
                    Ok(()) => {
                        self.trace.record(Trace::UpdateStarted {
                            chunks: start.total_chunks,
                        });
                        self.send_update_ready(src, 0);
                    }
                    Err(_) => self.send_update_error(
                        src,
                        cluster_commands::UpdateErrorCode::BadSize as u16,
                    ),
                }
            }
            Opcode::UpdateDataChunk => self.update_chunk(frame),
            Opcode::UpdatePoll => {
                let Ok(poll) = UpdatePoll::from_words(payload) else {
                    return;
                };
                if poll.target != self.node_id {
                    return;
                }
                match poll.poll_type {
                    PollType::Status => {
                        let status = u16::from(!self.ota.is_active());
                        self.send_update_ready(src, status);
                    }
                    PollType::Verify => {
                        let staging = SramStaging::new(&mut self.staging);
                        let (status, crc) = self.ota.verify(&staging);
                        let resp = VerifyResp { status, crc32: crc };
                        self.reply(
                            &resp.to_words(),
                            src,
                            Opcode::UpdateVerifyResp.stream(),
                        );
                    }
                }
            }
            Opcode::UpdateCommit => {
                if payload.len() >= 2 && payload[1] != u16::from(self.node_id)
                {
                    return;
                }
                self.update_commit(src);
            }
            Opcode::UpdateRestart => {
                self.watchdog.trigger_reset();
            }
            Opcode::UpdateModeExit => {
                self.ota.clear();
            }
            Opcode::BootNow => {
                // Post-update escape hatch: if the partition validates
                // now, boot it.
                if let Ok(vectors) = self.validate_app() {
                    self.trace.record(Trace::BootNow);
                    self.jump = Some(vectors);
                    self.phase = Phase::JumpReady;
                }
            }
            other => {
                self.trace.record(Trace::UnknownOpcode {
                    opcode: other as u16,
                });
            }
        }
    }

    fn update_chunk(&mut self, frame: &Frame) {
        let payload = frame.payload();
        let Ok(header) = ChunkHeader::from_words(payload) else {
            return;
        };
        if header.target != self.node_id {
            return;
        }
        let data_len = usize::from(header.data_size);
        if payload.len() < ChunkHeader::WORDS + data_len.div_ceil(2)
            || data_len > (map::BOOT_OTA_STAGING_SIZE as usize)
        {
            self.send_update_error(
                frame.src,
                cluster_commands::UpdateErrorCode::BadSize as u16,
            );
            return;
        }

        let mut data = [0u8; 1192];
        words_to_bytes(&payload[ChunkHeader::WORDS..], &mut data[..data_len]);

        let now = self.broker.link().now_us();
        let mut staging = SramStaging::new(&mut self.staging);
        match self.ota.accept_chunk(
            header.chunk_num,
            &data[..data_len],
            &mut staging,
            now,
        ) {
            Ok(()) => {
                let ack = [Opcode::UpdateAckChunk as u16, header.chunk_num];
                self.reply(&ack, frame.src, Opcode::UpdateAckChunk.stream());
            }
            Err(e) => {
                let code = match e {
                    target::Error::ChunkOutOfRange
                    | target::Error::ChunkOverrun => {
                        cluster_commands::UpdateErrorCode::ChunkSequence
                    }
                    _ => cluster_commands::UpdateErrorCode::BadSize,
                };
                self.send_update_error(frame.src, code as u16);
            }
        }
    }

    fn update_commit(&mut self, src: u8) {
        // The staged image must itself be a valid application package
        // before it is allowed anywhere near the partition.
        let header_ok = {
            let mut header_bytes = [0u8; app_image::HEADER_SIZE];
            if self.ota.params().size >= app_image::HEADER_SIZE as u32 {
                header_bytes
                    .copy_from_slice(&self.staging[..app_image::HEADER_SIZE]);
                AppHeader::parse(&header_bytes)
                    .and_then(|h| h.validate(map::APP_PARTITION_SIZE))
                    .is_ok()
            } else {
                false
            }
        };
        if !header_ok {
            self.send_update_error(
                src,
                cluster_commands::UpdateErrorCode::BadMagic as u16,
            );
            return;
        }

        let staging = SramStaging::new(&mut self.staging);
        let result = self.ota.commit(&staging, &mut self.flash);
        match result {
            Ok(_) => {
                self.trace.record(Trace::UpdateCommitted);
                let resp = [Opcode::UpdateCommitResp as u16, 0];
                self.reply(&resp, src, Opcode::UpdateCommitResp.stream());
            }
            Err(e) => {
                let status = match e {
                    target::Error::CrcMismatch => {
                        cluster_commands::UpdateErrorCode::CrcMismatch as u16
                    }
                    _ => cluster_commands::UpdateErrorCode::FlashFault as u16,
                };
                let resp = [Opcode::UpdateCommitResp as u16, status];
                self.reply(&resp, src, Opcode::UpdateCommitResp.stream());
            }
        }
    }

    /// 1 Hz red blink while in safe mode.
    fn blink(&mut self) {
        let now_ms = (self.broker.link().now_us() / 1000) as u32;
        if now_ms.wrapping_sub(self.blink_last_ms) > BLINK_HALF_PERIOD_MS {
            self.blink_on = !self.blink_on;
            self.led.set(if self.blink_on { 255 } else { 0 }, 0, 0);
            self.blink_last_ms = now_ms;
        }
    }

    /// Hands control to the validated application. The node id is
    /// re-latched first so the application (and the next soft reset)
    /// inherit it without re-reading the straps.
    ///
    /// A successful jump never returns. If it does (bad vectors, or the
    /// impossible return from the branch) safe mode is the only sane
    /// place left.
    pub fn jump(&mut self, handoff: &mut impl Handoff) {
        let Some(vectors) = self.jump else {
            self.enter_safe_mode();
            return;
        };
        node_id::latch(&mut self.scratch, self.node_id);
        let _fault = handoff.jump(vectors);
        self.enter_safe_mode();
    }
}

#[cfg(test)]
mod tests;

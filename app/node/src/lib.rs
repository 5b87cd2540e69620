// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker node application.
//!
//! Runs from the application partition, after the bootloader has proved
//! the image and jumped here. The first duty is re-initialization: the
//! bootloader's link and broker pointed DMA at *its* buffers, so the
//! application builds fresh ones before touching the bus (that is why
//! [`NodeApp::new`] takes a brand-new link). PSRAM keeps its hardware
//! state across the jump and is only marked usable, not re-trained.
//!
//! From there the node is a single cooperative loop: feed the watchdog,
//! pump the broker, dispatch one frame, and when the engine is running
//! give it its 1 ms timestep and broadcast what fired. Command handling
//! is a superset of the bootloader's safe mode: everything there, plus
//! memory operations and the SNN surface.
//!
//! Spike traffic discipline: all broadcasts from this node's own id are
//! dropped on receive. Our own fire-events come back to us like everyone
//! else's, and re-integrating them would couple every neuron to itself
//! through the bus. Same-node synapses are not starved by the filter;
//! the engine loops its own output spikes back internally, so the echo
//! is pure noise by the time it returns.

#![cfg_attr(not(test), no_std)]

use cluster_commands::{
    bytes_to_words, hi, lo, words_to_bytes, ChunkHeader, ClearMemory,
    MemoryHeader, Opcode, PollType, SnnStatus, SpikePayload, Status,
    UpdatePoll, UpdateReady, UpdateStart, VerifyResp,
};
use cluster_hw::{
    map, node_id, ExtMem, Flash, RgbLed, Scratch, Watchdog,
};
use drv_matrix_bus::hw::BusHw;
use drv_matrix_bus::LinkLayer;
use drv_matrix_broker::AppBroker;
use matrix_proto::{stream, Frame, FrameType, BROADCAST_ID, MAX_PAYLOAD_WORDS};
use ota_core::target::{self, TargetSession};
use ota_core::PsramStaging;
use snn_core::{Engine, Spike};
use tracebuf::TraceBuf;

/// Output spikes broadcast per timestep; the rest are shed under
/// overload so the service loop stays responsive.
pub const MAX_BROADCASTS_PER_TIMESTEP: usize = 5;

/// Green LED level while the application is idling.
const APP_GREEN_LEVEL: u8 = 32;

/// Heartbeat: blue pulse width and period.
const HEARTBEAT_PULSE_MS: u32 = 100;
const HEARTBEAT_PERIOD_MS: u32 = 3_000;

/// Largest data run accepted in one memory write frame.
pub const MAX_MEMORY_DATA_BYTES: usize =
    (MAX_PAYLOAD_WORDS - MemoryHeader::WORDS) * 2;

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    CmdOpcode { opcode: u16 },
    UnknownOpcode { opcode: u16 },
    BadPayload { opcode: u16 },
    DeployFailed,
    SelfBroadcastDropped,
    UpdateError { code: u16 },
    ResetRequested,
}

pub struct NodeApp<H, F, M, L, S, W>
where
    H: BusHw,
    F: Flash,
    M: ExtMem,
    L: RgbLed,
    S: Scratch,
    W: Watchdog,
{
    broker: AppBroker<H>,
    flash: F,
    psram: M,
    led: L,
    scratch: S,
    watchdog: W,
    node_id: u8,

    engine: Engine,
    ota: TargetSession,
    update_mode: bool,

    last_step_us: u64,
    heartbeat_start_ms: u32,
    heartbeat_on: bool,
    reset_pending: bool,

    trace: TraceBuf<Trace, 64>,
}

impl<H, F, M, L, S, W> NodeApp<H, F, M, L, S, W>
where
    H: BusHw,
    F: Flash,
    M: ExtMem,
    L: RgbLed,
    S: Scratch,
    W: Watchdog,
{
    /// Application bring-up. `link` must be freshly initialized so its
    /// DMA targets this image's buffers; `node_id` has been recovered
    /// from the scratch latch (or straps) by the caller.
    pub fn new(
        link: LinkLayer<H>,
        flash: F,
        psram: M,
        mut led: L,
        scratch: S,
        watchdog: W,
        id: u8,
    ) -> Self {
        let mut broker = AppBroker::new(link);
        broker.link_mut().set_node_id(id);
        // Bootloader left the red LED on; the app runs green, dimmed.
        led.set(0, APP_GREEN_LEVEL, 0);

        Self {
            broker,
            flash,
            psram,
            led,
            scratch,
            watchdog,
            node_id: id,
            engine: Engine::new(id),
            ota: TargetSession::new(),
            update_mode: false,
            last_step_us: 0,
            heartbeat_start_ms: 0,
            heartbeat_on: false,
            reset_pending: false,
            trace: TraceBuf::new(),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn broker(&self) -> &AppBroker<H> {
        &self.broker
    }

    /// True after RESET_TO_BOOTLOADER or UPDATE_RESTART has been
    /// acknowledged; the watchdog reset is already on its way.
    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    pub fn ota_active(&self) -> bool {
        self.ota.is_active()
    }

    /// True between UPDATE_MODE_ENTER/START and EXIT.
    pub fn update_mode(&self) -> bool {
        self.update_mode
    }

    /// One pass of the core-0 service loop.
    pub fn poll(&mut self) {
        self.watchdog.feed();
        self.heartbeat();
        self.broker.task();

        let mut frame = Frame::empty();
        if self.broker.try_receive(&mut frame) {
            self.dispatch(&frame);
            // Push any response out before the SNN gets the core.
            self.broker.task();
        }

        self.snn_tick();
    }

    fn dispatch(&mut self, frame: &Frame) {
        if !frame.crc_valid {
            return;
        }
        match frame.frame_type {
            FrameType::Ctrl => self.handle_command(frame),
            FrameType::Unicast => self.inject_unicast_spike(frame),
            FrameType::Broadcast => {
                if frame.src == self.node_id {
                    // Our own fire-event echoed back by the bus.
                    self.trace.record(Trace::SelfBroadcastDropped);
                    return;
                }
                self.inject_broadcast_spike(frame);
            }
            FrameType::Ack => {}
        }
    }

    /// Direct spike injection from the controller: `[gid_lo, gid_hi]`,
    /// optionally followed by a scaled value word.
    fn inject_unicast_spike(&mut self, frame: &Frame) {
        let payload = frame.payload();
        if payload.len() < 2 {
            return;
        }
        let value = if payload.len() >= 3 {
            f32::from(payload[2]) / 1000.0
        } else {
            1.0
        };
        let spike = Spike {
            source: cluster_commands::join(payload[0], payload[1]),
            timestamp_us: self.broker.link().now_us(),
            value,
        };
        let _ = self.engine.inject_spike(spike);
    }

    /// A fire-event from another node.
    fn inject_broadcast_spike(&mut self, frame: &Frame) {
        let Ok(payload) = SpikePayload::from_words(frame.payload()) else {
            return;
        };
        let spike = Spike {
            source: payload.global_id,
            timestamp_us: self.broker.link().now_us(),
            value: payload.value,
        };
        let _ = self.engine.inject_spike(spike);
    }

    /// The 1 ms LIF tick, plus output broadcast.
    fn snn_tick(&mut self) {
        if !self.engine.is_running() {
            return;
        }
        let now = self.broker.link().now_us();
        if now.saturating_sub(self.last_step_us)
            < u64::from(self.engine.timestep_us())
        {
            return;
        }
        self.last_step_us = now;

        self.engine.step();

        // Broadcast at most a handful of output spikes; the engine's
        // buffer is cleared next step either way.
        let mut outgoing: [Option<Spike>; MAX_BROADCASTS_PER_TIMESTEP] =
            [None; MAX_BROADCASTS_PER_TIMESTEP];
        for (slot, spike) in
            outgoing.iter_mut().zip(self.engine.output_spikes())
        {
            *slot = Some(*spike);
        }
        for spike in outgoing.into_iter().flatten() {
            let payload = SpikePayload {
                global_id: spike.source,
                value: spike.value,
            };
            if self
                .broker
                .send_spike(&payload.to_words(), BROADCAST_ID, stream::SPIKE)
                .is_err()
            {
                break;
            }
            self.broker.task();
        }
        self.broker.task();
    }

    fn reply(&mut self, words: &[u16], dest: u8, stream: u8) {
        let _ = self.broker.send_command(words, dest, stream);
    }

    fn ack_opcode(&mut self, opcode: Opcode, reply_opcode: Opcode, src: u8) {
        let words = [reply_opcode as u16, opcode as u16];
        self.reply(&words, src, reply_opcode.stream());
    }

    fn handle_command(&mut self, frame: &Frame) {
        let Some(raw) = frame.opcode() else {
            return;
        };
        let Some(opcode) = Opcode::from_u16(raw) else {
            self.trace.record(Trace::UnknownOpcode { opcode: raw });
            return;
        };
        self.trace.record(Trace::CmdOpcode { opcode: raw });
        let src = frame.src;
        let payload = frame.payload();

        match opcode {
            Opcode::Ping => {
                self.reply(&[Opcode::Pong as u16], src, Opcode::Pong.stream());
            }
            Opcode::Discover => {
                let words = [Opcode::DiscoverAck as u16, u16::from(self.node_id)];
                self.reply(&words, src, Opcode::DiscoverAck.stream());
            }
            Opcode::ReadStatus => {
                let status = Status {
                    node_id: self.node_id,
                    uptime_ms: (self.broker.link().now_us() / 1000) as u32,
                    free_mem: map::PSRAM_SIZE,
                    led: self.led.get(),
                    snn_running: self.engine.is_running(),
                    neuron_count: self.engine.neuron_count(),
                };
                self.reply(&status.to_words(), src, Opcode::Status.stream());
            }
            Opcode::SetLed => {
                let Ok(led) = cluster_commands::SetLed::from_words(payload)
                else {
                    self.trace.record(Trace::BadPayload { opcode: raw });
                    return;
                };
                self.led.set(led.r, led.g, led.b);
                self.ack_opcode(opcode, Opcode::LedAck, src);
            }
            Opcode::ResetToBootloader => {
                // Latch the id for the bootloader, answer, then let the
                // watchdog take us down.
                node_id::latch(&mut self.scratch, self.node_id);
                self.ack_opcode(opcode, Opcode::ResetAck, src);
                self.broker.task();
                self.watchdog.trigger_reset();
                self.reset_pending = true;
                self.trace.record(Trace::ResetRequested);
            }

            Opcode::WriteMemory => self.write_memory(frame),
            Opcode::ReadMemory => self.read_memory(frame),
            Opcode::ClearMemory => {
                let Ok(clear) = ClearMemory::from_words(payload) else {
                    self.trace.record(Trace::BadPayload { opcode: raw });
                    return;
                };
                if clear.addr % 4 != 0
                    || clear.addr.saturating_add(clear.len)
                        > self.psram.size()
                {
                    self.trace.record(Trace::BadPayload { opcode: raw });
                    return;
                }
                self.psram.clear(clear.addr, clear.len);
                self.reply(
                    &[Opcode::WriteAck as u16],
                    src,
                    Opcode::WriteAck.stream(),
                );
            }

            Opcode::DeployTopology => {
                match self.engine.deploy_topology(&self.psram) {
                    Ok(count) => {
                        let words =
                            [Opcode::DeployAck as u16, count as u16];
                        self.reply(&words, src, Opcode::DeployAck.stream());
                    }
                    Err(_) => {
                        // No ACK: the controller's deadline is the
                        // failure signal.
                        self.trace.record(Trace::DeployFailed);
                    }
                }
            }
            Opcode::ClearTopology => {
                self.engine.clear_topology();
                self.ack_opcode(opcode, Opcode::ConfigAck, src);
            }
            Opcode::SetTimestep => {
                if payload.len() < 3 {
                    self.trace.record(Trace::BadPayload { opcode: raw });
                    return;
                }
                self.engine.set_timestep(cluster_commands::join(
                    payload[1], payload[2],
                ));
                self.ack_opcode(opcode, Opcode::ConfigAck, src);
            }
            Opcode::InjectSpikeBatch => {
                if payload.len() < 2 {
                    return;
                }
                let count = usize::from(payload[1]);
                for i in 0..count {
                    let base = 2 + i * 2;
                    if base + 1 >= payload.len() {
                        break;
                    }
                    let spike = Spike {
                        source: cluster_commands::join(
                            payload[base],
                            payload[base + 1],
                        ),
                        timestamp_us: self.broker.link().now_us(),
                        value: 1.0,
                    };
                    let _ = self.engine.inject_spike(spike);
                }
            }
            Opcode::GetNeuronInfo => {
                if payload.len() < 2 {
                    return;
                }
                let Some(info) = self.engine.neuron_info(payload[1]) else {
                    return;
                };
                let words = [
                    Opcode::NeuronInfo as u16,
                    info.local_id,
                    (info.potential * 1000.0) as i16 as u16,
                    lo(info.spike_count),
                    hi(info.spike_count),
                ];
                self.reply(&words, src, Opcode::NeuronInfo.stream());
            }

            Opcode::StartSnn => {
                self.engine.start();
                self.last_step_us = self.broker.link().now_us();
                self.ack_opcode(opcode, Opcode::SnnAck, src);
            }
            Opcode::StopSnn => {
                self.engine.stop();
                self.ack_opcode(opcode, Opcode::SnnAck, src);
            }
            Opcode::PauseSnn => {
                self.engine.pause();
                self.ack_opcode(opcode, Opcode::SnnAck, src);
            }
            Opcode::ResumeSnn => {
                self.engine.resume();
                self.ack_opcode(opcode, Opcode::SnnAck, src);
            }
            Opcode::GetSnnStatus => {
                let stats = self.engine.stats();
                let status = SnnStatus {
                    running: self.engine.is_running(),
                    neuron_count: self.engine.neuron_count(),
                    active_neurons: self.engine.active_neurons(),
                    total_spikes: stats.spikes_received
                        + stats.spikes_generated,
                    spike_rate_hz: self.engine.spike_rate_hz(),
                };
                self.reply(&status.to_words(), src, Opcode::SnnStatus.stream());
            }

            Opcode::UpdateModeEnter => {
                if self.engine.is_running() {
                    self.engine.stop();
                }
                self.update_mode = true;
                self.ota.clear();
                self.send_update_ready(src, 0);
            }
            Opcode::UpdateModeExit => {
                self.update_mode = false;
                self.ota.clear();
            }
            Opcode::UpdateStart => self.update_start(frame),
            Opcode::UpdateDataChunk => self.update_chunk(frame),
            Opcode::UpdatePoll => self.update_poll(frame),
            Opcode::UpdateCommit => {
                if payload.len() >= 2 && payload[1] != u16::from(self.node_id)
                {
                    return;
                }
                self.update_commit(src);
            }
            Opcode::UpdateRestart => {
                self.watchdog.trigger_reset();
                self.reset_pending = true;
            }
            Opcode::BootNow => {}

            other => {
                self.trace.record(Trace::UnknownOpcode {
                    opcode: other as u16,
                });
            }
        }
    }

    fn write_memory(&mut self, frame: &Frame) {
        let payload = frame.payload();
        let Ok(header) = MemoryHeader::from_words(payload) else {
            self.trace.record(Trace::BadPayload { opcode: 0x10 });
            return;
        };
        let len = usize::from(header.length_bytes);
        if header.addr % 4 != 0
            || len > MAX_MEMORY_DATA_BYTES
            || payload.len() < MemoryHeader::WORDS + len.div_ceil(2)
            || header.addr.saturating_add(len as u32) > self.psram.size()
        {
            self.trace.record(Trace::BadPayload { opcode: 0x10 });
            return;
        }

        let mut data = [0u8; MAX_MEMORY_DATA_BYTES];
        words_to_bytes(&payload[MemoryHeader::WORDS..], &mut data[..len]);
        self.psram.write(header.addr, &data[..len]);
        self.reply(
            &[Opcode::WriteAck as u16],
            frame.src,
            Opcode::WriteAck.stream(),
        );
    }

    fn read_memory(&mut self, frame: &Frame) {
        let payload = frame.payload();
        let Ok(header) = MemoryHeader::from_words(payload) else {
            return;
        };
        let len = usize::from(header.length_bytes);
        if header.addr % 4 != 0
            || len > MAX_MEMORY_DATA_BYTES
            || header.addr.saturating_add(len as u32) > self.psram.size()
        {
            self.trace.record(Trace::BadPayload { opcode: 0x11 });
            return;
        }

        let mut data = [0u8; MAX_MEMORY_DATA_BYTES];
        self.psram.read(header.addr, &mut data[..len]);

        let mut words = [0u16; MAX_PAYLOAD_WORDS];
        let resp_header = MemoryHeader {
            opcode: Opcode::ReadData,
            length_bytes: header.length_bytes,
            addr: header.addr,
        };
        words[..MemoryHeader::WORDS]
            .copy_from_slice(&resp_header.to_words());
        let data_words =
            bytes_to_words(&data[..len], &mut words[MemoryHeader::WORDS..]);
        let total = MemoryHeader::WORDS + data_words;
        self.reply(&words[..total], frame.src, Opcode::ReadData.stream());
    }

    fn staging_capacity(&self) -> u32 {
        self.psram.size() - map::OTA_STAGING_OFFSET
    }

    fn send_update_ready(&mut self, dest: u8, status: u16) {
        let ready = UpdateReady {
            node_id: self.node_id,
            status,
            avail_kib: (self.staging_capacity() / 1024) as u16,
        };
        self.reply(&ready.to_words(), dest, Opcode::UpdateReady.stream());
    }

    fn send_update_error(&mut self, dest: u8, code: u16) {
        self.trace.record(Trace::UpdateError { code });
        let words = [Opcode::UpdateError as u16, code];
        self.reply(&words, dest, Opcode::UpdateError.stream());
    }

    fn update_start(&mut self, frame: &Frame) {
        let Ok(start) = UpdateStart::from_words(frame.payload()) else {
            return;
        };
        if start.target != self.node_id {
            return;
        }
        if self.engine.is_running() {
            self.engine.stop();
        }
        let params = target::Params {
            size: start.size,
            expected_crc32: start.crc32,
            chunk_size: start.chunk_size,
            total_chunks: start.total_chunks,
        };
        let now = self.broker.link().now_us();
        match self.ota.start(params, self.staging_capacity(), now) {
            Ok(()) => {
                self.update_mode = true;
                self.send_update_ready(frame.src, 0);
            }
            Err(_) => self.send_update_error(
                frame.src,
                cluster_commands::UpdateErrorCode::BadSize as u16,
            ),
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
        let len = usize::from(header.data_size);
        if payload.len() < ChunkHeader::WORDS + len.div_ceil(2) {
            self.send_update_error(
                frame.src,
                cluster_commands::UpdateErrorCode::BadSize as u16,
            );
            return;
        }

        let mut data = [0u8; 1192];
        words_to_bytes(&payload[ChunkHeader::WORDS..], &mut data[..len]);

        let now = self.broker.link().now_us();
        let mut staging = PsramStaging::new(
            &mut self.psram,
            map::OTA_STAGING_OFFSET,
            map::PSRAM_SIZE - map::OTA_STAGING_OFFSET,
        );
        match self.ota.accept_chunk(
            header.chunk_num,
            &data[..len],
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

    fn update_poll(&mut self, frame: &Frame) {
        let Ok(poll) = UpdatePoll::from_words(frame.payload()) else {
            return;
        };
        if poll.target != self.node_id {
            return;
        }
        match poll.poll_type {
            PollType::Status => {
                let status = u16::from(!self.ota.is_active());
                self.send_update_ready(frame.src, status);
            }
            PollType::Verify => {
                let staging = PsramStaging::new(
                    &mut self.psram,
                    map::OTA_STAGING_OFFSET,
                    map::PSRAM_SIZE - map::OTA_STAGING_OFFSET,
                );
                let (status, crc) = self.ota.verify(&staging);
                let resp = VerifyResp { status, crc32: crc };
                self.reply(
                    &resp.to_words(),
                    frame.src,
                    Opcode::UpdateVerifyResp.stream(),
                );
            }
        }
    }

    fn update_commit(&mut self, src: u8) {
        let staging = PsramStaging::new(
            &mut self.psram,
            map::OTA_STAGING_OFFSET,
            map::PSRAM_SIZE - map::OTA_STAGING_OFFSET,
        );
        match self.ota.commit(&staging, &mut self.flash) {
            Ok(_) => {
                let resp = [Opcode::UpdateCommitResp as u16, 0];
                self.reply(&resp, src, Opcode::UpdateCommitResp.stream());
            }
            Err(e) => {
                let status = match e {
                    target::Error::CrcMismatch => {
                        cluster_commands::UpdateErrorCode::CrcMismatch as u16
                    }
                    target::Error::NoSession => {
                        cluster_commands::UpdateErrorCode::BadSize as u16
                    }
                    _ => cluster_commands::UpdateErrorCode::FlashFault as u16,
                };
                let resp = [Opcode::UpdateCommitResp as u16, status];
                self.reply(&resp, src, Opcode::UpdateCommitResp.stream());
            }
        }
    }

    /// Blue pulse for 100 ms every 3 s.
    fn heartbeat(&mut self) {
        let now_ms = (self.broker.link().now_us() / 1000) as u32;
        let elapsed = now_ms.wrapping_sub(self.heartbeat_start_ms);
        if elapsed >= HEARTBEAT_PERIOD_MS {
            self.heartbeat_start_ms = now_ms;
            let (r, g, _) = self.led.get();
            self.led.set(r, g, 51);
            self.heartbeat_on = true;
        } else if self.heartbeat_on && elapsed >= HEARTBEAT_PULSE_MS {
            let (r, g, _) = self.led.get();
            self.led.set(r, g, 0);
            self.heartbeat_on = false;
        }
    }
}

#[cfg(test)]
mod tests;

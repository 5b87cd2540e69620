// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster controller, core-0 side.
//!
//! The controller is node 16: it owns the busy line's idle pulldown, the
//! master topology table, firmware update sessions, and the management
//! surface the HTTP front-end calls into. The HTTP layer itself is a thin
//! textual skin over [`ControllerApp`]'s typed operations and lives with
//! the Ethernet driver, not here.
//!
//! The core-0 loop is cooperative: service the network pump (elsewhere),
//! step the async spike injector, drain the broker, yield. Management
//! operations are synchronous: they issue a command and poll for the
//! matching reply under a deadline, continuing to run [`Broker::task`] so
//! the bus never stalls behind a waiting handler. Every synchronous
//! operation takes a `pump` closure that is called on each wait
//! iteration; firmware passes the Ethernet pump, tests step the simulated
//! peers.
//!
//! Frames that arrive unrequested (spike traffic, late replies) are
//! parked in a small stray queue; the loop hands them to the core-1
//! monitor over the lock-free frame pipe.

#![cfg_attr(not(test), no_std)]

use cluster_commands::{
    bytes_to_words, ChunkHeader, MemoryHeader, Opcode, PollType, SnnStatus,
    Status, UpdatePoll, UpdateReady, UpdateStart, VerifyResp,
};
use cluster_topology::Topology;
use drv_matrix_bus::hw::BusHw;
use drv_matrix_bus::LinkLayer;
use drv_matrix_broker::AppBroker;
use frame_pipe::Producer;
use heapless::Deque;
use matrix_proto::{
    stream, Frame, FrameType, BROADCAST_ID, CONTROLLER_ID, MAX_PAYLOAD_WORDS,
};
use ota_core::controller::{Action, ControllerSession, FailReason, Reply};
use tracebuf::TraceBuf;

/// Deadline for a link-layer ping reply.
pub const PING_TIMEOUT_US: u64 = 50_000;

/// Default deadline for management commands awaiting their reply.
pub const COMMAND_TIMEOUT_US: u64 = 100_000;

/// Spike injection rate limit, per job.
pub const SPIKE_INJECT_INTERVAL_US: u64 = 10_000;

/// Pending spike-injection jobs.
pub const MAX_SPIKE_JOBS: usize = 8;

/// Memory writes are chunked to this many data bytes per frame.
pub const MEMORY_WRITE_CHUNK_BYTES: usize = 384;

/// SD-card streamed updates use this fixed chunk size.
pub const STORAGE_CHUNK_BYTES: u16 = 512;

/// Largest update chunk the driver will put in one frame.
pub const MAX_UPDATE_CHUNK_BYTES: u16 = 1024;

/// Stray frames parked for the core-1 monitor.
pub const STRAY_QUEUE_DEPTH: usize = 4;

/// A firmware image the update driver can stream chunks from: an
/// in-memory buffer, or a file on the SD card read through the
/// filesystem shim.
pub trait ChunkSource {
    fn len(&self) -> u32;
    fn read(&self, offset: u32, buf: &mut [u8]);
}

/// The whole image already in memory.
pub struct SliceSource<'a>(pub &'a [u8]);

impl ChunkSource for SliceSource<'_> {
    fn len(&self) -> u32 {
        self.0.len() as u32
    }

    fn read(&self, offset: u32, buf: &mut [u8]) {
        let offset = offset as usize;
        buf.copy_from_slice(&self.0[offset..offset + buf.len()]);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct SpikeJob {
    global_id: u32,
    remaining: u32,
    last_send_us: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InjectorFull;

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    PingOk { node: u8 },
    PingTimeout { node: u8 },
    CommandTimeout { opcode: u16 },
    StrayFrame { src: u8 },
    StrayOverflow,
    UpdateDone { target: u8 },
    UpdateFailed { target: u8 },
    SpikeInjected { node: u8 },
}

pub struct ControllerApp<H: BusHw> {
    broker: AppBroker<H>,
    topology: Topology,
    jobs: Deque<SpikeJob, MAX_SPIKE_JOBS>,
    strays: Deque<Frame, STRAY_QUEUE_DEPTH>,
    ping_seq: u16,
    spikes_injected: u32,
    trace: TraceBuf<Trace, 64>,
}

impl<H: BusHw> ControllerApp<H> {
    pub fn new(link: LinkLayer<H>) -> Self {
        Self {
            broker: AppBroker::new(link),
            topology: Topology::new(),
            jobs: Deque::new(),
            strays: Deque::new(),
            ping_seq: 0,
            spikes_injected: 0,
            trace: TraceBuf::new(),
        }
    }

    pub fn broker(&self) -> &AppBroker<H> {
        &self.broker
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn spikes_injected(&self) -> u32 {
        self.spikes_injected
    }

    fn now_us(&self) -> u64 {
        self.broker.link().now_us()
    }

    /// One pass of the core-0 loop: injector, broker, stray intake.
    pub fn poll(&mut self) {
        self.injector_step();
        self.broker.task();

        let mut frame = Frame::empty();
        if self.broker.try_receive(&mut frame) {
            self.park_stray(&frame);
        }
    }

    /// Hands parked frames to the core-1 monitor pipe.
    pub fn forward_strays<const N: usize>(
        &mut self,
        monitor: &mut Producer<'_, N>,
    ) {
        while let Some(frame) = self.strays.front() {
            if monitor.push(frame).is_err() {
                return;
            }
            self.strays.pop_front();
        }
    }

    /// Drains outbound frames the monitor core queued on its egress pipe
    /// into the broker. CTRL frames go on the command queue, everything
    /// else rides the spike queue.
    pub fn pump_monitor_egress<const N: usize>(
        &mut self,
        egress: &mut frame_pipe::Consumer<'_, N>,
    ) {
        let mut frame = Frame::empty();
        while egress.pop(&mut frame) {
            let words = frame.payload_words().min(MAX_PAYLOAD_WORDS);
            let payload = &frame.payload[..words];
            let result = match frame.frame_type {
                FrameType::Ctrl => {
                    self.broker.send_command(payload, frame.dest, frame.stream)
                }
                _ => self.broker.send_spike(payload, frame.dest, frame.stream),
            };
            if result.is_err() {
                return;
            }
        }
    }

    /// Takes one parked frame directly (monitorless configurations).
    pub fn take_stray(&mut self, out: &mut Frame) -> bool {
        match self.strays.pop_front() {
            Some(frame) => {
                out.clone_from(&frame);
                true
            }
            None => false,
        }
    }

    fn park_stray(&mut self, frame: &Frame) {
        self.trace.record(Trace::StrayFrame { src: frame.src });
        if self.strays.push_back(frame.clone()).is_err() {
            // Monitor not keeping up; oldest first out the airlock.
            self.strays.pop_front();
            let _ = self.strays.push_back(frame.clone());
            self.trace.record(Trace::StrayOverflow);
        }
    }

    // ------------------------------------------------------------------
    // Async spike injection
    // ------------------------------------------------------------------

    /// Queues a job that injects `count` spikes into the neuron with
    /// global id `global_id`, one per 10 ms.
    pub fn inject_spikes_async(
        &mut self,
        global_id: u32,
        count: u32,
    ) -> Result<(), InjectorFull> {
        let job = SpikeJob {
            global_id,
            remaining: count,
            last_send_us: 0,
        };
        self.jobs.push_back(job).map_err(|_| InjectorFull)
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Sends at most one spike for the head job per pass.
    fn injector_step(&mut self) {
        let now = self.now_us();
        let Some(job) = self.jobs.front_mut() else {
            return;
        };
        if job.remaining == 0 {
            self.jobs.pop_front();
            return;
        }
        if job.last_send_us != 0
            && now.saturating_sub(job.last_send_us) < SPIKE_INJECT_INTERVAL_US
        {
            return;
        }

        let node = (job.global_id >> 16) as u8;
        let payload = [
            (job.global_id & 0xFFFF) as u16,
            (job.global_id >> 16) as u16,
            1000, // value 1.0
        ];
        if self
            .broker
            .send_spike(&payload, node, stream::SPIKE)
            .is_ok()
        {
            job.last_send_us = now.max(1);
            job.remaining -= 1;
            self.spikes_injected += 1;
            self.trace.record(Trace::SpikeInjected { node });
            if job.remaining == 0 {
                self.jobs.pop_front();
            }
        }
    }

    // ------------------------------------------------------------------
    // Synchronous command plumbing
    // ------------------------------------------------------------------

    /// Issues a command and polls for a reply with the expected opcode
    /// from `dest`, pumping the broker (and the caller's `pump`) while
    /// waiting. Unrelated frames are parked for the monitor.
    pub fn exec(
        &mut self,
        payload: &[u16],
        dest: u8,
        stream: u8,
        expect: Opcode,
        timeout_us: u64,
        out: &mut Frame,
        pump: &mut impl FnMut(),
    ) -> bool {
        if self.broker.send_command(payload, dest, stream).is_err() {
            return false;
        }
        let deadline = self.now_us() + timeout_us;
        loop {
            self.broker.task();
            pump();

            let mut frame = Frame::empty();
            if self.broker.try_receive(&mut frame) {
                if frame.crc_valid
                    && frame.frame_type == FrameType::Ctrl
                    && frame.src == dest
                    && frame.opcode() == Some(expect as u16)
                {
                    out.clone_from(&frame);
                    return true;
                }
                self.park_stray(&frame);
            }

            if self.now_us() >= deadline {
                self.trace.record(Trace::CommandTimeout {
                    opcode: expect as u16,
                });
                return false;
            }
            self.broker.link_mut().delay_us(10);
        }
    }

    // ------------------------------------------------------------------
    // Management surface (what the HTTP façade calls)
    // ------------------------------------------------------------------

    /// Link-layer ping with a fresh sequence number and nonce.
    pub fn ping_node(&mut self, dest: u8, pump: &mut impl FnMut()) -> bool {
        self.ping_seq = self.ping_seq.wrapping_add(1);
        let seq = self.ping_seq;
        let t = self.now_us();
        let nonce = [
            t as u16 ^ 0xA5A5,
            (t >> 16) as u16,
            (t >> 32) as u16 ^ seq,
            0x5A5A,
        ];
        if self.broker.link_mut().send_ping(dest, seq, nonce).is_err() {
            return false;
        }

        let deadline = self.now_us() + PING_TIMEOUT_US;
        loop {
            self.broker.task();
            pump();
            let mut frame = Frame::empty();
            if self.broker.try_receive(&mut frame) {
                self.park_stray(&frame);
            }
            if let Some(reply) = self.broker.take_ping_reply() {
                if reply.src == dest && reply.seq == seq && reply.nonce == nonce
                {
                    self.trace.record(Trace::PingOk { node: dest });
                    let now_ms = (self.now_us() / 1000) as u32;
                    self.topology.mark_online(dest, now_ms);
                    return true;
                }
            }
            if self.now_us() >= deadline {
                self.trace.record(Trace::PingTimeout { node: dest });
                self.topology.mark_offline(dest);
                return false;
            }
            self.broker.link_mut().delay_us(10);
        }
    }

    /// Pings every worker, refreshes the master table, and broadcasts
    /// the presence bitmap. Returns the bitmap.
    pub fn scan_topology(&mut self, pump: &mut impl FnMut()) -> u32 {
        for node in 0..CONTROLLER_ID {
            self.ping_node(node, pump);
        }
        let now_ms = (self.now_us() / 1000) as u32;
        self.topology.mark_online(CONTROLLER_ID, now_ms);
        let bitmap = self.topology.bitmap();
        let _ = self.broker.link_mut().broadcast_topology(bitmap);
        bitmap
    }

    pub fn node_status(
        &mut self,
        dest: u8,
        pump: &mut impl FnMut(),
    ) -> Option<Status> {
        let mut frame = Frame::empty();
        if !self.exec(
            &[Opcode::ReadStatus as u16],
            dest,
            stream::NODE_MGMT,
            Opcode::Status,
            COMMAND_TIMEOUT_US,
            &mut frame,
            pump,
        ) {
            return None;
        }
        Status::from_words(frame.payload()).ok()
    }

    pub fn set_led(
        &mut self,
        dest: u8,
        r: u8,
        g: u8,
        b: u8,
        pump: &mut impl FnMut(),
    ) -> bool {
        let cmd = cluster_commands::SetLed { r, g, b };
        let mut frame = Frame::empty();
        self.exec(
            &cmd.to_words(),
            dest,
            stream::NODE_MGMT,
            Opcode::LedAck,
            COMMAND_TIMEOUT_US,
            &mut frame,
            pump,
        )
    }

    /// Writes `data` into the worker's external memory at `addr`,
    /// chunked to [`MEMORY_WRITE_CHUNK_BYTES`] per frame, each chunk
    /// confirmed by WRITE_ACK.
    pub fn write_memory(
        &mut self,
        dest: u8,
        addr: u32,
        data: &[u8],
        pump: &mut impl FnMut(),
    ) -> bool {
        let mut offset = 0usize;
        while offset < data.len() {
            let n = (data.len() - offset).min(MEMORY_WRITE_CHUNK_BYTES);
            let header = MemoryHeader {
                opcode: Opcode::WriteMemory,
                length_bytes: n as u16,
                addr: addr + offset as u32,
            };
            let mut words = [0u16; MAX_PAYLOAD_WORDS];
            words[..MemoryHeader::WORDS].copy_from_slice(&header.to_words());
            let used = bytes_to_words(
                &data[offset..offset + n],
                &mut words[MemoryHeader::WORDS..],
            );

            let mut frame = Frame::empty();
            if !self.exec(
                &words[..MemoryHeader::WORDS + used],
                dest,
                stream::MEMORY,
                Opcode::WriteAck,
                COMMAND_TIMEOUT_US,
                &mut frame,
                pump,
            ) {
                return false;
            }
            offset += n;
        }
        true
    }

    /// Tells a worker to parse the table previously written to its
    /// neuron-table region. Returns the worker's deployed neuron count.
    pub fn deploy_topology(
        &mut self,
        dest: u8,
        neuron_count: u16,
        pump: &mut impl FnMut(),
    ) -> Option<u16> {
        let mut frame = Frame::empty();
        if !self.exec(
            &[Opcode::DeployTopology as u16, neuron_count],
            dest,
            stream::SNN_CONFIG,
            Opcode::DeployAck,
            COMMAND_TIMEOUT_US,
            &mut frame,
            pump,
        ) {
            return None;
        }
        frame.payload().get(1).copied()
    }

    /// Writes a packed neuron table into the worker's table region, then
    /// has the worker parse it. Returns the deployed neuron count.
    pub fn deploy_neuron_table(
        &mut self,
        dest: u8,
        table: &[u8],
        neuron_count: u16,
        pump: &mut impl FnMut(),
    ) -> Option<u16> {
        if !self.write_memory(
            dest,
            cluster_hw::map::NEURON_TABLE_OFFSET,
            table,
            pump,
        ) {
            return None;
        }
        self.deploy_topology(dest, neuron_count, pump)
    }

    pub fn snn_status(
        &mut self,
        dest: u8,
        pump: &mut impl FnMut(),
    ) -> Option<SnnStatus> {
        let mut frame = Frame::empty();
        if !self.exec(
            &[Opcode::GetSnnStatus as u16],
            dest,
            stream::SNN_CONTROL,
            Opcode::SnnStatus,
            COMMAND_TIMEOUT_US,
            &mut frame,
            pump,
        ) {
            return None;
        }
        SnnStatus::from_words(frame.payload()).ok()
    }

    /// Starts or stops the network on a single worker, confirmed.
    pub fn snn_control(
        &mut self,
        dest: u8,
        opcode: Opcode,
        pump: &mut impl FnMut(),
    ) -> bool {
        let mut frame = Frame::empty();
        self.exec(
            &[opcode as u16],
            dest,
            stream::SNN_CONTROL,
            Opcode::SnnAck,
            COMMAND_TIMEOUT_US,
            &mut frame,
            pump,
        )
    }

    /// Cluster-wide start/stop: broadcast, fire-and-forget.
    pub fn snn_control_all(&mut self, opcode: Opcode) {
        let _ = self.broker.send_command(
            &[opcode as u16],
            BROADCAST_ID,
            stream::SNN_CONTROL,
        );
        self.broker.task();
    }

    pub fn reset_node(&mut self, dest: u8, pump: &mut impl FnMut()) -> bool {
        let mut frame = Frame::empty();
        self.exec(
            &[Opcode::ResetToBootloader as u16],
            dest,
            stream::NODE_MGMT,
            Opcode::ResetAck,
            COMMAND_TIMEOUT_US,
            &mut frame,
            pump,
        )
    }

    // ------------------------------------------------------------------
    // Firmware update driving
    // ------------------------------------------------------------------

    /// Runs a complete update of `target` from `source`, driving the
    /// session state machine to `Done` or failure. The target's replies
    /// are matched by opcode; everything else is parked.
    pub fn run_update(
        &mut self,
        target: u8,
        source: &impl ChunkSource,
        chunk_size: u16,
        pump: &mut impl FnMut(),
    ) -> Result<(), FailReason> {
        let chunk_size = chunk_size.min(MAX_UPDATE_CHUNK_BYTES);
        let size = source.len();
        let crc = {
            let mut crc = app_image::ImageCrc::new();
            let mut buf = [0u8; 256];
            let mut offset = 0;
            while offset < size {
                let n = (size - offset).min(buf.len() as u32) as usize;
                source.read(offset, &mut buf[..n]);
                crc.update(&buf[..n]);
                offset += n as u32;
            }
            crc.finalize()
        };

        let mut session = ControllerSession::new(target, size, crc, chunk_size);
        let mut action = session.begin(self.now_us());

        loop {
            self.perform(&session, action, source);

            loop {
                self.broker.task();
                pump();

                let mut frame = Frame::empty();
                if self.broker.try_receive(&mut frame) {
                    if let Some(reply) = decode_update_reply(&frame, target) {
                        action = session.on_reply(reply, self.now_us());
                        break;
                    }
                    self.park_stray(&frame);
                }

                action = session.poll(self.now_us());
                if action != Action::None {
                    break;
                }
                match session.failure() {
                    Some(reason) => {
                        self.trace.record(Trace::UpdateFailed { target });
                        return Err(reason);
                    }
                    None => self.broker.link_mut().delay_us(10),
                }
            }

            if session.failure().is_some() {
                self.trace.record(Trace::UpdateFailed { target });
                return Err(session.failure().unwrap());
            }
            if action == Action::SendRestart {
                self.perform(&session, action, source);
                self.trace.record(Trace::UpdateDone { target });
                return Ok(());
            }
        }
    }

    /// The SD-card variant: fixed 512-byte chunks straight off storage.
    pub fn run_update_from_storage(
        &mut self,
        target: u8,
        source: &impl ChunkSource,
        pump: &mut impl FnMut(),
    ) -> Result<(), FailReason> {
        self.run_update(target, source, STORAGE_CHUNK_BYTES, pump)
    }

    fn perform(
        &mut self,
        session: &ControllerSession,
        action: Action,
        source: &impl ChunkSource,
    ) {
        let target = session.target();
        match action {
            Action::None => {}
            Action::SendStart => {
                let start = UpdateStart {
                    target,
                    size: session.size(),
                    crc32: session.crc32(),
                    chunk_size: session.chunk_size(),
                    total_chunks: session.total_chunks(),
                };
                let _ = self.broker.send_command(
                    &start.to_words(),
                    target,
                    stream::FIRMWARE,
                );
            }
            Action::SendChunk {
                chunk_num,
                offset,
                len,
            } => {
                let header = ChunkHeader {
                    target,
                    chunk_num,
                    data_size: len,
                };
                let mut data = [0u8; 1024];
                source.read(offset, &mut data[..usize::from(len)]);

                let mut words = [0u16; MAX_PAYLOAD_WORDS];
                words[..ChunkHeader::WORDS]
                    .copy_from_slice(&header.to_words());
                let used = bytes_to_words(
                    &data[..usize::from(len)],
                    &mut words[ChunkHeader::WORDS..],
                );
                let _ = self.broker.send_command(
                    &words[..ChunkHeader::WORDS + used],
                    target,
                    stream::FIRMWARE,
                );
            }
            Action::PollVerify => {
                let poll = UpdatePoll {
                    target,
                    poll_type: PollType::Verify,
                };
                let _ = self.broker.send_command(
                    &poll.to_words(),
                    target,
                    stream::FIRMWARE,
                );
            }
            Action::SendCommit => {
                let _ = self.broker.send_command(
                    &[Opcode::UpdateCommit as u16, u16::from(target)],
                    target,
                    stream::FIRMWARE,
                );
            }
            Action::SendRestart => {
                let _ = self.broker.send_command(
                    &[Opcode::UpdateRestart as u16],
                    target,
                    stream::FIRMWARE,
                );
                self.broker.task();
            }
        }
    }
}

/// Decodes an update-protocol reply frame from `target`.
fn decode_update_reply(frame: &Frame, target: u8) -> Option<Reply> {
    if !frame.crc_valid
        || frame.frame_type != FrameType::Ctrl
        || frame.src != target
    {
        return None;
    }
    let payload = frame.payload();
    match frame.opcode().and_then(Opcode::from_u16)? {
        Opcode::UpdateReady => {
            let ready = UpdateReady::from_words(payload).ok()?;
            Some(Reply::Ready {
                status: ready.status,
            })
        }
        Opcode::UpdateAckChunk => Some(Reply::ChunkAck {
            chunk_num: *payload.get(1)?,
        }),
        Opcode::UpdateVerifyResp => {
            let resp = VerifyResp::from_words(payload).ok()?;
            Some(Reply::VerifyResp {
                status: resp.status,
                crc32: resp.crc32,
            })
        }
        Opcode::UpdateCommitResp => Some(Reply::CommitResp {
            status: *payload.get(1)?,
        }),
        Opcode::UpdateError => Some(Reply::Error {
            code: *payload.get(1)?,
        }),
        _ => None,
    }
}

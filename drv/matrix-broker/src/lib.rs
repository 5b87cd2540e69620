// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The broker: fair, collision-aware access to a shared transmit path.
//!
//! Two queues feed one bus. The command queue carries CTRL traffic
//! (status, memory, SNN control, firmware) and has strict priority; the
//! spike queue carries fire-and-forget spike frames and yields to
//! commands, to the carrier-sense backoff, and to a burst limiter that
//! stops ten-in-a-row spike trains from starving other nodes.
//!
//! Arbitration before every transmit:
//!
//! 1. Sample the busy line, with a deadline (50 µs for spikes, growing
//!    with the retry count for commands, capped at 1 ms). Still busy at
//!    the deadline: the frame stays queued, the broker returns.
//! 2. Sleep out the priority slot, `node_id * 30 µs`. The controller
//!    (id 16) has the longest slot and therefore yields to every worker.
//! 3. Sample again. Busy now means somebody with a shorter slot took the
//!    bus: arbitration lost, try again next pass.
//!
//! Spikes are dropped when stale (older than five seconds), when their
//! transmit retries run out, or wholesale when the hardware looks wedged;
//! every drop is counted. Commands are never dropped: a command stays at
//! the head of its queue, its carrier-sense window widening with each
//! retry, until the link takes it. Acknowledgement of a command is the
//! addressee's application-level reply, which the *caller* awaits through
//! [`Broker::try_receive`]; the link-layer auto-ACK applies to unicast
//! data frames only.
//!
//! [`Broker::task`] performs at most one unit of work; the owning core
//! calls it continuously from the service loop.

#![cfg_attr(not(test), no_std)]

use drv_matrix_bus::hw::BusHw;
use drv_matrix_bus::{LinkLayer, PingReply};
use heapless::Deque;
use matrix_proto::{Frame, FrameType, BROADCAST_ID, MAX_PAYLOAD_WORDS};
use tracebuf::TraceBuf;

/// Carrier-sense deadline for spikes.
pub const SPIKE_CS_TIMEOUT_US: u64 = 50;

/// Carrier-sense deadline cap for commands.
pub const CMD_CS_TIMEOUT_CAP_US: u64 = 1_000;

/// Width of one arbitration priority slot.
pub const PRIORITY_SLOT_US: u32 = 30;

/// Consecutive spike transmissions allowed before the burst backoff.
pub const SPIKE_BURST_LIMIT: u8 = 10;

pub const SPIKE_BURST_BACKOFF_US: u64 = 500;

/// Spikes older than this are dropped unsent.
pub const SPIKE_STALE_US: u64 = 5_000_000;

/// Transmit failures tolerated per spike; a run of this many back-to-back
/// failures is treated as a DMA fault and flushes the whole spike queue.
pub const SPIKE_RETRIES: u8 = 3;

/// Worker-build queue depths.
pub const APP_SPIKE_DEPTH: usize = 64;
pub const APP_CMD_DEPTH: usize = 16;

/// Bootloader-build queue depths. The bootloader generates no spikes; its
/// spike queue exists only to satisfy the shape of the type.
pub const BOOT_SPIKE_DEPTH: usize = 2;
pub const BOOT_CMD_DEPTH: usize = 8;

pub type AppBroker<H> = Broker<H, APP_SPIKE_DEPTH, APP_CMD_DEPTH>;
pub type BootBroker<H> = Broker<H, BOOT_SPIKE_DEPTH, BOOT_CMD_DEPTH>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BrokerError {
    QueueFull,
    TooLong,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BrokerStats {
    pub spikes_sent: u32,
    pub cmds_sent: u32,
    pub dropped: u32,
    /// Arbitration losses (busy after the priority slot).
    pub collisions: u32,
    /// Histogram over the retry count a frame finally went out with:
    /// 0, 1, 2, and 3-or-more.
    pub retry_histogram: [u32; 4],
    pub min_latency_us: u64,
    pub max_latency_us: u64,
    pub total_latency_us: u64,
    pub latency_samples: u32,
    pub peak_spike_depth: u8,
    pub peak_cmd_depth: u8,
    /// Carrier-sense outcomes at first sample.
    pub cs_idle: u32,
    pub cs_busy: u32,
}

impl Default for BrokerStats {
    fn default() -> Self {
        Self {
            spikes_sent: 0,
            cmds_sent: 0,
            dropped: 0,
            collisions: 0,
            retry_histogram: [0; 4],
            min_latency_us: u64::MAX,
            max_latency_us: 0,
            total_latency_us: 0,
            latency_samples: 0,
            peak_spike_depth: 0,
            peak_cmd_depth: 0,
            cs_idle: 0,
            cs_busy: 0,
        }
    }
}

impl BrokerStats {
    pub fn avg_latency_us(&self) -> u64 {
        if self.latency_samples == 0 {
            0
        } else {
            self.total_latency_us / u64::from(self.latency_samples)
        }
    }

    fn record_latency(&mut self, us: u64, retries: u8) {
        self.min_latency_us = self.min_latency_us.min(us);
        self.max_latency_us = self.max_latency_us.max(us);
        self.total_latency_us += us;
        self.latency_samples += 1;
        self.retry_histogram[usize::from(retries.min(3))] += 1;
    }
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    SpikeSent { dest: u8 },
    CmdSent { dest: u8 },
    SpikeDropped,
    SpikeQueueFlushed { count: u8 },
    ArbitrationLost,
    BurstBackoff,
}

/// One queued frame. The payload is inline so enqueueing is a single copy
/// and the queue owns its memory outright.
#[derive(Clone)]
struct Request {
    payload: [u16; MAX_PAYLOAD_WORDS],
    words: u16,
    dest: u8,
    stream: u8,
    retries: u8,
    enqueued_us: u64,
}

impl Request {
    fn new(
        payload: &[u16],
        dest: u8,
        stream: u8,
        now: u64,
    ) -> Result<Self, BrokerError> {
        if payload.len() > MAX_PAYLOAD_WORDS {
            return Err(BrokerError::TooLong);
        }
        let mut r = Self {
            payload: [0; MAX_PAYLOAD_WORDS],
            words: payload.len() as u16,
            dest,
            stream,
            retries: 0,
            enqueued_us: now,
        };
        r.payload[..payload.len()].copy_from_slice(payload);
        Ok(r)
    }

    fn payload_words(&self) -> &[u16] {
        &self.payload[..usize::from(self.words)]
    }
}

/// Outcome of one arbitration attempt.
enum Arbitration {
    Won,
    Deferred,
    Lost,
}

pub struct Broker<H: BusHw, const SPIKES: usize, const CMDS: usize> {
    link: LinkLayer<H>,
    spikes: Deque<Request, SPIKES>,
    cmds: Deque<Request, CMDS>,

    burst_count: u8,
    spike_backoff_until: u64,
    consecutive_spike_failures: u8,

    stats: BrokerStats,
    trace: TraceBuf<Trace, 32>,
}

impl<H: BusHw, const SPIKES: usize, const CMDS: usize> Broker<H, SPIKES, CMDS> {
    pub fn new(link: LinkLayer<H>) -> Self {
        Self {
            link,
            spikes: Deque::new(),
            cmds: Deque::new(),
            burst_count: 0,
            spike_backoff_until: 0,
            consecutive_spike_failures: 0,
            stats: BrokerStats::default(),
            trace: TraceBuf::new(),
        }
    }

    pub fn link(&self) -> &LinkLayer<H> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut LinkLayer<H> {
        &mut self.link
    }

    pub fn stats(&self) -> BrokerStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = BrokerStats::default();
    }

    pub fn spike_depth(&self) -> usize {
        self.spikes.len()
    }

    pub fn cmd_depth(&self) -> usize {
        self.cmds.len()
    }

    pub fn take_ping_reply(&mut self) -> Option<PingReply> {
        self.link.take_ping_reply()
    }

    /// Queues a fire-and-forget spike frame (UNICAST, or BROADCAST for
    /// destination 31). Full queue: the caller backs off, nothing is
    /// emitted for the rejected request.
    pub fn send_spike(
        &mut self,
        payload: &[u16],
        dest: u8,
        stream: u8,
    ) -> Result<(), BrokerError> {
        let now = self.link.now_us();
        let request = Request::new(payload, dest, stream, now)?;
        if self.spikes.push_back(request).is_err() {
            self.stats.dropped += 1;
            return Err(BrokerError::QueueFull);
        }
        self.stats.peak_spike_depth =
            self.stats.peak_spike_depth.max(self.spikes.len() as u8);
        Ok(())
    }

    /// Queues a CTRL command. Once accepted it will be transmitted;
    /// commands are retried, not shed.
    pub fn send_command(
        &mut self,
        payload: &[u16],
        dest: u8,
        stream: u8,
    ) -> Result<(), BrokerError> {
        let now = self.link.now_us();
        let request = Request::new(payload, dest, stream, now)?;
        if self.cmds.push_back(request).is_err() {
            self.stats.dropped += 1;
            return Err(BrokerError::QueueFull);
        }
        self.stats.peak_cmd_depth =
            self.stats.peak_cmd_depth.max(self.cmds.len() as u8);
        Ok(())
    }

    /// Receives one frame, if available. Thin pass-through to the link.
    pub fn try_receive(&mut self, out: &mut Frame) -> bool {
        self.link.try_receive(out)
    }

    /// One scheduling step: commands strictly first, then spikes under
    /// the backoff rules. Call continuously from the owning core.
    pub fn task(&mut self) {
        if !self.cmds.is_empty() {
            self.pump_command();
        } else if !self.spikes.is_empty() {
            self.pump_spike();
        }

        if self.cmds.is_empty() && self.spikes.is_empty() {
            self.burst_count = 0;
        }
    }

    /// Carrier sense + priority slot. `cs_deadline_us` is how long we are
    /// willing to wait for the line to go idle at all.
    fn arbitrate(&mut self, cs_deadline_us: u64) -> Arbitration {
        let start = self.link.now_us();
        if self.link.carrier_sense() {
            self.stats.cs_busy += 1;
            loop {
                if !self.link.carrier_sense() {
                    break;
                }
                if self.link.now_us().saturating_sub(start) >= cs_deadline_us {
                    return Arbitration::Deferred;
                }
                self.link.delay_us(1);
            }
        } else {
            self.stats.cs_idle += 1;
        }

        // Idle observed: wait out our slot, then look again. Someone with
        // a shorter slot may legitimately have taken the bus.
        let slot = u32::from(self.link.node_id()) * PRIORITY_SLOT_US;
        self.link.delay_us(slot);
        if self.link.carrier_sense() {
            self.stats.collisions += 1;
            self.trace.record(Trace::ArbitrationLost);
            return Arbitration::Lost;
        }
        Arbitration::Won
    }

    fn pump_command(&mut self) {
        let (dest, stream, retries, cs_window) = {
            let head = self.cmds.front().unwrap();
            let window = (50 + 50 * u64::from(head.retries))
                .min(CMD_CS_TIMEOUT_CAP_US);
            (head.dest, head.stream, head.retries, window)
        };

        match self.arbitrate(cs_window) {
            Arbitration::Won => {}
            Arbitration::Deferred => return,
            Arbitration::Lost => {
                if let Some(head) = self.cmds.front_mut() {
                    head.retries = head.retries.saturating_add(1);
                }
                return;
            }
        }

        let mut buf = [0u16; MAX_PAYLOAD_WORDS];
        let n = {
            let head = self.cmds.front().unwrap();
            let n = usize::from(head.words);
            buf[..n].copy_from_slice(head.payload_words());
            n
        };
        let no_ack = dest == BROADCAST_ID;
        let result = self
            .link
            .send_frame(FrameType::Ctrl, dest, stream, no_ack, &buf[..n]);

        match result {
            Ok(()) => {
                let request = self.cmds.pop_front().unwrap();
                let latency =
                    self.link.now_us().saturating_sub(request.enqueued_us);
                self.stats.cmds_sent += 1;
                self.stats.record_latency(latency, retries);
                self.trace.record(Trace::CmdSent { dest });
            }
            Err(_) => {
                // The command stays queued; its carrier-sense window
                // widens next pass.
                if let Some(head) = self.cmds.front_mut() {
                    head.retries = head.retries.saturating_add(1);
                }
            }
        }
    }

    fn pump_spike(&mut self) {
        let now = self.link.now_us();
        if now < self.spike_backoff_until {
            return;
        }

        // Shed stale spikes from the head before spending bus time.
        while let Some(head) = self.spikes.front() {
            if now.saturating_sub(head.enqueued_us) > SPIKE_STALE_US {
                self.spikes.pop_front();
                self.stats.dropped += 1;
                self.trace.record(Trace::SpikeDropped);
            } else {
                break;
            }
        }
        let Some(head) = self.spikes.front() else {
            return;
        };
        let (dest, stream, retries) = (head.dest, head.stream, head.retries);

        match self.arbitrate(SPIKE_CS_TIMEOUT_US) {
            Arbitration::Won => {}
            Arbitration::Deferred | Arbitration::Lost => return,
        }

        let frame_type = if dest == BROADCAST_ID {
            FrameType::Broadcast
        } else {
            FrameType::Unicast
        };
        let mut buf = [0u16; MAX_PAYLOAD_WORDS];
        let n = {
            let head = self.spikes.front().unwrap();
            let n = usize::from(head.words);
            buf[..n].copy_from_slice(head.payload_words());
            n
        };
        let result = self
            .link
            .send_frame(frame_type, dest, stream, true, &buf[..n]);

        match result {
            Ok(()) => {
                let request = self.spikes.pop_front().unwrap();
                let latency =
                    self.link.now_us().saturating_sub(request.enqueued_us);
                self.stats.spikes_sent += 1;
                self.stats.record_latency(latency, retries);
                self.trace.record(Trace::SpikeSent { dest });
                self.consecutive_spike_failures = 0;

                self.burst_count += 1;
                if self.burst_count >= SPIKE_BURST_LIMIT {
                    self.spike_backoff_until =
                        self.link.now_us() + SPIKE_BURST_BACKOFF_US;
                    self.burst_count = 0;
                    self.trace.record(Trace::BurstBackoff);
                }
            }
            Err(_) => {
                if let Some(head) = self.spikes.front_mut() {
                    head.retries = head.retries.saturating_add(1);
                }
                self.consecutive_spike_failures =
                    self.consecutive_spike_failures.saturating_add(1);
                if self.consecutive_spike_failures >= SPIKE_RETRIES {
                    // Three back-to-back transmit failures for the same
                    // head spike reads as a wedged DMA engine, not a busy
                    // bus. Shed the queue rather than hammer it.
                    let count = self.spikes.len() as u8;
                    self.stats.dropped += u32::from(count);
                    self.spikes.clear();
                    self.consecutive_spike_failures = 0;
                    self.trace.record(Trace::SpikeQueueFlushed { count });
                }
            }
        }
    }
}

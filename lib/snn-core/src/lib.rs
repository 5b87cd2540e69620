// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Leaky integrate-and-fire execution engine.
//!
//! One engine instance runs per worker. Neurons integrate weighted incoming
//! spikes into their membrane potential; each timestep the potential decays
//! by the neuron's leak retention factor and the neuron fires when it
//! crosses threshold, subject to a refractory window. Firing resets the
//! potential to zero.
//!
//! The engine is deliberately free of I/O: spikes arrive through
//! [`Engine::inject_spike`], the caller fetches [`Engine::output_spikes`]
//! after each [`Engine::step`] and is responsible for broadcasting them.
//! Time is advanced by the step itself, one timestep per call; the caller
//! decides the wall-clock pacing.
//!
//! Fire-events also propagate to synapses *within* the same engine: each
//! step re-queues its own output spikes for the next step's integration,
//! marked so they can never re-enter the input-neuron direct-stimulation
//! path on their own node. The service loop is therefore free to drop
//! every self-addressed broadcast it hears back from the bus.

#![cfg_attr(not(test), no_std)]

use cluster_hw::{map, ExtMem};
use heapless::{Deque, Vec};
use neuron_table::{
    decode_weight, global_id, split_global_id, unpack_synapse, NeuronFlags,
    TableError, MAX_SYNAPSES,
};

/// Neuron capacity per worker.
pub const MAX_NEURONS: usize = 256;

/// Incoming spike queue depth; also bounds the per-step output buffer.
pub const SPIKE_QUEUE_DEPTH: usize = 256;

/// Incoming spikes drained per step. The rest stay queued so a spike storm
/// cannot starve the service loop.
pub const MAX_DRAIN_PER_STEP: usize = 100;

pub const DEFAULT_TIMESTEP_US: u32 = 1000;

/// A spike event: who fired, when, and how hard.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Spike {
    /// Global id of the source neuron: `(node << 16) | local`.
    pub source: u32,
    pub timestamp_us: u64,
    /// 1.0 for fire events; arbitrary for injected input.
    pub value: f32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Synapse {
    source: u32,
    weight: f32,
}

/// A queued spike, with its delivery class.
///
/// Fire-events loop back into their own engine so that same-node synapses
/// see them, but the origin must never re-enter the input-neuron
/// direct-stimulation path off its own spike; `synaptic_only` carries
/// that distinction through the queue.
#[derive(Copy, Clone, Debug, PartialEq)]
struct Incoming {
    spike: Spike,
    synaptic_only: bool,
}

#[derive(Clone, Debug)]
struct Neuron {
    local_id: u16,
    global_id: u32,
    flags: NeuronFlags,
    potential: f32,
    threshold: f32,
    leak_rate: f32,
    refractory_us: u32,
    refractory_until_us: u64,
    last_spike_us: u64,
    fired_this_step: bool,
    spike_count: u32,
    synapses: Vec<Synapse, MAX_SYNAPSES>,
}

impl Neuron {
    fn is_input(&self) -> bool {
        self.synapses.is_empty()
    }

    fn refractory(&self, now: u64) -> bool {
        now < self.refractory_until_us
    }

    fn eligible(&self, now: u64) -> bool {
        !self.fired_this_step
            && !self.refractory(now)
            && self.potential >= self.threshold
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub spikes_received: u32,
    pub spikes_generated: u32,
    /// Inject attempts and loopback deliveries refused because the spike
    /// queue was full, plus output spikes lost to a full output buffer.
    pub spikes_dropped: u32,
    pub steps: u64,
}

/// Per-neuron snapshot for the management surface.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NeuronInfo {
    pub local_id: u16,
    pub flags: NeuronFlags,
    pub potential: f32,
    pub threshold: f32,
    pub spike_count: u32,
    pub last_spike_us: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeployError {
    Table(TableError),
    /// More live entries than [`MAX_NEURONS`].
    TooManyNeurons,
}

impl From<TableError> for DeployError {
    fn from(e: TableError) -> Self {
        Self::Table(e)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFull;

pub struct Engine {
    node_id: u8,
    running: bool,
    paused: bool,
    timestep_us: u32,
    now_us: u64,
    neurons: Vec<Neuron, MAX_NEURONS>,
    incoming: Deque<Incoming, SPIKE_QUEUE_DEPTH>,
    outgoing: Vec<Spike, SPIKE_QUEUE_DEPTH>,
    stats: Stats,
}

impl Engine {
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            running: false,
            paused: false,
            timestep_us: DEFAULT_TIMESTEP_US,
            now_us: 0,
            neurons: Vec::new(),
            incoming: Deque::new(),
            outgoing: Vec::new(),
            stats: Stats::default(),
        }
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn neuron_count(&self) -> u16 {
        self.neurons.len() as u16
    }

    pub fn current_time_us(&self) -> u64 {
        self.now_us
    }

    pub fn timestep_us(&self) -> u32 {
        self.timestep_us
    }

    pub fn set_timestep(&mut self, timestep_us: u32) {
        if timestep_us > 0 {
            self.timestep_us = timestep_us;
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = Stats::default();
    }

    /// Neurons that have fired at least once since the last deploy.
    pub fn active_neurons(&self) -> u16 {
        self.neurons.iter().filter(|n| n.spike_count > 0).count() as u16
    }

    /// Mean spike rate since simulation start.
    pub fn spike_rate_hz(&self) -> u32 {
        if self.now_us == 0 {
            return 0;
        }
        let total =
            u64::from(self.stats.spikes_received + self.stats.spikes_generated);
        ((total * 1_000_000) / self.now_us) as u32
    }

    pub fn start(&mut self) {
        self.running = true;
        self.paused = false;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Parses the neuron table from external memory, replacing any deployed
    /// topology. Simulation time and statistics restart from zero.
    pub fn deploy_topology(
        &mut self,
        mem: &impl ExtMem,
    ) -> Result<usize, DeployError> {
        let mut staged: Vec<Neuron, MAX_NEURONS> = Vec::new();
        let node_id = self.node_id;
        let result = neuron_table::for_each_entry(
            mem,
            map::NEURON_TABLE_OFFSET,
            MAX_NEURONS + 1,
            |_, raw| {
                let mut synapses = Vec::new();
                for &packed in raw.live_synapses() {
                    let (source, weight) = unpack_synapse(packed.get());
                    // Capacity matches MAX_SYNAPSES; live_synapses is
                    // already clamped.
                    let _ = synapses.push(Synapse {
                        source,
                        weight: decode_weight(weight),
                    });
                }
                let local = raw.local_id.get();
                staged
                    .push(Neuron {
                        local_id: local,
                        global_id: global_id(node_id, local),
                        flags: raw.neuron_flags(),
                        potential: raw.potential.get(),
                        threshold: raw.threshold.get(),
                        leak_rate: raw.leak_rate.get(),
                        refractory_us: raw.refractory_us.get(),
                        refractory_until_us: 0,
                        last_spike_us: 0,
                        fired_this_step: false,
                        spike_count: 0,
                        synapses,
                    })
                    .map_err(|_| TableError::Unterminated)
            },
        );
        let count = match result {
            Ok(count) => count,
            Err(TableError::Unterminated)
                if staged.len() == staged.capacity() =>
            {
                return Err(DeployError::TooManyNeurons)
            }
            Err(e) => return Err(e.into()),
        };

        self.neurons = staged;
        self.incoming.clear();
        self.outgoing.clear();
        self.now_us = 0;
        self.stats = Stats::default();
        Ok(count)
    }

    /// Removes the deployed topology and stops the engine.
    pub fn clear_topology(&mut self) {
        self.running = false;
        self.paused = false;
        self.neurons.clear();
        self.incoming.clear();
        self.outgoing.clear();
        self.now_us = 0;
        self.stats = Stats::default();
    }

    /// Queues an incoming spike for the next step.
    pub fn inject_spike(&mut self, spike: Spike) -> Result<(), QueueFull> {
        let entry = Incoming {
            spike,
            synaptic_only: false,
        };
        if self.incoming.push_back(entry).is_err() {
            self.stats.spikes_dropped += 1;
            return Err(QueueFull);
        }
        self.stats.spikes_received += 1;
        Ok(())
    }

    /// Adds `value` directly to a local neuron's membrane potential. The
    /// threshold is evaluated at the next step, so a large stimulus still
    /// respects the once-per-timestep fire rule.
    pub fn inject_spike_immediate(&mut self, local_id: u16, value: f32) {
        if let Some(n) =
            self.neurons.iter_mut().find(|n| n.local_id == local_id)
        {
            n.potential += value;
            self.stats.spikes_received += 1;
        }
    }

    /// Output spikes produced by the most recent step.
    pub fn output_spikes(&self) -> &[Spike] {
        &self.outgoing
    }

    pub fn neuron_info(&self, local_id: u16) -> Option<NeuronInfo> {
        self.neurons.iter().find(|n| n.local_id == local_id).map(|n| {
            NeuronInfo {
                local_id: n.local_id,
                flags: n.flags,
                potential: n.potential,
                threshold: n.threshold,
                spike_count: n.spike_count,
                last_spike_us: n.last_spike_us,
            }
        })
    }

    /// Runs one timestep. No-op unless running and not paused.
    pub fn step(&mut self) {
        if !self.running || self.paused {
            return;
        }

        self.now_us += u64::from(self.timestep_us);
        let now = self.now_us;
        self.outgoing.clear();
        self.stats.steps += 1;
        for n in &mut self.neurons {
            n.fired_this_step = false;
        }

        // Phase 1: integrate queued spikes, at most MAX_DRAIN_PER_STEP of
        // them; the remainder waits for the next tick.
        for _ in 0..MAX_DRAIN_PER_STEP {
            let Some(entry) = self.incoming.pop_front() else {
                break;
            };
            self.integrate(entry, now);
        }

        // Phase 2: leak, then the post-leak threshold check.
        for i in 0..self.neurons.len() {
            let n = &mut self.neurons[i];
            if n.leak_rate != 0.0 {
                n.potential *= n.leak_rate;
            }
            if n.eligible(now) {
                Self::fire(
                    &mut self.neurons[i],
                    now,
                    &mut self.outgoing,
                    &mut self.stats,
                );
            }
        }

        // Phase 3: intra-node delivery. The receive side drops our bus
        // echo, so this step's fire-events are looped back here for the
        // next step's synapse matching. Synaptic-only: the origin never
        // re-enters the direct-stimulation path off its own spike, and
        // the refractory window keeps the firing neuron itself quiet.
        for spike in &self.outgoing {
            let entry = Incoming {
                spike: *spike,
                synaptic_only: true,
            };
            if self.incoming.push_back(entry).is_err() {
                self.stats.spikes_dropped += 1;
            }
        }
    }

    fn integrate(&mut self, entry: Incoming, now: u64) {
        let spike = entry.spike;
        let (src_node, src_local) = split_global_id(spike.source);

        // Direct stimulation: a spike naming a local input neuron (no
        // incoming synapses) adds its value to that neuron's potential.
        // Loopback of our own fire-events skips this path.
        if !entry.synaptic_only && src_node == self.node_id {
            if let Some(i) = self
                .neurons
                .iter()
                .position(|n| n.local_id == src_local && n.is_input())
            {
                let n = &mut self.neurons[i];
                n.potential += spike.value;
                if n.eligible(now) {
                    Self::fire(
                        &mut self.neurons[i],
                        now,
                        &mut self.outgoing,
                        &mut self.stats,
                    );
                }
            }
        }

        // Synaptic integration: every local neuron listening to this
        // source accumulates weight * value.
        for i in 0..self.neurons.len() {
            let n = &mut self.neurons[i];
            let Some(w) = n
                .synapses
                .iter()
                .find(|s| s.source == spike.source)
                .map(|s| s.weight)
            else {
                continue;
            };
            n.potential += w * spike.value;
            if n.eligible(now) {
                Self::fire(
                    &mut self.neurons[i],
                    now,
                    &mut self.outgoing,
                    &mut self.stats,
                );
            }
        }
    }

    fn fire(
        neuron: &mut Neuron,
        now: u64,
        outgoing: &mut Vec<Spike, SPIKE_QUEUE_DEPTH>,
        stats: &mut Stats,
    ) {
        neuron.potential = 0.0;
        neuron.fired_this_step = true;
        neuron.refractory_until_us = now + u64::from(neuron.refractory_us);
        neuron.last_spike_us = now;
        neuron.spike_count += 1;
        stats.spikes_generated += 1;

        let spike = Spike {
            source: neuron.global_id,
            timestamp_us: now,
            value: 1.0,
        };
        if outgoing.push(spike).is_err() {
            stats.spikes_dropped += 1;
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A software Matrix bus for host tests.
//!
//! All endpoints share one medium and one virtual clock. A transmit
//! delivers its beats into every endpoint's RX ring (including the
//! sender's, exactly like the real wiring) and advances the clock one
//! microsecond per beat. Tests can corrupt beats in flight, hang the TX
//! DMA, and push the RX write pointer out of bounds to exercise the
//! recovery paths.
//!
//! Single-threaded by design; the cooperative service loops under test
//! are single-threaded too.

use crate::hw::{BusHw, RX_RING_WORDS};
use std::cell::RefCell;
use std::rc::Rc;
use std::vec;
use std::vec::Vec;

struct Ring {
    words: Vec<u16>,
    write: usize,
    forced_write_index: Option<usize>,
}

impl Ring {
    fn new() -> Self {
        Self {
            words: vec![0; RX_RING_WORDS],
            write: 0,
            forced_write_index: None,
        }
    }

    fn push(&mut self, beat: u16) {
        self.words[self.write] = beat;
        self.write = (self.write + 1) & (RX_RING_WORDS - 1);
    }
}

#[derive(Default)]
struct Faults {
    /// After skipping `.0` transmissions, XOR `.2` into frame word `.1`
    /// of the next one, as seen by every receiver.
    corrupt_tx: Option<(usize, usize, u16)>,
    /// The next `start_tx` hangs until `abort_tx`.
    hang_next_tx: bool,
}

struct Medium {
    now_us: u64,
    busy: bool,
    rings: Vec<Ring>,
    faults: Faults,
    tx_hung: bool,
}

/// Handle on the shared medium; clone freely, hand [`SimBus::endpoint`]
/// results to link layers.
#[derive(Clone)]
pub struct SimBus {
    inner: Rc<RefCell<Medium>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Medium {
                now_us: 0,
                busy: false,
                rings: Vec::new(),
                faults: Faults::default(),
                tx_hung: false,
            })),
        }
    }

    /// Attaches a new endpoint to the medium.
    pub fn endpoint(&self) -> SimHw {
        let mut m = self.inner.borrow_mut();
        m.rings.push(Ring::new());
        SimHw {
            bus: self.inner.clone(),
            index: m.rings.len() - 1,
            speed_khz: 10_000,
        }
    }

    pub fn now_us(&self) -> u64 {
        self.inner.borrow().now_us
    }

    /// Advances the shared clock.
    pub fn advance_us(&self, us: u64) {
        self.inner.borrow_mut().now_us += us;
    }

    pub fn is_busy(&self) -> bool {
        self.inner.borrow().busy
    }

    /// Holds the busy line high without any endpoint transmitting, for
    /// carrier-sense tests.
    pub fn jam_busy(&self, busy: bool) {
        self.inner.borrow_mut().busy = busy;
    }

    /// Corrupts word `index` of the next transmission with `mask`.
    pub fn corrupt_next_tx(&self, index: usize, mask: u16) {
        self.corrupt_nth_tx(0, index, mask);
    }

    /// Corrupts word `index` of the transmission after the next `skip`
    /// ones.
    pub fn corrupt_nth_tx(&self, skip: usize, index: usize, mask: u16) {
        self.inner.borrow_mut().faults.corrupt_tx = Some((skip, index, mask));
    }

    /// Makes the next transmission hang its DMA.
    pub fn hang_next_tx(&self) {
        self.inner.borrow_mut().faults.hang_next_tx = true;
    }

    /// Forces an endpoint's RX write index out of the ring, as a wedged
    /// DMA channel would.
    pub fn break_rx_dma(&self, endpoint: usize) {
        self.inner.borrow_mut().rings[endpoint].forced_write_index =
            Some(RX_RING_WORDS + 1);
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimHw {
    bus: Rc<RefCell<Medium>>,
    index: usize,
    speed_khz: u32,
}

impl SimHw {
    pub fn endpoint_index(&self) -> usize {
        self.index
    }

    pub fn speed_khz(&self) -> u32 {
        self.speed_khz
    }
}

impl BusHw for SimHw {
    fn now_us(&self) -> u64 {
        self.bus.borrow().now_us
    }

    fn delay_us(&mut self, us: u32) {
        self.bus.borrow_mut().now_us += u64::from(us);
    }

    fn busy_line(&self) -> bool {
        self.bus.borrow().busy
    }

    fn acquire(&mut self) {
        self.bus.borrow_mut().busy = true;
    }

    fn release_data(&mut self) {}

    fn release_busy(&mut self) {
        self.bus.borrow_mut().busy = false;
    }

    fn arm_busy_pulldown(&mut self) {}

    fn start_tx(&mut self, words: &[u16]) {
        let mut m = self.bus.borrow_mut();
        if m.faults.hang_next_tx {
            m.faults.hang_next_tx = false;
            m.tx_hung = true;
            return;
        }

        let corrupt = match m.faults.corrupt_tx {
            Some((0, idx, mask)) => {
                m.faults.corrupt_tx = None;
                Some((idx, mask))
            }
            Some((skip, idx, mask)) => {
                m.faults.corrupt_tx = Some((skip - 1, idx, mask));
                None
            }
            None => None,
        };
        // One beat per clock tick on the shared timeline.
        m.now_us += words.len() as u64;
        for (i, &word) in words.iter().enumerate() {
            let beat = match corrupt {
                Some((idx, mask)) if idx == i => word ^ mask,
                _ => word,
            };
            for ring in &mut m.rings {
                ring.push(beat);
            }
        }
    }

    fn tx_busy(&self) -> bool {
        self.bus.borrow().tx_hung
    }

    fn abort_tx(&mut self) {
        self.bus.borrow_mut().tx_hung = false;
    }

    fn rx_write_index(&self) -> usize {
        let m = self.bus.borrow();
        let ring = &m.rings[self.index];
        ring.forced_write_index.unwrap_or(ring.write)
    }

    fn rx_read(&self, index: usize) -> u16 {
        self.bus.borrow().rings[self.index].words[index]
    }

    fn rx_reset(&mut self) {
        let mut m = self.bus.borrow_mut();
        let ring = &mut m.rings[self.index];
        ring.write = 0;
        ring.forced_write_index = None;
        ring.words.fill(0);
    }

    fn set_speed_khz(&mut self, khz: u32) {
        self.speed_khz = khz;
    }
}

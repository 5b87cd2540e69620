// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The hardware contract for the Matrix bus.
//!
//! One implementation drives the real pins, PIO clocking, and DMA engines;
//! the `sim` module provides a software medium for host tests. The link
//! layer is written entirely against this trait.

/// RX ring capacity in 16-bit words (16 KiB, power of two; the DMA channel
/// wraps in hardware).
pub const RX_RING_WORDS: usize = 8192;

pub trait BusHw {
    /// Monotonic microsecond clock.
    fn now_us(&self) -> u64;

    /// Bounded busy-wait.
    fn delay_us(&mut self, us: u32);

    /// Carrier sense: true while some transmitter drives the busy line.
    fn busy_line(&self) -> bool;

    /// Takes the bus: data and clock pins to output, busy line driven
    /// high. The caller has already decided the bus is ours to take.
    fn acquire(&mut self);

    /// Re-floats the data and clock pins. Always precedes
    /// [`Self::release_busy`]; the gap between the two lets the lines
    /// discharge before the next arbitration.
    fn release_data(&mut self);

    /// Stops driving the busy line.
    fn release_busy(&mut self);

    /// Controller only: re-arms the shared idle pulldown on the busy line
    /// after a transmission.
    fn arm_busy_pulldown(&mut self);

    /// Starts a DMA transfer of `words` onto the data lines, clocked by
    /// the source clock. Returns immediately.
    fn start_tx(&mut self, words: &[u16]);

    /// True while the TX DMA is still moving beats.
    fn tx_busy(&self) -> bool;

    /// Aborts a hung TX DMA.
    fn abort_tx(&mut self);

    /// The RX DMA's current write index into the ring, in words. A value
    /// at or past [`RX_RING_WORDS`] means the channel has gone off the
    /// rails and needs [`Self::rx_reset`].
    fn rx_write_index(&self) -> usize;

    /// Reads the ring word at `index`.
    fn rx_read(&self, index: usize) -> u16;

    /// Full receive-path reset: flush the FIFO, abort the DMA, reprogram
    /// and re-arm it. The write index restarts at zero.
    fn rx_reset(&mut self);

    /// Reconfigures the bus clock divider.
    fn set_speed_khz(&mut self, khz: u32);
}

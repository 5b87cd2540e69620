// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lock-free single-producer single-consumer frame queue.
//!
//! Used to hand frames between the two cores: the bus core pushes received
//! frames for the monitor core, and vice versa for outbound frames. Slots
//! are full [`Frame`]s, so each transfer is one copy and no allocation.
//!
//! The head index is owned by the producer, the tail by the consumer; each
//! publishes its index with a release store and reads the other's with an
//! acquire load, which is the fence pairing the shared-memory protocol
//! needs. One slot is sacrificed to distinguish full from empty.
//!
//! `split` hands out the producer and consumer ends as separate `Send`
//! values; the borrow checker enforces the single-producer single-consumer
//! discipline from there.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use matrix_proto::Frame;

pub struct FramePipe<const N: usize> {
    storage: UnsafeCell<[Frame; N]>,
    /// Next slot the producer will write.
    head: AtomicUsize,
    /// Next slot the consumer will read.
    tail: AtomicUsize,
}

// The raw pipe is shared between the two ends; the UnsafeCell accesses are
// disjoint by the head/tail protocol.
unsafe impl<const N: usize> Sync for FramePipe<N> {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Full;

impl<const N: usize> FramePipe<N> {
    const EMPTY_FRAME: Frame = Frame::empty();

    pub const fn new() -> Self {
        assert!(N.is_power_of_two());
        Self {
            storage: UnsafeCell::new([Self::EMPTY_FRAME; N]),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Splits the pipe into its two ends.
    pub fn split(&mut self) -> (Producer<'_, N>, Consumer<'_, N>) {
        (Producer { pipe: self }, Consumer { pipe: self })
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail) & (N - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const N: usize> Default for FramePipe<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Producer<'a, const N: usize> {
    pipe: &'a FramePipe<N>,
}

unsafe impl<const N: usize> Send for Producer<'_, N> {}

impl<const N: usize> Producer<'_, N> {
    pub fn push(&mut self, frame: &Frame) -> Result<(), Full> {
        let head = self.pipe.head.load(Ordering::Relaxed);
        let next = (head + 1) & (N - 1);
        if next == self.pipe.tail.load(Ordering::Acquire) {
            return Err(Full);
        }
        // SAFETY: `head` is owned by this (sole) producer and the slot is
        // outside the consumer's published window.
        unsafe {
            (*self.pipe.storage.get())[head] = frame.clone();
        }
        self.pipe.head.store(next, Ordering::Release);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        let head = self.pipe.head.load(Ordering::Relaxed);
        let next = (head + 1) & (N - 1);
        next == self.pipe.tail.load(Ordering::Acquire)
    }
}

pub struct Consumer<'a, const N: usize> {
    pipe: &'a FramePipe<N>,
}

unsafe impl<const N: usize> Send for Consumer<'_, N> {}

impl<const N: usize> Consumer<'_, N> {
    /// Copies the oldest frame into `out`. Returns false when empty.
    pub fn pop(&mut self, out: &mut Frame) -> bool {
        let tail = self.pipe.tail.load(Ordering::Relaxed);
        if tail == self.pipe.head.load(Ordering::Acquire) {
            return false;
        }
        // SAFETY: `tail` is owned by this (sole) consumer and the slot was
        // published by the producer's release store.
        unsafe {
            out.clone_from(&(*self.pipe.storage.get())[tail]);
        }
        self.pipe.tail.store((tail + 1) & (N - 1), Ordering::Release);
        true
    }

    pub fn is_empty(&self) -> bool {
        let tail = self.pipe.tail.load(Ordering::Relaxed);
        tail == self.pipe.head.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_tag(tag: u16) -> Frame {
        let mut f = Frame::empty();
        f.length = 2;
        f.payload[0] = tag;
        f
    }

    #[test]
    fn fifo_order() {
        let mut pipe: FramePipe<8> = FramePipe::new();
        let (mut tx, mut rx) = pipe.split();
        for tag in 0..5 {
            tx.push(&frame_with_tag(tag)).unwrap();
        }
        let mut out = Frame::empty();
        for tag in 0..5 {
            assert!(rx.pop(&mut out));
            assert_eq!(out.payload[0], tag);
        }
        assert!(!rx.pop(&mut out));
    }

    #[test]
    fn full_detection_sacrifices_one_slot() {
        let mut pipe: FramePipe<4> = FramePipe::new();
        let (mut tx, mut rx) = pipe.split();
        for tag in 0..3 {
            tx.push(&frame_with_tag(tag)).unwrap();
        }
        assert!(tx.is_full());
        assert_eq!(tx.push(&frame_with_tag(9)), Err(Full));

        let mut out = Frame::empty();
        assert!(rx.pop(&mut out));
        assert!(!tx.is_full());
        tx.push(&frame_with_tag(3)).unwrap();
    }

    #[test]
    fn wraparound() {
        let mut pipe: FramePipe<4> = FramePipe::new();
        let (mut tx, mut rx) = pipe.split();
        let mut out = Frame::empty();
        for round in 0..20u16 {
            tx.push(&frame_with_tag(round)).unwrap();
            assert!(rx.pop(&mut out));
            assert_eq!(out.payload[0], round);
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn cross_thread_handoff() {
        let mut pipe: FramePipe<16> = FramePipe::new();
        let (mut tx, mut rx) = pipe.split();
        const COUNT: u16 = 1000;

        std::thread::scope(|scope| {
            scope.spawn(move || {
                for tag in 0..COUNT {
                    loop {
                        if tx.push(&frame_with_tag(tag)).is_ok() {
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            });

            let mut out = Frame::empty();
            for expected in 0..COUNT {
                loop {
                    if rx.pop(&mut out) {
                        break;
                    }
                    std::hint::spin_loop();
                }
                assert_eq!(out.payload[0], expected);
            }
        });
    }
}

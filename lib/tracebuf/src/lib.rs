// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for instrumenting drivers and service loops.
//!
//! A `TraceBuf<T, N>` keeps the most recent `N` trace entries, overwriting
//! the oldest once full. Recording the same value repeatedly collapses into
//! a single entry with a repeat count, so a tight polling loop does not
//! push the interesting history out of the buffer.
//!
//! Unlike a statically-allocated debug ring, a `TraceBuf` is a plain value:
//! the object that wants instrumentation owns one and records into it. This
//! keeps trace state alongside the state it describes, and lets host tests
//! assert on the recorded sequence.

#![cfg_attr(not(test), no_std)]

/// One recorded trace event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Entry<T> {
    pub payload: T,
    /// Number of consecutive times this payload was recorded.
    pub count: u32,
}

#[derive(Clone)]
pub struct TraceBuf<T, const N: usize> {
    entries: [Option<Entry<T>>; N],
    /// Index of the slot the next distinct entry will be written to.
    next: usize,
    /// Total number of `record` calls, including de-duplicated ones.
    total: u32,
}

impl<T, const N: usize> Default for TraceBuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> TraceBuf<T, N> {
    const EMPTY: Option<Entry<T>> = None;

    pub const fn new() -> Self {
        Self {
            entries: [Self::EMPTY; N],
            next: 0,
            total: 0,
        }
    }

    /// Total number of events recorded over the buffer's lifetime.
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl<T: Copy + PartialEq, const N: usize> TraceBuf<T, N> {
    /// Records an event, merging it into the previous entry if the payload
    /// is identical.
    pub fn record(&mut self, payload: T) {
        self.total = self.total.wrapping_add(1);

        let last = self.next.checked_sub(1).unwrap_or(N - 1);
        if let Some(prev) = &mut self.entries[last] {
            if prev.payload == payload {
                prev.count = prev.count.saturating_add(1);
                return;
            }
        }

        self.entries[self.next] = Some(Entry { payload, count: 1 });
        self.next = if self.next + 1 == N { 0 } else { self.next + 1 };
    }

    /// The most recently recorded entry, if any.
    pub fn last(&self) -> Option<&Entry<T>> {
        if self.total == 0 {
            return None;
        }
        let last = self.next.checked_sub(1).unwrap_or(N - 1);
        self.entries[last].as_ref()
    }

    /// Iterates entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &Entry<T>> {
        self.entries[self.next..]
            .iter()
            .chain(self.entries[..self.next].iter())
            .flatten()
    }

    /// True if `payload` appears anywhere in the retained window.
    pub fn contains(&self, payload: T) -> bool {
        self.iter().any(|e| e.payload == payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    enum Trace {
        None,
        Start,
        Tick(u8),
        Stop,
    }

    #[test]
    fn empty() {
        let buf: TraceBuf<Trace, 4> = TraceBuf::new();
        assert!(buf.is_empty());
        assert_eq!(buf.last(), None);
        assert_eq!(buf.iter().count(), 0);
        assert!(!buf.contains(Trace::None));
    }

    #[test]
    fn dedup_consecutive() {
        let mut buf: TraceBuf<Trace, 4> = TraceBuf::new();
        buf.record(Trace::Start);
        buf.record(Trace::Tick(0));
        buf.record(Trace::Tick(0));
        buf.record(Trace::Tick(0));

        assert_eq!(buf.total(), 4);
        assert_eq!(buf.iter().count(), 2);
        assert_eq!(
            buf.last(),
            Some(&Entry {
                payload: Trace::Tick(0),
                count: 3
            })
        );
    }

    #[test]
    fn overwrites_oldest() {
        let mut buf: TraceBuf<Trace, 3> = TraceBuf::new();
        buf.record(Trace::Start);
        for i in 0..3 {
            buf.record(Trace::Tick(i));
        }
        buf.record(Trace::Stop);

        // Start and Tick(0) have fallen off.
        assert!(!buf.contains(Trace::Start));
        assert!(!buf.contains(Trace::Tick(0)));
        assert!(buf.contains(Trace::Tick(1)));
        assert!(buf.contains(Trace::Tick(2)));
        assert_eq!(buf.last().unwrap().payload, Trace::Stop);
    }

    #[test]
    fn distinct_values_interleaved_are_not_merged() {
        let mut buf: TraceBuf<Trace, 8> = TraceBuf::new();
        buf.record(Trace::Tick(1));
        buf.record(Trace::Tick(2));
        buf.record(Trace::Tick(1));
        assert_eq!(buf.iter().count(), 3);
    }
}

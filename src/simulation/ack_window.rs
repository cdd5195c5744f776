//! Windowed bitmap acknowledgment.
//!
//! The gateway keeps one [`AckWindow`] per device. Receipts are buffered by
//! sequence inside `[base, base + width)`; once the span is complete, or the
//! oldest receipt has waited `max_delay`, the window is due and a single
//! [`Bitmap`] acknowledges all of it. A clear bit tells the device to
//! retransmit that sequence.

use std::collections::VecDeque;
use std::time::Duration;

/// One aggregated acknowledgment: bit `i` set means `base + i` was received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitmap {
    pub base: u32,
    pub width: u32,
    pub bits: u64,
}

impl Bitmap {
    pub fn covers(&self, seq: u32) -> bool {
        seq >= self.base && seq - self.base < self.width
    }

    /// `Some(received)` for covered sequences.
    pub fn status(&self, seq: u32) -> Option<bool> {
        self.covers(seq).then(|| self.bits & (1u64 << (seq - self.base)) != 0)
    }

    pub fn received(&self) -> u32 {
        self.bits.count_ones()
    }

    /// Covered sequences whose bit is clear.
    pub fn lost(&self) -> Vec<u32> {
        (0..self.width).filter(|i| self.bits & (1u64 << i) == 0).map(|i| self.base + i).collect()
    }

    /// Wire size of the bit field.
    pub fn byte_len(width: u32) -> usize {
        width.div_ceil(8) as usize
    }
}

#[derive(Debug, Clone)]
pub struct AckWindow {
    width: u32,
    max_delay: Duration,
    base: u32,
    bits: u64,
    highest: Option<u32>,
    opened_at: Option<Duration>,
    /// Earlier windows pushed out by receipts beyond them, oldest first.
    overflow: VecDeque<Bitmap>,
}

impl AckWindow {
    pub fn new(width: u32, base: u32, max_delay: Duration) -> Self {
        Self {
            width: width.clamp(1, 64),
            max_delay,
            base,
            bits: 0,
            highest: None,
            opened_at: None,
            overflow: VecDeque::new(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Receipts buffered in the open window.
    pub fn pending(&self) -> u32 {
        self.bits.count_ones()
    }

    /// Buffer a received sequence. Returns `false` for sequences below the
    /// window, which have already been reported.
    pub fn record(&mut self, seq: u32, now: Duration) -> bool {
        if seq < self.base {
            return false;
        }
        if seq - self.base >= self.width {
            if self.highest.is_some() {
                self.overflow.push_back(self.snapshot());
            }
            self.base = (self.base + self.width).max(seq + 1 - self.width);
            self.bits = 0;
            self.highest = None;
            self.opened_at = None;
        }
        self.bits |= 1u64 << (seq - self.base);
        self.highest = Some(self.highest.map_or(seq, |h| h.max(seq)));
        self.opened_at.get_or_insert(now);
        true
    }

    /// Whether an acknowledgment should go out in the next receive window.
    pub fn due(&self, now: Duration) -> bool {
        if !self.overflow.is_empty() {
            return true;
        }
        match (self.highest, self.opened_at) {
            (Some(highest), Some(opened)) => highest >= self.base + self.width - 1 || now >= opened + self.max_delay,
            _ => false,
        }
    }

    /// The bitmap [`take`](Self::take) would hand out, leaving the window untouched.
    pub fn peek(&self, now: Duration) -> Option<Bitmap> {
        if let Some(bitmap) = self.overflow.front() {
            return Some(*bitmap);
        }
        self.due(now).then(|| self.snapshot())
    }

    /// Hand out the due bitmap and advance the window past it.
    pub fn take(&mut self, now: Duration) -> Option<Bitmap> {
        if let Some(bitmap) = self.overflow.pop_front() {
            return Some(bitmap);
        }
        if !self.due(now) {
            return None;
        }
        let bitmap = self.snapshot();
        self.base = self.highest.map_or(self.base, |h| h + 1);
        self.bits = 0;
        self.highest = None;
        self.opened_at = None;
        Some(bitmap)
    }

    fn snapshot(&self) -> Bitmap {
        Bitmap {
            base: self.base,
            width: self.width,
            bits: self.bits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(4 * 3600);

    fn at(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    #[test]
    fn lost_sequences_leave_clear_bits() {
        let mut window = AckWindow::new(8, 10, LONG);
        for seq in [11, 13, 14, 16] {
            assert!(window.record(seq, at(seq as u64)));
            assert!(!window.due(at(seq as u64)));
        }
        window.record(17, at(17));
        assert!(window.due(at(17)));

        let bitmap = window.take(at(17)).unwrap();
        assert_eq!(bitmap.base, 10);
        assert_eq!(bitmap.bits, 0b1101_1010);
        for bit in [0, 2, 5] {
            assert_eq!(bitmap.status(10 + bit), Some(false));
        }
        for bit in [1, 3, 4, 6, 7] {
            assert_eq!(bitmap.status(10 + bit), Some(true));
        }
        assert_eq!(bitmap.lost(), vec![10, 12, 15]);
        assert_eq!(bitmap.received(), 5);
        assert_eq!(window.base(), 18);
        assert_eq!(window.pending(), 0);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut window = AckWindow::new(4, 0, LONG);
        for seq in 0..4 {
            window.record(seq, at(seq as u64));
        }
        let peeked = window.peek(at(4)).unwrap();
        assert_eq!(window.base(), 0);
        assert_eq!(window.take(at(4)), Some(peeked));
        assert_eq!(window.peek(at(4)), None);
    }

    #[test]
    fn full_window_is_due_immediately() {
        let mut window = AckWindow::new(16, 0, LONG);
        for seq in 0..15 {
            window.record(seq, at(seq as u64 * 600));
        }
        assert!(!window.due(at(9000)));
        window.record(15, at(9000));
        let bitmap = window.take(at(9000)).unwrap();
        assert_eq!(bitmap.received(), 16);
        assert_eq!(window.base(), 16);
    }

    #[test]
    fn aggregation_delay_flushes_partial_window() {
        let mut window = AckWindow::new(16, 100, at(3600));
        window.record(100, at(0));
        window.record(101, at(600));
        assert!(!window.due(at(3599)));
        assert!(window.due(at(3600)));
        let bitmap = window.take(at(3600)).unwrap();
        assert_eq!(bitmap.received(), 2);
        assert_eq!(window.base(), 102);
        assert!(window.take(at(3600)).is_none());
    }

    #[test]
    fn receipt_beyond_window_pushes_previous_out() {
        let mut window = AckWindow::new(4, 0, LONG);
        window.record(0, at(0));
        window.record(1, at(1));
        // 2 and 3 lost, 5 arrives
        window.record(5, at(5));
        assert!(window.due(at(5)));
        let previous = window.take(at(5)).unwrap();
        assert_eq!(previous.base, 0);
        assert_eq!(previous.lost(), vec![2, 3]);
        assert_eq!(window.base(), 4);
        assert_eq!(window.pending(), 1);
        assert!(!window.due(at(5)));
    }

    #[test]
    fn overflows_queue_up_until_taken() {
        let mut window = AckWindow::new(4, 0, LONG);
        window.record(0, at(0));
        window.record(2, at(2));
        window.record(5, at(5));
        // second window pushed out before the first was sent
        window.record(9, at(9));

        let first = window.take(at(9)).unwrap();
        assert_eq!((first.base, first.bits), (0, 0b0101));
        assert!(window.due(at(9)));
        let second = window.peek(at(9)).unwrap();
        assert_eq!(window.take(at(9)), Some(second));
        assert_eq!((second.base, second.bits), (4, 0b0010));
        assert_eq!(window.base(), 8);
        assert_eq!(window.pending(), 1);
        assert!(!window.due(at(9)));
    }

    #[test]
    fn buffer_never_exceeds_width() {
        let mut window = AckWindow::new(8, 0, LONG);
        for seq in 0..100 {
            window.record(seq, at(seq as u64));
            assert!(window.pending() <= 8);
            if window.due(at(seq as u64)) {
                window.take(at(seq as u64));
            }
        }
    }

    #[test]
    fn old_sequences_are_ignored() {
        let mut window = AckWindow::new(8, 20, LONG);
        assert!(!window.record(19, at(0)));
        assert_eq!(window.pending(), 0);
    }

    #[test]
    fn wire_length_rounds_up() {
        assert_eq!(Bitmap::byte_len(8), 1);
        assert_eq!(Bitmap::byte_len(12), 2);
        assert_eq!(Bitmap::byte_len(64), 8);
    }
}

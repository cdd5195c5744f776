//! Rolling-window duty-cycle accounting.
//!
//! A ledger remembers the transmissions of one transmitter (a device, or the
//! gateway's downlink radio) and answers whether a new transmission fits in
//! the budget `duty_cycle × window` for every window that contains it. Since a
//! single transmitter never overlaps itself, the worst window is the one
//! ending when the new transmission ends, so only that window is checked.
//! A transmission that does not fit is never allowed; the caller gets the
//! earliest start at which it would.

use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DutyCycleLedger {
    window: Duration,
    budget: Duration,
    /// `(start, airtime)` of recent transmissions, oldest first.
    history: VecDeque<(Duration, Duration)>,
}

impl DutyCycleLedger {
    /// A duty cycle of 1.0 or more never defers anything.
    pub fn new(duty_cycle: f64, window: Duration) -> Self {
        let budget = if duty_cycle >= 1.0 { Duration::MAX } else { window.mul_f64(duty_cycle.max(0.0)) };
        Self {
            window,
            budget,
            history: VecDeque::new(),
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Airtime booked inside `[window_end - window, window_end]`.
    pub fn consumed(&self, window_end: Duration) -> Duration {
        let window_start = window_end.saturating_sub(self.window);
        self.history
            .iter()
            .map(|&(start, airtime)| overlap(start, start + airtime, window_start, window_end))
            .sum()
    }

    /// `Ok` if a transmission of `airtime` may start at `start`, otherwise the
    /// earliest start that keeps every window within budget.
    pub fn check(&self, start: Duration, airtime: Duration) -> Result<(), Duration> {
        if self.budget == Duration::MAX {
            return Ok(());
        }
        if airtime > self.budget {
            // Can never fit; caller validated frame sizes, so this only guards misuse.
            return Err(start + self.window);
        }
        if self.consumed(start + airtime) + airtime <= self.budget {
            return Ok(());
        }

        let allowed = self.budget - airtime;
        let mut cumulative = Duration::ZERO;
        let mut latest_end = start;
        for &(tx_start, tx_airtime) in self.history.iter().rev() {
            let tx_end = tx_start + tx_airtime;
            latest_end = latest_end.max(tx_end);
            if cumulative + tx_airtime > allowed {
                // Window must start late enough that only `allowed - cumulative` of this entry remains inside.
                let window_start = tx_end - (allowed - cumulative);
                let earliest = window_start + self.window - airtime;
                return Err(earliest.max(latest_end).max(start));
            }
            cumulative += tx_airtime;
        }
        Err(latest_end.max(start))
    }

    /// Book a transmission without checking it.
    pub fn record(&mut self, start: Duration, airtime: Duration) {
        let horizon = (start + airtime).saturating_sub(self.window);
        while let Some(&(s, a)) = self.history.front() {
            if s + a <= horizon {
                self.history.pop_front();
            } else {
                break;
            }
        }
        self.history.push_back((start, airtime));
    }

    /// Check and, when allowed, book.
    pub fn try_reserve(&mut self, start: Duration, airtime: Duration) -> Result<(), Duration> {
        self.check(start, airtime)?;
        self.record(start, airtime);
        Ok(())
    }
}

fn overlap(a_start: Duration, a_end: Duration, b_start: Duration, b_end: Duration) -> Duration {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    end.saturating_sub(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn budget_is_fraction_of_window() {
        let ledger = DutyCycleLedger::new(0.01, Duration::from_secs(3600));
        assert_eq!(ledger.budget(), Duration::from_secs(36));
    }

    #[test]
    fn transmissions_within_budget_are_allowed() {
        let mut ledger = DutyCycleLedger::new(0.1, ms(1000));
        assert!(ledger.try_reserve(ms(0), ms(50)).is_ok());
        assert!(ledger.try_reserve(ms(100), ms(50)).is_ok());
        assert_eq!(ledger.consumed(ms(150)), ms(100));
    }

    #[test]
    fn exceeding_transmission_is_deferred_to_exact_legal_start() {
        // 100 ms budget per 1 s window
        let mut ledger = DutyCycleLedger::new(0.1, ms(1000));
        ledger.record(ms(0), ms(100));
        let next = ledger.check(ms(200), ms(40)).unwrap_err();
        // the window ending at next + 40 may only hold 60 ms of the first frame: starts at 40 ms
        assert_eq!(next, ms(1000));
        assert!(ledger.check(next, ms(40)).is_ok());
        assert!(ledger.check(next - ms(1), ms(40)).is_err());
    }

    #[test]
    fn deferral_accounts_for_multiple_frames() {
        let mut ledger = DutyCycleLedger::new(0.1, ms(1000));
        ledger.record(ms(0), ms(30));
        ledger.record(ms(100), ms(30));
        ledger.record(ms(200), ms(30));
        let next = ledger.check(ms(300), ms(30)).unwrap_err();
        assert!(ledger.check(next, ms(30)).is_ok());
        assert!(ledger.consumed(next + ms(30)) + ms(30) <= ledger.budget());
    }

    #[test]
    fn unlimited_ledger_never_defers() {
        let mut ledger = DutyCycleLedger::new(1.0, Duration::from_secs(3600));
        for i in 0..100 {
            assert!(ledger.try_reserve(ms(i * 10), ms(10)).is_ok());
        }
    }

    #[test]
    fn old_entries_are_pruned() {
        let mut ledger = DutyCycleLedger::new(0.5, ms(100));
        ledger.record(ms(0), ms(10));
        ledger.record(ms(500), ms(10));
        assert_eq!(ledger.history.len(), 1);
    }

    proptest! {
        #[test]
        fn rolling_window_never_exceeds_budget(
            frames in proptest::collection::vec((0u64..5_000, 1u64..400), 1..80),
            duty_permille in 5u64..300,
        ) {
            let window = ms(10_000);
            let mut ledger = DutyCycleLedger::new(duty_permille as f64 / 1000.0, window);
            let budget = ledger.budget();
            let mut booked: Vec<(Duration, Duration)> = Vec::new();
            let mut clock = Duration::ZERO;

            for (gap, airtime) in frames {
                let airtime = ms(airtime).min(budget);
                let mut start = clock + ms(gap);
                if let Err(next) = ledger.check(start, airtime) {
                    prop_assert!(next >= start);
                    start = next;
                }
                prop_assert!(ledger.try_reserve(start, airtime).is_ok());
                booked.push((start, airtime));
                clock = start + airtime;
            }

            for &(start, airtime) in &booked {
                let end = start + airtime;
                let window_start = end.saturating_sub(window);
                let used: Duration = booked
                    .iter()
                    .map(|&(s, a)| overlap(s, s + a, window_start, end))
                    .sum();
                prop_assert!(used <= budget, "window ending at {:?} used {:?} of {:?}", end, used, budget);
            }
        }
    }
}

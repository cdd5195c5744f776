//! Discrete-event scheduler.
//!
//! A time-ordered queue of events keyed by `(time, insertion sequence)`. The
//! sequence breaks ties between events scheduled for the same instant, so a
//! run is fully deterministic for a fixed seed. Simulated time only moves when
//! an event is popped; nothing here ever sleeps.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use crate::error::SimError;

/// Ordering key of a queued event.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct EventKey {
    /// When the event fires.
    pub time: Duration,
    /// Insertion order, FIFO among events with the same time.
    pub sequence: u64,
}

impl Ord for EventKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.cmp(&other.time) {
            Ordering::Equal => self.sequence.cmp(&other.sequence),
            ord => ord,
        }
    }
}

impl PartialOrd for EventKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Scheduler<E> {
    queue: BTreeMap<EventKey, E>,
    sequence: u64,
    now: Duration,
    dispatched: u64,
}

impl<E: Debug> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Debug> Scheduler<E> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            sequence: 0,
            now: Duration::ZERO,
            dispatched: 0,
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of events dispatched so far.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Queue `event` at the absolute time `at`.
    ///
    /// Scheduling into the past is an invariant violation and is reported as
    /// [`SimError::ScheduleInPast`].
    pub fn schedule(&mut self, event: E, at: Duration) -> Result<EventKey, SimError> {
        if at < self.now {
            return Err(SimError::ScheduleInPast {
                event: format!("{event:?}"),
                at,
                now: self.now,
            });
        }
        let key = EventKey {
            time: at,
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.queue.insert(key, event);
        Ok(key)
    }

    /// Queue `event` `delay` after the current time.
    pub fn schedule_in(&mut self, event: E, delay: Duration) -> EventKey {
        let key = EventKey {
            time: self.now + delay,
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.queue.insert(key, event);
        key
    }

    pub fn cancel(&mut self, key: &EventKey) -> Option<E> {
        self.queue.remove(key)
    }

    /// Time of the earliest queued event.
    pub fn peek_time(&self) -> Option<Duration> {
        self.queue.first_key_value().map(|(key, _)| key.time)
    }

    /// Pop the earliest event if it fires no later than `end`, advancing the
    /// clock to its timestamp.
    pub fn pop_until(&mut self, end: Duration) -> Option<(Duration, E)> {
        let next = self.peek_time()?;
        if next > end {
            return None;
        }
        let (key, event) = self.queue.pop_first()?;
        self.now = key.time;
        self.dispatched += 1;
        Some((key.time, event))
    }

    /// Dispatch events in order until the queue drains or the next event lies
    /// beyond `end`. The clock reads `end` afterwards.
    ///
    /// The handler receives the scheduler itself so that it can queue follow-up
    /// events; any error it returns aborts the loop.
    pub fn run_until<F>(&mut self, end: Duration, mut dispatch: F) -> Result<u64, SimError>
    where
        F: FnMut(&mut Self, E) -> Result<(), SimError>,
    {
        let start = self.dispatched;
        while let Some((_, event)) = self.pop_until(end) {
            dispatch(self, event)?;
        }
        if self.now < end {
            self.now = end;
        }
        Ok(self.dispatched - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        At(u64),
        Spawn(u64),
    }

    #[test]
    fn event_key_orders_by_time_then_sequence() {
        let earlier = EventKey {
            time: Duration::from_secs(1),
            sequence: 5,
        };
        let later = EventKey {
            time: Duration::from_secs(2),
            sequence: 1,
        };
        let tie = EventKey {
            time: Duration::from_secs(1),
            sequence: 6,
        };
        assert!(earlier < later);
        assert!(earlier < tie);
    }

    #[test]
    fn equal_timestamps_dispatch_in_insertion_order() {
        let mut scheduler = Scheduler::new();
        for i in 0..5 {
            scheduler.schedule(Ping::At(i), Duration::from_secs(3)).unwrap();
        }
        let mut seen = Vec::new();
        scheduler
            .run_until(Duration::from_secs(10), |_, event| {
                seen.push(event);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, (0..5).map(Ping::At).collect::<Vec<_>>());
    }

    #[test]
    fn scheduling_in_the_past_is_rejected() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(Ping::At(0), Duration::from_secs(5)).unwrap();
        scheduler.pop_until(Duration::from_secs(10)).unwrap();
        let err = scheduler.schedule(Ping::At(1), Duration::from_secs(4)).unwrap_err();
        assert!(matches!(err, SimError::ScheduleInPast { .. }));
        assert!(err.to_string().contains("At(1)"));
    }

    #[test]
    fn time_never_decreases_across_dispatch() {
        let mut scheduler = Scheduler::new();
        for t in [7u64, 1, 4, 4, 9, 2] {
            scheduler.schedule(Ping::At(t), Duration::from_millis(t)).unwrap();
        }
        scheduler.schedule(Ping::Spawn(3), Duration::from_millis(3)).unwrap();

        let mut last = Duration::ZERO;
        let mut count = 0;
        scheduler
            .run_until(Duration::from_millis(100), |sched, event| {
                assert!(sched.now() >= last, "clock went backwards");
                if let Ping::At(t) | Ping::Spawn(t) = event {
                    assert_eq!(sched.now(), Duration::from_millis(t));
                }
                if let Ping::Spawn(_) = event {
                    sched.schedule_in(Ping::At(3), Duration::ZERO);
                    sched.schedule_in(Ping::At(8), Duration::from_millis(5));
                }
                last = sched.now();
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 9);
        assert_eq!(scheduler.now(), Duration::from_millis(100));
    }

    #[test]
    fn run_until_stops_at_end_and_leaves_later_events() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(Ping::At(1), Duration::from_secs(1)).unwrap();
        scheduler.schedule(Ping::At(2), Duration::from_secs(2)).unwrap();
        scheduler.schedule(Ping::At(5), Duration::from_secs(5)).unwrap();
        let n = scheduler.run_until(Duration::from_secs(2), |_, _| Ok(())).unwrap();
        assert_eq!(n, 2);
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.now(), Duration::from_secs(2));
    }

    #[test]
    fn cancelled_events_never_fire() {
        let mut scheduler = Scheduler::new();
        let key = scheduler.schedule(Ping::At(1), Duration::from_secs(1)).unwrap();
        scheduler.schedule(Ping::At(2), Duration::from_secs(2)).unwrap();
        assert_eq!(scheduler.cancel(&key), Some(Ping::At(1)));
        let mut seen = Vec::new();
        scheduler
            .run_until(Duration::from_secs(3), |_, e| {
                seen.push(e);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![Ping::At(2)]);
    }

    #[test]
    fn dispatch_error_aborts_the_loop() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule(Ping::At(1), Duration::from_secs(1)).unwrap();
        scheduler.schedule(Ping::At(2), Duration::from_secs(2)).unwrap();
        let result = scheduler.run_until(Duration::from_secs(3), |_, _| {
            Err(SimError::invariant("device 0", Duration::from_secs(1), "boom"))
        });
        assert!(result.is_err());
        assert_eq!(scheduler.len(), 1);
    }
}

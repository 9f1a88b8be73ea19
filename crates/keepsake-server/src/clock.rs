//! Commit clock for the version store.
//!
//! Every accepted mutation takes a stamp from the clock while it holds the
//! per-id slot lock. Stamps are strictly increasing even when the wall clock
//! stalls or steps backwards.

use std::collections::BTreeSet;

use keepsake_core::models::Timestamp;
use keepsake_core::util::now_millis;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct CommitClock {
    state: Mutex<ClockState>,
}

#[derive(Debug, Default)]
struct ClockState {
    last: Timestamp,
    in_flight: BTreeSet<Timestamp>,
}

/// A stamp reserved for one mutation; released when dropped.
#[derive(Debug)]
pub struct CommitTicket<'a> {
    clock: &'a CommitClock,
    stamp: Timestamp,
}

impl CommitTicket<'_> {
    pub const fn stamp(&self) -> Timestamp {
        self.stamp
    }
}

impl Drop for CommitTicket<'_> {
    fn drop(&mut self) {
        self.clock.state.lock().in_flight.remove(&self.stamp);
    }
}

impl CommitClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next stamp: `max(now, last + 1)`.
    pub fn begin(&self) -> CommitTicket<'_> {
        self.begin_at(now_millis())
    }

    fn begin_at(&self, now: Timestamp) -> CommitTicket<'_> {
        let mut state = self.state.lock();
        let stamp = now.max(state.last.saturating_add(1));
        state.last = stamp;
        state.in_flight.insert(stamp);
        CommitTicket { clock: self, stamp }
    }

    /// Highest stamp below which every commit has finished.
    ///
    /// A feed served up to this value never misses a mutation that lands later
    /// with a smaller stamp.
    pub fn snapshot(&self) -> Timestamp {
        let state = self.state.lock();
        state
            .in_flight
            .first()
            .map_or(state.last, |oldest| oldest - 1)
    }

    /// Last stamp handed out.
    pub fn last(&self) -> Timestamp {
        self.state.lock().last
    }
}

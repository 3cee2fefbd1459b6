// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Offset estimation between local and authoritative (broker) time.
//!
//! `Clock` is a pure state machine: it has no timer of its own and sends no
//! probes. The transport that owns a socket is responsible for the ~2s
//! `get_time` probe loop (see `relay-transport-ws`); it feeds round trips
//! into this type via [`Clock::record_round_trip`].

use crate::error::EngineError;

/// Estimated offset between local and broker time, built from repeated
/// round-trip samples.
///
/// Only the sample with the lowest observed RTT is used to set the offset,
/// on the assumption that a faster round trip bounds clock skew more
/// tightly. `last_ping` always reflects the most recent sample regardless
/// of whether it improved the offset.
#[derive(Debug, Default)]
pub struct Clock {
    lowest_ping: Option<i64>,
    last_ping: Option<i64>,
    offset: Option<i64>,
    on_sync: Vec<Box<dyn FnOnce() + Send>>,
}

impl Clock {
    /// Creates an unsynced clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once at least one round trip has been recorded.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.offset.is_some()
    }

    /// Queues a one-shot callback to run after the clock syncs.
    ///
    /// Does not invoke anything itself, even if already synced — callers
    /// must check [`Clock::is_synced`] first and fire the callback
    /// themselves outside of any lock guarding this clock, to avoid
    /// re-entrant deadlocks when the callback goes on to call back into the
    /// owning transport. See [`Clock::drain_on_sync`].
    pub fn queue_on_sync(&mut self, cb: Box<dyn FnOnce() + Send>) {
        self.on_sync.push(cb);
    }

    /// Drains and returns all queued one-shot callbacks.
    ///
    /// Callers should only do this once [`Clock::is_synced`] is true, and
    /// must invoke the returned callbacks after releasing any lock that
    /// guards this clock.
    pub fn drain_on_sync(&mut self) -> Vec<Box<dyn FnOnce() + Send>> {
        std::mem::take(&mut self.on_sync)
    }

    /// Records one `get_time` round trip: probe sent at `sent_at_ms`
    /// (local clock), reply received at `recv_at_ms` (local clock) carrying
    /// broker time `server_time_ms`.
    ///
    /// Returns `true` exactly once: when this call is the first to
    /// establish sync. Callers should treat that transition as the signal
    /// to drain and fire queued one-shot callbacks.
    pub fn record_round_trip(&mut self, sent_at_ms: i64, recv_at_ms: i64, server_time_ms: i64) -> bool {
        let rtt = recv_at_ms - sent_at_ms;
        let was_synced = self.is_synced();

        if self.lowest_ping.is_none_or(|lowest| rtt < lowest) {
            let mid = (sent_at_ms + recv_at_ms) / 2;
            self.offset = Some(server_time_ms - mid);
            self.lowest_ping = Some(rtt);
        }
        self.last_ping = Some(rtt);

        !was_synced && self.is_synced()
    }

    /// Estimated broker time for the given local clock reading.
    ///
    /// # Errors
    /// Returns [`EngineError::NotSynced`] if no round trip has completed yet.
    pub fn server_time(&self, local_now_ms: i64) -> Result<i64, EngineError> {
        self.offset
            .map(|offset| local_now_ms + offset)
            .ok_or(EngineError::NotSynced)
    }

    /// Most recent round-trip time in ms, or `None` if no round trip has
    /// ever completed (the `+∞` case in the specification).
    #[must_use]
    pub fn ping(&self) -> Option<i64> {
        self.last_ping
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsynced_clock_rejects_server_time() {
        let clock = Clock::new();
        assert_eq!(clock.server_time(1_000), Err(EngineError::NotSynced));
        assert_eq!(clock.ping(), None);
    }

    #[test]
    fn first_round_trip_syncs_and_reports_transition_once() {
        let mut clock = Clock::new();
        assert!(clock.record_round_trip(1_000, 1_100, 5_000));
        assert!(clock.is_synced());
        // second round trip with a worse ping does not re-fire the transition
        assert!(!clock.record_round_trip(2_000, 2_300, 6_000));
    }

    #[test]
    fn offset_updates_only_on_lower_rtt() {
        let mut clock = Clock::new();
        // rtt = 100, mid = 1050, offset = 5000 - 1050 = 3950
        clock.record_round_trip(1_000, 1_100, 5_000);
        assert_eq!(clock.server_time(0), Ok(3_950));

        // worse rtt (200): offset must not move even though server time differs
        clock.record_round_trip(2_000, 2_200, 99_999);
        assert_eq!(clock.server_time(0), Ok(3_950));
        assert_eq!(clock.ping(), Some(200));

        // better rtt (50): offset updates
        clock.record_round_trip(3_000, 3_050, 10_000);
        // mid = 3025, offset = 10000-3025=6975
        assert_eq!(clock.server_time(0), Ok(6_975));
        assert_eq!(clock.ping(), Some(50));
    }

    #[test]
    fn on_sync_callbacks_are_queued_not_auto_invoked() {
        let mut clock = Clock::new();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        clock.queue_on_sync(Box::new(move || {
            fired2.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        // syncing does not itself invoke queued callbacks; the caller must
        // drain and fire them explicitly outside of any lock.
        assert!(clock.record_round_trip(0, 0, 0));
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));

        let queued = clock.drain_on_sync();
        assert_eq!(queued.len(), 1);
        for cb in queued {
            cb();
        }
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(clock.drain_on_sync().is_empty());
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fixed-stride, fixed-capacity checkpoint cache.
//!
//! Bounds the cost of `state_at(tick)` queries to O(stride) by retaining a
//! sliding window of full replays at evenly spaced ticks, instead of either
//! keeping every tick's state (unbounded memory) or replaying from
//! `initial_tick` on every query (unbounded latency as the timeline grows).

use std::sync::Arc;

/// Reports that [`SnapshotCache::ensure_through`] dropped the oldest
/// snapshots to stay within `snapshot_count`, sliding the window forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneEvent {
    /// New window start tick after the slide.
    pub new_start_tick: i64,
    /// How many snapshots were dropped.
    pub dropped: usize,
}

/// A bounded, evenly-spaced sequence of `(tick, state)` checkpoints.
///
/// Snapshot ticks are always `start_tick + k * stride` for `k` in
/// `[0, len())`; the struct never stores a checkpoint at any other tick.
pub struct SnapshotCache<S> {
    stride: i64,
    capacity: usize,
    start_tick: i64,
    entries: Vec<(i64, Arc<S>)>,
}

impl<S> SnapshotCache<S> {
    /// Creates an empty cache windowed at `start_tick`.
    ///
    /// # Panics
    /// Panics if `stride < 1` or `capacity < 1` (per the configuration
    /// invariant; both are fixed at `Engine` construction, never user
    /// input at runtime).
    #[must_use]
    pub fn new(start_tick: i64, stride: u32, capacity: usize) -> Self {
        assert!(stride >= 1, "stride must be >= 1");
        assert!(capacity >= 1, "snapshot_count must be >= 1");
        Self {
            stride: i64::from(stride),
            capacity,
            start_tick,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Current window start tick.
    #[must_use]
    pub fn start_tick(&self) -> i64 {
        self.start_tick
    }

    /// Configured spacing between adjacent snapshot ticks.
    #[must_use]
    pub fn stride(&self) -> i64 {
        self.stride
    }

    /// Number of snapshots currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no snapshot is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tick of the most recently retained snapshot, if any.
    #[must_use]
    pub fn last_tick(&self) -> Option<i64> {
        self.entries.last().map(|(t, _)| *t)
    }

    /// Seeds the cache with a single checkpoint at `start_tick`, replacing
    /// any existing contents.
    ///
    /// Used once, when `initial_tick` is first established — at that point
    /// there is nothing to invalidate, only a first entry to plant.
    pub fn seed(&mut self, tick: i64, state: Arc<S>) {
        self.start_tick = tick;
        self.entries.clear();
        self.entries.push((tick, state));
    }

    /// Greatest stored snapshot with tick `<= at_tick`, if any.
    #[must_use]
    pub fn nearest_at_or_before(&self, at_tick: i64) -> Option<(i64, Arc<S>)> {
        self.entries
            .iter()
            .rev()
            .find(|(t, _)| *t <= at_tick)
            .map(|(t, s)| (*t, Arc::clone(s)))
    }

    /// Deletes every snapshot whose tick is `>= tick`.
    ///
    /// If `tick <= start_tick` every snapshot is cleared (the whole window
    /// is now suspect). If `tick` is past the last retained snapshot this
    /// is a no-op.
    pub fn invalidate_from(&mut self, tick: i64) {
        if tick <= self.start_tick {
            self.entries.clear();
            return;
        }
        self.entries.retain(|(t, _)| *t < tick);
    }

    /// Ensures snapshots exist at every `stride` multiple from `start_tick`
    /// up to the greatest such tick `<= at_tick`, producing missing ones via
    /// `advance_fn(prev_state, prev_tick, next_tick)`.
    ///
    /// `advance_fn` is expected to replay `(prev_tick, next_tick]` (calling
    /// `on_tick`/`on_post` for each intervening tick) and return the
    /// resulting state. If the cache is empty this does nothing: the first
    /// snapshot can only be planted by [`SnapshotCache::seed`], since there
    /// is no `prev_state` to advance from before `initial_tick` exists.
    ///
    /// Returns a [`PruneEvent`] if producing new snapshots pushed the
    /// window past `capacity`, requiring the oldest entries to be dropped
    /// and `start_tick` advanced.
    pub fn ensure_through(
        &mut self,
        at_tick: i64,
        mut advance_fn: impl FnMut(&Arc<S>, i64, i64) -> S,
    ) -> Option<PruneEvent> {
        let Some(&(mut prev_tick, ref last)) = self.entries.last() else {
            return None;
        };
        let mut prev_state = Arc::clone(last);

        if at_tick < prev_tick {
            return None;
        }

        let target = prev_tick + ((at_tick - prev_tick) / self.stride) * self.stride;
        while prev_tick < target {
            let next_tick = prev_tick + self.stride;
            let next_state = Arc::new(advance_fn(&prev_state, prev_tick, next_tick));
            self.entries.push((next_tick, Arc::clone(&next_state)));
            prev_state = next_state;
            prev_tick = next_tick;
        }

        self.slide_if_over_capacity()
    }

    fn slide_if_over_capacity(&mut self) -> Option<PruneEvent> {
        if self.entries.len() <= self.capacity {
            return None;
        }
        let dropped = self.entries.len() - self.capacity;
        self.entries.drain(0..dropped);
        self.start_tick = self.entries.first().map_or(self.start_tick, |(t, _)| *t);
        Some(PruneEvent {
            new_start_tick: self.start_tick,
            dropped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Counter(i64);

    fn advance(prev: &Arc<Counter>, _prev_tick: i64, next_tick: i64) -> Counter {
        Counter(prev.0 + (next_tick))
    }

    #[test]
    fn seed_plants_a_single_checkpoint() {
        let mut cache: SnapshotCache<Counter> = SnapshotCache::new(0, 8, 4);
        cache.seed(10, Arc::new(Counter(0)));
        assert_eq!(cache.start_tick(), 10);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.nearest_at_or_before(10).unwrap().0, 10);
        assert!(cache.nearest_at_or_before(9).is_none());
    }

    #[test]
    fn ensure_through_fills_strides_and_reports_no_prune_under_capacity() {
        let mut cache: SnapshotCache<Counter> = SnapshotCache::new(0, 8, 4);
        cache.seed(0, Arc::new(Counter(0)));
        let pruned = cache.ensure_through(20, advance);
        assert!(pruned.is_none());
        assert_eq!(cache.last_tick(), Some(16));
        assert_eq!(cache.len(), 3); // ticks 0, 8, 16
    }

    #[test]
    fn window_slides_and_prunes_when_capacity_exceeded() {
        let mut cache: SnapshotCache<Counter> = SnapshotCache::new(0, 8, 4);
        cache.seed(0, Arc::new(Counter(0)));
        // window=32 (stride 8 * count 4); running to 200 requires many strides
        let mut last_prune = None;
        for target in (8..=200).step_by(8) {
            if let Some(p) = cache.ensure_through(target, advance) {
                last_prune = Some(p);
            }
        }
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.start_tick(), 168);
        assert!(last_prune.is_some());
    }

    #[test]
    fn invalidate_from_at_or_before_start_clears_everything() {
        let mut cache: SnapshotCache<Counter> = SnapshotCache::new(0, 8, 4);
        cache.seed(0, Arc::new(Counter(0)));
        cache.ensure_through(24, advance);
        assert_eq!(cache.len(), 4);
        cache.invalidate_from(0);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_from_mid_window_keeps_earlier_snapshots() {
        let mut cache: SnapshotCache<Counter> = SnapshotCache::new(0, 8, 4);
        cache.seed(0, Arc::new(Counter(0)));
        cache.ensure_through(24, advance); // ticks 0, 8, 16, 24
        cache.invalidate_from(16);
        assert_eq!(cache.last_tick(), Some(8));
    }

    #[test]
    fn invalidate_from_past_last_snapshot_is_a_no_op() {
        let mut cache: SnapshotCache<Counter> = SnapshotCache::new(0, 8, 4);
        cache.seed(0, Arc::new(Counter(0)));
        cache.ensure_through(16, advance);
        let len_before = cache.len();
        cache.invalidate_from(1_000);
        assert_eq!(cache.len(), len_before);
    }

    #[test]
    fn nearest_at_or_before_picks_greatest_tick_not_exceeding_query() {
        let mut cache: SnapshotCache<Counter> = SnapshotCache::new(0, 8, 4);
        cache.seed(0, Arc::new(Counter(0)));
        cache.ensure_through(24, advance);
        let (tick, _) = cache.nearest_at_or_before(23).unwrap();
        assert_eq!(tick, 16);
    }

    #[test]
    fn identical_states_share_the_same_allocation() {
        let mut cache: SnapshotCache<Counter> = SnapshotCache::new(0, 8, 4);
        let seeded = Arc::new(Counter(0));
        cache.seed(0, Arc::clone(&seeded));
        let (_, got) = cache.nearest_at_or_before(0).unwrap();
        assert!(Arc::ptr_eq(&seeded, &got));
    }
}

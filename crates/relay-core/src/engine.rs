// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Orchestrates Clock, Transport, Timeline and SnapshotCache into the
//! public replicated-state engine.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use relay_proto::Post;
use tracing::{debug, trace, warn};

use crate::error::EngineError;
use crate::snapshot::SnapshotCache;
use crate::timeline::{AddLocalOutcome, AddRemoteOutcome, LocalPost, Tick, Timeline};
use crate::transport::SharedTransport;

/// Engine lifecycle state, readable without locking the inner state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
    /// No transport activity observed yet.
    Unsynced = 0,
    /// Transport is open but the clock has not completed its first round
    /// trip.
    Syncing = 1,
    /// Clock synced; `post` is now permitted.
    Synced = 2,
}

impl SyncState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unsynced,
            1 => Self::Syncing,
            _ => Self::Synced,
        }
    }
}

/// One tick's replay inputs, handed to `on_tick`/`on_post` by the host.
pub struct TickInputs<'a> {
    /// The tick being advanced to.
    pub tick: Tick,
    /// Remote posts at this tick, ascending by index.
    pub remote: &'a [Post],
    /// Local (optimistic) posts at this tick, insertion order.
    pub local: &'a [LocalPost],
}

/// User-supplied pure state transition: advance `prev` by one tick, then
/// fold in this tick's posts in canonical order.
pub trait StateFns<S> {
    /// Advances `prev` to the start of a new tick, before any posts apply.
    fn on_tick(&self, prev: &S, tick: Tick) -> S;
    /// Applies one post's effect onto `state`.
    fn on_post(&self, state: &S, post_name: &str, post_data: &serde_json::Value) -> S;
    /// Blends a lagged authoritative state with a predicted current one
    /// for rendering.
    fn smooth(&self, remote_state: &S, local_state: &S) -> S;
}

struct Shared<S> {
    timeline: Timeline,
    cache: SnapshotCache<S>,
    init: Arc<S>,
}

/// The client-side replicated state engine for one room.
pub struct Engine<S, F: StateFns<S>> {
    room: String,
    tick_rate: u32,
    tolerance: i64,
    cache_enabled: bool,
    fns: F,
    transport: SharedTransport,
    state: Mutex<Shared<S>>,
    sync_state: AtomicU8,
}

impl<S, F> Engine<S, F>
where
    S: 'static + Send + Sync,
    F: StateFns<S> + Send + Sync + 'static,
{
    /// Creates an Engine for `room`, wires the sync bootstrap (watch +
    /// `load(room, 0)` once the transport's clock syncs), and returns it
    /// wrapped in an `Arc` since the bootstrap closure needs to hold a
    /// reference back into the Engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        room: impl Into<String>,
        init: S,
        fns: F,
        tick_rate: u32,
        tolerance: i64,
        cache_enabled: bool,
        snapshot_stride: u32,
        snapshot_count: usize,
        transport: SharedTransport,
    ) -> Arc<Self> {
        let room = room.into();
        let engine = Arc::new(Self {
            room: room.clone(),
            tick_rate,
            tolerance,
            cache_enabled,
            fns,
            transport,
            state: Mutex::new(Shared {
                timeline: Timeline::new(tick_rate, tolerance),
                cache: SnapshotCache::new(0, snapshot_stride, snapshot_count),
                init: Arc::new(init),
            }),
            sync_state: AtomicU8::new(SyncState::Unsynced as u8),
        });

        engine.sync_state.store(SyncState::Syncing as u8, Ordering::SeqCst);

        let bootstrap_engine = Arc::clone(&engine);
        engine.transport.on_sync(Box::new(move || {
            bootstrap_engine
                .sync_state
                .store(SyncState::Synced as u8, Ordering::SeqCst);

            let handler_engine = Arc::clone(&bootstrap_engine);
            let watch_result = bootstrap_engine.transport.watch(
                &bootstrap_engine.room,
                Arc::new(move |post: Post| {
                    handler_engine.handle_incoming(post);
                }),
            );
            if let Err(e) = watch_result {
                warn!(room = %bootstrap_engine.room, error = %e, "failed to register watch handler");
                return;
            }
            bootstrap_engine.transport.load(&bootstrap_engine.room, 0);
        }));

        engine
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        SyncState::from_u8(self.sync_state.load(Ordering::SeqCst))
    }

    fn handle_incoming(&self, post: Post) {
        let mut guard = self.state.lock().unwrap();
        if guard.timeline.has_local(&post.name) {
            guard.timeline.remove_local_post(&post.name);
        }
        let start_tick = if self.cache_enabled {
            Some(guard.cache.start_tick())
        } else {
            None
        };
        let outcome = guard.timeline.add_remote_post(post.clone(), start_tick);
        match outcome {
            AddRemoteOutcome::Duplicate => {
                trace!(room = %self.room, index = post.index, "duplicate remote post ignored");
            }
            AddRemoteOutcome::BeforeWindow => {
                warn!(room = %self.room, index = post.index, "remote post before snapshot window dropped");
            }
            AddRemoteOutcome::Inserted { tick, initial_just_set } => {
                if initial_just_set {
                    let init = Arc::clone(&guard.init);
                    guard.cache.seed(tick, init);
                    debug!(room = %self.room, tick, "initial tick established, cache seeded");
                } else {
                    guard.cache.invalidate_from(tick);
                    trace!(room = %self.room, tick, "snapshot cache invalidated from tick");
                }
            }
        }
    }

    /// State at a specific tick, replaying from the nearest usable
    /// snapshot (or from `initial_tick` if the cache is disabled).
    #[must_use]
    pub fn compute_state_at(&self, at_tick: Tick) -> Arc<S> {
        let mut guard = self.state.lock().unwrap();
        let Some((_, initial_tick)) = guard.timeline.initial() else {
            return Arc::clone(&guard.init);
        };
        if at_tick < initial_tick {
            return Arc::clone(&guard.init);
        }

        if !self.cache_enabled {
            return self.full_replay(&guard.timeline, &guard.init, initial_tick, at_tick);
        }

        if guard.cache.is_empty() {
            let init = Arc::clone(&guard.init);
            guard.cache.seed(initial_tick, init);
        }

        let clamped = at_tick.max(guard.cache.start_tick());
        if let Some(prune) = self.ensure_through_locked(&mut guard, clamped) {
            debug!(
                room = %self.room,
                new_start_tick = prune.new_start_tick,
                dropped = prune.dropped,
                "snapshot window slid forward"
            );
            guard.timeline.prune_before(prune.new_start_tick);
        }

        if at_tick < guard.cache.start_tick() {
            // Requested tick is older than the window: best available
            // authoritative state is the window's own start snapshot.
            let (_, state) = guard
                .cache
                .nearest_at_or_before(guard.cache.start_tick())
                .expect("cache seeded above");
            return state;
        }

        let (snap_tick, snap_state) = guard
            .cache
            .nearest_at_or_before(at_tick)
            .expect("cache seeded above");
        self.replay_range(&guard.timeline, &snap_state, snap_tick, at_tick)
    }

    fn ensure_through_locked(
        &self,
        guard: &mut Shared<S>,
        at_tick: Tick,
    ) -> Option<crate::snapshot::PruneEvent> {
        let fns = &self.fns;
        let timeline = &guard.timeline;
        guard.cache.ensure_through(at_tick, |prev, prev_tick, next_tick| {
            Self::replay_one_tick(fns, timeline, prev, prev_tick, next_tick)
        })
    }

    fn replay_one_tick(fns: &F, timeline: &Timeline, prev: &Arc<S>, prev_tick: Tick, next_tick: Tick) -> S {
        debug_assert!(next_tick > prev_tick);
        let mut state = prev.as_ref();
        let mut owned;
        let mut tick = prev_tick;
        loop {
            tick += 1;
            owned = fns.on_tick(state, tick);
            state = &owned;
            if let Some(bucket) = timeline.bucket(tick) {
                for post in &bucket.remote {
                    owned = fns.on_post(state, &post.name, &post.data);
                    state = &owned;
                }
                for post in &bucket.local {
                    owned = fns.on_post(state, &post.name, &post.data);
                    state = &owned;
                }
            }
            if tick == next_tick {
                break;
            }
        }
        owned
    }

    fn replay_range(&self, timeline: &Timeline, from_state: &Arc<S>, from_tick: Tick, to_tick: Tick) -> Arc<S> {
        if to_tick <= from_tick {
            return Arc::clone(from_state);
        }
        Arc::new(Self::replay_one_tick(&self.fns, timeline, from_state, from_tick, to_tick))
    }

    fn full_replay(&self, timeline: &Timeline, init: &Arc<S>, initial_tick: Tick, at_tick: Tick) -> Arc<S> {
        if at_tick <= initial_tick {
            return Arc::clone(init);
        }
        Arc::new(Self::replay_one_tick(&self.fns, timeline, init, initial_tick, at_tick))
    }

    /// Alias matching the language-neutral API's `compute_current_state`:
    /// the state at the current server tick (no render-lag blending).
    #[must_use]
    pub fn compute_current_state(&self, now_ms: i64) -> Result<Arc<S>, EngineError> {
        let tick = self.server_tick(now_ms)?;
        Ok(self.compute_state_at(tick))
    }

    /// Blends a lagged authoritative state with the predicted current
    /// state for rendering, per the `remote_lag` formula.
    ///
    /// # Errors
    /// Returns [`EngineError::NotSynced`] before the clock has synced.
    pub fn compute_render_state(&self, now_ms: i64) -> Result<S, EngineError>
    where
        S: Clone,
    {
        let curr_tick = self.server_tick(now_ms)?;
        let tick_ms = 1000.0 / f64::from(self.tick_rate);
        let tol_ticks = (self.tolerance as f64 / tick_ms).ceil() as i64;
        let remote_lag = match self.transport.ping() {
            Some(rtt) => {
                let half_rtt_ticks = ((rtt as f64 / 2.0) / tick_ms).ceil() as i64;
                tol_ticks.max(half_rtt_ticks + 1)
            }
            None => tol_ticks,
        };
        let remote_tick = (curr_tick - remote_lag).max(0);

        let remote_state = self.compute_state_at(remote_tick);
        let local_state = self.compute_state_at(curr_tick);
        Ok(self.fns.smooth(&remote_state, &local_state))
    }

    /// Publishes `data`, recording a local optimistic post immediately.
    ///
    /// # Errors
    /// Returns [`EngineError::NotSynced`] unless the engine is `Synced`,
    /// and propagates [`EngineError::NotOpen`] from the transport.
    pub fn post(&self, now_ms: i64, data: serde_json::Value) -> Result<String, EngineError> {
        if self.sync_state() != SyncState::Synced {
            return Err(EngineError::NotSynced);
        }
        let client_time = now_ms;
        let server_time = self.transport.server_time(now_ms)?;
        let name = self.transport.post(&self.room, client_time, data.clone())?;

        let lp = LocalPost {
            name: name.clone(),
            client_time,
            server_time,
            data,
        };
        let mut guard = self.state.lock().unwrap();
        let start_tick = if self.cache_enabled {
            Some(guard.cache.start_tick())
        } else {
            None
        };
        let outcome = guard.timeline.add_local_post(name.clone(), lp, start_tick);
        match outcome {
            AddLocalOutcome::BeforeWindow => {
                warn!(room = %self.room, name, "local post before snapshot window dropped");
            }
            AddLocalOutcome::Inserted { tick } => {
                guard.cache.invalidate_from(tick);
            }
        }
        Ok(name)
    }

    /// Delegates to the transport's clock.
    ///
    /// # Errors
    /// Returns [`EngineError::NotSynced`] before the first sync.
    pub fn server_time(&self, now_ms: i64) -> Result<i64, EngineError> {
        self.transport.server_time(now_ms)
    }

    /// `floor(server_time * tick_rate / 1000)`.
    ///
    /// # Errors
    /// Returns [`EngineError::NotSynced`] before the first sync.
    pub fn server_tick(&self, now_ms: i64) -> Result<Tick, EngineError> {
        let t = self.server_time(now_ms)?;
        Ok(self.time_to_tick(t))
    }

    /// `floor(ms * tick_rate / 1000)`, with no synchronization requirement.
    #[must_use]
    pub fn time_to_tick(&self, ms: i64) -> Tick {
        crate::timeline::official_tick(ms, self.tick_rate)
    }

    /// `(initial_time, initial_tick)`, set once index 0 is seen.
    #[must_use]
    pub fn initial(&self) -> Option<(i64, Tick)> {
        self.state.lock().unwrap().timeline.initial()
    }

    /// Retained authoritative post count.
    #[must_use]
    pub fn post_count(&self) -> usize {
        self.state.lock().unwrap().timeline.post_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    struct Counter {
        ticked: i64,
        posts: Vec<String>,
    }

    struct CounterFns;

    impl StateFns<Counter> for CounterFns {
        fn on_tick(&self, prev: &Counter, tick: Tick) -> Counter {
            Counter {
                ticked: tick,
                posts: prev.posts.clone(),
            }
        }

        fn on_post(&self, state: &Counter, post_name: &str, _post_data: &serde_json::Value) -> Counter {
            let mut posts = state.posts.clone();
            posts.push(post_name.to_string());
            Counter {
                ticked: state.ticked,
                posts,
            }
        }

        fn smooth(&self, remote_state: &Counter, _local_state: &Counter) -> Counter {
            remote_state.clone()
        }
    }

    use crate::transport::SimTransport;

    fn engine_with_transport() -> (Arc<Engine<Counter, CounterFns>>, Arc<SimTransport>) {
        let transport = Arc::new(SimTransport::new());
        let engine = Engine::new(
            "room",
            Counter::default(),
            CounterFns,
            24,
            300,
            true,
            8,
            256,
            transport.clone(),
        );
        (engine, transport)
    }

    #[test]
    fn post_before_sync_fails_not_synced() {
        let (engine, _transport) = engine_with_transport();
        let err = engine.post(0, json!(null)).unwrap_err();
        assert_eq!(err, EngineError::NotSynced);
    }

    #[test]
    fn syncing_transport_bootstraps_watch_and_load() {
        let (engine, transport) = engine_with_transport();
        assert_eq!(engine.sync_state(), SyncState::Syncing);
        transport.complete_sync(0, 10, 1000);
        assert_eq!(engine.sync_state(), SyncState::Synced);
    }

    #[test]
    fn state_at_unset_initial_tick_returns_init() {
        let (engine, _transport) = engine_with_transport();
        let s = engine.compute_state_at(100);
        assert_eq!(*s, Counter::default());
    }

    #[test]
    fn remote_post_establishes_initial_tick_and_advances_state() {
        let (engine, transport) = engine_with_transport();
        transport.complete_sync(0, 0, 0);

        let post = Post {
            room: "room".into(),
            index: 0,
            server_time: 0,
            client_time: 0,
            name: "p0".into(),
            data: json!(null),
        };
        transport.deliver("room", post);

        let (_, initial_tick) = engine.initial().unwrap();
        let s = engine.compute_state_at(initial_tick);
        assert_eq!(s.posts, vec!["p0".to_string()]);
    }

    #[test]
    fn local_post_is_reconciled_when_echoed() {
        let (engine, transport) = engine_with_transport();
        transport.complete_sync(0, 0, 0);
        // seed initial tick via a remote post so the cache is live
        transport.deliver(
            "room",
            Post {
                room: "room".into(),
                index: 0,
                server_time: 0,
                client_time: 0,
                name: "seed".into(),
                data: json!(null),
            },
        );

        let name = engine.post(41, json!({"k": 1})).unwrap();
        assert_eq!(engine.post_count(), 1); // only the seed remote post so far

        // broker echoes the local post back with an assigned index
        transport.deliver(
            "room",
            Post {
                room: "room".into(),
                index: 1,
                server_time: 41,
                client_time: 41,
                name,
                data: json!({"k": 1}),
            },
        );
        assert_eq!(engine.post_count(), 2);
    }
}

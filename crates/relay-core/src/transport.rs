// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The interface the Engine consumes to talk to a broker, plus an
//! in-memory simulator for tests.
//!
//! Real implementations (a WebSocket client, say) live outside this crate;
//! see `relay-transport-ws`. [`SimTransport`] here is a legitimate
//! substitution in its own right, not just a test double — it lets a host
//! run multiple Engines against one shared, single-process broker without a
//! socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use relay_proto::Post;

use crate::clock::Clock;
use crate::error::EngineError;

/// Abstraction the Engine consumes: clock access, a single live room watch,
/// backlog requests, and posting.
///
/// Implementations must guarantee: every successful `post` is eventually
/// echoed back through the room's watch handler with the same `name`; a
/// room may have at most one live watch handler at a time; delivery order
/// is not guaranteed relative to `index`, and duplicates may occur (the
/// Engine deduplicates).
pub trait Transport {
    /// Registers `cb` to run exactly once after the clock has synced. If
    /// already synced, implementations should fire it as soon as
    /// convenient rather than immediately from within this call, to avoid
    /// reentrancy into the caller.
    fn on_sync(&self, cb: Box<dyn FnOnce() + Send>);

    /// Subscribes to live (and, via `load`, historical) posts for `room`.
    ///
    /// # Errors
    /// Returns [`EngineError::DuplicateHandler`] if `room` already has a
    /// live watch handler.
    fn watch(
        &self,
        room: &str,
        handler: Arc<dyn Fn(Post) + Send + Sync>,
    ) -> Result<(), EngineError>;

    /// Unsubscribes the room's live watch handler, if any.
    fn unwatch(&self, room: &str);

    /// Requests backlog from `index = from`; arrivals flow through the
    /// room's watch handler exactly as live posts do.
    fn load(&self, room: &str, from: u64);

    /// Publishes `data` to `room`. Returns the opaque name the broker will
    /// stamp on its eventual echo.
    ///
    /// # Errors
    /// Returns [`EngineError::NotOpen`] if the transport is not ready.
    fn post(&self, room: &str, client_time: i64, data: serde_json::Value) -> Result<String, EngineError>;

    /// Delegates to the transport's clock.
    ///
    /// # Errors
    /// Returns [`EngineError::NotSynced`] before the first sync.
    fn server_time(&self, local_now_ms: i64) -> Result<i64, EngineError>;

    /// Last observed round-trip time in ms, or `None` if unsynced.
    fn ping(&self) -> Option<i64>;
}

struct RoomState {
    handler: Option<Arc<dyn Fn(Post) + Send + Sync>>,
    log: Vec<Post>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            handler: None,
            log: Vec::new(),
        }
    }
}

/// An in-memory, single-process broker simulator.
///
/// All posts `post()`ed through this transport are appended to a per-room
/// log and immediately "delivered" (synchronously, in posting order) to
/// the room's current watch handler, stamped with a dense index and the
/// simulator's own clock. Test code drives clock sync and RTT explicitly
/// via [`SimTransport::complete_sync`]; nothing here spawns a timer.
pub struct SimTransport {
    inner: Mutex<SimInner>,
}

struct SimInner {
    clock: Clock,
    rooms: HashMap<String, RoomState>,
    open: bool,
    name_seq: u64,
}

impl SimTransport {
    /// Creates a transport with no rooms and an unsynced clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner {
                clock: Clock::new(),
                rooms: HashMap::new(),
                open: true,
                name_seq: 0,
            }),
        }
    }

    /// Marks the transport closed; subsequent `post` calls fail with
    /// `NotOpen`.
    pub fn close(&self) {
        self.inner.lock().unwrap().open = false;
    }

    /// Drives one `get_time` round trip through the simulator's clock and
    /// fires any `on_sync` callbacks this transport doesn't otherwise own
    /// (there are none today; kept for symmetry with `record_round_trip`'s
    /// contract and for tests that queue callbacks directly via
    /// [`SimTransport::queue_on_sync`]).
    pub fn complete_sync(&self, sent_at_ms: i64, recv_at_ms: i64, server_time_ms: i64) {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            let just_synced = inner
                .clock
                .record_round_trip(sent_at_ms, recv_at_ms, server_time_ms);
            if just_synced {
                inner.clock.drain_on_sync()
            } else {
                Vec::new()
            }
        };
        for cb in callbacks {
            cb();
        }
    }

    /// Queues a one-shot sync callback directly (bypassing `on_sync`'s
    /// signature, for tests that want to hold a typed closure handle).
    pub fn queue_on_sync(&self, cb: Box<dyn FnOnce() + Send>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.clock.is_synced() {
            drop(inner);
            cb();
        } else {
            inner.clock.queue_on_sync(cb);
        }
    }

    /// Delivers a post directly into a room's log and, if watched, its
    /// handler — used by tests to simulate out-of-band or duplicate
    /// deliveries without going through `post()`.
    pub fn deliver(&self, room: &str, post: Post) {
        let handler = {
            let mut inner = self.inner.lock().unwrap();
            let state = inner.rooms.entry(room.to_string()).or_insert_with(RoomState::new);
            state.log.push(post.clone());
            state.handler.clone()
        };
        // Call the handler after releasing the lock: it may call back into
        // this transport (e.g. to post a reply or re-watch).
        if let Some(handler) = handler {
            handler(post);
        }
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn on_sync(&self, cb: Box<dyn FnOnce() + Send>) {
        self.queue_on_sync(cb);
    }

    fn watch(&self, room: &str, handler: Arc<dyn Fn(Post) + Send + Sync>) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let state = inner.rooms.entry(room.to_string()).or_insert_with(RoomState::new);
        if state.handler.is_some() {
            return Err(EngineError::DuplicateHandler);
        }
        state.handler = Some(handler);
        Ok(())
    }

    fn unwatch(&self, room: &str) {
        if let Some(state) = self.inner.lock().unwrap().rooms.get_mut(room) {
            state.handler = None;
        }
    }

    fn load(&self, room: &str, from: u64) {
        let backlog = {
            let inner = self.inner.lock().unwrap();
            inner
                .rooms
                .get(room)
                .map(|s| {
                    s.log
                        .iter()
                        .filter(|p| p.index >= from)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };
        for post in backlog {
            self.deliver(room, post);
        }
    }

    fn post(&self, room: &str, client_time: i64, data: serde_json::Value) -> Result<String, EngineError> {
        let (name, index, server_time) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.open {
                return Err(EngineError::NotOpen);
            }
            inner.name_seq += 1;
            let name = format!("local-{}", inner.name_seq);
            let server_time = inner.clock.server_time(client_time).unwrap_or(client_time);
            let state = inner.rooms.entry(room.to_string()).or_insert_with(RoomState::new);
            let index = state.log.len() as u64;
            (name, index, server_time)
        };

        let post = Post {
            room: room.to_string(),
            index,
            server_time,
            client_time,
            name: name.clone(),
            data,
        };
        self.deliver(room, post);
        Ok(name)
    }

    fn server_time(&self, local_now_ms: i64) -> Result<i64, EngineError> {
        self.inner.lock().unwrap().clock.server_time(local_now_ms)
    }

    fn ping(&self) -> Option<i64> {
        self.inner.lock().unwrap().clock.ping()
    }
}

/// Convenience alias for the common `Arc<dyn Transport>` ownership shape
/// used when wiring an Engine to a shared transport.
pub type SharedTransport = Arc<dyn Transport + Send + Sync>;

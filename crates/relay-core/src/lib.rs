// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! relay-core: deterministic tick-based replicated state engine.
//!
//! A single authoritative log of ordered posts per room is replayed
//! identically by every participant. This crate holds the engine itself —
//! clock-offset estimation, the transport contract, a bounded snapshot
//! cache, and the timeline that canonicalizes per-tick ordering — with no
//! network or wall-clock dependency of its own; hosts drive it with real
//! timestamps and a real or simulated [`transport::Transport`].
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::multiple_crate_versions
)]

pub mod clock;
/// Orchestration: `Engine`, `StateFns`, `SyncState`.
pub mod engine;
mod error;
/// Bounded, evenly-spaced state checkpoint cache.
pub mod snapshot;
/// Per-tick canonical post ordering and dedup.
pub mod timeline;
/// The `Transport` contract and an in-memory simulator.
pub mod transport;

pub use clock::Clock;
pub use engine::{Engine, StateFns, SyncState, TickInputs};
pub use error::EngineError;
pub use snapshot::{PruneEvent, SnapshotCache};
pub use timeline::{
    official_tick, official_time, AddLocalOutcome, AddRemoteOutcome, LocalPost, PostView, Tick,
    Timeline, TimelineBucket,
};
pub use transport::{SharedTransport, SimTransport, Transport};

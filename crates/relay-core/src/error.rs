// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Engine-wide error kinds.

use thiserror::Error;

/// Errors surfaced by the clock, transport contract, and engine.
///
/// `BeforeWindow` and `UnknownMessage` are documented as silently-absorbed
/// (log only) by callers per the engine's failure semantics; they are still
/// modeled as real error values so that callers that *do* want to observe
/// them (metrics, tests) can.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The operation requires a synced clock (`server_time`/`post` before
    /// the first successful time-sync round trip).
    #[error("operation requires a synced clock")]
    NotSynced,
    /// The transport is not ready to accept a post.
    #[error("transport is not open")]
    NotOpen,
    /// A room already has a live watch handler registered.
    #[error("room already has a watch handler registered")]
    DuplicateHandler,
    /// A post's official tick falls before the retained snapshot window and
    /// was dropped.
    #[error("post is older than the retained snapshot window")]
    BeforeWindow,
    /// The broker sent a message kind this client doesn't recognize.
    #[error("unrecognized message kind: {0}")]
    UnknownMessage(String),
}

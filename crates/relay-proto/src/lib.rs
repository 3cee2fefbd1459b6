// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
//! Wire schema for the relay room broker.
//!
//! A room is a single authoritative, append-only log of [`Post`]s. Every
//! message exchanged between a client and the broker is a JSON object
//! tagged by a `$` field, matching the table in the room-engine
//! specification's external interfaces section.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod wire;

/// An authoritative event in a room, as echoed by the broker.
///
/// `index` is dense and strictly increasing in server delivery order within
/// a room; `server_time` is monotonically non-decreasing across indices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    /// Room this post belongs to.
    pub room: String,
    /// Monotonic, dense, broker-assigned sequence number within the room.
    pub index: u64,
    /// Broker clock reading (ms) at the moment the post was stamped.
    pub server_time: i64,
    /// Originating client's clock reading (ms) at post time.
    pub client_time: i64,
    /// Opaque unique name the client supplied (or the broker generated) for
    /// this post; used to reconcile an optimistic local copy with its echo.
    pub name: String,
    /// Opaque application payload.
    pub data: Value,
}

/// Wire messages exchanged between a client and the broker.
///
/// Tagged internally by the `$` field using the snake_case names from the
/// protocol table (`get_time`, `info_time`, `post`, `info_post`, `load`,
/// `watch`, `unwatch`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "$")]
pub enum Message {
    /// C→S: request the broker's current time.
    #[serde(rename = "get_time")]
    GetTime,
    /// S→C: broker time at send, in ms.
    #[serde(rename = "info_time")]
    InfoTime {
        /// Broker clock reading in ms.
        time: i64,
    },
    /// C→S: publish an event. The broker stamps `server_time` and assigns
    /// a dense `index`, then echoes it back (and to other watchers) as
    /// [`Message::InfoPost`].
    #[serde(rename = "post")]
    Post {
        /// Target room.
        room: String,
        /// Client clock reading (ms) at post time.
        time: i64,
        /// Opaque name chosen by the poster.
        name: String,
        /// Opaque application payload.
        data: Value,
    },
    /// S→C: live delivery, echo, or backlog entry for a room. The same
    /// message shape is used in all three cases.
    #[serde(rename = "info_post")]
    InfoPost {
        /// Room this post belongs to.
        room: String,
        /// Broker-assigned dense sequence number.
        index: u64,
        /// Broker clock reading (ms) at post time.
        server_time: i64,
        /// Originating client's clock reading (ms).
        client_time: i64,
        /// Opaque name supplied by the poster.
        name: String,
        /// Opaque application payload.
        data: Value,
    },
    /// C→S: request backlog from `index = from` onward. Arrivals flow
    /// through the room's watch handler as if live.
    #[serde(rename = "load")]
    Load {
        /// Target room.
        room: String,
        /// First index (inclusive) to replay.
        from: u64,
    },
    /// C→S: subscribe to future posts for a room.
    #[serde(rename = "watch")]
    Watch {
        /// Target room.
        room: String,
    },
    /// C→S: unsubscribe from a room.
    #[serde(rename = "unwatch")]
    Unwatch {
        /// Target room.
        room: String,
    },
}

impl Message {
    /// The canonical `$` tag for this message variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::GetTime => "get_time",
            Message::InfoTime { .. } => "info_time",
            Message::Post { .. } => "post",
            Message::InfoPost { .. } => "info_post",
            Message::Load { .. } => "load",
            Message::Watch { .. } => "watch",
            Message::Unwatch { .. } => "unwatch",
        }
    }
}

impl From<Message> for Option<Post> {
    /// Extracts a [`Post`] out of an [`Message::InfoPost`], if applicable.
    fn from(msg: Message) -> Self {
        match msg {
            Message::InfoPost {
                room,
                index,
                server_time,
                client_time,
                name,
                data,
            } => Some(Post {
                room,
                index,
                server_time,
                client_time,
                name,
                data,
            }),
            _ => None,
        }
    }
}

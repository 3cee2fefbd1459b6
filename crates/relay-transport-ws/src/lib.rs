// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Real [`relay_core::Transport`] over a WebSocket connection to a relay
//! broker, with a background `get_time` probe loop feeding the clock.

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
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions
)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use relay_core::{Clock, EngineError, Transport};
use relay_proto::{wire, Message, Post};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{trace, warn};

/// How often the background probe loop sends `get_time`.
const PROBE_INTERVAL: Duration = Duration::from_secs(2);

struct RoomState {
    handler: Option<Arc<dyn Fn(Post) + Send + Sync>>,
}

impl RoomState {
    fn new() -> Self {
        Self { handler: None }
    }
}

struct Shared {
    clock: Mutex<Clock>,
    rooms: Mutex<HashMap<String, RoomState>>,
    pending_probe_sent_at: Mutex<Option<i64>>,
    open: AtomicBool,
    name_seq: AtomicU64,
    out_tx: mpsc::UnboundedSender<Message>,
}

/// A [`relay_core::Transport`] backed by a live WebSocket connection.
///
/// Connects once; the reader, writer, and probe loop run as background
/// tasks for the lifetime of the returned handle. Dropping every clone of
/// the handle drops the outbound channel, which ends the writer task; the
/// reader task ends when the socket closes.
pub struct WsTransport {
    shared: Arc<Shared>,
}

impl WsTransport {
    /// Connects to `url` (e.g. `ws://localhost:8080/ws`) and spawns the
    /// reader/writer/probe tasks on the current Tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the WebSocket handshake fails.
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        let (mut ws_sink, mut ws_stream) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let shared = Arc::new(Shared {
            clock: Mutex::new(Clock::new()),
            rooms: Mutex::new(HashMap::new()),
            pending_probe_sent_at: Mutex::new(None),
            open: AtomicBool::new(true),
            name_seq: AtomicU64::new(0),
            out_tx,
        });

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                match wire::encode(&msg) {
                    Ok(text) => {
                        if ws_sink.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(?err, "failed to encode outgoing message"),
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(frame) = ws_stream.next().await {
                let frame = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match wire::decode(&frame) {
                    Ok(msg) => Self::handle_incoming(&reader_shared, msg),
                    Err(err) => warn!(?err, "dropping malformed frame from broker"),
                }
            }
            reader_shared.open.store(false, Ordering::SeqCst);
        });

        let probe_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            loop {
                ticker.tick().await;
                if !probe_shared.open.load(Ordering::SeqCst) {
                    break;
                }
                Self::send_probe(&probe_shared);
            }
        });

        Ok(Arc::new(Self { shared }))
    }

    fn send_probe(shared: &Arc<Shared>) {
        let sent_at = now_ms();
        *shared.pending_probe_sent_at.lock().unwrap() = Some(sent_at);
        let _ = shared.out_tx.send(Message::GetTime);
    }

    fn handle_incoming(shared: &Arc<Shared>, msg: Message) {
        match msg {
            Message::InfoTime { time } => {
                let sent_at = shared.pending_probe_sent_at.lock().unwrap().take();
                let Some(sent_at) = sent_at else {
                    trace!("info_time with no outstanding probe; ignoring");
                    return;
                };
                let recv_at = now_ms();
                let callbacks = {
                    let mut clock = shared.clock.lock().unwrap();
                    if clock.record_round_trip(sent_at, recv_at, time) {
                        clock.drain_on_sync()
                    } else {
                        Vec::new()
                    }
                };
                for cb in callbacks {
                    cb();
                }
            }
            Message::InfoPost {
                room,
                index,
                server_time,
                client_time,
                name,
                data,
            } => {
                let post = Post {
                    room,
                    index,
                    server_time,
                    client_time,
                    name,
                    data,
                };
                let handler = {
                    let rooms = shared.rooms.lock().unwrap();
                    rooms.get(&post.room).and_then(|r| r.handler.clone())
                };
                if let Some(handler) = handler {
                    handler(post);
                }
            }
            other => {
                trace!(kind = other.kind(), "ignoring message from broker");
            }
        }
    }
}

impl Transport for WsTransport {
    fn on_sync(&self, cb: Box<dyn FnOnce() + Send>) {
        let mut clock = self.shared.clock.lock().unwrap();
        if clock.is_synced() {
            drop(clock);
            cb();
        } else {
            clock.queue_on_sync(cb);
        }
    }

    fn watch(&self, room: &str, handler: Arc<dyn Fn(Post) + Send + Sync>) -> Result<(), EngineError> {
        let mut rooms = self.shared.rooms.lock().unwrap();
        let state = rooms.entry(room.to_string()).or_insert_with(RoomState::new);
        if state.handler.is_some() {
            return Err(EngineError::DuplicateHandler);
        }
        state.handler = Some(handler);
        drop(rooms);
        let _ = self.shared.out_tx.send(Message::Watch { room: room.to_string() });
        Ok(())
    }

    fn unwatch(&self, room: &str) {
        if let Some(state) = self.shared.rooms.lock().unwrap().get_mut(room) {
            state.handler = None;
        }
        let _ = self.shared.out_tx.send(Message::Unwatch { room: room.to_string() });
    }

    fn load(&self, room: &str, from: u64) {
        let _ = self.shared.out_tx.send(Message::Load {
            room: room.to_string(),
            from,
        });
    }

    fn post(&self, room: &str, client_time: i64, data: serde_json::Value) -> Result<String, EngineError> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(EngineError::NotOpen);
        }
        let seq = self.shared.name_seq.fetch_add(1, Ordering::SeqCst);
        let name = format!("ws-{seq}");
        self.shared
            .out_tx
            .send(Message::Post {
                room: room.to_string(),
                time: client_time,
                name: name.clone(),
                data,
            })
            .map_err(|_| EngineError::NotOpen)?;
        Ok(name)
    }

    fn server_time(&self, local_now_ms: i64) -> Result<i64, EngineError> {
        self.shared.clock.lock().unwrap().server_time(local_now_ms)
    }

    fn ping(&self) -> Option<i64> {
        self.shared.clock.lock().unwrap().ping()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

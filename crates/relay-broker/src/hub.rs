// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Room registry: per-room log + live subscriber fan-out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use relay_proto::Message;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::store::{RoomLog, StoreError};

struct Room {
    log: RoomLog,
    subscribers: HashMap<u64, mpsc::Sender<Message>>,
}

/// Shared broker state: one log + subscriber set per room, guarded by a
/// single async mutex (mirrors the session hub's connection-state lock —
/// contention is bounded by message-handling latency, not I/O).
pub struct Hub {
    data_dir: PathBuf,
    rooms: Mutex<HashMap<String, Room>>,
    next_conn_id: std::sync::atomic::AtomicU64,
}

impl Hub {
    /// Creates a hub rooted at `data_dir` (one `<room>.jsonl` file per
    /// room, created on first use).
    #[must_use]
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            rooms: Mutex::new(HashMap::new()),
            next_conn_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Allocates a fresh connection id.
    pub fn alloc_conn_id(&self) -> u64 {
        self.next_conn_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    async fn room(&self, name: &str) -> Result<tokio::sync::MappedMutexGuard<'_, Room>, StoreError> {
        let mut rooms = self.rooms.lock().await;
        if !rooms.contains_key(name) {
            let log = RoomLog::open(&self.data_dir, name)?;
            rooms.insert(
                name.to_string(),
                Room {
                    log,
                    subscribers: HashMap::new(),
                },
            );
        }
        Ok(tokio::sync::MutexGuard::map(rooms, |r| {
            r.get_mut(name).expect("just inserted")
        }))
    }

    /// Registers `conn_id`'s outbound channel as the live subscriber for
    /// `room`, replacing any previous subscriber for that connection.
    ///
    /// # Errors
    /// Propagates I/O failures opening the room's log.
    pub async fn watch(&self, room: &str, conn_id: u64, tx: mpsc::Sender<Message>) -> Result<(), StoreError> {
        let mut guard = self.room(room).await?;
        guard.subscribers.insert(conn_id, tx);
        debug!(room, conn_id, "subscriber added");
        Ok(())
    }

    /// Removes `conn_id` as a subscriber of `room`, if present.
    pub async fn unwatch(&self, room: &str, conn_id: u64) {
        let mut rooms = self.rooms.lock().await;
        if let Some(r) = rooms.get_mut(room) {
            r.subscribers.remove(&conn_id);
        }
    }

    /// Removes `conn_id` from every room it's subscribed to (connection
    /// teardown).
    pub async fn disconnect(&self, conn_id: u64) {
        let mut rooms = self.rooms.lock().await;
        for room in rooms.values_mut() {
            room.subscribers.remove(&conn_id);
        }
    }

    /// Appends a post, then fans it out as `info_post` to every live
    /// subscriber of the room (including the poster, so local echoes
    /// arrive the same way remote ones do).
    ///
    /// # Errors
    /// Propagates I/O failures appending to the room's log.
    pub async fn post(
        &self,
        room: &str,
        server_time: i64,
        client_time: i64,
        name: String,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut guard = self.room(room).await?;
        let index = guard
            .log
            .append(server_time, client_time, name.clone(), data.clone())?;

        let info = Message::InfoPost {
            room: room.to_string(),
            index,
            server_time,
            client_time,
            name,
            data,
        };
        Self::broadcast(&mut guard.subscribers, &info).await;
        Ok(())
    }

    /// Requests backlog from `from`; results are delivered to `conn_id`'s
    /// channel as `info_post` messages, mirroring live delivery.
    ///
    /// # Errors
    /// Propagates I/O failures or a corrupt log.
    pub async fn load(&self, room: &str, from: u64, conn_id: u64, tx: &mpsc::Sender<Message>) -> Result<(), StoreError> {
        let posts = {
            let guard = self.room(room).await?;
            guard.log.read_from(room, from)?
        };
        for post in posts {
            let info = Message::InfoPost {
                room: post.room,
                index: post.index,
                server_time: post.server_time,
                client_time: post.client_time,
                name: post.name,
                data: post.data,
            };
            if tx.send(info).await.is_err() {
                warn!(room, conn_id, "subscriber channel closed during backlog replay");
                break;
            }
        }
        Ok(())
    }

    async fn broadcast(subscribers: &mut HashMap<u64, mpsc::Sender<Message>>, msg: &Message) {
        let mut dead = Vec::new();
        for (&conn_id, tx) in subscribers.iter() {
            if tx.send(msg.clone()).await.is_err() {
                dead.push(conn_id);
            }
        }
        for conn_id in dead {
            subscribers.remove(&conn_id);
        }
    }
}

/// Shared handle type used across connection tasks.
pub type SharedHub = Arc<Hub>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn post_fans_out_to_subscriber_including_poster() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(dir.path().to_path_buf());
        let (tx, mut rx) = mpsc::channel(8);
        hub.watch("lobby", 1, tx).await.unwrap();

        hub.post("lobby", 100, 100, "p1".into(), json!({"x": 1}))
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        match msg {
            Message::InfoPost { index, name, .. } => {
                assert_eq!(index, 0);
                assert_eq!(name, "p1");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn load_replays_backlog_to_requester() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(dir.path().to_path_buf());
        hub.post("lobby", 100, 100, "p1".into(), json!(1)).await.unwrap();
        hub.post("lobby", 200, 200, "p2".into(), json!(2)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        hub.load("lobby", 0, 99, &tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, Message::InfoPost { index: 0, .. }));
        assert!(matches!(second, Message::InfoPost { index: 1, .. }));
    }

    #[tokio::test]
    async fn unwatch_stops_further_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::new(dir.path().to_path_buf());
        let (tx, mut rx) = mpsc::channel(8);
        hub.watch("lobby", 1, tx).await.unwrap();
        hub.unwatch("lobby", 1).await;

        hub.post("lobby", 100, 100, "p1".into(), json!(null)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}

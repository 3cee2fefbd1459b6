// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Room broker: terminates client WebSocket connections and drives a
//! [`Hub`] of append-only per-room logs.

mod hub;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use relay_config::{ConfigService, FsConfigStore};
use relay_proto::{wire, Message};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::hub::{Hub, SharedHub};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay room broker")]
struct Args {
    /// TCP listener for clients (e.g. 0.0.0.0:8080). Falls back to the last
    /// persisted value, then 0.0.0.0:8080.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Directory holding one `<room>.jsonl` log per room. Falls back to the
    /// last persisted value, then ./relay-data.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BrokerPrefs {
    listen: Option<SocketAddr>,
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config: ConfigService<FsConfigStore> =
        ConfigService::new(FsConfigStore::new().context("opening config store")?);
    let mut prefs: BrokerPrefs = config.load("broker-prefs")?.unwrap_or_default();

    let listen = args
        .listen
        .or(prefs.listen)
        .unwrap_or_else(|| "0.0.0.0:8080".parse().expect("valid default socket addr"));
    let data_dir = args
        .data_dir
        .or_else(|| prefs.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from("./relay-data"));

    prefs.listen = Some(listen);
    prefs.data_dir = Some(data_dir.clone());
    if let Err(err) = config.save("broker-prefs", &prefs) {
        warn!(?err, "failed to persist broker preferences");
    }

    let hub: SharedHub = Arc::new(Hub::new(data_dir.clone()));

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(hub);

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    info!(%listen, data_dir = %data_dir.display(), "relay broker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("broker server loop")?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install ctrl-c handler; shutdown will not be graceful");
    }
}

async fn ws_handler(State(hub): State<SharedHub>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: SharedHub) {
    let conn_id = hub.alloc_conn_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            match wire::encode(&msg) {
                Ok(text) => {
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(?err, conn_id, "failed to encode outgoing message"),
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let decoded = match wire::decode(&text) {
            Ok(m) => m,
            Err(err) => {
                warn!(?err, conn_id, "dropping malformed frame");
                continue;
            }
        };
        if let Err(err) = dispatch(&hub, conn_id, decoded, &out_tx).await {
            warn!(?err, conn_id, "dispatch failed");
        }
    }

    hub.disconnect(conn_id).await;
    writer.abort();
}

async fn dispatch(
    hub: &SharedHub,
    conn_id: u64,
    msg: Message,
    out_tx: &mpsc::Sender<Message>,
) -> Result<()> {
    match msg {
        Message::GetTime => {
            let _ = out_tx
                .send(Message::InfoTime {
                    time: server_time_ms(),
                })
                .await;
        }
        Message::Post {
            room,
            time,
            name,
            data,
        } => {
            hub.post(&room, server_time_ms(), time, name, data).await?;
        }
        Message::Load { room, from } => {
            hub.load(&room, from, conn_id, out_tx).await?;
        }
        Message::Watch { room } => {
            hub.watch(&room, conn_id, out_tx.clone()).await?;
        }
        Message::Unwatch { room } => {
            hub.unwatch(&room, conn_id).await;
        }
        other => {
            warn!(kind = other.kind(), conn_id, "ignoring unexpected message from client");
        }
    }
    Ok(())
}

fn server_time_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

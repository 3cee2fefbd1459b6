// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Interactive CLI for poking a relay room directly over its wire
//! protocol: `/watch`, `/unwatch`, `/load`, `/post`.

use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use relay_config::{ConfigService, FsConfigStore};
use relay_core::Transport;
use relay_proto::Post;
use relay_transport_ws::WsTransport;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay room CLI")]
struct Args {
    /// Broker WebSocket URL, e.g. ws://localhost:8080/ws. Falls back to the
    /// last URL used, then to ws://127.0.0.1:8080/ws.
    #[arg(long)]
    broker: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CliPrefs {
    broker_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config: ConfigService<FsConfigStore> =
        ConfigService::new(FsConfigStore::new().context("opening config store")?);
    let mut prefs: CliPrefs = config.load("cli-prefs")?.unwrap_or_default();

    let broker_url = args
        .broker
        .or_else(|| prefs.broker_url.clone())
        .unwrap_or_else(|| "ws://127.0.0.1:8080/ws".to_string());

    prefs.broker_url = Some(broker_url.clone());
    if let Err(err) = config.save("cli-prefs", &prefs) {
        warn!(?err, "failed to persist broker url preference");
    }

    info!(broker = %broker_url, "connecting");
    let transport = WsTransport::connect(&broker_url).await?;
    println!("connected to {broker_url}");
    println!("commands: /watch <room>  /unwatch <room>  /load <room> <from>  /post <room> <json>  /quit");

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("reading stdin")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = dispatch(&transport, line) {
            eprintln!("error: {err}");
        }
    }

    Ok(())
}

fn dispatch(transport: &Arc<WsTransport>, line: &str) -> Result<()> {
    let mut parts = line.splitn(3, ' ');
    let cmd = parts.next().unwrap_or_default();
    match cmd {
        "/watch" => {
            let room = parts.next().context("usage: /watch <room>")?.to_string();
            let label = room.clone();
            transport.watch(
                &room,
                Arc::new(move |post: Post| {
                    let index = post.index;
                    let name = post.name;
                    let data = post.data;
                    println!("[{label}] #{index} {name} {data}");
                }),
            )?;
            println!("watching {room}");
        }
        "/unwatch" => {
            let room = parts.next().context("usage: /unwatch <room>")?;
            transport.unwatch(room);
            println!("unwatched {room}");
        }
        "/load" => {
            let room = parts.next().context("usage: /load <room> <from>")?;
            let from: u64 = parts
                .next()
                .context("usage: /load <room> <from>")?
                .parse()
                .context("from must be a non-negative integer")?;
            transport.load(room, from);
        }
        "/post" => {
            let room = parts.next().context("usage: /post <room> <json>")?;
            let body = parts.next().context("usage: /post <room> <json>")?;
            let data: serde_json::Value =
                serde_json::from_str(body).context("payload must be JSON")?;
            let client_time = now_ms();
            let name = transport.post(room, client_time, data)?;
            println!("posted as {name}");
        }
        other => {
            println!("unknown command: {other}");
        }
    }
    Ok(())
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! WASD demo: drives a [`relay_core::Engine`] end to end, either against a
//! real broker or, with no `--broker` given, a local in-process
//! [`relay_core::SimTransport`] (handy for trying the Engine without
//! standing up `relay-broker`).

mod state;

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use relay_core::{Engine, SharedTransport, SimTransport, SyncState};
use relay_transport_ws::WsTransport;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::state::{input_payload, join_payload, DemoFns, DemoState};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay WASD demo")]
struct Args {
    /// Broker WebSocket URL. Omit to run entirely in-process against a
    /// simulated transport.
    #[arg(long)]
    broker: Option<String>,
    /// Room name.
    #[arg(long, default_value = "lobby")]
    room: String,
    /// This player's name.
    #[arg(long, default_value = "p1")]
    player: String,
    /// Simulation tick rate in Hz.
    #[arg(long, default_value_t = 20)]
    tick_rate: u32,
    /// Reconciliation tolerance in ms (see `official_time`).
    #[arg(long, default_value_t = 100)]
    tolerance_ms: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let sim = if args.broker.is_none() {
        Some(Arc::new(SimTransport::new()))
    } else {
        None
    };

    let transport: SharedTransport = if let Some(url) = &args.broker {
        WsTransport::connect(url).await?
    } else {
        Arc::clone(sim.as_ref().expect("sim branch set above"))
    };

    let engine = Engine::new(
        args.room.clone(),
        DemoState::default(),
        DemoFns::new(args.tick_rate),
        args.tick_rate,
        args.tolerance_ms,
        true,
        8,
        256,
        transport,
    );

    if let Some(sim) = &sim {
        sim.complete_sync(0, 0, 0);
    }

    while engine.sync_state() != SyncState::Synced {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    info!(room = %args.room, player = %args.player, "synced, joining");
    engine.post(now_ms(), join_payload(&args.player))?;

    println!("commands: w/a/s/d move, x stop, q quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(1000 / u64::from(args.tick_rate)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let rendered = engine.compute_render_state(now_ms())?;
                if let Some(p) = rendered.players.get(&args.player) {
                    print!("\r{}: ({:.2}, {:.2})          ", args.player, p.x, p.y);
                    std::io::stdout().flush().ok();
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "w" => post_input(&engine, &args.player, 0.0, -3.0),
                    "s" => post_input(&engine, &args.player, 0.0, 3.0),
                    "a" => post_input(&engine, &args.player, -3.0, 0.0),
                    "d" => post_input(&engine, &args.player, 3.0, 0.0),
                    "x" => post_input(&engine, &args.player, 0.0, 0.0),
                    "q" => break,
                    other => println!("unknown command: {other}"),
                }
            }
        }
    }

    Ok(())
}

fn post_input(engine: &Arc<Engine<DemoState, DemoFns>>, player: &str, vx: f64, vy: f64) {
    if let Err(err) = engine.post(now_ms(), input_payload(player, vx, vy)) {
        warn!(?err, "failed to post input");
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

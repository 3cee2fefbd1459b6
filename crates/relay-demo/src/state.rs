// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Game state driven by the Engine: a flat set of WASD-controlled players.

use std::collections::BTreeMap;

use relay_core::{StateFns, Tick};
use serde::Deserialize;
use serde_json::Value;

/// One player's position and velocity, in grid units per second.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
}

/// The whole room's state: every known player, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct DemoState {
    pub players: BTreeMap<String, PlayerState>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum DemoEvent {
    Join { player: String },
    Leave { player: String },
    Input { player: String, vx: f64, vy: f64 },
}

/// Convenience constructor for the wire payload of a `join` post.
#[must_use]
pub fn join_payload(player: &str) -> Value {
    serde_json::json!({ "kind": "join", "player": player })
}

/// Convenience constructor for the wire payload of an `input` post.
#[must_use]
pub fn input_payload(player: &str, vx: f64, vy: f64) -> Value {
    serde_json::json!({ "kind": "input", "player": player, "vx": vx, "vy": vy })
}

/// State transition rules for the demo: straight-line motion between
/// inputs, no collision, no bounds.
pub struct DemoFns {
    tick_rate: u32,
}

impl DemoFns {
    /// Creates the rule set for a room ticking at `tick_rate` Hz.
    #[must_use]
    pub fn new(tick_rate: u32) -> Self {
        Self { tick_rate }
    }
}

impl StateFns<DemoState> for DemoFns {
    fn on_tick(&self, prev: &DemoState, _tick: Tick) -> DemoState {
        let dt = 1.0 / f64::from(self.tick_rate);
        let players = prev
            .players
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    PlayerState {
                        x: p.x + p.vx * dt,
                        y: p.y + p.vy * dt,
                        vx: p.vx,
                        vy: p.vy,
                    },
                )
            })
            .collect();
        DemoState { players }
    }

    fn on_post(&self, state: &DemoState, _post_name: &str, post_data: &Value) -> DemoState {
        let Ok(event) = serde_json::from_value::<DemoEvent>(post_data.clone()) else {
            return state.clone();
        };
        let mut players = state.players.clone();
        match event {
            DemoEvent::Join { player } => {
                players.entry(player).or_insert_with(PlayerState::default);
            }
            DemoEvent::Leave { player } => {
                players.remove(&player);
            }
            DemoEvent::Input { player, vx, vy } => {
                let entry = players.entry(player).or_insert_with(PlayerState::default);
                entry.vx = vx;
                entry.vy = vy;
            }
        }
        DemoState { players }
    }

    fn smooth(&self, remote_state: &DemoState, local_state: &DemoState) -> DemoState {
        let mut players = local_state.players.clone();
        for (name, local) in &mut players {
            if let Some(remote) = remote_state.players.get(name) {
                local.x = (remote.x + local.x) / 2.0;
                local.y = (remote.y + local.y) / 2.0;
            }
        }
        DemoState { players }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_tick_advances_position_by_velocity_over_dt() {
        let fns = DemoFns::new(10);
        let mut state = DemoState::default();
        state.players.insert(
            "p1".into(),
            PlayerState {
                x: 0.0,
                y: 0.0,
                vx: 10.0,
                vy: 0.0,
            },
        );
        let next = fns.on_tick(&state, 1);
        let p = next.players["p1"];
        assert!((p.x - 1.0).abs() < 1e-9);
        assert_eq!(p.vx, 10.0);
    }

    #[test]
    fn on_post_join_then_input_sets_velocity() {
        let fns = DemoFns::new(10);
        let state = DemoState::default();
        let joined = fns.on_post(&state, "n0", &join_payload("p1"));
        assert!(joined.players.contains_key("p1"));

        let moved = fns.on_post(&joined, "n1", &input_payload("p1", 1.0, -2.0));
        let p = moved.players["p1"];
        assert_eq!((p.vx, p.vy), (1.0, -2.0));
    }

    #[test]
    fn on_post_leave_removes_player() {
        let fns = DemoFns::new(10);
        let joined = fns.on_post(&DemoState::default(), "n0", &join_payload("p1"));
        let left = fns.on_post(&joined, "n1", &serde_json::json!({"kind": "leave", "player": "p1"}));
        assert!(!left.players.contains_key("p1"));
    }

    #[test]
    fn smooth_averages_position_but_keeps_local_velocity() {
        let fns = DemoFns::new(10);
        let mut remote = DemoState::default();
        remote.players.insert(
            "p1".into(),
            PlayerState {
                x: 0.0,
                y: 0.0,
                vx: 0.0,
                vy: 0.0,
            },
        );
        let mut local = DemoState::default();
        local.players.insert(
            "p1".into(),
            PlayerState {
                x: 10.0,
                y: 0.0,
                vx: 5.0,
                vy: 0.0,
            },
        );
        let blended = fns.smooth(&remote, &local);
        let p = blended.players["p1"];
        assert!((p.x - 5.0).abs() < 1e-9);
        assert_eq!(p.vx, 5.0);
    }

    #[test]
    fn unparseable_post_data_is_a_no_op() {
        let fns = DemoFns::new(10);
        let state = DemoState::default();
        let same = fns.on_post(&state, "n0", &serde_json::json!("garbage"));
        assert_eq!(same.players.len(), state.players.len());
    }
}

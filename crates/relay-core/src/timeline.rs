// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical per-tick ordering, dedup, and local/remote reconciliation.

use std::collections::{BTreeMap, HashMap};

use relay_proto::Post;

/// Authoritative tick index. Signed so that arithmetic on ticks before the
/// engine's `initial_tick` (which can only ever be compared against, never
/// produced as a real snapshot key) stays well-defined.
pub type Tick = i64;

/// An optimistic, not-yet-acknowledged post created by a local `Engine::post`.
///
/// Mirrors [`Post`]'s shape but carries no broker-assigned index: it has not
/// been accepted into the authoritative log yet.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalPost {
    /// Opaque name, matching what the broker will eventually echo back.
    pub name: String,
    /// Local clock reading (ms) at post time.
    pub client_time: i64,
    /// `Engine::server_time()` at post time (only trustworthy once synced).
    pub server_time: i64,
    /// Opaque application payload.
    pub data: serde_json::Value,
}

/// Generic view over a post passed to `on_post`, whether it originated
/// locally or remotely. `index` is `None` for posts still awaiting their
/// authoritative echo.
#[derive(Debug, Clone, Copy)]
pub struct PostView<'a> {
    /// Opaque post name.
    pub name: &'a str,
    /// Broker-assigned index, or `None` for a pending local post.
    pub index: Option<u64>,
    /// Local clock reading (ms) at post time.
    pub client_time: i64,
    /// Broker (or estimated, for local posts) clock reading (ms).
    pub server_time: i64,
    /// Opaque application payload.
    pub data: &'a serde_json::Value,
}

impl<'a> From<&'a Post> for PostView<'a> {
    fn from(p: &'a Post) -> Self {
        PostView {
            name: &p.name,
            index: Some(p.index),
            client_time: p.client_time,
            server_time: p.server_time,
            data: &p.data,
        }
    }
}

impl<'a> From<&'a LocalPost> for PostView<'a> {
    fn from(p: &'a LocalPost) -> Self {
        PostView {
            name: &p.name,
            index: None,
            client_time: p.client_time,
            server_time: p.server_time,
            data: &p.data,
        }
    }
}

/// The deterministic tick at which a post takes effect, derived from
/// `client_time`, `server_time`, and `tolerance`.
#[must_use]
pub fn official_time(client_time: i64, server_time: i64, tolerance: i64) -> i64 {
    if client_time > server_time - tolerance {
        client_time
    } else {
        server_time - tolerance
    }
}

/// `floor(official_time * tick_rate / 1000)`.
#[must_use]
pub fn official_tick(official_time: i64, tick_rate: u32) -> Tick {
    let num = i128::from(official_time) * i128::from(tick_rate);
    num.div_euclid(1000) as Tick
}

/// Canonical application order at one tick: `on_tick`, then every `remote`
/// post by ascending index, then every `local` post by insertion order.
#[derive(Debug, Default, Clone)]
pub struct TimelineBucket {
    /// Remote (authoritative) posts at this tick, sorted by ascending index.
    pub remote: Vec<Post>,
    /// Local (optimistic) posts at this tick, insertion order.
    pub local: Vec<LocalPost>,
}

/// Outcome of [`Timeline::add_remote_post`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddRemoteOutcome {
    /// The post's index was already present; it was ignored.
    Duplicate,
    /// The post's official tick was before the retained window; dropped.
    BeforeWindow,
    /// The post was inserted at `tick`. `initial_just_set` is true iff this
    /// call just fixed `initial_time`/`initial_tick` (i.e. this was index 0,
    /// seen for the first time).
    Inserted {
        /// Tick the post now lives at.
        tick: Tick,
        /// Whether this call just established `initial_tick`.
        initial_just_set: bool,
    },
}

/// Outcome of [`Timeline::add_local_post`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddLocalOutcome {
    /// The post's official tick was before the retained window; dropped.
    BeforeWindow,
    /// The post was inserted (or re-inserted) at `tick`.
    Inserted {
        /// Tick the post now lives at.
        tick: Tick,
    },
}

/// Remote dedup table, local post table, and per-tick buckets.
pub struct Timeline {
    tick_rate: u32,
    tolerance: i64,
    remote_posts: BTreeMap<u64, Tick>,
    local_posts: HashMap<String, Tick>,
    buckets: BTreeMap<Tick, TimelineBucket>,
    initial: Option<(i64, Tick)>,
}

impl Timeline {
    /// Creates an empty timeline for the given tick rate and tolerance.
    #[must_use]
    pub fn new(tick_rate: u32, tolerance: i64) -> Self {
        Self {
            tick_rate,
            tolerance,
            remote_posts: BTreeMap::new(),
            local_posts: HashMap::new(),
            buckets: BTreeMap::new(),
            initial: None,
        }
    }

    /// The tick a post with these timestamps would land at, per this
    /// timeline's configured `tick_rate`/`tolerance`.
    #[must_use]
    pub fn tick_for(&self, client_time: i64, server_time: i64) -> Tick {
        official_tick(
            official_time(client_time, server_time, self.tolerance),
            self.tick_rate,
        )
    }

    /// `(initial_time, initial_tick)`, fixed permanently once index 0 is
    /// seen.
    #[must_use]
    pub fn initial(&self) -> Option<(i64, Tick)> {
        self.initial
    }

    /// Number of retained authoritative posts.
    #[must_use]
    pub fn post_count(&self) -> usize {
        self.remote_posts.len()
    }

    /// Read-only view of the bucket at `tick`, if any posts landed there.
    #[must_use]
    pub fn bucket(&self, tick: Tick) -> Option<&TimelineBucket> {
        self.buckets.get(&tick)
    }

    fn bucket_mut(&mut self, tick: Tick) -> &mut TimelineBucket {
        self.buckets.entry(tick).or_default()
    }

    /// True if a live (not yet reconciled) local post with this name exists.
    #[must_use]
    pub fn has_local(&self, name: &str) -> bool {
        self.local_posts.contains_key(name)
    }

    /// Ingests a post echoed/delivered by the transport.
    ///
    /// `start_tick` is the cache's current window start (`None` when the
    /// cache is disabled or not yet seeded, in which case no post is ever
    /// considered before-window).
    pub fn add_remote_post(&mut self, post: Post, start_tick: Option<Tick>) -> AddRemoteOutcome {
        let tick = self.tick_for(post.client_time, post.server_time);

        let initial_just_set = if post.index == 0 && self.initial.is_none() {
            let official = official_time(post.client_time, post.server_time, self.tolerance);
            self.initial = Some((official, tick));
            true
        } else {
            false
        };

        if let Some(start) = start_tick {
            if tick < start {
                return AddRemoteOutcome::BeforeWindow;
            }
        }

        if self.remote_posts.contains_key(&post.index) {
            return AddRemoteOutcome::Duplicate;
        }

        self.remote_posts.insert(post.index, tick);
        let bucket = self.bucket_mut(tick);
        let pos = bucket
            .remote
            .binary_search_by_key(&post.index, |p| p.index)
            .unwrap_or_else(|e| e);
        bucket.remote.insert(pos, post);

        AddRemoteOutcome::Inserted {
            tick,
            initial_just_set,
        }
    }

    /// Ingests a locally-created optimistic post, replacing any prior post
    /// with the same `name` first (idempotent re-posts).
    pub fn add_local_post(
        &mut self,
        name: String,
        post: LocalPost,
        start_tick: Option<Tick>,
    ) -> AddLocalOutcome {
        self.remove_local_post(&name);

        let tick = self.tick_for(post.client_time, post.server_time);
        if let Some(start) = start_tick {
            if tick < start {
                return AddLocalOutcome::BeforeWindow;
            }
        }

        self.local_posts.insert(name, tick);
        self.bucket_mut(tick).local.push(post);
        AddLocalOutcome::Inserted { tick }
    }

    /// Removes a live local post by name, if present, returning the tick it
    /// was removed from.
    pub fn remove_local_post(&mut self, name: &str) -> Option<Tick> {
        let tick = self.local_posts.remove(name)?;
        if let Some(bucket) = self.buckets.get_mut(&tick) {
            bucket.local.retain(|p| p.name != name);
        }
        Some(tick)
    }

    /// Drops every remote/local post (and empty bucket) whose tick is
    /// strictly before `tick`, as required when the snapshot window slides.
    pub fn prune_before(&mut self, tick: Tick) {
        self.remote_posts.retain(|_, &mut t| t >= tick);
        self.local_posts.retain(|_, &mut t| t >= tick);
        self.buckets.retain(|&t, _| t >= tick);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post(index: u64, client_time: i64, server_time: i64, name: &str) -> Post {
        Post {
            room: "r".into(),
            index,
            server_time,
            client_time,
            name: name.into(),
            data: json!(null),
        }
    }

    #[test]
    fn official_time_prefers_client_time_within_tolerance() {
        assert_eq!(official_time(1000, 1000, 300), 1000);
        assert_eq!(official_time(600, 1000, 300), 700);
        assert_eq!(official_time(700, 1000, 300), 700);
        assert_eq!(official_time(701, 1000, 300), 701);
    }

    #[test]
    fn first_remote_post_sets_initial_tick_permanently() {
        let mut tl = Timeline::new(24, 300);
        let outcome = tl.add_remote_post(post(0, 1000, 1000, "a"), None);
        assert_eq!(
            outcome,
            AddRemoteOutcome::Inserted {
                tick: tl.initial().unwrap().1,
                initial_just_set: true
            }
        );
        let initial = tl.initial().unwrap();

        // a later post at index 0 arriving again (duplicate) must not move it
        tl.add_remote_post(post(1, 5000, 5000, "b"), None);
        assert_eq!(tl.initial(), Some(initial));
    }

    #[test]
    fn duplicate_index_is_ignored() {
        let mut tl = Timeline::new(24, 300);
        tl.add_remote_post(post(0, 0, 0, "a"), None);
        let outcome = tl.add_remote_post(post(0, 999, 999, "dup"), None);
        assert_eq!(outcome, AddRemoteOutcome::Duplicate);
        assert_eq!(tl.post_count(), 1);
    }

    #[test]
    fn before_window_posts_are_dropped() {
        let mut tl = Timeline::new(24, 300);
        let outcome = tl.add_remote_post(post(5, 0, 0, "a"), Some(100));
        assert_eq!(outcome, AddRemoteOutcome::BeforeWindow);
        assert_eq!(tl.post_count(), 0);
    }

    #[test]
    fn remote_bucket_stays_sorted_by_index_regardless_of_arrival_order() {
        let mut tl = Timeline::new(24, 300);
        // All three land in the same tick (client/server times close together).
        tl.add_remote_post(post(2, 0, 0, "c"), None);
        tl.add_remote_post(post(0, 0, 0, "a"), None);
        tl.add_remote_post(post(1, 0, 0, "b"), None);
        let tick = tl.tick_for(0, 0);
        let bucket = tl.bucket(tick).unwrap();
        let indices: Vec<u64> = bucket.remote.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn re_posting_same_local_name_is_idempotent() {
        let mut tl = Timeline::new(24, 300);
        let lp1 = LocalPost {
            name: "n".into(),
            client_time: 0,
            server_time: 0,
            data: json!(1),
        };
        tl.add_local_post("n".into(), lp1, None);
        let lp2 = LocalPost {
            name: "n".into(),
            client_time: 41,
            server_time: 41,
            data: json!(2),
        };
        let outcome = tl.add_local_post("n".into(), lp2, None);
        assert!(matches!(outcome, AddLocalOutcome::Inserted { .. }));
        let tick0 = tl.tick_for(0, 0);
        let tick1 = tl.tick_for(41, 41);
        if tick0 == tick1 {
            assert_eq!(tl.bucket(tick0).unwrap().local.len(), 1);
        } else {
            assert!(tl.bucket(tick0).is_none_or(|b| b.local.is_empty()));
            assert_eq!(tl.bucket(tick1).unwrap().local.len(), 1);
        }
    }

    #[test]
    fn prune_before_removes_old_posts_and_buckets() {
        let mut tl = Timeline::new(24, 300);
        tl.add_remote_post(post(0, 0, 0, "a"), None);
        tl.add_remote_post(post(1, 10_000, 10_000, "b"), None);
        let cut = tl.tick_for(5_000, 5_000);
        tl.prune_before(cut);
        assert_eq!(tl.post_count(), 1);
        assert!(tl.bucket(tl.tick_for(0, 0)).is_none());
    }
}

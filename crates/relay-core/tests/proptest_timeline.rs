// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(missing_docs)]
use proptest::prelude::*;
use relay_core::{official_tick, official_time};

proptest! {
    // official_time never precedes the tolerance-adjusted server floor, and
    // never precedes client_time either: it's always the larger of the two
    // candidate timestamps in the `server_time - tolerance` formulation.
    #[test]
    fn official_time_is_never_earlier_than_either_candidate(
        client_time in -1_000_000i64..1_000_000,
        server_time in -1_000_000i64..1_000_000,
        tolerance in 0i64..10_000,
    ) {
        let t = official_time(client_time, server_time, tolerance);
        prop_assert!(t >= server_time - tolerance);
        prop_assert!(t == client_time || t == server_time - tolerance);
    }

    // official_tick is monotonically non-decreasing in official_time for a
    // fixed tick_rate: later timestamps never land at an earlier tick.
    #[test]
    fn official_tick_is_monotonic_in_time(
        t1 in -1_000_000i64..1_000_000,
        delta in 0i64..100_000,
        tick_rate in 1u32..240,
    ) {
        let t2 = t1 + delta;
        prop_assert!(official_tick(t1, tick_rate) <= official_tick(t2, tick_rate));
    }
}

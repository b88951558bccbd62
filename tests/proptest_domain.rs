//! Property-Based Tests - Ingest Invariants
//!
//! Uses `proptest` to verify that the token bucket, the backoff policy
//! and the quote cache maintain their invariants across random inputs.

use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use feed_ingest::domain::backoff::BackoffPolicy;
use feed_ingest::domain::quote::{Quote, QuoteSource};
use feed_ingest::ports::sinks::QuoteSink;
use feed_ingest::usecases::quote_cache::QuoteCache;
use feed_ingest::usecases::rate_limiter::{RateLimiter, RateLimiterConfig};

fn at(offset_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + offset_ms).unwrap()
}

// ── Token Bucket Properties ────────────────────────────────

proptest! {
    /// Tokens stay within [0, capacity] whatever is requested.
    #[test]
    fn token_bucket_stays_in_bounds(
        capacity in 1.0f64..100.0,
        refill in 0.1f64..50.0,
        requests in prop::collection::vec(1u32..20, 1..60),
    ) {
        let limiter = RateLimiter::new(
            "prop",
            RateLimiterConfig { capacity, refill_per_sec: refill },
        ).unwrap();

        for n in requests {
            let before = limiter.available();
            let granted = limiter.try_acquire(n);
            let after = limiter.available();
            prop_assert!(after >= 0.0, "tokens went negative: {after}");
            prop_assert!(after <= capacity + 1e-9, "tokens above capacity: {after}");
            if f64::from(n) > capacity {
                prop_assert!(!granted, "granted {n} tokens from a bucket of {capacity}");
            }
            if !granted {
                prop_assert!(before < f64::from(n) + 1e-9);
            }
        }
    }
}

// ── Backoff Properties ─────────────────────────────────────

proptest! {
    /// Jittered delays never decrease and never exceed the cap.
    #[test]
    fn backoff_non_decreasing_up_to_cap(
        base_ms in 1u64..1_000,
        multiplier in 1.0f64..4.0,
        cap_factor in 1u64..100,
        jitter in 0.0f64..=1.0,
    ) {
        let base = Duration::from_millis(base_ms);
        let max = base * u32::try_from(cap_factor).unwrap();
        let policy = BackoffPolicy::new(base, multiplier, max, jitter).unwrap();

        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let delay = policy.delay(attempt);
            prop_assert!(delay <= max, "attempt {attempt}: {delay:?} > cap {max:?}");
            // Float rounding in Duration::mul_f64 may cost a nanosecond.
            prop_assert!(
                delay + Duration::from_micros(1) >= previous,
                "attempt {attempt}: {delay:?} < {previous:?}"
            );
            prop_assert!(delay >= policy.nominal_delay(attempt));
            previous = delay;
        }
    }
}

// ── Quote Cache Properties ─────────────────────────────────

proptest! {
    /// Whatever order two poll quotes arrive in, the newer one is served.
    #[test]
    fn cache_reorder_idempotent(
        t1 in 0i64..1_000_000,
        gap in 1i64..1_000_000,
        v1 in 0.0f64..1_000.0,
        v2 in 0.0f64..1_000.0,
        newer_first in any::<bool>(),
    ) {
        let older = Quote::score("G1", v1, QuoteSource::Poll, at(t1));
        let newer = Quote::score("G1", v2, QuoteSource::Poll, at(t1 + gap));

        let (cache, _receivers) = QuoteCache::new(16, None);
        if newer_first {
            cache.ingest(newer.clone());
            cache.ingest(older);
        } else {
            cache.ingest(older);
            cache.ingest(newer.clone());
        }

        prop_assert_eq!(cache.get("G1"), Some(newer));
    }

    /// Replaying the same quote leaves the cache unchanged.
    #[test]
    fn cache_replay_is_idempotent(t in 0i64..1_000_000, v in 0.0f64..1_000.0, replays in 1usize..5) {
        let quote = Quote::book("X", v, v + 0.01, QuoteSource::Stream, at(t));
        let (cache, _receivers) = QuoteCache::new(16, None);
        for _ in 0..=replays {
            cache.ingest(quote.clone());
        }
        prop_assert_eq!(cache.get("X"), Some(quote));
        prop_assert_eq!(cache.instruments().len(), 1);
    }
}

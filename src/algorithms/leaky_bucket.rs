//! Leaky bucket state machine.
//!
//! Tokens drip back into the bucket at `duration / limit` milliseconds per
//! token. The leak anchor (`updated_at`) only advances by whole leak periods
//! so fragments of a period are never lost between calls; the rate is floored
//! at one millisecond per token so high-frequency limits cannot produce a
//! zero divisor.

use super::gregorian;
use crate::types::{Behavior, Counter, RateLimitReq, RateLimitResp, Status};

/// Evaluate one hit against the previous counter state.
///
/// Pure: the only time source is `now_ms`.
pub fn apply(prev: Option<&Counter>, req: &RateLimitReq, now_ms: i64) -> (Counter, RateLimitResp) {
    if req.limit <= 0 {
        let counter = Counter::LeakyBucket {
            limit: req.limit,
            duration: req.duration,
            created_at: now_ms,
            burst: req.burst,
            remaining: 0,
            updated_at: now_ms,
        };
        let resp = RateLimitResp {
            status: Status::OverLimit,
            limit: req.limit,
            remaining: 0,
            reset_time: now_ms,
            error: String::new(),
        };
        return (counter, resp);
    }

    let capacity = if req.burst > req.limit {
        req.burst
    } else {
        req.limit
    };
    let unit = if req.behavior.has(Behavior::DURATION_IS_GREGORIAN) {
        gregorian::unit_from_duration(req.duration)
    } else {
        None
    };

    // A calendar-aligned bucket expires when its window's boundary passes;
    // a rolling bucket never expires, it just keeps leaking.
    let carried = match prev {
        Some(Counter::LeakyBucket {
            created_at,
            remaining,
            updated_at,
            ..
        }) => {
            let rolled_over =
                matches!(unit, Some(u) if gregorian::next_boundary(u, *created_at) <= now_ms);
            if rolled_over {
                None
            } else {
                Some((*created_at, *remaining, *updated_at))
            }
        }
        _ => None,
    };

    let (created_at, mut remaining, mut updated_at) = match carried {
        Some(state) => state,
        None => (now_ms, capacity, now_ms),
    };

    let span = match unit {
        Some(u) => {
            let (start, end) = gregorian::window(u, created_at);
            end - start
        }
        None => req.duration,
    };
    let rate = (span / req.limit).max(1);

    // Leak whole periods since the anchor.
    if now_ms > updated_at {
        let leaked = (now_ms - updated_at) / rate;
        if leaked > 0 {
            remaining += leaked;
            updated_at += leaked * rate;
        }
    }
    // Clamping after the leak also absorbs a capacity that shrank since the
    // last call.
    remaining = remaining.min(capacity);

    let boundary = unit.map(|u| gregorian::next_boundary(u, created_at));
    let reset_for = |remaining: i64| -> i64 {
        let reset = now_ms + (capacity - remaining) * rate;
        match boundary {
            Some(b) => reset.min(b),
            None => reset,
        }
    };

    if req.behavior.has(Behavior::RESET_REMAINING) {
        let counter = Counter::LeakyBucket {
            limit: req.limit,
            duration: req.duration,
            created_at,
            burst: req.burst,
            remaining: req.limit,
            updated_at: now_ms,
        };
        let resp = RateLimitResp {
            status: Status::UnderLimit,
            limit: req.limit,
            remaining: req.limit,
            reset_time: reset_for(req.limit),
            error: String::new(),
        };
        return (counter, resp);
    }

    let status = if req.hits == 0 {
        if remaining > 0 {
            Status::UnderLimit
        } else {
            Status::OverLimit
        }
    } else if req.hits < 0 {
        remaining = (remaining - req.hits).min(capacity);
        Status::UnderLimit
    } else if req.hits <= remaining {
        remaining -= req.hits;
        Status::UnderLimit
    } else {
        if req.behavior.has(Behavior::DRAIN_OVER_LIMIT) {
            remaining = 0;
        }
        Status::OverLimit
    };

    let counter = Counter::LeakyBucket {
        limit: req.limit,
        duration: req.duration,
        created_at,
        burst: req.burst,
        remaining,
        updated_at,
    };
    let resp = RateLimitResp {
        status,
        limit: req.limit,
        remaining,
        reset_time: reset_for(remaining),
        error: String::new(),
    };
    (counter, resp)
}

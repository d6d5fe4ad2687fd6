//! Token bucket state machine.
//!
//! A counter starts with `capacity` tokens and hands them out until the
//! window resets, at which point the bucket refills completely. A hit
//! larger than what is left does not deduct anything; the caller is told
//! OVER_LIMIT and may retry with a smaller claim.

use super::gregorian;
use crate::types::{Behavior, Counter, RateLimitReq, RateLimitResp, Status};

/// Evaluate one hit against the previous counter state.
///
/// Pure: the only time source is `now_ms`.
pub fn apply(prev: Option<&Counter>, req: &RateLimitReq, now_ms: i64) -> (Counter, RateLimitResp) {
    if req.limit <= 0 {
        // A zero limit admits nothing.
        let counter = Counter::TokenBucket {
            limit: req.limit,
            duration: req.duration,
            created_at: now_ms,
            remaining: 0,
            reset_time: now_ms,
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

    let capacity = if req.burst > 0 { req.burst } else { req.limit };

    // Carry state forward only while the window is live and describes the
    // same limit class; an expired window or a changed duration/algorithm
    // starts a fresh bucket.
    let carried = match prev {
        Some(Counter::TokenBucket {
            limit,
            duration,
            created_at,
            remaining,
            reset_time,
        }) if *duration == req.duration && *reset_time > now_ms => {
            Some((*limit, *created_at, *remaining, *reset_time))
        }
        _ => None,
    };

    let (old_limit, created_at, mut remaining, reset_time) = match carried {
        Some((old_limit, created_at, remaining, reset_time)) => {
            (Some(old_limit), created_at, remaining, reset_time)
        }
        None => {
            let reset_time = if req.behavior.has(Behavior::DURATION_IS_GREGORIAN) {
                match gregorian::unit_from_duration(req.duration) {
                    Some(unit) => gregorian::next_boundary(unit, now_ms),
                    None => now_ms + req.duration,
                }
            } else {
                now_ms + req.duration
            };
            (None, now_ms, capacity, reset_time)
        }
    };

    // The limit changed mid-window: shift remaining by the difference so the
    // tokens already consumed stay consumed.
    if let Some(old) = old_limit {
        if old != req.limit {
            remaining = (remaining + (req.limit - old)).clamp(0, req.limit);
        }
    }

    if req.behavior.has(Behavior::RESET_REMAINING) {
        let counter = Counter::TokenBucket {
            limit: req.limit,
            duration: req.duration,
            created_at,
            remaining: req.limit,
            reset_time,
        };
        let resp = RateLimitResp {
            status: Status::UnderLimit,
            limit: req.limit,
            remaining: req.limit,
            reset_time,
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
        // Claimed more than is left: leave the bucket intact so a smaller
        // retry can still succeed, unless the caller asked us to drain.
        if req.behavior.has(Behavior::DRAIN_OVER_LIMIT) {
            remaining = 0;
        }
        Status::OverLimit
    };

    let counter = Counter::TokenBucket {
        limit: req.limit,
        duration: req.duration,
        created_at,
        remaining,
        reset_time,
    };
    let resp = RateLimitResp {
        status,
        limit: req.limit,
        remaining,
        reset_time,
        error: String::new(),
    };
    (counter, resp)
}

//! Rate limit algorithm cores.
//!
//! Both algorithms are total, deterministic functions from
//! `(previous state, request, now)` to `(next state, response)`. Nothing in
//! this module reads the system clock; callers supply unix milliseconds from
//! an injected [`crate::clock::Clock`].

mod leaky_bucket;
mod token_bucket;

pub mod gregorian;

use crate::types::{Algorithm, Counter, RateLimitReq, RateLimitResp};

/// Evaluate a request against the stored counter state.
///
/// A stored counter whose algorithm differs from the request is discarded and
/// the bucket starts fresh, exactly as if the key had never been seen.
#[must_use]
pub fn apply(prev: Option<&Counter>, req: &RateLimitReq, now_ms: i64) -> (Counter, RateLimitResp) {
    let prev = prev.filter(|c| c.algorithm() == req.algorithm);
    match req.algorithm {
        Algorithm::TokenBucket => token_bucket::apply(prev, req, now_ms),
        Algorithm::LeakyBucket => leaky_bucket::apply(prev, req, now_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Status, SECOND};

    #[test]
    fn test_algorithm_switch_starts_fresh() {
        let now = 1_000_000;
        let mut req = RateLimitReq {
            name: "test".to_string(),
            unique_key: "account:1".to_string(),
            hits: 3,
            limit: 10,
            duration: 30 * SECOND,
            algorithm: Algorithm::TokenBucket,
            ..Default::default()
        };

        let (counter, resp) = apply(None, &req, now);
        assert_eq!(resp.remaining, 7);

        // Same key, different algorithm: prior state is ignored.
        req.algorithm = Algorithm::LeakyBucket;
        let (counter, resp) = apply(Some(&counter), &req, now);
        assert_eq!(resp.remaining, 7);
        assert_eq!(counter.algorithm(), Algorithm::LeakyBucket);
        assert_eq!(resp.status, Status::UnderLimit);
    }
}

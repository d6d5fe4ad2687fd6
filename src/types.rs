//! Request, response and counter state types shared across the service.
//!
//! These are the wire types: they travel over the framed peer RPC as
//! MessagePack and over the HTTP gateway as JSON. Field names are snake_case
//! on both wires and enums encode as their protocol string names
//! (`TOKEN_BUCKET`, `UNDER_LIMIT`, ...).

use serde::{Deserialize, Serialize};

/// One millisecond, expressed as a request duration.
pub const MILLISECOND: i64 = 1;
/// One second in milliseconds.
pub const SECOND: i64 = 1_000;
/// One minute in milliseconds.
pub const MINUTE: i64 = 60 * SECOND;
/// One hour in milliseconds.
pub const HOUR: i64 = 60 * MINUTE;

/// Rate limit algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    /// Fixed window of tokens which are all refilled when the window resets.
    #[default]
    TokenBucket,
    /// Tokens drip back into the bucket at a constant rate.
    LeakyBucket,
}

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// The hit fit within the limit.
    #[default]
    UnderLimit,
    /// The hit exceeded the limit.
    OverLimit,
}

/// Behavior flags carried on a request, encoded as a bitset on the wire.
///
/// `BATCHING` is the zero value and therefore the default: requests forwarded
/// to a peer coalesce inside the batching window unless `NO_BATCHING` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Behavior(pub u32);

impl Behavior {
    /// Coalesce forwarded requests inside the batching window (default).
    pub const BATCHING: Behavior = Behavior(0);
    /// Bypass the forwarding queue and issue an immediate RPC.
    pub const NO_BATCHING: Behavior = Behavior(1);
    /// Eventually-consistent mode: answer locally, forward hits to the owner
    /// asynchronously, accept owner broadcasts.
    pub const GLOBAL: Behavior = Behavior(1 << 1);
    /// `duration` selects a calendar unit; the window ends at the next
    /// UTC boundary of that unit.
    pub const DURATION_IS_GREGORIAN: Behavior = Behavior(1 << 2);
    /// Refill `remaining` to the limit without counting the current hits.
    pub const RESET_REMAINING: Behavior = Behavior(1 << 3);
    /// Reserved for cross-datacenter replication; parsed and ignored.
    pub const MULTI_REGION: Behavior = Behavior(1 << 4);
    /// An over-limit hit drains the bucket to zero instead of leaving it
    /// untouched.
    pub const DRAIN_OVER_LIMIT: Behavior = Behavior(1 << 5);

    /// Returns `true` if every flag in `other` is set.
    #[inline]
    #[must_use]
    pub fn contains(self, other: Behavior) -> bool {
        self.0 & other.0 == other.0 && (other.0 != 0 || self.0 == 0)
    }

    /// Returns `true` if the given non-zero flag is set.
    #[inline]
    #[must_use]
    pub fn has(self, flag: Behavior) -> bool {
        self.0 & flag.0 != 0
    }
}

impl std::ops::BitOr for Behavior {
    type Output = Behavior;

    fn bitor(self, rhs: Behavior) -> Behavior {
        Behavior(self.0 | rhs.0)
    }
}

/// A single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitReq {
    /// Namespace of the limit, e.g. `requests_per_sec`.
    pub name: String,
    /// Key within the namespace, e.g. `account:1234`.
    pub unique_key: String,
    /// Number of units claimed. Negative hits refund units.
    pub hits: i64,
    /// Maximum units per window.
    pub limit: i64,
    /// Window length in milliseconds, or a gregorian sentinel when
    /// `DURATION_IS_GREGORIAN` is set.
    pub duration: i64,
    /// Which algorithm evaluates this key.
    pub algorithm: Algorithm,
    /// Behavior flag bitset.
    pub behavior: Behavior,
    /// Burst capacity; `0` means "use `limit`".
    pub burst: i64,
}

impl RateLimitReq {
    /// The cache/routing key for this request.
    ///
    /// The same composition feeds the consistent hash, so the key and its
    /// owner are stable for the life of a peer set.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}_{}", self.name, self.unique_key)
    }
}

/// Answer for a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitResp {
    /// Whether the hit was within the limit.
    pub status: Status,
    /// The limit currently applied to the key.
    pub limit: i64,
    /// Units left in the window.
    pub remaining: i64,
    /// Unix milliseconds when the window resets (token bucket) or the bucket
    /// fully drains (leaky bucket).
    pub reset_time: i64,
    /// Empty on success; a validation or transport message otherwise.
    pub error: String,
}

/// A batch of rate limit checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetRateLimitsReq {
    /// The checks to evaluate, answered in this order.
    pub requests: Vec<RateLimitReq>,
}

/// Responses for a batch, in request order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetRateLimitsResp {
    /// One response per request, same order.
    pub responses: Vec<RateLimitResp>,
}

/// Daemon health report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckResp {
    /// `"healthy"` or `"unhealthy"`.
    pub status: String,
    /// Transport errors from unhealthy peer clients, empty when healthy.
    pub message: String,
    /// Number of peers in the current ring snapshot.
    pub peer_count: i32,
}

/// Authoritative counter state broadcast by an owner to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalUpdate {
    /// Namespace of the key.
    pub name: String,
    /// Key within the namespace.
    pub unique_key: String,
    /// Algorithm the owner evaluated with.
    pub algorithm: Algorithm,
    /// Window length the owner evaluated with.
    pub duration: i64,
    /// Limit the owner evaluated with.
    pub limit: i64,
    /// Authoritative remaining units.
    pub remaining: i64,
    /// Authoritative reset time in unix milliseconds.
    pub reset_time: i64,
}

/// Owner-to-peer broadcast batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatePeerGlobalsReq {
    /// Updated counters, last-writer-wins per key.
    pub globals: Vec<GlobalUpdate>,
}

/// In-memory counter state for one `(name, unique_key)` pair.
///
/// Invariant: `0 <= remaining <= capacity` where capacity is `burst` when set
/// and `limit` otherwise. Mutation happens under the store's per-key guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Counter {
    /// Fixed-window token bucket.
    TokenBucket {
        /// Limit at the last evaluation.
        limit: i64,
        /// Window length in milliseconds (or gregorian sentinel).
        duration: i64,
        /// Unix milliseconds of the first hit for this window.
        created_at: i64,
        /// Units left in the window.
        remaining: i64,
        /// Unix milliseconds when the window resets.
        reset_time: i64,
    },
    /// Constant-rate leaky bucket.
    LeakyBucket {
        /// Limit at the last evaluation.
        limit: i64,
        /// Window length in milliseconds (or gregorian sentinel).
        duration: i64,
        /// Unix milliseconds of the first hit.
        created_at: i64,
        /// Burst capacity; `0` means "use `limit`".
        burst: i64,
        /// Units left in the bucket.
        remaining: i64,
        /// Leak anchor: advanced by whole leak periods, not wall-clock
        /// deltas, so sub-period fragments are never lost.
        updated_at: i64,
    },
}

impl Counter {
    /// The algorithm this counter belongs to.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Counter::TokenBucket { .. } => Algorithm::TokenBucket,
            Counter::LeakyBucket { .. } => Algorithm::LeakyBucket,
        }
    }

    /// Units left in the counter.
    #[must_use]
    pub fn remaining(&self) -> i64 {
        match self {
            Counter::TokenBucket { remaining, .. } | Counter::LeakyBucket { remaining, .. } => {
                *remaining
            }
        }
    }
}

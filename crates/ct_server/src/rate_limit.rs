// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Submission rate limits.
//!
//! Three token buckets protect the log from abusive submission patterns,
//! each with sustained rate `r` and burst `⌈r⌉`:
//!
//! - old-notBefore: submissions whose certificate was issued long ago,
//!   typically backfill traffic that should not crowd out fresh issuance;
//! - per-issuer: one bucket per issuing CA, created on first use;
//! - dedup: resolutions of duplicate submissions, which cost a bundle read.
//!
//! Integration pushback is not a bucket; the sequencer signals it directly.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// A classic token bucket: capacity `⌈rate⌉`, refilled continuously at
/// `rate` tokens per second.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Returns a full bucket with the given sustained rate.
    ///
    /// # Panics
    ///
    /// Panics if `rate` is not strictly positive.
    pub fn new(rate: f64) -> Self {
        assert!(rate > 0.0, "token bucket rate must be positive");
        let burst = rate.ceil();
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token, reporting whether one was available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// The three-valued dedup limit: negative configs mean unlimited, zero means
// every duplicate is rejected, positive is a bucket.
enum DedupLimit {
    Unlimited,
    AlwaysReject,
    Bucket(TokenBucket),
}

/// The set of configured rate limits. All methods are cheap and safe to call
/// from concurrent request tasks.
pub struct RateLimits {
    not_before: Option<(Duration, TokenBucket)>,
    issuer: Option<RwLock<HashMap<[u8; 32], Arc<TokenBucket>>>>,
    issuer_rate: f64,
    dedup: DedupLimit,
}

impl RateLimits {
    /// Builds the limit set. `not_before` pairs an age threshold with a
    /// rate; `issuer_rate` is per-issuer queries per second with negative
    /// disabling the limit; `dedup_rate` keeps the three-value semantics
    /// (negative unlimited, zero always-reject, positive a bucket).
    pub fn new(
        not_before: Option<(Duration, f64)>,
        issuer_rate: f64,
        dedup_rate: f64,
    ) -> Self {
        let not_before = not_before.map(|(age, rate)| {
            log::info!("configured old-notBefore limit: {rate:.2} qps for certs aged >= {age:?}");
            (age, TokenBucket::new(rate))
        });
        let issuer = (issuer_rate >= 0.0).then(|| {
            log::info!("configured issuer limit: {issuer_rate:.2} qps per issuer");
            RwLock::new(HashMap::new())
        });
        let dedup = if dedup_rate < 0.0 {
            DedupLimit::Unlimited
        } else if dedup_rate == 0.0 {
            log::info!("configured dedup limit: all duplicates rejected");
            DedupLimit::AlwaysReject
        } else {
            log::info!("configured dedup limit: {dedup_rate:.2} qps");
            DedupLimit::Bucket(TokenBucket::new(dedup_rate))
        };
        Self {
            not_before,
            issuer,
            issuer_rate,
            dedup,
        }
    }

    /// Returns whether a submission with the given leaf notBefore should be
    /// accepted. Only submissions older than the configured threshold
    /// consume tokens.
    pub fn accept_not_before(&self, not_before_millis: u64, now_millis: u64) -> bool {
        let Some((age_threshold, bucket)) = &self.not_before else {
            return true;
        };
        let age = Duration::from_millis(now_millis.saturating_sub(not_before_millis));
        if age < *age_threshold {
            return true;
        }
        bucket.allow()
    }

    /// Returns whether a submission should be accepted based on the leaf's
    /// raw issuer name. Buckets are created on first use.
    pub fn accept_issuer(&self, raw_issuer: &[u8]) -> bool {
        let Some(buckets) = &self.issuer else {
            return true;
        };
        let key: [u8; 32] = Sha256::digest(raw_issuer).into();
        if let Some(bucket) = buckets.read().unwrap().get(&key).cloned() {
            return bucket.allow();
        }
        let bucket = buckets
            .write()
            .unwrap()
            .entry(key)
            .or_insert_with(|| Arc::new(TokenBucket::new(self.issuer_rate)))
            .clone();
        bucket.allow()
    }

    /// Returns whether a duplicate submission may be resolved.
    pub fn accept_dedup(&self) -> bool {
        match &self.dedup {
            DedupLimit::Unlimited => true,
            DedupLimit::AlwaysReject => false,
            DedupLimit::Bucket(bucket) => bucket.allow(),
        }
    }
}

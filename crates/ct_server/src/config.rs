// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Log configuration and its validation.

use der::oid::{db::rfc5280, ObjectIdentifier};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use x509_util::ChainPolicy;

/// The EKU value for anyExtendedKeyUsage.
const ANY_EXTENDED_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.37.0");

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("empty origin")]
    EmptyOrigin,
    #[error("origin has a trailing slash")]
    OriginTrailingSlash,
    #[error("origin starts with a scheme")]
    OriginHasScheme,
    #[error("origin contains whitespace")]
    OriginHasWhitespace,
    #[error("configuration would reject all certificates")]
    RejectsEverything,
    #[error("notAfter limit is before notAfter start")]
    NotAfterRangeInverted,
    #[error("unknown extended key usage: {0}")]
    UnknownEku(String),
    #[error("invalid OID: {0}")]
    InvalidOid(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("invalid rate limit spec: {0}")]
    InvalidRateLimit(String),
}

/// Configuration for a CT log instance. Field defaults match a small
/// deployment; every knob is surfaced as a CLI flag by the binary.
#[derive(Clone)]
pub struct LogConfig {
    /// The log's origin: its checkpoint name and submission prefix, with no
    /// scheme and no trailing slash.
    pub origin: String,

    /// PEM file with the initial accepted roots.
    pub roots_pem_file: Option<PathBuf>,
    /// URL of a CCADB-style CSV of additional roots to fetch periodically.
    pub roots_remote_fetch_url: Option<String>,
    /// Interval between remote root fetches; zero disables fetching.
    pub roots_remote_fetch_interval: Duration,
    /// Hex SHA-256 fingerprints of roots to drop regardless of source.
    pub reject_roots: HashSet<[u8; 32]>,

    /// Chain validation policy.
    pub policy: ChainPolicy,

    /// Maximum entries per sequencing batch.
    pub batch_max_size: usize,
    /// Maximum time a batch stays open.
    pub batch_max_age: Duration,
    /// Re-sign the checkpoint when this much time passed without growth.
    pub checkpoint_interval: Duration,
    /// Re-publish the checkpoint unconditionally at this interval.
    pub checkpoint_republish_interval: Duration,

    /// Reject adds when this many entries await integration.
    pub pushback_max_outstanding: usize,
    /// Reject adds when the anti-spam follower lags by more than this many
    /// entries.
    pub pushback_max_antispam_lag: u64,

    /// Rate limit on submissions with an old notBefore: age threshold and
    /// sustained queries per second. None disables the limit.
    pub rate_limit_old_not_before: Option<(Duration, f64)>,
    /// Per-issuer sustained queries per second; negative disables.
    pub rate_limit_issuer: f64,
    /// Duplicate-resolution queries per second; zero rejects all duplicates,
    /// negative means unlimited.
    pub rate_limit_dedup: f64,

    /// Entries held by the in-memory anti-spam cache.
    pub inmemory_antispam_cache_size: usize,

    /// Optional prefix for the submission endpoints.
    pub path_prefix: String,
    /// Mask internal error messages in HTTP 500 bodies.
    pub mask_internal_errors: bool,
    /// Deadline for a submission request, including sequencing.
    pub http_deadline: Duration,

    /// Interval between garbage collection sweeps; zero disables GC.
    pub garbage_collection_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            origin: String::new(),
            roots_pem_file: None,
            roots_remote_fetch_url: None,
            roots_remote_fetch_interval: Duration::from_secs(3600),
            reject_roots: HashSet::new(),
            policy: ChainPolicy::default(),
            batch_max_size: 256,
            batch_max_age: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(10),
            checkpoint_republish_interval: Duration::from_secs(3600),
            pushback_max_outstanding: 4096,
            pushback_max_antispam_lag: 10_000,
            rate_limit_old_not_before: None,
            rate_limit_issuer: -1.0,
            rate_limit_dedup: -1.0,
            inmemory_antispam_cache_size: 65_536,
            path_prefix: String::new(),
            mask_internal_errors: false,
            http_deadline: Duration::from_secs(30),
            garbage_collection_interval: Duration::from_secs(300),
        }
    }
}

impl LogConfig {
    /// Normalises and validates the configuration. The origin is normalised
    /// exactly once, here; nothing downstream re-checks it.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first invalid option found.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        while self.origin.ends_with('/') {
            self.origin.pop();
        }
        if self.origin.is_empty() {
            return Err(ConfigError::EmptyOrigin);
        }
        if self.origin.contains("://") {
            return Err(ConfigError::OriginHasScheme);
        }
        if self.origin.chars().any(char::is_whitespace) {
            return Err(ConfigError::OriginHasWhitespace);
        }

        if self.policy.reject_expired && self.policy.reject_unexpired {
            return Err(ConfigError::RejectsEverything);
        }
        if let (Some(start), Some(limit)) =
            (self.policy.not_after_start, self.policy.not_after_limit)
        {
            if limit < start {
                return Err(ConfigError::NotAfterRangeInverted);
            }
        }

        if !self.path_prefix.is_empty() && !self.path_prefix.starts_with('/') {
            self.path_prefix.insert(0, '/');
        }
        while self.path_prefix.ends_with('/') {
            self.path_prefix.pop();
        }

        Ok(())
    }
}

/// Parses a comma-separated list of extended key usage names from the fixed
/// set recognised by the validator.
///
/// # Errors
///
/// Returns an error on an unknown name.
pub fn parse_ext_key_usages(s: &str) -> Result<Vec<ObjectIdentifier>, ConfigError> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| match part.trim() {
            "ServerAuth" => Ok(rfc5280::ID_KP_SERVER_AUTH),
            "ClientAuth" => Ok(rfc5280::ID_KP_CLIENT_AUTH),
            "CodeSigning" => Ok(rfc5280::ID_KP_CODE_SIGNING),
            "EmailProtection" => Ok(rfc5280::ID_KP_EMAIL_PROTECTION),
            "TimeStamping" => Ok(rfc5280::ID_KP_TIME_STAMPING),
            "OCSPSigning" => Ok(rfc5280::ID_KP_OCSP_SIGNING),
            "Any" => Ok(ANY_EXTENDED_KEY_USAGE),
            other => Err(ConfigError::UnknownEku(other.to_string())),
        })
        .collect()
}

/// Parses a comma-separated list of dotted OIDs.
///
/// # Errors
///
/// Returns an error on a malformed OID.
pub fn parse_oids(s: &str) -> Result<Vec<ObjectIdentifier>, ConfigError> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            ObjectIdentifier::new(part.trim()).map_err(|_| ConfigError::InvalidOid(part.into()))
        })
        .collect()
}

/// Parses a duration like `250ms`, `30s`, `5m`, `12h`, or `30d`.
///
/// # Errors
///
/// Returns an error if the string is not a number followed by a unit.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let err = || ConfigError::InvalidDuration(s.to_string());
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(err)?;
    let (num, unit) = s.split_at(split);
    let num: u64 = num.parse().map_err(|_| err())?;
    let millis = match unit {
        "ms" => num,
        "s" => num * 1_000,
        "m" => num * 60 * 1_000,
        "h" => num * 3_600 * 1_000,
        "d" => num * 86_400 * 1_000,
        _ => return Err(err()),
    };
    Ok(Duration::from_millis(millis))
}

/// Parses an old-notBefore rate limit spec of the form `<duration>:<qps>`,
/// e.g. `30d:1`.
///
/// # Errors
///
/// Returns an error if either component is malformed or the rate is not
/// positive.
pub fn parse_not_before_limit(s: &str) -> Result<(Duration, f64), ConfigError> {
    let err = || ConfigError::InvalidRateLimit(s.to_string());
    let (age, qps) = s.split_once(':').ok_or_else(err)?;
    let age = parse_duration(age).map_err(|_| err())?;
    let qps: f64 = qps.parse().map_err(|_| err())?;
    if !qps.is_finite() || qps <= 0.0 {
        return Err(err());
    }
    Ok((age, qps))
}

/// Parses a hex SHA-256 fingerprint.
///
/// # Errors
///
/// Returns an error if the input is not 64 hex characters.
pub fn parse_fingerprint(s: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(s.trim()).map_err(|_| ConfigError::InvalidOid(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidOid(s.to_string()))
}

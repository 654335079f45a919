// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! # ct_server
//!
//! The write path of a [Static CT API](https://c2sp.org/static-ct-api) log:
//! submissions come in over HTTP, get validated against a dynamic root pool,
//! batched and sequenced into an RFC 6962 Merkle tree published as static
//! tiles, and answered with SCTs. Reads are served directly from the object
//! storage holding the tiles; this server only ever writes.

pub mod antispam;
pub mod ccadb;
pub mod config;
pub mod ctlog;
pub mod gc;
pub mod http;
pub mod metrics;
pub mod rate_limit;
pub mod roots;
pub mod signer;
pub mod storage;

pub use config::LogConfig;
pub use ctlog::Log;

use std::time::{SystemTime, UNIX_EPOCH};
use tlog_tiles::UnixTimestamp;

/// Index and timestamp assigned to an entry by the sequencer.
pub type SequenceMetadata = (tlog_tiles::LeafIndex, UnixTimestamp);

/// The current time in milliseconds since the Unix epoch.
///
/// # Panics
///
/// Panics if the system clock is set before the Unix epoch.
pub fn now_millis() -> UnixTimestamp {
    u64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_millis(),
    )
    .unwrap()
}

// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! # tlog_tiles
//!
//! Merkle tree primitives for a tiled transparency log: record and node
//! hashes, the stored-hash index space, tree heads, inclusion and consistency
//! proofs, fixed-height tiles with their coordinate paths, and the checkpoint
//! (signed tree head) text format of <https://c2sp.org/tlog-checkpoint>.

pub mod checkpoint;
pub mod tile;
pub mod tlog;

pub use checkpoint::*;
pub use tile::*;
pub use tlog::*;

/// Unix timestamp in milliseconds since the epoch, ignoring leap seconds.
pub type UnixTimestamp = u64;

/// Index of a leaf in the log.
pub type LeafIndex = u64;

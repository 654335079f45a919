// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The checkpoint (tree head) text format of
//! <https://c2sp.org/tlog-checkpoint>.
//!
//! A checkpoint body looks like this:
//! ```text
//! example.com/origin
//! 923748
//! nND/nri//U0xuHUrYSy0HtMeal2vzD9V4k/BO79C+QeI=
//! ```
//!
//! It may be followed by extension lines, and is signed as a note
//! (see the `signed_note` crate).

use crate::tlog::Hash;
use std::fmt;

/// Maximum checkpoint body size we are willing to parse.
const MAX_CHECKPOINT_SIZE: usize = 1_000_000;

/// A parsed checkpoint body.
#[derive(PartialEq, Debug)]
pub struct Checkpoint {
    origin: String,
    size: u64,
    hash: Hash,
    // Empty, or a sequence of non-empty newline-terminated lines.
    extension: String,
}

/// An error returned when a checkpoint body is not well-formed.
#[derive(Debug, PartialEq)]
pub struct MalformedCheckpointError;

impl fmt::Display for MalformedCheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed checkpoint")
    }
}

impl std::error::Error for MalformedCheckpointError {}

impl Checkpoint {
    /// Returns a new checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the origin is empty or the extension is not a
    /// sequence of non-empty newline-terminated lines.
    pub fn new(
        origin: &str,
        size: u64,
        hash: Hash,
        extension: &str,
    ) -> Result<Self, MalformedCheckpointError> {
        if origin.is_empty() {
            return Err(MalformedCheckpointError);
        }
        let mut rest = extension;
        while !rest.is_empty() {
            match rest.split_once('\n') {
                Some((line, after)) if !line.is_empty() => rest = after,
                _ => return Err(MalformedCheckpointError),
            }
        }
        Ok(Self {
            origin: origin.to_string(),
            size,
            hash,
            extension: extension.to_string(),
        })
    }

    /// Returns the checkpoint's origin.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Returns the tree size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the root hash.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Returns the extension lines.
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Parses a checkpoint body. The input must consist of exactly the
    /// origin line, a decimal tree size, a base64 root hash, and any
    /// extension lines, each newline-terminated.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is malformed.
    pub fn from_bytes(text: &[u8]) -> Result<Self, MalformedCheckpointError> {
        if text.len() > MAX_CHECKPOINT_SIZE || text.last() != Some(&b'\n') {
            return Err(MalformedCheckpointError);
        }
        let text = std::str::from_utf8(text).map_err(|_| MalformedCheckpointError)?;
        let mut lines = text[..text.len() - 1].split('\n');

        let origin = lines.next().ok_or(MalformedCheckpointError)?;
        let size_str = lines.next().ok_or(MalformedCheckpointError)?;
        let hash_str = lines.next().ok_or(MalformedCheckpointError)?;

        let size = size_str
            .parse::<u64>()
            .map_err(|_| MalformedCheckpointError)?;
        // Reject non-canonical encodings like leading zeros or a plus sign.
        if size_str != size.to_string() {
            return Err(MalformedCheckpointError);
        }
        let hash = Hash::parse_hash(hash_str).map_err(|_| MalformedCheckpointError)?;

        let mut extension = String::new();
        for line in lines {
            if line.is_empty() {
                return Err(MalformedCheckpointError);
            }
            extension.push_str(line);
            extension.push('\n');
        }

        Self::new(origin, size, hash, &extension)
    }

    /// Returns the encoded checkpoint body, ending in a newline.
    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "{}\n{}\n{}\n{}",
            self.origin, self.size, self.hash, self.extension
        )
        .into()
    }
}

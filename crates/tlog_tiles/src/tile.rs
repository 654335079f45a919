// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Fixed-height tiles over the stored-hash index space.
//!
//! A tile at level `L` offset `N` lists up to 256 consecutive hashes at tree
//! level `8*L`, starting at offset `N*256`. A complete tile lists 256 hashes;
//! a partial tile lists fewer and is published under a `.p/<W>` path suffix.
//! A tile represents the entire subtree of height 8 with those hashes as
//! leaves, so hashes at intermediate tree levels are reconstructed by
//! hashing within the tile.
//!
//! Tile coordinates are encoded as paths of the form `tile/<L>/<NNN>[.p/<W>]`
//! per <https://c2sp.org/static-ct-api#merkle-tree>, with the (possibly very
//! large) `N` split into 3-digit path elements, all but the last prefixed
//! with `x` (e.g. `N` = 1234067 encodes as `x001/x234/067`). Entry bundles
//! use the same coordinate scheme under `tile/data/`.

use crate::tlog::{node_hash, split_stored_hash_index, stored_hash_index, Hash, HashReader, TlogError, HASH_SIZE};
use std::fmt;
use std::str::FromStr;

// Limits any one directory to at most 3000 children (xNNN, NNN, and NNN.p).
const PATH_BASE: u64 = 1000;

/// A tile coordinate, optionally the data (entry bundle) variant.
#[derive(Debug, Eq, Hash, PartialEq, Default, Clone, Copy)]
pub struct TlogTile {
    level: u8,
    level_index: u64,
    width: u16,
    data: bool,
}

/// An error returned when parsing an invalid tile path.
#[derive(Debug, PartialEq)]
pub struct BadPathError(pub String);

impl fmt::Display for BadPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed tile path: {}", self.0)
    }
}

impl std::error::Error for BadPathError {}

impl TlogTile {
    /// Fixed tile height per <https://c2sp.org/static-ct-api#merkle-tree>.
    pub const HEIGHT: u8 = 8;

    /// Number of hashes in a complete tile.
    pub const FULL_WIDTH: u16 = 1 << Self::HEIGHT;

    /// Returns a new tile with the given coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the parameters are outside their valid ranges.
    pub fn new(level: u8, level_index: u64, width: u16, data: bool) -> Self {
        assert!(
            level < 64 && (1..=Self::FULL_WIDTH).contains(&width),
            "invalid tile"
        );
        assert!(!data || level == 0, "data tiles only exist at level 0");
        Self {
            level,
            level_index,
            width,
            data,
        }
    }

    /// Returns the tile's level.
    pub fn level(&self) -> u8 {
        self.level
    }

    /// Returns the tile's index within its level.
    pub fn level_index(&self) -> u64 {
        self.level_index
    }

    /// Returns the tile's width.
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Returns whether this is a data (entry bundle) tile.
    pub fn is_data(&self) -> bool {
        self.data
    }

    /// Returns whether this is a partial tile.
    pub fn is_partial(&self) -> bool {
        self.width < Self::FULL_WIDTH
    }

    /// Returns the data-tile variant of this level-0 tile, with the same
    /// coordinates.
    ///
    /// # Panics
    ///
    /// Panics if called on a tile above level 0.
    pub fn with_data(self) -> Self {
        Self::new(0, self.level_index, self.width, true)
    }

    /// Returns the coordinates of the tiles that must be published when the
    /// tree grows from `old_tree_size` to `new_tree_size`, bottom level
    /// first, in order within each level. No tiles are needed for a tree of
    /// size zero.
    pub fn new_tiles(old_tree_size: u64, new_tree_size: u64) -> Vec<Self> {
        let h = u32::from(Self::HEIGHT);
        let mut tiles = Vec::new();
        let mut level = 0u8;
        while u32::from(level) * h < 64 && new_tree_size >> (u32::from(level) * h) > 0 {
            let old_n = old_tree_size >> (u32::from(level) * h);
            let new_n = new_tree_size >> (u32::from(level) * h);
            if old_n != new_n {
                for n in (old_n >> h)..(new_n >> h) {
                    tiles.push(Self::new(level, n, Self::FULL_WIDTH, false));
                }
                let n = new_n >> h;
                let w = u16::try_from(new_n - (n << h)).unwrap();
                if w > 0 {
                    tiles.push(Self::new(level, n, w, false));
                }
            }
            level += 1;
        }
        tiles
    }

    /// Returns the least-width tile storing the given stored-hash index.
    pub fn from_index(index: u64) -> Self {
        Self::from_index_with_range(index).0
    }

    // Returns the tile storing the given stored-hash index, along with the
    // byte range within the tile data from which the hash at that index is
    // reconstructed with `subtree_hash`.
    fn from_index_with_range(index: u64) -> (Self, usize, usize) {
        let h = u32::from(Self::HEIGHT);
        let (mut level, mut n) = split_stored_hash_index(index);
        let t_level = level / Self::HEIGHT;
        level -= t_level * Self::HEIGHT;
        let t_index = n << level >> h;
        n -= t_index << h >> level;
        let width = u16::try_from((n + 1) << level).unwrap();
        let start = usize::try_from(n << level).unwrap() * HASH_SIZE;
        let end = usize::try_from((n + 1) << level).unwrap() * HASH_SIZE;
        (Self::new(t_level, t_index, width, false), start, end)
    }

    /// Returns the hash at the given stored-hash index, reconstructed from
    /// this tile's data.
    ///
    /// # Errors
    ///
    /// Returns an error if the index does not fall within this tile or
    /// `data` is shorter than the tile's width.
    pub fn hash_at_index(&self, data: &[u8], index: u64) -> Result<Hash, TlogError> {
        if self.data || data.len() < usize::from(self.width) * HASH_SIZE {
            return Err(TlogError::InvalidTile);
        }
        let (t, start, end) = Self::from_index_with_range(index);
        if self.level != t.level || self.level_index != t.level_index || self.width < t.width {
            return Err(TlogError::InvalidTile);
        }
        Ok(Self::subtree_hash(&data[start..end]))
    }

    /// Computes the subtree hash of the `2^k` consecutive hashes in `data`.
    ///
    /// # Panics
    ///
    /// Panics if `data` is empty or not a power-of-two multiple of
    /// [`HASH_SIZE`].
    pub fn subtree_hash(data: &[u8]) -> Hash {
        assert!(!data.is_empty(), "bad math in tile subtree_hash");
        if data.len() == HASH_SIZE {
            return Hash(data.try_into().unwrap());
        }
        let mid = data.len() / 2;
        node_hash(Self::subtree_hash(&data[..mid]), Self::subtree_hash(&data[mid..]))
    }

    /// Returns the tile's coordinate path.
    pub fn path(&self) -> String {
        let mut n = self.level_index;
        let mut parts = vec![format!("{:03}", n % PATH_BASE)];
        while n >= PATH_BASE {
            n /= PATH_BASE;
            parts.push(format!("x{:03}", n % PATH_BASE));
        }
        parts.reverse();
        let n_str = parts.join("/");
        let p_str = if self.width == Self::FULL_WIDTH {
            String::new()
        } else {
            format!(".p/{}", self.width)
        };
        let l_str = if self.data {
            "data".to_string()
        } else {
            self.level.to_string()
        };
        format!("tile/{l_str}/{n_str}{p_str}")
    }

    /// Parses a tile coordinate path.
    ///
    /// # Errors
    ///
    /// Returns a [`BadPathError`] if the path is not the canonical encoding
    /// of a tile coordinate.
    pub fn from_path(path: &str) -> Result<Self, BadPathError> {
        let err = || BadPathError(path.into());
        const MAX_PATH_LEN: usize =
            "tile/data/x018/x446/x744/x073/x709/x551/615.p/255".len();
        if path.len() > MAX_PATH_LEN {
            return Err(err());
        }

        let mut components: Vec<&str> = path.split('/').collect();
        if components.len() < 3 || components[0] != "tile" {
            return Err(err());
        }

        let (level, data) = if components[1] == "data" {
            (0, true)
        } else {
            (u8::from_str(components[1]).map_err(|_| err())?, false)
        };
        if level > 63 {
            return Err(err());
        }

        let mut width = Self::FULL_WIDTH;
        #[allow(clippy::case_sensitive_file_extension_comparisons)]
        if components[components.len() - 2].ends_with(".p") {
            let w = u16::from_str(components[components.len() - 1]).map_err(|_| err())?;
            if !(1..Self::FULL_WIDTH).contains(&w) {
                return Err(err());
            }
            width = w;
            let len = components.len();
            components[len - 2] = components[len - 2].strip_suffix(".p").unwrap();
            components.pop();
        }

        let mut n = 0u64;
        for s in &components[2..] {
            let part = u64::from_str(s.trim_start_matches('x')).map_err(|_| err())?;
            if part >= PATH_BASE {
                return Err(err());
            }
            // Explicitly reject overflow rather than relying on the
            // round-trip check below to catch a wrapped value.
            n = n
                .checked_mul(PATH_BASE)
                .ok_or_else(err)?
                .checked_add(part)
                .ok_or_else(err)?;
        }

        let tile = Self::new(level, n, width, data);
        if path != tile.path() {
            return Err(err());
        }
        Ok(tile)
    }

    /// Reads this tile's hashes from `r`, returning the tile data.
    ///
    /// # Errors
    ///
    /// Returns an error if the reader cannot produce the requested hashes.
    ///
    /// # Panics
    ///
    /// Panics if the reader returns the wrong number of hashes.
    pub fn read_data<R: HashReader>(&self, r: &R) -> Result<Vec<u8>, TlogError> {
        let size = usize::from(self.width);
        let start = self.level_index << Self::HEIGHT;
        let mut indexes = Vec::with_capacity(size);
        for i in 0..size as u64 {
            indexes.push(stored_hash_index(self.level * Self::HEIGHT, start + i));
        }

        let hashes = r.read_hashes(&indexes)?;
        assert_eq!(hashes.len(), indexes.len(), "read_hashes returned invalid size");

        let mut tile_data = vec![0u8; size * HASH_SIZE];
        for (i, h) in hashes.iter().enumerate() {
            tile_data[i * HASH_SIZE..(i + 1) * HASH_SIZE].copy_from_slice(&h.0);
        }
        Ok(tile_data)
    }
}

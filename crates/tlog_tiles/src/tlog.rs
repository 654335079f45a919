// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Merkle tree math for an append-only log, following RFC 6962 hashing and
//! the stored-hash ordering of Crosby and Wallach's "Efficient Data
//! Structures for Tamper-Evident Logging" (section 3.3).
//!
//! Hashes for a tree of N records are kept in a dense linear array addressed
//! by [`stored_hash_index`]. Appending record `n` stores the record hash plus
//! one interior hash per completed subtree, so the array never needs to be
//! rewritten. All tree heads and proofs are computed through a [`HashReader`]
//! over that index space.

use base64::prelude::*;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Size of a [`Hash`] in bytes.
pub const HASH_SIZE: usize = 32;

/// A node or record hash in the tree.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Hash(pub [u8; HASH_SIZE]);

/// A verifiable inclusion or consistency proof: sibling subtree hashes,
/// bottom-up.
pub type Proof = Vec<Hash>;

/// Hash of the empty tree: SHA-256 of the empty string (RFC 6962 §2.1).
pub const EMPTY_HASH: Hash = Hash([
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
]);

#[derive(Error, Debug)]
pub enum TlogError {
    #[error("invalid transparency proof")]
    InvalidProof,
    #[error("malformed hash")]
    MalformedHash,
    #[error("invalid tile")]
    InvalidTile,
    #[error("indexes not in tree")]
    IndexesNotInTree,
    #[error("bad math")]
    BadMath,
    #[error(transparent)]
    InvalidBase64(#[from] base64::DecodeError),
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Hash {
    /// Parses a base64-encoded hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not base64 or does not decode to
    /// exactly [`HASH_SIZE`] bytes.
    pub fn parse_hash(s: &str) -> Result<Self, TlogError> {
        let data = BASE64_STANDARD.decode(s)?;
        Ok(Hash(data.try_into().map_err(|_| TlogError::MalformedHash)?))
    }
}

/// Returns the content hash for a record: `SHA-256(0x00 || data)`.
pub fn record_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// Returns the hash of an interior node: `SHA-256(0x01 || left || right)`.
pub fn node_hash(left: Hash, right: Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

// Returns k, the maximum power of 2 strictly smaller than n, and l = log₂ k.
// n must be at least 2.
fn maxpow2(n: u64) -> (u64, u8) {
    let l = u8::try_from((n - 1).ilog2()).unwrap();
    (1 << l, l)
}

/// Maps the tree coordinates `(level, n)`, the `n`'th hash at the given
/// level, to an index in the dense hash storage ordering.
pub fn stored_hash_index(level: u8, n: u64) -> u64 {
    // Level l's n'th hash is written right after level l+1's 2n+1'th hash.
    // Work down to the level-0 ordering and add the level back at the end.
    let mut n = n;
    for _ in 0..level {
        n = 2 * n + 1;
    }

    // Level 0's n'th hash is written at n + n/2 + n/4 + ...
    let mut i = 0;
    while n > 0 {
        i += n;
        n >>= 1;
    }

    i + u64::from(level)
}

/// The inverse of [`stored_hash_index`].
///
/// # Panics
///
/// Panics on internal math errors, which cannot happen for indexes produced
/// by [`stored_hash_index`].
pub fn split_stored_hash_index(index: u64) -> (u8, u64) {
    // stored_hash_index(0, n) < 2n, so the record we want is in
    // [index/2, index/2 + log₂(index)].
    let mut n = index / 2;
    let mut index_n = stored_hash_index(0, n);
    assert!(index_n <= index, "bad math");
    loop {
        // Each new record n adds 1 + trailing_zeros(n+1) hashes.
        let x = index_n + 1 + u64::from((n + 1).trailing_zeros());
        if x > index {
            break;
        }
        n += 1;
        index_n = x;
    }
    // The hash we want was committed with record n, as one of
    // (0, n), (1, n/2), (2, n/4), ...
    let level = u8::try_from(index - index_n).unwrap();
    (level, n >> level)
}

/// Returns the number of stored hashes expected for a tree of `n` records.
pub fn stored_hash_count(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut num_hash = stored_hash_index(0, n - 1) + 1;
    let mut i = n - 1;
    while i & 1 != 0 {
        num_hash += 1;
        i >>= 1;
    }
    num_hash
}

/// A `HashReader` reads hashes out of the stored-hash index space.
pub trait HashReader {
    /// Returns the hashes at the given stored-hash indexes, in order. May be
    /// faster when `indexes` is sorted.
    ///
    /// # Errors
    ///
    /// Implementations must either return exactly one hash per requested
    /// index or an error.
    fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError>;
}

/// Returns the hashes that must be stored when writing record `n` with hash
/// `h`, starting at `stored_hash_index(0, n)`: the record hash followed by
/// one interior hash per subtree completed by this record.
///
/// # Errors
///
/// Returns an error if the reader fails to produce the earlier hashes needed
/// to close completed subtrees.
///
/// # Panics
///
/// Panics if the reader returns the wrong number of hashes.
pub fn stored_hashes_for_record_hash<R: HashReader>(
    n: u64,
    h: Hash,
    r: &R,
) -> Result<Vec<Hash>, TlogError> {
    let mut hashes = vec![h];

    // Each trailing 1 bit in n+1 completes a subtree and consumes a hash from
    // an adjacent subtree to its left.
    let m = u8::try_from((n + 1).trailing_zeros()).unwrap();
    let mut indexes = vec![0u64; m.into()];
    for i in 0..m {
        // n >> i is always odd here.
        indexes[usize::from(m - 1 - i)] = stored_hash_index(i, (n >> i) - 1);
    }

    let old = r.read_hashes(&indexes)?;
    assert_eq!(old.len(), indexes.len(), "bad read_hashes implementation");

    let mut h = h;
    for i in 0..m {
        h = node_hash(old[usize::from(m - 1 - i)], h);
        hashes.push(h);
    }

    Ok(hashes)
}

/// [`stored_hashes_for_record_hash`] over the record data itself.
///
/// # Errors
///
/// See [`stored_hashes_for_record_hash`].
pub fn stored_hashes<R: HashReader>(n: u64, data: &[u8], r: &R) -> Result<Vec<Hash>, TlogError> {
    stored_hashes_for_record_hash(n, record_hash(data), r)
}

// Appends the stored-hash indexes of the maximal complete subtrees covering
// records [lo, hi) to `need`. See RFC 6962 §2.1.
fn subtree_index(mut lo: u64, hi: u64, need: &mut Vec<u64>) {
    while lo < hi {
        let (k, level) = maxpow2(hi - lo + 1);
        assert_eq!(lo & (k - 1), 0, "bad math in subtree_index");
        need.push(stored_hash_index(level, lo >> level));
        lo += k;
    }
}

// Computes the hash of the subtree covering records [lo, hi), consuming from
// the front of `hashes` the values read for subtree_index(lo, hi).
fn subtree_hash(mut lo: u64, hi: u64, hashes: &mut &[Hash]) -> Hash {
    let mut num_tree = 0usize;
    while lo < hi {
        let (k, _) = maxpow2(hi - lo + 1);
        num_tree += 1;
        lo += k;
    }
    assert!(hashes.len() >= num_tree, "bad index math in subtree_hash");

    // The left-most subtree hash is the most significant; fold right-to-left.
    let mut h = hashes[num_tree - 1];
    for i in (0..num_tree - 1).rev() {
        h = node_hash(hashes[i], h);
    }
    *hashes = &hashes[num_tree..];
    h
}

/// Computes the root hash of the tree with `n` records, reading at most
/// `1 + log₂ n` stored hashes.
///
/// # Errors
///
/// Returns an error if the reader cannot produce the requested hashes.
pub fn tree_hash<R: HashReader>(n: u64, r: &R) -> Result<Hash, TlogError> {
    if n == 0 {
        return Ok(EMPTY_HASH);
    }
    let mut indexes = Vec::new();
    subtree_index(0, n, &mut indexes);
    let hashes = r.read_hashes(&indexes)?;
    assert_eq!(hashes.len(), indexes.len(), "bad read_hashes implementation");
    let mut rest: &[Hash] = &hashes;
    let h = subtree_hash(0, n, &mut rest);
    assert!(rest.is_empty(), "bad index math in tree_hash");
    Ok(h)
}

// Appends the indexes needed to prove that record n is contained in the
// subtree covering records [lo, hi).
fn leaf_proof_index(lo: u64, hi: u64, n: u64, need: &mut Vec<u64>) {
    assert!(lo <= n && n < hi, "bad math in leaf_proof_index");
    if lo + 1 == hi {
        return;
    }
    let (k, _) = maxpow2(hi - lo);
    if n < lo + k {
        leaf_proof_index(lo, lo + k, n, need);
        subtree_index(lo + k, hi, need);
    } else {
        subtree_index(lo, lo + k, need);
        leaf_proof_index(lo + k, hi, n, need);
    }
}

// Constructs the proof that record n is contained in the subtree covering
// records [lo, hi), consuming the hashes read for leaf_proof_index.
fn leaf_proof(lo: u64, hi: u64, n: u64, hashes: &mut &[Hash]) -> Proof {
    if lo + 1 == hi {
        return Vec::new();
    }
    let (k, _) = maxpow2(hi - lo);
    let (mut p, th) = if n < lo + k {
        let p = leaf_proof(lo, lo + k, n, hashes);
        let th = subtree_hash(lo + k, hi, hashes);
        (p, th)
    } else {
        let th = subtree_hash(lo, lo + k, hashes);
        let p = leaf_proof(lo + k, hi, n, hashes);
        (p, th)
    };
    p.push(th);
    p
}

/// Returns the proof that the tree of size `t` contains record `n`.
///
/// # Errors
///
/// Returns an error if `n >= t` or the reader cannot produce the requested
/// hashes.
pub fn prove_record<R: HashReader>(t: u64, n: u64, r: &R) -> Result<Proof, TlogError> {
    if n >= t {
        return Err(TlogError::InvalidProof);
    }
    let mut indexes = Vec::new();
    leaf_proof_index(0, t, n, &mut indexes);
    if indexes.is_empty() {
        return Ok(Vec::new());
    }
    let hashes = r.read_hashes(&indexes)?;
    assert_eq!(hashes.len(), indexes.len(), "bad read_hashes implementation");
    let mut rest: &[Hash] = &hashes;
    let p = leaf_proof(0, t, n, &mut rest);
    assert!(rest.is_empty(), "bad index math in prove_record");
    Ok(p)
}

// Runs the proof over the subtree covering [lo, hi), returning the implied
// subtree hash.
fn run_record_proof(p: &[Hash], lo: u64, hi: u64, n: u64, leaf_hash: Hash) -> Result<Hash, TlogError> {
    if lo + 1 == hi {
        if !p.is_empty() {
            return Err(TlogError::InvalidProof);
        }
        return Ok(leaf_hash);
    }
    let Some((&sibling, p)) = p.split_last() else {
        return Err(TlogError::InvalidProof);
    };
    let (k, _) = maxpow2(hi - lo);
    if n < lo + k {
        let th = run_record_proof(p, lo, lo + k, n, leaf_hash)?;
        Ok(node_hash(th, sibling))
    } else {
        let th = run_record_proof(p, lo + k, hi, n, leaf_hash)?;
        Ok(node_hash(sibling, th))
    }
}

/// Verifies that `p` proves that the tree of size `t` with root hash `th`
/// contains record `n` with hash `h`.
///
/// # Errors
///
/// Returns [`TlogError::InvalidProof`] if verification fails.
pub fn check_record(p: &Proof, t: u64, th: Hash, n: u64, h: Hash) -> Result<(), TlogError> {
    if n >= t {
        return Err(TlogError::InvalidProof);
    }
    let th2 = run_record_proof(p, 0, t, n, h)?;
    if th2 == th {
        Ok(())
    } else {
        Err(TlogError::InvalidProof)
    }
}

// Appends the indexes needed for the consistency sub-proof related to the
// subtree covering records [lo, hi).
fn tree_proof_index(lo: u64, hi: u64, n: u64, need: &mut Vec<u64>) {
    assert!(lo < n && n <= hi, "bad math in tree_proof_index");
    if n == hi {
        if lo != 0 {
            subtree_index(lo, hi, need);
        }
        return;
    }
    let (k, _) = maxpow2(hi - lo);
    if n <= lo + k {
        tree_proof_index(lo, lo + k, n, need);
        subtree_index(lo + k, hi, need);
    } else {
        subtree_index(lo, lo + k, need);
        tree_proof_index(lo + k, hi, n, need);
    }
}

fn tree_proof(lo: u64, hi: u64, n: u64, hashes: &mut &[Hash]) -> Proof {
    if n == hi {
        if lo == 0 {
            return Vec::new();
        }
        return vec![subtree_hash(lo, hi, hashes)];
    }
    let (k, _) = maxpow2(hi - lo);
    let (mut p, th) = if n <= lo + k {
        let p = tree_proof(lo, lo + k, n, hashes);
        let th = subtree_hash(lo + k, hi, hashes);
        (p, th)
    } else {
        let th = subtree_hash(lo, lo + k, hashes);
        let p = tree_proof(lo + k, hi, n, hashes);
        (p, th)
    };
    p.push(th);
    p
}

/// Returns the proof that the tree of size `t` contains as a prefix the tree
/// of size `n`.
///
/// # Errors
///
/// Returns an error if `n` is zero, `n > t`, or the reader cannot produce
/// the requested hashes.
pub fn prove_tree<R: HashReader>(t: u64, n: u64, r: &R) -> Result<Proof, TlogError> {
    if n == 0 || n > t {
        return Err(TlogError::InvalidProof);
    }
    let mut indexes = Vec::new();
    tree_proof_index(0, t, n, &mut indexes);
    if indexes.is_empty() {
        return Ok(Vec::new());
    }
    let hashes = r.read_hashes(&indexes)?;
    assert_eq!(hashes.len(), indexes.len(), "bad read_hashes implementation");
    let mut rest: &[Hash] = &hashes;
    let p = tree_proof(0, t, n, &mut rest);
    assert!(rest.is_empty(), "bad index math in prove_tree");
    Ok(p)
}

// Returns (old tree hash, new tree hash) implied by the sub-proof for the
// subtree covering [lo, hi).
fn run_tree_proof(
    p: &[Hash],
    lo: u64,
    hi: u64,
    n: u64,
    old: Hash,
) -> Result<(Hash, Hash), TlogError> {
    if n == hi {
        if lo == 0 {
            if !p.is_empty() {
                return Err(TlogError::InvalidProof);
            }
            return Ok((old, old));
        }
        if p.len() != 1 {
            return Err(TlogError::InvalidProof);
        }
        return Ok((p[0], p[0]));
    }
    let Some((&sibling, p)) = p.split_last() else {
        return Err(TlogError::InvalidProof);
    };
    let (k, _) = maxpow2(hi - lo);
    if n <= lo + k {
        let (oh, th) = run_tree_proof(p, lo, lo + k, n, old)?;
        Ok((oh, node_hash(th, sibling)))
    } else {
        let (oh, th) = run_tree_proof(p, lo + k, hi, n, old)?;
        Ok((node_hash(sibling, oh), node_hash(sibling, th)))
    }
}

/// Verifies that `p` proves that the tree of size `t` with root hash `th`
/// contains as a prefix the tree of size `n` with root hash `h`.
///
/// # Errors
///
/// Returns [`TlogError::InvalidProof`] if verification fails.
pub fn check_tree(p: &Proof, t: u64, th: Hash, n: u64, h: Hash) -> Result<(), TlogError> {
    if n == 0 || n > t {
        return Err(TlogError::InvalidProof);
    }
    let (h2, th2) = run_tree_proof(p, 0, t, n, h)?;
    if th2 == th && h2 == h {
        Ok(())
    } else {
        Err(TlogError::InvalidProof)
    }
}

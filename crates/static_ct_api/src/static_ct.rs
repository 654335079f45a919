// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Log entry encodings, SCT signatures, and checkpoint signatures for the
//! [Static CT API](https://c2sp.org/static-ct-api) wire format.
//!
//! Entries appear in two encodings: the RFC 6962 `MerkleTreeLeaf`, which is
//! what gets hashed into the tree, and the entry-bundle `TileLeaf`, which
//! additionally carries the precertificate and the chain fingerprints so
//! that monitors can reconstruct submissions from the static tiles alone.

use crate::AddChainResponse;
use base64::prelude::*;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature as EcdsaSignature, SigningKey as EcdsaSigningKey,
        VerifyingKey as EcdsaVerifyingKey,
    },
    pkcs8::EncodePublicKey,
};
use rand::{seq::SliceRandom, Rng};
use sha2::{Digest, Sha256};
use signed_note::{
    key_id, Ed25519NoteSigner, Ed25519NoteVerifier, Note, NoteError, NoteSignature, NoteSigner,
    NoteVerifier, VerifierList,
};
use std::io::{Cursor, Read, Write};
use thiserror::Error;
use tlog_tiles::{record_hash, Checkpoint, Hash, HashReader, LeafIndex, TlogError, UnixTimestamp};

/// The anti-spam identity of a log entry: a SHA-256 over every field except
/// the timestamp, so resubmissions of the same logical leaf collide.
pub type IdentityHash = [u8; 32];

/// Issuer-related data carried only by precertificate entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecertData {
    /// SHA-256 of the issuing certificate's SubjectPublicKeyInfo.
    pub issuer_key_hash: [u8; 32],
    /// The submitted precertificate, DER.
    pub precertificate: Vec<u8>,
}

/// A validated submission that has not yet been assigned an index.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    /// The end-entity certificate, or for precerts the canonicalised
    /// TBSCertificate. At most 2^24-1 bytes.
    pub certificate: Vec<u8>,
    /// Present iff this is a precertificate entry.
    pub precert: Option<PrecertData>,
    /// SHA-256 fingerprints of the issuer chain, leaf excluded, root
    /// included.
    pub chain_fingerprints: Vec<[u8; 32]>,
}

impl PendingEntry {
    /// Returns whether this is a precertificate entry.
    pub fn is_precert(&self) -> bool {
        self.precert.is_some()
    }

    /// Computes the entry's identity hash. The timestamp is deliberately not
    /// an input: two submissions of the same logical certificate must
    /// deduplicate regardless of arrival time.
    ///
    /// # Panics
    ///
    /// Panics only if writing to the in-memory buffer fails, which cannot
    /// happen.
    pub fn identity_hash(&self) -> IdentityHash {
        let mut buffer = Vec::new();
        buffer
            .write_u8(u8::from(self.precert.is_some()))
            .unwrap();
        write_length_prefixed(&mut buffer, &self.certificate, 3).unwrap();
        if let Some(precert) = &self.precert {
            buffer.extend_from_slice(&precert.issuer_key_hash);
            write_length_prefixed(&mut buffer, &precert.precertificate, 3).unwrap();
        }
        write_length_prefixed(&mut buffer, &self.chain_fingerprints.concat(), 2).unwrap();
        Sha256::digest(&buffer).into()
    }

    /// Promotes this pending entry to a sequenced [`Entry`].
    pub fn into_entry(self, leaf_index: LeafIndex, timestamp: UnixTimestamp) -> Entry {
        Entry {
            pending: self,
            leaf_index,
            timestamp,
        }
    }
}

/// A sequenced log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub pending: PendingEntry,
    pub leaf_index: LeafIndex,
    pub timestamp: UnixTimestamp,
}

impl Entry {
    // Marshals the RFC 6962 TimestampedEntry, with empty extensions.
    fn timestamped_entry(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.write_u64::<BigEndian>(self.timestamp).unwrap();
        if let Some(precert) = &self.pending.precert {
            buffer.write_u16::<BigEndian>(1).unwrap(); // entry_type = precert_entry
            buffer.extend_from_slice(&precert.issuer_key_hash);
        } else {
            buffer.write_u16::<BigEndian>(0).unwrap(); // entry_type = x509_entry
        }
        write_length_prefixed(&mut buffer, &self.pending.certificate, 3).unwrap();
        write_length_prefixed(&mut buffer, &[], 2).unwrap(); // extensions
        buffer
    }

    /// Returns the marshaled [RFC 6962
    /// `MerkleTreeLeaf`](https://datatracker.ietf.org/doc/html/rfc6962#section-3.4).
    pub fn merkle_tree_leaf(&self) -> Vec<u8> {
        let mut buffer = vec![
            0, // version = v1
            0, // leaf_type = timestamped_entry
        ];
        buffer.extend(self.timestamped_entry());
        buffer
    }

    /// Returns the RFC 6962 leaf hash of this entry.
    pub fn merkle_leaf_hash(&self) -> Hash {
        record_hash(&self.merkle_tree_leaf())
    }

    /// Returns the marshaled [static-ct-api
    /// `TileLeaf`](https://c2sp.org/static-ct-api#log-entries) for entry
    /// bundles.
    pub fn bundle_leaf(&self) -> Vec<u8> {
        let mut buffer = self.timestamped_entry();
        if let Some(precert) = &self.pending.precert {
            write_length_prefixed(&mut buffer, &precert.precertificate, 3).unwrap();
        }
        write_length_prefixed(&mut buffer, &self.pending.chain_fingerprints.concat(), 2).unwrap();
        buffer
    }
}

/// An error from parsing an entry bundle.
#[derive(Error, Debug)]
pub enum BundleParseError {
    #[error("unknown entry type")]
    UnknownType,
    #[error("unexpected SCT extensions")]
    UnexpectedExtensions,
    #[error("malformed fingerprints")]
    MalformedFingerprints,
    #[error("entry not in bundle")]
    EntryNotInBundle,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// An iterator over the entries of an entry bundle.
pub struct BundleIterator {
    s: Cursor<Vec<u8>>,
    next_index: LeafIndex,
    remaining: usize,
}

impl BundleIterator {
    /// Returns an iterator that parses exactly `size` entries, assigning
    /// leaf indexes starting at `start_index`.
    pub fn new(bundle: Vec<u8>, size: usize, start_index: LeafIndex) -> Self {
        Self {
            s: Cursor::new(bundle),
            next_index: start_index,
            remaining: size,
        }
    }

    fn parse_next(&mut self) -> Result<Entry, BundleParseError> {
        let timestamp = self.s.read_u64::<BigEndian>()?;
        let entry_type = self.s.read_u16::<BigEndian>()?;
        let mut precert = None;
        let certificate;
        match entry_type {
            0 => {
                certificate = read_length_prefixed(&mut self.s, 3)?;
                let extensions = read_length_prefixed(&mut self.s, 2)?;
                if !extensions.is_empty() {
                    return Err(BundleParseError::UnexpectedExtensions);
                }
            }
            1 => {
                let mut issuer_key_hash = [0u8; 32];
                self.s.read_exact(&mut issuer_key_hash)?;
                certificate = read_length_prefixed(&mut self.s, 3)?;
                let extensions = read_length_prefixed(&mut self.s, 2)?;
                if !extensions.is_empty() {
                    return Err(BundleParseError::UnexpectedExtensions);
                }
                let precertificate = read_length_prefixed(&mut self.s, 3)?;
                precert = Some(PrecertData {
                    issuer_key_hash,
                    precertificate,
                });
            }
            _ => return Err(BundleParseError::UnknownType),
        }
        let fingerprints = read_length_prefixed(&mut self.s, 2)?;
        if fingerprints.len() % 32 != 0 {
            return Err(BundleParseError::MalformedFingerprints);
        }
        let chain_fingerprints = fingerprints
            .chunks_exact(32)
            .map(|c| c.try_into().unwrap())
            .collect();

        let leaf_index = self.next_index;
        self.next_index += 1;
        Ok(Entry {
            pending: PendingEntry {
                certificate,
                precert,
                chain_fingerprints,
            },
            leaf_index,
            timestamp,
        })
    }
}

impl Iterator for BundleIterator {
    type Item = Result<Entry, BundleParseError>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.parse_next())
    }
}

/// Extracts the timestamp of the entry at position `offset` within a bundle
/// without materialising any entry: each record's length-prefixed fields are
/// skipped in place.
///
/// # Errors
///
/// Returns an error if the bundle is malformed or holds fewer than
/// `offset + 1` entries.
pub fn bundle_timestamp_at(bundle: &[u8], offset: usize) -> Result<UnixTimestamp, BundleParseError> {
    let mut s = Cursor::new(bundle);
    for _ in 0..offset {
        s.seek_relative_u64(8)?; // timestamp
        let entry_type = s.read_u16::<BigEndian>()?;
        match entry_type {
            0 => {
                s.skip_length_prefixed(3)?; // certificate
                s.skip_length_prefixed(2)?; // extensions
            }
            1 => {
                s.seek_relative_u64(32)?; // issuer_key_hash
                s.skip_length_prefixed(3)?; // tbs_certificate
                s.skip_length_prefixed(2)?; // extensions
                s.skip_length_prefixed(3)?; // pre_certificate
            }
            _ => return Err(BundleParseError::UnknownType),
        }
        s.skip_length_prefixed(2)?; // fingerprints
    }
    if s.position() + 8 > bundle.len() as u64 {
        return Err(BundleParseError::EntryNotInBundle);
    }
    Ok(s.read_u64::<BigEndian>()?)
}

// Cursor helpers for skipping fields without reading them into buffers.
trait SkipExt {
    fn seek_relative_u64(&mut self, n: u64) -> Result<(), std::io::Error>;
    fn skip_length_prefixed(&mut self, length_bytes: usize) -> Result<(), std::io::Error>;
}

impl SkipExt for Cursor<&[u8]> {
    fn seek_relative_u64(&mut self, n: u64) -> Result<(), std::io::Error> {
        let target = self.position() + n;
        if target > self.get_ref().len() as u64 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
        self.set_position(target);
        Ok(())
    }

    fn skip_length_prefixed(&mut self, length_bytes: usize) -> Result<(), std::io::Error> {
        let length = self.read_uint::<BigEndian>(length_bytes)?;
        self.seek_relative_u64(length)
    }
}

/// Calculates the log ID (the SCT `id` field) from a verifying key:
/// SHA-256 of the key's SubjectPublicKeyInfo.
///
/// # Errors
///
/// Returns an error if the key cannot be encoded.
pub fn log_id_from_key(vkey: &EcdsaVerifyingKey) -> Result<[u8; 32], p256::pkcs8::spki::Error> {
    let pkix = vkey.to_public_key_der()?;
    Ok(Sha256::digest(&pkix).into())
}

/// Produces a signed add-(pre-)chain response for a sequenced entry.
///
/// Signatures are deterministic (RFC 6979), so resolving a duplicate against
/// the original timestamp and index reproduces the original SCT bytes.
///
/// # Errors
///
/// Returns an error if the signing key cannot be encoded.
pub fn signed_certificate_timestamp(
    signing_key: &EcdsaSigningKey,
    entry: &Entry,
) -> Result<AddChainResponse, p256::pkcs8::spki::Error> {
    // https://datatracker.ietf.org/doc/html/rfc6962#section-3.2
    let mut buffer = vec![
        0, // sct_version = v1
        0, // signature_type = certificate_timestamp
    ];
    buffer.extend(entry.timestamped_entry());
    let signature = sign_tls_digitally_signed(signing_key, &buffer);
    let id = log_id_from_key(signing_key.verifying_key())?.to_vec();

    Ok(AddChainResponse {
        sct_version: 0,
        id,
        timestamp: entry.timestamp,
        extensions: Vec::new(),
        signature,
    })
}

/// Verifies an SCT signature over the reconstructed entry, for tests and
/// diagnostics.
///
/// # Errors
///
/// Returns an error if the signature is malformed or does not verify.
pub fn verify_sct_signature(
    vkey: &EcdsaVerifyingKey,
    entry: &Entry,
    signature: &[u8],
) -> Result<(), signature::Error> {
    let mut s = Cursor::new(signature);
    let hash_alg = s.read_u8().map_err(signature::Error::from_source)?;
    let sig_alg = s.read_u8().map_err(signature::Error::from_source)?;
    if hash_alg != 4 || sig_alg != 3 {
        return Err(signature::Error::new());
    }
    let sig = read_length_prefixed(&mut s, 2).map_err(signature::Error::from_source)?;
    let sig = EcdsaSignature::from_der(&sig)?;

    let mut buffer = vec![0, 0];
    buffer.extend(entry.timestamped_entry());
    vkey.verify(&buffer, &sig)
}

/// Produces an encoded RFC 5246 `DigitallySigned` with ECDSA-P256-SHA256.
///
/// # Panics
///
/// Panics only if writing to the in-memory buffer fails, which cannot
/// happen.
pub fn sign_tls_digitally_signed(signing_key: &EcdsaSigningKey, msg: &[u8]) -> Vec<u8> {
    let sig: EcdsaSignature = signing_key.sign(msg);
    let sig_der = sig.to_der();
    let sig_bytes = sig_der.as_bytes();

    let mut digitally_signed = Vec::new();
    digitally_signed.push(4); // hash = sha256
    digitally_signed.push(3); // signature = ecdsa
    digitally_signed
        .write_u16::<BigEndian>(u16::try_from(sig_bytes.len()).unwrap())
        .unwrap();
    digitally_signed.extend_from_slice(sig_bytes);
    digitally_signed
}

/// A transparency log tree head with its timestamp.
#[derive(Default, Debug, Clone, Copy, PartialEq)]
pub struct TreeWithTimestamp {
    size: u64,
    hash: Hash,
    time: UnixTimestamp,
}

/// An error returned when signing or opening a checkpoint.
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("missing verifier signature")]
    MissingVerifierSignature,
    #[error("malformed checkpoint")]
    Malformed,
    #[error("timestamp is after current time")]
    InvalidTimestamp,
    #[error("checkpoint origin does not match")]
    OriginMismatch,
    #[error("unexpected checkpoint extension")]
    UnexpectedExtension,
    #[error(transparent)]
    Note(#[from] NoteError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TreeWithTimestamp {
    /// Returns a new tree head.
    pub fn new(size: u64, hash: Hash, time: UnixTimestamp) -> Self {
        Self { size, hash, time }
    }

    /// Computes the tree head for `size` records by reading hashes from `r`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hashes cannot be read.
    pub fn from_hash_reader<R: HashReader>(
        size: u64,
        r: &R,
        time: UnixTimestamp,
    ) -> Result<Self, TlogError> {
        let hash = tlog_tiles::tree_hash(size, r)?;
        Ok(Self { size, hash, time })
    }

    /// Returns the size of the tree.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the root hash of the tree.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Returns the timestamp of the tree head.
    pub fn time(&self) -> UnixTimestamp {
        self.time
    }

    /// Signs the tree head as a [checkpoint](https://c2sp.org/tlog-checkpoint):
    /// the RFC 6962 note signature first, then any witness cosignatures, plus
    /// grease signatures that clients must ignore.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(
        &self,
        origin: &str,
        signing_key: &EcdsaSigningKey,
        witnesses: &[&Ed25519NoteSigner],
        rng: &mut impl Rng,
    ) -> Result<Vec<u8>, CheckpointError> {
        let sth_bytes = serialize_sth_signature_input(self.time, self.size, &self.hash);
        let tree_head_signature = sign_tls_digitally_signed(signing_key, &sth_bytes);

        // struct {
        //     uint64 timestamp;
        //     TreeHeadSignature signature;
        // } RFC6962NoteSignature;
        let mut sig = Vec::new();
        sig.write_u64::<BigEndian>(self.time).unwrap();
        sig.extend_from_slice(&tree_head_signature);

        let verifier = Rfc6962Verifier::new(origin, signing_key.verifying_key())
            .map_err(|_| CheckpointError::Malformed)?;
        let rs = InjectedSigner { v: verifier, sig };
        // The primary signature comes first, then any witness cosignatures.
        let mut signers: Vec<&dyn NoteSigner> = Vec::with_capacity(witnesses.len() + 1);
        signers.push(&rs);
        for w in witnesses {
            signers.push(*w);
        }

        let checkpoint = Checkpoint::new(origin, self.size, self.hash, "")
            .map_err(|_| CheckpointError::Malformed)?;
        let mut note = Note::new(&checkpoint.to_bytes(), &[])?;
        note.add_sigs(&signers)?;
        // Trailing grease signatures enforce forward-compatible clients.
        note.append_signatures(&gen_grease_signatures(origin, rng));
        Ok(note.to_bytes())
    }
}

/// Opens and verifies a serialized checkpoint, returning the parsed
/// [`Checkpoint`] and the timestamp of its RFC 6962 signature. A witness
/// verifier, when provided, must also have signed.
///
/// # Errors
///
/// Returns an error if parsing or any required signature verification
/// fails, or if the timestamp is in the future.
pub fn open_checkpoint(
    origin: &str,
    vkey: &EcdsaVerifyingKey,
    witness: Option<&Ed25519NoteVerifier>,
    current_time: UnixTimestamp,
    b: &[u8],
) -> Result<(Checkpoint, UnixTimestamp), CheckpointError> {
    let v1 = Rfc6962Verifier::new(origin, vkey).map_err(|_| CheckpointError::Malformed)?;
    let mut verifiers: Vec<Box<dyn NoteVerifier>> = vec![Box::new(v1.clone())];
    if let Some(w) = witness {
        verifiers.push(Box::new(w.clone()));
    }
    let note = Note::from_bytes(b)?;
    let (verified_sigs, _) = note.verify(&VerifierList::new(verifiers))?;

    let mut timestamp: UnixTimestamp = 0;
    let mut v1_found = false;
    let mut witness_found = witness.is_none();
    for sig in &verified_sigs {
        if sig.id() == v1.key_id() {
            v1_found = true;
            timestamp = rfc6962_signature_timestamp(sig)?;
        } else if witness.is_some_and(|w| w.key_id() == sig.id()) {
            witness_found = true;
        }
    }
    if !v1_found || !witness_found {
        return Err(CheckpointError::MissingVerifierSignature);
    }

    let checkpoint =
        Checkpoint::from_bytes(note.text()).map_err(|_| CheckpointError::Malformed)?;
    if current_time < timestamp {
        return Err(CheckpointError::InvalidTimestamp);
    }
    if checkpoint.origin() != origin {
        return Err(CheckpointError::OriginMismatch);
    }
    if !checkpoint.extension().is_empty() {
        return Err(CheckpointError::UnexpectedExtension);
    }
    Ok((checkpoint, timestamp))
}

/// A [`NoteVerifier`] for RFC 6962 `TreeHeadSignature`s formatted per
/// <https://c2sp.org/static-ct-api#checkpoints>. The key ID is derived from
/// `0x05 || SHA-256(SPKI)` under the origin name.
#[derive(Clone)]
pub struct Rfc6962Verifier {
    name: String,
    id: u32,
    verifying_key: EcdsaVerifyingKey,
}

impl Rfc6962Verifier {
    /// Returns a new verifier for the given origin and key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key cannot be encoded.
    ///
    /// # Panics
    ///
    /// Panics if the origin is not a valid note key name; origins are
    /// validated at configuration time.
    pub fn new(name: &str, verifying_key: &EcdsaVerifyingKey) -> Result<Self, p256::pkcs8::spki::Error> {
        assert!(signed_note::is_key_name_valid(name), "invalid origin");
        let pkix = verifying_key.to_public_key_der()?;
        let key_hash = Sha256::digest(&pkix);
        let key_material = [&[0x05], key_hash.as_slice()].concat();
        let id = key_id(name, &key_material);
        Ok(Self {
            name: name.to_string(),
            id,
            verifying_key: *verifying_key,
        })
    }
}

impl NoteVerifier for Rfc6962Verifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_id(&self) -> u32 {
        self.id
    }

    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(checkpoint) = Checkpoint::from_bytes(msg) else {
            return false;
        };
        if !checkpoint.extension().is_empty() {
            return false;
        }
        let mut s = Cursor::new(sig);
        let Ok(timestamp) = s.read_u64::<BigEndian>() else {
            return false;
        };
        let Ok(hash_alg) = s.read_u8() else {
            return false;
        };
        let Ok(sig_alg) = s.read_u8() else {
            return false;
        };
        // Only SHA-256/ECDSA is permitted.
        if hash_alg != 4 || sig_alg != 3 {
            return false;
        }
        let Ok(signature) = read_length_prefixed(&mut s, 2) else {
            return false;
        };
        if s.position() != s.get_ref().len() as u64 {
            return false;
        }

        let sth_bytes =
            serialize_sth_signature_input(timestamp, checkpoint.size(), checkpoint.hash());
        let Ok(sig) = EcdsaSignature::from_der(&signature) else {
            return false;
        };
        self.verifying_key.verify(&sth_bytes, &sig).is_ok()
    }
}

// A NoteSigner carrying a precomputed signature, used to inject the
// timestamped RFC 6962 signature into the note.
struct InjectedSigner {
    v: Rfc6962Verifier,
    sig: Vec<u8>,
}

impl NoteSigner for InjectedSigner {
    fn name(&self) -> &str {
        self.v.name()
    }
    fn key_id(&self) -> u32 {
        self.v.key_id()
    }
    fn sign(&self, _msg: &[u8]) -> Result<Vec<u8>, signature::Error> {
        Ok(self.sig.clone())
    }
}

/// Reads the timestamp out of an `RFC6962NoteSignature`.
///
/// # Errors
///
/// Returns an error if the signature is shorter than eight bytes.
pub fn rfc6962_signature_timestamp(sig: &NoteSignature) -> Result<u64, std::io::Error> {
    let mut s = sig.signature();
    s.read_u64::<BigEndian>()
}

// Serializes the RFC 6962 §3.5 TreeHeadSignature input:
//
// digitally-signed struct {
//     Version version;
//     SignatureType signature_type = tree_hash;
//     uint64 timestamp;
//     uint64 tree_size;
//     opaque sha256_root_hash[32];
// } TreeHeadSignature;
fn serialize_sth_signature_input(timestamp: u64, tree_size: u64, root_hash: &Hash) -> Vec<u8> {
    let mut buffer = Vec::new();
    buffer.write_u8(0).unwrap(); // version = v1
    buffer.write_u8(1).unwrap(); // signature_type = tree_hash
    buffer.write_u64::<BigEndian>(timestamp).unwrap();
    buffer.write_u64::<BigEndian>(tree_size).unwrap();
    buffer.extend(root_hash.0);
    buffer
}

/// Produces unverifiable but well-formed signatures. Clients MUST ignore
/// unknown signatures, and including grease ones ensures they do.
fn gen_grease_signatures(origin: &str, rng: &mut impl Rng) -> Vec<NoteSignature> {
    let mut g1 = vec![0u8; 1 + rng.gen_range(0..100)];
    rng.fill(&mut g1[..]);

    let mut g2 = vec![0u8; 1 + rng.gen_range(0..100)];
    rng.fill(&mut g2[..]);
    let mut hasher = Sha256::new();
    hasher.update(b"grease\n");
    hasher.update([rng.gen::<u8>()]);
    let id = u32::from_be_bytes(hasher.finalize()[..4].try_into().unwrap());

    let mut signatures = vec![
        NoteSignature::new("grease.invalid".to_string(), rng.gen(), g1),
        NoteSignature::new(origin.to_string(), id, g2),
    ];
    signatures.shuffle(rng);
    signatures
}

// Reads a big-endian length-prefixed field.
pub(crate) fn read_length_prefixed<R: Read>(
    reader: &mut R,
    length_bytes: usize,
) -> Result<Vec<u8>, std::io::Error> {
    let length = reader.read_uint::<BigEndian>(length_bytes)?;
    let mut buffer = vec![0; usize::try_from(length).unwrap()];
    reader.read_exact(&mut buffer)?;
    Ok(buffer)
}

// Writes a big-endian length-prefixed field.
pub(crate) fn write_length_prefixed<W: Write>(
    writer: &mut W,
    data: &[u8],
    length_bytes: usize,
) -> Result<usize, std::io::Error> {
    writer.write_uint::<BigEndian>(data.len() as u64, length_bytes)?;
    writer.write(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    fn test_signing_key() -> EcdsaSigningKey {
        EcdsaSigningKey::from_slice(&Sha256::digest(b"sct signing key")).unwrap()
    }

    fn x509_entry(i: u64, timestamp: UnixTimestamp) -> Entry {
        PendingEntry {
            certificate: format!("certificate {i}").into_bytes(),
            precert: None,
            chain_fingerprints: vec![[i as u8; 32], [0xaa; 32]],
        }
        .into_entry(i, timestamp)
    }

    fn precert_entry(i: u64, timestamp: UnixTimestamp) -> Entry {
        PendingEntry {
            certificate: format!("tbs certificate {i}").into_bytes(),
            precert: Some(PrecertData {
                issuer_key_hash: [0x42; 32],
                precertificate: format!("precertificate {i}").into_bytes(),
            }),
            chain_fingerprints: vec![[i as u8; 32]],
        }
        .into_entry(i, timestamp)
    }

    #[test]
    fn test_identity_hash_ignores_timestamp() {
        let a = x509_entry(7, 1_000);
        let b = x509_entry(7, 2_000);
        assert_eq!(a.pending.identity_hash(), b.pending.identity_hash());

        let c = x509_entry(8, 1_000);
        assert_ne!(a.pending.identity_hash(), c.pending.identity_hash());

        // Cert and precert entries with the same certificate bytes must not
        // collide.
        let p = precert_entry(7, 1_000);
        assert_ne!(a.pending.identity_hash(), p.pending.identity_hash());
    }

    #[test]
    fn test_merkle_tree_leaf_layout() {
        let entry = x509_entry(1, 0x0102_0304);
        let leaf = entry.merkle_tree_leaf();
        assert_eq!(leaf[0], 0); // version
        assert_eq!(leaf[1], 0); // leaf_type
        assert_eq!(&leaf[2..10], &0x0102_0304u64.to_be_bytes()); // timestamp
        assert_eq!(&leaf[10..12], &[0, 0]); // entry_type = x509_entry
        let cert_len = usize::from(leaf[12]) << 16 | usize::from(leaf[13]) << 8 | usize::from(leaf[14]);
        assert_eq!(cert_len, entry.pending.certificate.len());
        // Trailing extensions are empty.
        assert_eq!(&leaf[leaf.len() - 2..], &[0, 0]);
    }

    #[test]
    fn test_bundle_round_trip() {
        let entries: Vec<Entry> = (0..5)
            .map(|i| {
                if i % 2 == 0 {
                    x509_entry(i, 1_700_000_000_000 + i)
                } else {
                    precert_entry(i, 1_700_000_000_000 + i)
                }
            })
            .collect();
        let mut bundle = Vec::new();
        for entry in &entries {
            bundle.extend(entry.bundle_leaf());
        }

        let parsed: Vec<Entry> = BundleIterator::new(bundle.clone(), entries.len(), 0)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(parsed, entries);

        // The fast timestamp path must agree with the full parse.
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(bundle_timestamp_at(&bundle, i).unwrap(), entry.timestamp);
        }
        bundle_timestamp_at(&bundle, entries.len()).unwrap_err();
    }

    #[test]
    fn test_sct_round_trip() {
        let key = test_signing_key();
        let entry = x509_entry(3, 1_700_000_000_000);
        let sct = signed_certificate_timestamp(&key, &entry).unwrap();

        assert_eq!(sct.sct_version, 0);
        assert_eq!(sct.timestamp, entry.timestamp);
        assert!(sct.extensions.is_empty());
        assert_eq!(
            sct.id,
            log_id_from_key(key.verifying_key()).unwrap().to_vec()
        );
        verify_sct_signature(key.verifying_key(), &entry, &sct.signature).unwrap();

        // A different timestamp must not verify against the same signature.
        let mut other = entry.clone();
        other.timestamp += 1;
        verify_sct_signature(key.verifying_key(), &other, &sct.signature).unwrap_err();
    }

    #[test]
    fn test_sct_determinism() {
        let key = test_signing_key();
        let entry = precert_entry(9, 1_700_000_000_000);
        let a = signed_certificate_timestamp(&key, &entry).unwrap();
        let b = signed_certificate_timestamp(&key, &entry).unwrap();
        assert_eq!(a.signature, b.signature);
    }

    #[test]
    fn test_checkpoint_sign_and_open() {
        let origin = "example.com/test-log";
        let key = test_signing_key();
        let (witness_skey, witness_vkey) =
            signed_note::generate_key(&mut rand::rngs::OsRng, origin);
        let witness_signer = Ed25519NoteSigner::new(&witness_skey).unwrap();
        let witness_verifier = Ed25519NoteVerifier::new(&witness_vkey).unwrap();

        let tree = TreeWithTimestamp::new(42, record_hash(b"root"), 1_700_000_000_000);
        let signed = tree
            .sign(origin, &key, &[&witness_signer], &mut thread_rng())
            .unwrap();

        let (checkpoint, timestamp) = open_checkpoint(
            origin,
            key.verifying_key(),
            Some(&witness_verifier),
            1_800_000_000_000,
            &signed,
        )
        .unwrap();
        assert_eq!(checkpoint.origin(), origin);
        assert_eq!(checkpoint.size(), 42);
        assert_eq!(checkpoint.hash(), &record_hash(b"root"));
        assert_eq!(timestamp, 1_700_000_000_000);

        // The primary signature is the first signature line.
        let note = Note::from_bytes(&signed).unwrap();
        let primary = Rfc6962Verifier::new(origin, key.verifying_key()).unwrap();
        assert_eq!(note.signatures()[0].id(), primary.key_id());

        // Wrong origin fails.
        open_checkpoint(
            "example.com/other",
            key.verifying_key(),
            Some(&witness_verifier),
            1_800_000_000_000,
            &signed,
        )
        .unwrap_err();

        // Timestamps from the future fail.
        open_checkpoint(
            origin,
            key.verifying_key(),
            Some(&witness_verifier),
            1_600_000_000_000,
            &signed,
        )
        .unwrap_err();
    }

    #[test]
    fn test_checkpoint_without_witness() {
        let origin = "example.com/test-log";
        let key = test_signing_key();
        let tree = TreeWithTimestamp::new(0, tlog_tiles::EMPTY_HASH, 1_700_000_000_000);
        let signed = tree.sign(origin, &key, &[], &mut thread_rng()).unwrap();
        let (checkpoint, _) = open_checkpoint(
            origin,
            key.verifying_key(),
            None,
            1_800_000_000_000,
            &signed,
        )
        .unwrap();
        assert_eq!(checkpoint.size(), 0);
    }
}

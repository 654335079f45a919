// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Notes as specified by [C2SP signed-note](https://c2sp.org/signed-note).
//!
//! A note is a text ending in a newline, signed by one or more server keys.
//! The signed encoding is the text, a blank line, then one signature line per
//! signature: an em dash (U+2014), a space, the server key name, a space, and
//! the base64 encoding of the 4-byte big-endian key ID followed by the
//! signature bytes.
//!
//! A server key is identified by a name (non-empty UTF-8 without Unicode
//! spaces or plus signs) and a 32-bit key ID computed as recommended by the
//! spec:
//! ```text
//! key ID = SHA-256(key name || 0x0A || algorithm || public key)[:4]
//! ```
//!
//! The one standard key type is Ed25519 (algorithm 1), with verifier keys
//! encoded as `<name>+<id>+<keydata>` and signer keys encoded as
//! `PRIVATE+KEY+<name>+<id>+<keydata>`. Other signature schemes (such as the
//! RFC 6962 tree-head signatures used by CT checkpoints) plug in through the
//! [`NoteSigner`] and [`NoteVerifier`] traits.
//!
//! ```
//! use signed_note::{Ed25519NoteSigner, Ed25519NoteVerifier, Note, VerifierList};
//!
//! let (skey, vkey) = signed_note::generate_key(&mut rand_core::OsRng, "example.com/log");
//! let signer = Ed25519NoteSigner::new(&skey).unwrap();
//! let mut note = Note::new(b"hello, transparency\n", &[]).unwrap();
//! note.add_sigs(&[&signer]).unwrap();
//!
//! let verifier = Ed25519NoteVerifier::new(&vkey).unwrap();
//! let (verified, _) = note
//!     .verify(&VerifierList::new(vec![Box::new(verifier)]))
//!     .unwrap();
//! assert_eq!(verified.len(), 1);
//! ```

use base64::prelude::*;
use ed25519_dalek::{
    Signer as _, SigningKey as Ed25519SigningKey, Verifier as _,
    VerifyingKey as Ed25519VerifyingKey,
};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAX_NOTE_SIZE: usize = 1_000_000;
const MAX_NOTE_SIGNATURES: usize = 100;

const ALG_ED25519: u8 = 1;

/// An error arising from parsing, signing, or verifying a note.
#[derive(Error, Debug)]
pub enum NoteError {
    #[error("malformed note")]
    Malformed,
    #[error("invalid signer")]
    InvalidSigner,
    #[error("signature failure for key {name}")]
    SignatureFailure { name: String },
    #[error("no verifiable signatures")]
    Unverified,
    #[error(transparent)]
    Signature(#[from] signature::Error),
}

/// An error returned when decoding an encoded verifier or signer key.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("malformed key")]
    Format,
    #[error("unknown key algorithm")]
    Alg,
    #[error("key ID mismatch")]
    Id,
}

/// A `NoteVerifier` verifies messages signed with one server key.
pub trait NoteVerifier {
    /// Returns the server name associated with the key.
    fn name(&self) -> &str;

    /// Returns the key ID.
    fn key_id(&self) -> u32;

    /// Reports whether `sig` is a valid signature of `msg`.
    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool;
}

/// A `NoteSigner` signs messages with one server key.
pub trait NoteSigner {
    /// Returns the server name associated with the key.
    fn name(&self) -> &str;

    /// Returns the key ID.
    fn key_id(&self) -> u32;

    /// Returns a signature over `msg`.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, signature::Error>;
}

/// Computes the key ID for the given server name and algorithm-prefixed
/// public key, as recommended at <https://c2sp.org/signed-note#signatures>.
pub fn key_id(name: &str, key: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"\n");
    hasher.update(key);
    let digest = hasher.finalize();
    u32::from_be_bytes(digest[..4].try_into().unwrap())
}

/// Reports whether `name` is a valid server key name: non-empty, without
/// Unicode spaces or plus signs.
pub fn is_key_name_valid(name: &str) -> bool {
    !(name.is_empty() || name.chars().any(char::is_whitespace) || name.contains('+'))
}

/// Returns the encoded verifier key for an Ed25519 public key.
pub fn new_ed25519_verifier_key(name: &str, key: &Ed25519VerifyingKey) -> String {
    let pubkey = [&[ALG_ED25519], key.to_bytes().as_slice()].concat();
    format!(
        "{name}+{:08x}+{}",
        key_id(name, &pubkey),
        BASE64_STANDARD.encode(&pubkey)
    )
}

/// Generates an Ed25519 signer/verifier key pair for a named server. The
/// signer key must be kept secret.
pub fn generate_key<R: CryptoRngCore + ?Sized>(csprng: &mut R, name: &str) -> (String, String) {
    let signing_key = Ed25519SigningKey::generate(csprng);
    let pubkey = [
        &[ALG_ED25519],
        signing_key.verifying_key().to_bytes().as_slice(),
    ]
    .concat();
    let privkey = [&[ALG_ED25519], signing_key.to_bytes().as_slice()].concat();
    let id = key_id(name, &pubkey);
    (
        format!("PRIVATE+KEY+{name}+{id:08x}+{}", BASE64_STANDARD.encode(privkey)),
        format!("{name}+{id:08x}+{}", BASE64_STANDARD.encode(pubkey)),
    )
}

/// Verifier for the standard Ed25519 signature type.
#[derive(Clone, Debug)]
pub struct Ed25519NoteVerifier {
    name: String,
    id: u32,
    verifying_key: Ed25519VerifyingKey,
}

impl NoteVerifier for Ed25519NoteVerifier {
    fn name(&self) -> &str {
        &self.name
    }
    fn key_id(&self) -> u32 {
        self.id
    }
    fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Ok(sig_bytes) = <[u8; ed25519_dalek::SIGNATURE_LENGTH]>::try_from(sig) else {
            return false;
        };
        self.verifying_key
            .verify(msg, &ed25519_dalek::Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}

impl Ed25519NoteVerifier {
    /// Constructs a verifier from an encoded verifier key
    /// `<name>+<id>+<keydata>`.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the key is malformed, uses an unknown
    /// algorithm, or its ID does not match its contents.
    pub fn new(vkey: &str) -> Result<Self, KeyError> {
        let (name, rest) = vkey.split_once('+').ok_or(KeyError::Format)?;
        let (id16, key64) = rest.split_once('+').ok_or(KeyError::Format)?;

        let id = u32::from_str_radix(id16, 16).map_err(|_| KeyError::Format)?;
        let key = BASE64_STANDARD
            .decode(key64)
            .map_err(|_| KeyError::Format)?;

        if id16.len() != 8 || !is_key_name_valid(name) || key.is_empty() {
            return Err(KeyError::Format);
        }
        if id != key_id(name, &key) {
            return Err(KeyError::Id);
        }

        match key[0] {
            ALG_ED25519 => {
                let key_bytes: &[u8; ed25519_dalek::PUBLIC_KEY_LENGTH] =
                    &key[1..].try_into().map_err(|_| KeyError::Format)?;
                let verifying_key = Ed25519VerifyingKey::from_bytes(key_bytes)
                    .map_err(|_| KeyError::Format)?;
                Ok(Self {
                    name: name.to_owned(),
                    id,
                    verifying_key,
                })
            }
            _ => Err(KeyError::Alg),
        }
    }
}

/// Signer for the standard Ed25519 signature type.
#[derive(Clone, Debug)]
pub struct Ed25519NoteSigner {
    name: String,
    id: u32,
    signing_key: Ed25519SigningKey,
}

impl NoteSigner for Ed25519NoteSigner {
    fn name(&self) -> &str {
        &self.name
    }
    fn key_id(&self) -> u32 {
        self.id
    }
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, signature::Error> {
        Ok(self.signing_key.try_sign(msg)?.to_vec())
    }
}

impl Ed25519NoteSigner {
    /// Constructs a signer from an encoded signer key
    /// `PRIVATE+KEY+<name>+<id>+<keydata>`.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if the key is malformed, uses an unknown
    /// algorithm, or its ID does not match the derived public key.
    pub fn new(skey: &str) -> Result<Self, KeyError> {
        let (priv1, rest) = skey.split_once('+').ok_or(KeyError::Format)?;
        let (priv2, rest) = rest.split_once('+').ok_or(KeyError::Format)?;
        let (name, rest) = rest.split_once('+').ok_or(KeyError::Format)?;
        let (id16, key64) = rest.split_once('+').ok_or(KeyError::Format)?;

        let id = u32::from_str_radix(id16, 16).map_err(|_| KeyError::Format)?;
        let key = BASE64_STANDARD
            .decode(key64)
            .map_err(|_| KeyError::Format)?;

        if priv1 != "PRIVATE"
            || priv2 != "KEY"
            || id16.len() != 8
            || !is_key_name_valid(name)
            || key.is_empty()
        {
            return Err(KeyError::Format);
        }

        match key[0] {
            ALG_ED25519 => {
                let signing_key =
                    Ed25519SigningKey::try_from(&key[1..]).map_err(|_| KeyError::Format)?;
                // The ID commits to the public key; verify it after deriving.
                let pubkey = [
                    &[ALG_ED25519],
                    signing_key.verifying_key().to_bytes().as_slice(),
                ]
                .concat();
                if id != key_id(name, &pubkey) {
                    return Err(KeyError::Id);
                }
                Ok(Self {
                    name: name.to_owned(),
                    id,
                    signing_key,
                })
            }
            _ => Err(KeyError::Alg),
        }
    }
}

/// A lookup table of verifiers by (name, key ID).
pub struct VerifierList(Vec<Box<dyn NoteVerifier>>);

impl VerifierList {
    /// Returns a new `VerifierList` from the given verifiers.
    pub fn new(verifiers: Vec<Box<dyn NoteVerifier>>) -> Self {
        Self(verifiers)
    }

    fn find(&self, name: &str, id: u32) -> Option<&dyn NoteVerifier> {
        self.0
            .iter()
            .map(AsRef::as_ref)
            .find(|v| v.name() == name && v.key_id() == id)
    }
}

/// A signature line on a note, possibly not yet verified.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteSignature {
    name: String,
    id: u32,
    // Raw signature bytes, after the 4-byte key ID.
    signature: Vec<u8>,
}

impl NoteSignature {
    /// Returns a new signature from its parts.
    pub fn new(name: String, id: u32, signature: Vec<u8>) -> Self {
        Self {
            name,
            id,
            signature,
        }
    }

    /// Parses a signature line of the form `— <name> <base64>`, without the
    /// trailing newline.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is malformed.
    pub fn from_line(line: &str) -> Result<Self, NoteError> {
        let rest = line.strip_prefix("\u{2014} ").ok_or(NoteError::Malformed)?;
        let (name, b64) = rest.split_once(' ').ok_or(NoteError::Malformed)?;
        if !is_key_name_valid(name) || b64.contains(' ') {
            return Err(NoteError::Malformed);
        }
        let sig = BASE64_STANDARD
            .decode(b64)
            .map_err(|_| NoteError::Malformed)?;
        if sig.len() < 5 {
            return Err(NoteError::Malformed);
        }
        let id = u32::from_be_bytes(sig[..4].try_into().unwrap());
        Ok(Self {
            name: name.to_string(),
            id,
            signature: sig[4..].to_vec(),
        })
    }

    /// Encodes the signature line, without the trailing newline.
    pub fn to_line(&self) -> String {
        let sig = [&self.id.to_be_bytes()[..], &self.signature].concat();
        format!("\u{2014} {} {}", self.name, BASE64_STANDARD.encode(sig))
    }

    /// Returns the server key name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the key ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the raw signature bytes (after the key ID).
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

/// A note: a text with signatures.
#[derive(Debug)]
pub struct Note {
    text: Vec<u8>,
    signatures: Vec<NoteSignature>,
}

// Reports whether the text is valid note text: non-empty, newline-terminated
// UTF-8 without control characters other than newline.
fn is_text_valid(text: &[u8]) -> bool {
    if text.is_empty() || text.last() != Some(&b'\n') {
        return false;
    }
    let Ok(text) = std::str::from_utf8(text) else {
        return false;
    };
    !text.chars().any(|c| c < ' ' && c != '\n')
}

impl Note {
    /// Returns a new note with the given text and signatures.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid note text.
    pub fn new(text: &[u8], signatures: &[NoteSignature]) -> Result<Self, NoteError> {
        if !is_text_valid(text) {
            return Err(NoteError::Malformed);
        }
        Ok(Self {
            text: text.to_vec(),
            signatures: signatures.to_vec(),
        })
    }

    /// Returns the note text, including the final newline.
    pub fn text(&self) -> &[u8] {
        &self.text
    }

    /// Returns the note's signatures.
    pub fn signatures(&self) -> &[NoteSignature] {
        &self.signatures
    }

    /// Parses a signed note: text, a blank line, and signature lines.
    ///
    /// # Errors
    ///
    /// Returns an error if the note is syntactically invalid, too large, or
    /// carries too many signatures.
    pub fn from_bytes(msg: &[u8]) -> Result<Self, NoteError> {
        if msg.len() > MAX_NOTE_SIZE || msg.last() != Some(&b'\n') {
            return Err(NoteError::Malformed);
        }
        let msg = std::str::from_utf8(msg).map_err(|_| NoteError::Malformed)?;
        let (text, sig_block) = msg.split_once("\n\n").ok_or(NoteError::Malformed)?;

        let text = format!("{text}\n");
        if !is_text_valid(text.as_bytes()) {
            return Err(NoteError::Malformed);
        }

        let sig_block = sig_block.strip_suffix('\n').ok_or(NoteError::Malformed)?;
        if sig_block.is_empty() {
            return Err(NoteError::Malformed);
        }
        let mut signatures = Vec::new();
        for line in sig_block.split('\n') {
            signatures.push(NoteSignature::from_line(line)?);
            if signatures.len() > MAX_NOTE_SIGNATURES {
                return Err(NoteError::Malformed);
            }
        }

        Ok(Self {
            text: text.into_bytes(),
            signatures,
        })
    }

    /// Signs the note text with each signer, appending the signatures.
    ///
    /// # Errors
    ///
    /// Returns an error if a signer has an invalid name or fails to sign.
    pub fn add_sigs(&mut self, signers: &[&dyn NoteSigner]) -> Result<(), NoteError> {
        for signer in signers {
            if !is_key_name_valid(signer.name()) {
                return Err(NoteError::InvalidSigner);
            }
            let sig = signer.sign(&self.text)?;
            self.signatures.push(NoteSignature::new(
                signer.name().to_string(),
                signer.key_id(),
                sig,
            ));
        }
        Ok(())
    }

    /// Appends already-encoded signatures, e.g. grease lines.
    pub fn append_signatures(&mut self, signatures: &[NoteSignature]) {
        self.signatures.extend_from_slice(signatures);
    }

    /// Verifies the note's signatures against the given verifiers, returning
    /// the verified signatures and those with no known verifier.
    ///
    /// # Errors
    ///
    /// Returns an error if a signature by a known key fails to verify, or if
    /// no signature verifies at all.
    pub fn verify(
        &self,
        known: &VerifierList,
    ) -> Result<(Vec<NoteSignature>, Vec<NoteSignature>), NoteError> {
        let mut verified = Vec::new();
        let mut unverified = Vec::new();
        for sig in &self.signatures {
            match known.find(sig.name(), sig.id()) {
                Some(verifier) => {
                    if !verifier.verify(&self.text, sig.signature()) {
                        return Err(NoteError::SignatureFailure {
                            name: sig.name().to_string(),
                        });
                    }
                    verified.push(sig.clone());
                }
                None => unverified.push(sig.clone()),
            }
        }
        if verified.is_empty() {
            return Err(NoteError::Unverified);
        }
        Ok((verified, unverified))
    }

    /// Encodes the note in signed-note format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.text.clone();
        out.push(b'\n');
        for sig in &self.signatures {
            out.extend(sig.to_line().as_bytes());
            out.push(b'\n');
        }
        out
    }
}

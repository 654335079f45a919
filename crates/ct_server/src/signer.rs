// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Signing key loading.
//!
//! The log's primary key signs both SCTs and checkpoints and must be ECDSA
//! P-256; anything else is rejected at startup rather than producing
//! signatures monitors cannot verify. Witness keys are Ed25519 note keys.

use p256::ecdsa::SigningKey as EcdsaSigningKey;
use p256::pkcs8::DecodePrivateKey;
use signed_note::Ed25519NoteSigner;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyLoadError {
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported key type: only ECDSA P-256 is accepted")]
    UnsupportedKeyType,
    #[error("malformed witness key")]
    MalformedWitnessKey,
}

/// Loads the log's ECDSA P-256 signing key from a PKCS#8 PEM file.
///
/// # Errors
///
/// Returns [`KeyLoadError::UnsupportedKeyType`] for any key that is not
/// ECDSA P-256, and I/O errors for unreadable files.
pub fn load_signing_key(path: &Path) -> Result<EcdsaSigningKey, KeyLoadError> {
    let pem = std::fs::read_to_string(path)?;
    // Decoding enforces the key type: a PKCS#8 blob for RSA, Ed25519, or a
    // different curve fails to parse as a P-256 key.
    EcdsaSigningKey::from_pkcs8_pem(&pem).map_err(|_| KeyLoadError::UnsupportedKeyType)
}

/// Loads an Ed25519 witness signer from a file holding an encoded note
/// signer key (`PRIVATE+KEY+<name>+<id>+<keydata>`).
///
/// # Errors
///
/// Returns an error for unreadable files or malformed keys.
pub fn load_witness_key(path: &Path) -> Result<Ed25519NoteSigner, KeyLoadError> {
    let encoded = std::fs::read_to_string(path)?;
    Ed25519NoteSigner::new(encoded.trim()).map_err(|_| KeyLoadError::MalformedWitnessKey)
}

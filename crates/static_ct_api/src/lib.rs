// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! # static_ct_api
//!
//! Wire formats of the [Static CT API](https://c2sp.org/static-ct-api): the
//! submission request and response bodies, log entries with their Merkle leaf
//! and entry-bundle encodings, precertificate canonicalisation, SCT
//! signatures, and the RFC 6962 checkpoint note signature scheme.

pub mod rfc6962;
pub mod static_ct;

pub use rfc6962::*;
pub use static_ct::*;

use thiserror::Error;

/// Errors produced while validating submissions or building log entries.
#[derive(Error, Debug)]
pub enum StaticCtError {
    #[error(transparent)]
    Der(#[from] der::Error),
    #[error(transparent)]
    Validation(#[from] x509_util::ValidationError),
    #[error("submitted to wrong endpoint: is_precert={is_precert}")]
    EndpointMismatch { is_precert: bool },
    #[error("invalid CT poison extension")]
    InvalidCtPoison,
    #[error("signature algorithm does not match TBS signature algorithm")]
    MismatchedSigAlg,
    #[error("precertificate chain carries no issuer")]
    MissingIssuer,
    #[error("precertificate signing certificate missing its issuer")]
    MissingPreIssuerIssuer,
}

// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Utilities for X.509 operations: certificate pools and the relaxed chain
//! validation used by CT logs.
//!
//! The validator here deliberately does not implement full RFC 5280 path
//! validation. Per RFC 6962 §3.1, a log verifies that the submitted chain is
//! a linear signature path from the end-entity certificate to one of the
//! log's accepted roots, with only the constraint checks that matter for a
//! public log: signature-algorithm policy, CA basic constraints and
//! keyCertSign on parents, the leaf's notAfter window and EKU set, and an
//! extension reject-list.

use der::{oid::ObjectIdentifier, Decode, Encode, Error as DerError};
use sha2::{Digest, Sha256};
use std::collections::{hash_map::Entry, HashMap};
use x509_cert::{
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
        SubjectKeyIdentifier,
    },
    Certificate, Version,
};
use x509_verify::VerifyingKey;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

type UnixTimestamp = u64;

// Signature algorithm OIDs subject to policy. See RFC 3279 §2.2 and the ISO
// variant of sha1WithRSAEncryption emitted by some legacy toolchains.
const OID_MD2_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.2");
const OID_MD5_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.4");
const OID_SHA1_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");
const OID_SHA1_WITH_RSA_ISO: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.29");
const OID_DSA_WITH_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10040.4.3");
const OID_ECDSA_WITH_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.1");

/// A `CertPool` is a set of certificates indexed for chain building.
#[derive(Default)]
pub struct CertPool {
    // Map from SHA-256 fingerprint to index in `certs`.
    by_fingerprint: HashMap<[u8; 32], usize>,
    // Map from subject name to indexes of certs with that subject.
    by_name: HashMap<String, Vec<usize>>,
    // Map from subject key identifier to indexes of certs with that SKI.
    by_subject_key_id: HashMap<Vec<u8>, Vec<usize>>,
    // Certificates in insertion order.
    pub certs: Vec<Certificate>,
}

impl CertPool {
    /// Constructs a `CertPool` from the given certificates, weeding out
    /// duplicates.
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate or its extensions cannot be
    /// DER-encoded.
    pub fn new(certs: Vec<Certificate>) -> Result<Self, DerError> {
        let mut pool = Self::default();
        for cert in certs {
            pool.add_cert(cert)?;
        }
        Ok(pool)
    }

    /// Adds a certificate to the pool if it is not already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate or its extensions cannot be
    /// DER-encoded.
    pub fn add_cert(&mut self, cert: Certificate) -> Result<(), DerError> {
        let fingerprint: [u8; 32] = Sha256::digest(cert.to_der()?).into();
        if let Entry::Vacant(e) = self.by_fingerprint.entry(fingerprint) {
            let idx = self.certs.len();
            e.insert(idx);
            self.by_name
                .entry(cert.tbs_certificate.subject.to_string())
                .or_default()
                .push(idx);
            if let Some((_, ski)) = cert.tbs_certificate.get::<SubjectKeyIdentifier>()? {
                self.by_subject_key_id
                    .entry(ski.to_der()?)
                    .or_default()
                    .push(idx);
            }
            self.certs.push(cert);
        }
        Ok(())
    }

    /// Adds certificates from PEM-encoded data, skipping non-certificate
    /// blocks.
    ///
    /// # Errors
    ///
    /// Returns an error on DER or PEM decoding issues.
    pub fn append_certs_from_pem(&mut self, input: &[u8]) -> Result<(), DerError> {
        for cert in Certificate::load_pem_chain(input)? {
            self.add_cert(cert)?;
        }
        Ok(())
    }

    /// Returns the number of certificates in the pool.
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Returns whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Reports whether the pool includes the given certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate cannot be DER-encoded.
    pub fn includes(&self, cert: &Certificate) -> Result<bool, DerError> {
        Ok(self
            .by_fingerprint
            .contains_key::<[u8; 32]>(&Sha256::digest(cert.to_der()?).into()))
    }

    /// Returns the certificate with the given SHA-256 fingerprint, if any.
    pub fn by_fingerprint(&self, fingerprint: &[u8; 32]) -> Option<&Certificate> {
        self.by_fingerprint
            .get(fingerprint)
            .and_then(|&idx| self.certs.get(idx))
    }

    /// Returns indexes of pool certificates that could have issued `cert`,
    /// matching by authority key identifier when present, falling back to
    /// the issuer name.
    ///
    /// # Errors
    ///
    /// Returns an error if extensions cannot be DER-encoded.
    pub fn find_potential_parents(&self, cert: &Certificate) -> Result<&[usize], DerError> {
        if let Some((_, aki)) = cert.tbs_certificate.get::<AuthorityKeyIdentifier>()? {
            if let Some(key_id) = aki.key_identifier {
                // Match against the SKI contents.
                if let Some(indexes) = self.by_subject_key_id.get(&key_id.to_der()?) {
                    return Ok(indexes);
                }
            }
        }
        if let Some(indexes) = self.by_name.get(&cert.tbs_certificate.issuer.to_string()) {
            return Ok(indexes);
        }
        Ok(&[])
    }
}

/// Converts certificates to their DER encodings.
///
/// # Errors
///
/// Returns an error if any certificate cannot be DER-encoded.
pub fn certs_to_bytes(certs: &[Certificate]) -> Result<Vec<Vec<u8>>, DerError> {
    certs.iter().map(der::Encode::to_der).collect()
}

/// Policy knobs for [`validate_chain`].
#[derive(Default, Clone)]
pub struct ChainPolicy {
    /// Accept SHA-1-based signature algorithms on chain links.
    pub accept_sha1: bool,
    /// Reject leaves that have expired as of the validation time.
    pub reject_expired: bool,
    /// Reject leaves that have not expired as of the validation time.
    pub reject_unexpired: bool,
    /// Inclusive lower bound on the leaf's notAfter, milliseconds.
    pub not_after_start: Option<UnixTimestamp>,
    /// Exclusive upper bound on the leaf's notAfter, milliseconds.
    pub not_after_limit: Option<UnixTimestamp>,
    /// If non-empty, the leaf must carry at least one of these EKUs.
    pub ext_key_usages: Vec<ObjectIdentifier>,
    /// The leaf must not carry any of these extension OIDs.
    pub reject_extensions: Vec<ObjectIdentifier>,
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error(transparent)]
    Der(#[from] der::Error),
    #[error("empty chain")]
    EmptyChain,
    #[error("invalid leaf certificate")]
    InvalidLeaf,
    #[error("leaf is expired")]
    Expired,
    #[error("leaf is unexpired")]
    Unexpired,
    #[error("leaf notAfter outside accepted range")]
    NotAfterOutOfRange,
    #[error("leaf is missing a required extended key usage")]
    MissingRequiredEku,
    #[error("leaf carries a rejected extension: {0}")]
    RejectedExtension(ObjectIdentifier),
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedSignatureAlgorithm(ObjectIdentifier),
    #[error("invalid link in chain")]
    InvalidLinkInChain,
    #[error("parent certificate cannot sign certificates")]
    ParentCannotSign,
    #[error("issuer not in root store: {issuer}")]
    NoPathToTrustedRoot { issuer: String },
}

/// Either an error from the validator itself, or from the caller's hook.
#[derive(thiserror::Error, Debug)]
pub enum HookOrValidationError<E: std::fmt::Display> {
    #[error("{0}")]
    Hook(E),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A chain accepted by [`validate_chain`], in `[leaf, issuer₁, …, root]`
/// order with the root resolved from the pool when the submitter omitted it.
#[derive(Debug)]
pub struct ValidatedChain {
    /// The end-entity certificate.
    pub leaf: Certificate,
    /// Every certificate above the leaf, root included.
    pub issuers: Vec<Certificate>,
    /// SHA-256 fingerprints of the DER encodings of `issuers`.
    pub issuer_fingerprints: Vec<[u8; 32]>,
}

// Applies the signature-algorithm policy for a certificate whose signature
// is about to be verified.
fn check_signature_algorithm(
    cert: &Certificate,
    policy: &ChainPolicy,
) -> Result<(), ValidationError> {
    let oid = cert.signature_algorithm.oid;
    match oid {
        OID_MD2_WITH_RSA | OID_MD5_WITH_RSA => {
            Err(ValidationError::UnsupportedSignatureAlgorithm(oid))
        }
        OID_SHA1_WITH_RSA | OID_SHA1_WITH_RSA_ISO | OID_DSA_WITH_SHA1 | OID_ECDSA_WITH_SHA1
            if !policy.accept_sha1 =>
        {
            Err(ValidationError::UnsupportedSignatureAlgorithm(oid))
        }
        _ => Ok(()),
    }
}

// Reports whether `issuer` may sign certificates: a version 3 issuer must
// assert the CA basic constraint, and a present KeyUsage must include
// keyCertSign (RFC 5280 §4.2.1.9 and §4.2.1.3).
fn check_parent_constraints(issuer: &Certificate) -> Result<(), ValidationError> {
    if issuer.tbs_certificate.version == Version::V3
        && issuer
            .tbs_certificate
            .get::<BasicConstraints>()?
            .is_none_or(|(_, bc)| !bc.ca)
    {
        return Err(ValidationError::ParentCannotSign);
    }
    if let Some((_, ku)) = issuer.tbs_certificate.get::<KeyUsage>()? {
        if !ku.0.contains(KeyUsages::KeyCertSign) {
            return Err(ValidationError::ParentCannotSign);
        }
    }
    Ok(())
}

// Reports whether `issuer`'s key verifies `child`'s signature.
fn is_link_valid(child: &Certificate, issuer: &Certificate) -> bool {
    if let Ok(key) = VerifyingKey::try_from(issuer) {
        key.verify_strict(child).is_ok()
    } else {
        false
    }
}

/// Validates a certificate chain against the pool and policy, then hands the
/// accepted chain to `hook` for domain-specific checks and construction of
/// the caller's result.
///
/// The chain walk is linear per RFC 6962: each certificate must be signed by
/// the next one, and the last certificate must be in the pool or directly
/// signed by a pool certificate, which is then taken as the root.
///
/// # Errors
///
/// Returns a [`ValidationError`] if the chain fails to validate, or the
/// hook's error wrapped in [`HookOrValidationError::Hook`].
pub fn validate_chain<T, E, F>(
    raw_chain: &[Vec<u8>],
    roots: &CertPool,
    policy: &ChainPolicy,
    now: UnixTimestamp,
    hook: F,
) -> Result<T, HookOrValidationError<E>>
where
    E: std::fmt::Display,
    F: FnOnce(ValidatedChain) -> Result<T, E>,
{
    if raw_chain.is_empty() {
        return Err(ValidationError::EmptyChain.into());
    }
    let leaf = Certificate::from_der(&raw_chain[0]).map_err(ValidationError::from)?;

    let not_after = u64::try_from(
        leaf.tbs_certificate
            .validity
            .not_after
            .to_unix_duration()
            .as_millis(),
    )
    .map_err(|_| ValidationError::InvalidLeaf)?;
    if policy.not_after_start.is_some_and(|start| start > not_after)
        || policy.not_after_limit.is_some_and(|limit| limit <= not_after)
    {
        return Err(ValidationError::NotAfterOutOfRange.into());
    }
    if policy.reject_expired && now > not_after {
        return Err(ValidationError::Expired.into());
    }
    if policy.reject_unexpired && now <= not_after {
        return Err(ValidationError::Unexpired.into());
    }

    if !policy.ext_key_usages.is_empty() {
        let has_required = leaf
            .tbs_certificate
            .get::<ExtendedKeyUsage>()
            .map_err(ValidationError::from)?
            .is_some_and(|(_, eku)| {
                eku.0
                    .iter()
                    .any(|usage| policy.ext_key_usages.contains(usage))
            });
        if !has_required {
            return Err(ValidationError::MissingRequiredEku.into());
        }
    }

    if let Some(exts) = &leaf.tbs_certificate.extensions {
        for ext in exts {
            if policy.reject_extensions.contains(&ext.extn_id) {
                return Err(ValidationError::RejectedExtension(ext.extn_id).into());
            }
        }
    }

    let mut issuers: Vec<Certificate> = raw_chain[1..]
        .iter()
        .map(|bytes| Certificate::from_der(bytes))
        .collect::<Result<_, _>>()
        .map_err(ValidationError::from)?;
    let mut issuer_fingerprints: Vec<[u8; 32]> = raw_chain[1..]
        .iter()
        .map(|der| Sha256::digest(der).into())
        .collect();

    // Walk up the chain, verifying that each certificate signs the previous.
    let mut to_verify = &leaf;
    for issuer in &issuers {
        check_signature_algorithm(to_verify, policy)?;
        check_parent_constraints(issuer)?;
        if !is_link_valid(to_verify, issuer) {
            return Err(ValidationError::InvalidLinkInChain.into());
        }
        to_verify = issuer;
    }

    // The last certificate is either an accepted root or chains directly to
    // one, which then completes the chain.
    if !roots.includes(to_verify).map_err(ValidationError::from)? {
        check_signature_algorithm(to_verify, policy)?;
        let found = roots
            .find_potential_parents(to_verify)
            .map_err(ValidationError::from)?
            .iter()
            .copied()
            .find(|&idx| {
                check_parent_constraints(&roots.certs[idx]).is_ok()
                    && is_link_valid(to_verify, &roots.certs[idx])
            });
        let Some(idx) = found else {
            return Err(ValidationError::NoPathToTrustedRoot {
                issuer: to_verify.tbs_certificate.issuer.to_string(),
            }
            .into());
        };
        let root = roots.certs[idx].clone();
        let der = root.to_der().map_err(ValidationError::from)?;
        issuer_fingerprints.push(Sha256::digest(&der).into());
        issuers.push(root);
    }

    hook(ValidatedChain {
        leaf,
        issuers,
        issuer_fingerprints,
    })
    .map_err(HookOrValidationError::Hook)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{CertParams, TestAuthority};

    fn now() -> u64 {
        // Fixed validation time inside the generated certs' validity window.
        testutil::FIXED_NOW
    }

    use crate::testutil;

    #[test]
    fn test_pool_dedup_and_lookup() {
        let ca = TestAuthority::new("CN=Test Root");
        let mut pool = CertPool::default();
        pool.add_cert(ca.cert.clone()).unwrap();
        pool.add_cert(ca.cert.clone()).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(pool.includes(&ca.cert).unwrap());

        let fingerprint: [u8; 32] = Sha256::digest(ca.cert.to_der().unwrap()).into();
        assert!(pool.by_fingerprint(&fingerprint).is_some());
    }

    #[test]
    fn test_validate_simple_chain() {
        let ca = TestAuthority::new("CN=Test Root");
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();

        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];
        let validated = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap();
        assert_eq!(validated.issuers.len(), 1);
        assert_eq!(validated.issuer_fingerprints.len(), 1);
    }

    #[test]
    fn test_validate_infers_omitted_root() {
        let ca = TestAuthority::new("CN=Test Root");
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();

        let chain = vec![leaf.to_der().unwrap()];
        let validated = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap();
        assert_eq!(validated.issuers.len(), 1);
        assert_eq!(
            validated.issuer_fingerprints[0],
            <[u8; 32]>::from(Sha256::digest(ca.cert.to_der().unwrap()))
        );
    }

    #[test]
    fn test_validate_intermediate_chain() {
        let root = TestAuthority::new("CN=Test Root");
        let intermediate = root.issue_authority("CN=Test Intermediate");
        let leaf = intermediate.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![root.cert.clone()]).unwrap();

        let chain = vec![leaf.to_der().unwrap(), intermediate.cert.to_der().unwrap()];
        let validated = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap();
        assert_eq!(validated.issuers.len(), 2);
    }

    #[test]
    fn test_unknown_root_rejected() {
        let ca = TestAuthority::new("CN=Test Root");
        let other = TestAuthority::new("CN=Other Root");
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![other.cert.clone()]).unwrap();

        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];
        let err = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::NoPathToTrustedRoot { .. })
        ));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let pool = CertPool::default();
        let err = validate_chain(
            &[],
            &pool,
            &ChainPolicy::default(),
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::EmptyChain)
        ));
    }

    #[test]
    fn test_broken_link_rejected() {
        let ca = TestAuthority::new("CN=Test Root");
        let other = TestAuthority::new("CN=Other Root");
        let leaf = other.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();

        // The leaf claims a chain through a root that did not sign it.
        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];
        let err = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::InvalidLinkInChain)
        ));
    }

    #[test]
    fn test_not_after_window() {
        let ca = TestAuthority::new("CN=Test Root");
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();
        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];

        let not_after = testutil::DEFAULT_NOT_AFTER;
        for (start, limit, ok) in [
            (None, None, true),
            (Some(not_after - 1), Some(not_after + 1), true),
            (Some(not_after + 1), None, false),
            (None, Some(not_after), false),
        ] {
            let policy = ChainPolicy {
                not_after_start: start,
                not_after_limit: limit,
                ..Default::default()
            };
            let res = validate_chain(&chain, &pool, &policy, now(), Ok::<_, ValidationError>);
            assert_eq!(res.is_ok(), ok, "start={start:?} limit={limit:?}");
        }
    }

    #[test]
    fn test_expiry_policy() {
        let ca = TestAuthority::new("CN=Test Root");
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();
        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];

        let reject_expired = ChainPolicy {
            reject_expired: true,
            ..Default::default()
        };
        // Inside validity: fine.
        validate_chain(&chain, &pool, &reject_expired, now(), Ok::<_, ValidationError>).unwrap();
        // After notAfter: rejected.
        let err = validate_chain(
            &chain,
            &pool,
            &reject_expired,
            testutil::DEFAULT_NOT_AFTER + 1,
            Ok::<_, ValidationError>,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::Expired)
        ));

        let reject_unexpired = ChainPolicy {
            reject_unexpired: true,
            ..Default::default()
        };
        let err = validate_chain(
            &chain,
            &pool,
            &reject_unexpired,
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::Unexpired)
        ));
    }

    #[test]
    fn test_eku_filter() {
        use der::oid::db::rfc5280::{ID_KP_CLIENT_AUTH, ID_KP_SERVER_AUTH};
        let ca = TestAuthority::new("CN=Test Root");
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();
        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];

        let accept = ChainPolicy {
            ext_key_usages: vec![ID_KP_SERVER_AUTH],
            ..Default::default()
        };
        validate_chain(&chain, &pool, &accept, now(), Ok::<_, ValidationError>).unwrap();

        let reject = ChainPolicy {
            ext_key_usages: vec![ID_KP_CLIENT_AUTH],
            ..Default::default()
        };
        let err =
            validate_chain(&chain, &pool, &reject, now(), Ok::<_, ValidationError>).unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::MissingRequiredEku)
        ));
    }

    #[test]
    fn test_reject_extensions() {
        use der::oid::db::rfc5280::ID_CE_EXT_KEY_USAGE;
        let ca = TestAuthority::new("CN=Test Root");
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();
        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];

        let policy = ChainPolicy {
            reject_extensions: vec![ID_CE_EXT_KEY_USAGE],
            ..Default::default()
        };
        let err =
            validate_chain(&chain, &pool, &policy, now(), Ok::<_, ValidationError>).unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::RejectedExtension(_))
        ));
    }

    #[test]
    fn test_sha1_gate_checked_before_signature() {
        let ca = TestAuthority::new("CN=Test Root");
        let leaf = ca.issue_leaf_with_sig_alg(
            &CertParams::server_auth("CN=leaf.example"),
            OID_SHA1_WITH_RSA,
        );
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();
        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];

        // Gate closed: the algorithm is rejected outright.
        let err = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::UnsupportedSignatureAlgorithm(_))
        ));

        // Gate open: the algorithm passes policy and the chain proceeds to
        // signature verification, which fails for this mislabeled leaf.
        let policy = ChainPolicy {
            accept_sha1: true,
            ..Default::default()
        };
        let err =
            validate_chain(&chain, &pool, &policy, now(), Ok::<_, ValidationError>).unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::InvalidLinkInChain)
        ));
    }

    #[test]
    fn test_md5_always_rejected() {
        let ca = TestAuthority::new("CN=Test Root");
        let leaf =
            ca.issue_leaf_with_sig_alg(&CertParams::server_auth("CN=leaf.example"), OID_MD5_WITH_RSA);
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();
        let chain = vec![leaf.to_der().unwrap(), ca.cert.to_der().unwrap()];

        let policy = ChainPolicy {
            accept_sha1: true,
            ..Default::default()
        };
        let err =
            validate_chain(&chain, &pool, &policy, now(), Ok::<_, ValidationError>).unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::UnsupportedSignatureAlgorithm(_))
        ));
    }

    #[test]
    fn test_parent_without_ca_bit_rejected() {
        let root = TestAuthority::new("CN=Test Root");
        // A leaf is not a CA; using it as an intermediate must fail.
        let fake_intermediate = root.issue_leaf(&CertParams::server_auth("CN=Not A CA"));
        let pool = CertPool::new(vec![root.cert.clone()]).unwrap();

        let leaf = root.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let chain = vec![leaf.to_der().unwrap(), fake_intermediate.to_der().unwrap()];
        let err = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            now(),
            Ok::<_, ValidationError>,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            HookOrValidationError::Validation(ValidationError::ParentCannotSign)
        ));
    }
}

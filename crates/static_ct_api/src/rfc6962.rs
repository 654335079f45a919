// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Submission validation per [RFC 6962](https://datatracker.ietf.org/doc/html/rfc6962)
//! and the [Static CT API](https://c2sp.org/static-ct-api): the add-chain
//! request and response bodies, the CT-specific checks layered on top of the
//! relaxed chain validator, and precertificate canonicalisation.

use crate::{PendingEntry, PrecertData, StaticCtError};
use der::{
    asn1::{Null, OctetString},
    oid::{
        db::rfc5280::ID_CE_AUTHORITY_KEY_IDENTIFIER,
        db::rfc6962::{CT_PRECERT_POISON, CT_PRECERT_SCTS, CT_PRECERT_SIGNING_CERT},
        AssociatedOid, ObjectIdentifier,
    },
};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use sha2::{Digest, Sha256};
use tlog_tiles::UnixTimestamp;
use x509_cert::{
    der::Encode,
    ext::{
        pkix::{AuthorityKeyIdentifier, ExtendedKeyUsage},
        Extension,
    },
    impl_newtype, Certificate, TbsCertificate,
};
use x509_util::{CertPool, ChainPolicy, HookOrValidationError};

/// Add-(pre-)chain request body.
#[serde_as]
#[derive(Deserialize, Serialize)]
pub struct AddChainRequest {
    #[serde_as(as = "Vec<Base64>")]
    pub chain: Vec<Vec<u8>>,
}

/// Add-(pre-)chain response body.
#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct AddChainResponse {
    pub sct_version: u8,
    #[serde_as(as = "Base64")]
    pub id: Vec<u8>,
    pub timestamp: UnixTimestamp,
    #[serde_as(as = "Base64")]
    pub extensions: Vec<u8>,
    #[serde_as(as = "Base64")]
    pub signature: Vec<u8>,
}

/// Get-roots response body.
#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct GetRootsResponse {
    #[serde_as(as = "Vec<Base64>")]
    pub certificates: Vec<Vec<u8>>,
}

/// Validates a submitted chain and builds the pending log entry for it,
/// also returning the DER encodings of the issuer chain (root included) for
/// the issuer store.
///
/// # Errors
///
/// Returns a [`StaticCtError`] when the chain fails the relaxed path checks,
/// the CT policy, or was submitted to the wrong endpoint for its kind.
pub fn validate_chain(
    raw_chain: &[Vec<u8>],
    roots: &CertPool,
    policy: &ChainPolicy,
    now: UnixTimestamp,
    expect_precert: bool,
) -> Result<(PendingEntry, Vec<Vec<u8>>), StaticCtError> {
    let hook = |validated: x509_util::ValidatedChain| -> Result<(PendingEntry, Vec<Vec<u8>>), StaticCtError> {
        let leaf = &validated.leaf;

        // Reject mismatched signature algorithms:
        // https://github.com/google/certificate-transparency-go/pull/702
        for cert in std::iter::once(leaf).chain(validated.issuers.iter()) {
            if cert.signature_algorithm != cert.tbs_certificate.signature {
                return Err(StaticCtError::MismatchedSigAlg);
            }
        }

        let is_leaf_precert = is_precert(leaf)?;
        if is_leaf_precert != expect_precert {
            return Err(StaticCtError::EndpointMismatch {
                is_precert: is_leaf_precert,
            });
        }

        let precert_opt: Option<PrecertData>;
        let certificate: Vec<u8>;
        if is_leaf_precert {
            let Some(first_issuer) = validated.issuers.first() else {
                return Err(StaticCtError::MissingIssuer);
            };
            // A precertificate may be signed by a precertificate signing
            // certificate, in which case the entry's issuer is the next one
            // up the chain.
            let has_pre_issuer = is_pre_issuer(first_issuer)?;
            let issuer_key_hash: [u8; 32] = if has_pre_issuer {
                let Some(real_issuer) = validated.issuers.get(1) else {
                    return Err(StaticCtError::MissingPreIssuerIssuer);
                };
                Sha256::digest(
                    real_issuer
                        .tbs_certificate
                        .subject_public_key_info
                        .to_der()?,
                )
                .into()
            } else {
                Sha256::digest(
                    validated.issuers[0]
                        .tbs_certificate
                        .subject_public_key_info
                        .to_der()?,
                )
                .into()
            };
            let pre_issuer_tbs = has_pre_issuer.then(|| &validated.issuers[0].tbs_certificate);
            certificate = build_precert_tbs(&leaf.tbs_certificate, pre_issuer_tbs)?;
            precert_opt = Some(PrecertData {
                issuer_key_hash,
                precertificate: leaf.to_der()?,
            });
        } else {
            precert_opt = None;
            certificate = leaf.to_der()?;
        }

        let issuer_ders = x509_util::certs_to_bytes(&validated.issuers)?;
        Ok((
            PendingEntry {
                certificate,
                precert: precert_opt,
                chain_fingerprints: validated.issuer_fingerprints,
            },
            issuer_ders,
        ))
    };

    x509_util::validate_chain(raw_chain, roots, policy, now, hook).map_err(|e| match e {
        HookOrValidationError::Validation(ve) => ve.into(),
        HookOrValidationError::Hook(he) => he,
    })
}

/// Precertificate poison extension, decodable with [`TbsCertificate::get`].
#[derive(Debug)]
struct CtPrecertPoison(Null);

impl AssociatedOid for CtPrecertPoison {
    const OID: ObjectIdentifier = CT_PRECERT_POISON;
}
impl_newtype!(CtPrecertPoison, Null);

/// Returns whether the certificate carries the precertificate poison
/// extension.
///
/// # Errors
///
/// Returns an error if the poison extension is present but not critical, or
/// its value is not an ASN.1 NULL.
pub fn is_precert(cert: &Certificate) -> Result<bool, StaticCtError> {
    match cert.tbs_certificate.get::<CtPrecertPoison>()? {
        Some((true, _)) => Ok(true),
        Some((false, _)) => Err(StaticCtError::InvalidCtPoison),
        None => Ok(false),
    }
}

// Returns whether the certificate carries the precertificate-signing
// extended key usage.
fn is_pre_issuer(cert: &Certificate) -> Result<bool, StaticCtError> {
    Ok(cert
        .tbs_certificate
        .get::<ExtendedKeyUsage>()?
        .is_some_and(|(_, eku)| eku.0.iter().any(|usage| *usage == CT_PRECERT_SIGNING_CERT)))
}

/// Builds the canonical `TBSCertificate` of a precertificate entry
/// (RFC 6962 §3.2): the poison extension is removed, as is any embedded
/// SCT-list extension, preserving the order of the remaining extensions.
///
/// If `pre_issuer_opt` is a precertificate signing certificate's TBS, the
/// entry's issuance information is rewritten to that of the next issuer in
/// the chain: the TBS issuer becomes the pre-issuer's issuer, and the
/// authority key identifier is replaced with the pre-issuer's.
///
/// # Errors
///
/// Returns an error if the poison extension is absent or encoding fails.
pub fn build_precert_tbs(
    tbs: &TbsCertificate,
    pre_issuer_opt: Option<&TbsCertificate>,
) -> Result<Vec<u8>, StaticCtError> {
    let mut tbs = tbs.clone();

    let exts = tbs
        .extensions
        .as_mut()
        .ok_or(StaticCtError::InvalidCtPoison)?;

    let poison_idx = exts
        .iter()
        .position(|ext| ext.extn_id == CT_PRECERT_POISON)
        .ok_or(StaticCtError::InvalidCtPoison)?;
    exts.remove(poison_idx);
    exts.retain(|ext| ext.extn_id != CT_PRECERT_SCTS);

    if let Some(pre_issuer) = pre_issuer_opt {
        tbs.issuer = pre_issuer.issuer.clone();

        let pre_issuer_aki = match pre_issuer.get::<AuthorityKeyIdentifier>()? {
            Some((_, aki)) => Some(OctetString::new(aki.to_der()?)?),
            None => None,
        };

        let aki_idx = exts
            .iter()
            .position(|ext| ext.extn_id == ID_CE_AUTHORITY_KEY_IDENTIFIER);
        match (aki_idx, pre_issuer_aki) {
            (Some(idx), Some(value)) => exts[idx].extn_value = value,
            (Some(idx), None) => {
                exts.remove(idx);
            }
            (None, Some(value)) => exts.push(Extension {
                extn_id: ID_CE_AUTHORITY_KEY_IDENTIFIER,
                critical: false,
                extn_value: value,
            }),
            (None, None) => {}
        }
    }

    Ok(tbs.to_der()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use der::Decode;
    use x509_util::testutil::{
        poison_extension, sct_list_extension, CertParams, TestAuthority, FIXED_NOW,
    };

    fn setup() -> (TestAuthority, CertPool) {
        let ca = TestAuthority::new("CN=CT Test Root");
        let pool = CertPool::new(vec![ca.cert.clone()]).unwrap();
        (ca, pool)
    }

    #[test]
    fn test_validate_x509_chain() {
        let (ca, pool) = setup();
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let chain = vec![leaf.to_der().unwrap(), ca.cert_der()];

        let (entry, issuers) = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            FIXED_NOW,
            false,
        )
        .unwrap();
        assert!(!entry.is_precert());
        assert_eq!(entry.certificate, leaf.to_der().unwrap());
        assert_eq!(entry.chain_fingerprints.len(), 1);
        assert_eq!(issuers, vec![ca.cert_der()]);
    }

    #[test]
    fn test_endpoint_mismatch() {
        let (ca, pool) = setup();
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let precert = ca.issue_precert(&CertParams::server_auth("CN=precert.example"));

        // Certificate submitted to add-pre-chain.
        let err = validate_chain(
            &[leaf.to_der().unwrap(), ca.cert_der()],
            &pool,
            &ChainPolicy::default(),
            FIXED_NOW,
            true,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StaticCtError::EndpointMismatch { is_precert: false }
        ));

        // Precertificate submitted to add-chain.
        let err = validate_chain(
            &[precert.to_der().unwrap(), ca.cert_der()],
            &pool,
            &ChainPolicy::default(),
            FIXED_NOW,
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StaticCtError::EndpointMismatch { is_precert: true }
        ));
    }

    #[test]
    fn test_precert_canonicalisation() {
        let (ca, pool) = setup();
        let precert = ca.issue_precert(
            &CertParams::server_auth("CN=precert.example")
                .with_extension(sct_list_extension(b"embedded scts")),
        );
        let chain = vec![precert.to_der().unwrap(), ca.cert_der()];

        let (entry, _) = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            FIXED_NOW,
            true,
        )
        .unwrap();
        let precert_data = entry.precert.as_ref().unwrap();

        // The issuer key hash commits to the immediate issuer's SPKI.
        assert_eq!(
            precert_data.issuer_key_hash,
            <[u8; 32]>::from(Sha256::digest(ca.spki_der()))
        );
        assert_eq!(precert_data.precertificate, precert.to_der().unwrap());

        // The canonical TBS has both the poison and the embedded SCT list
        // stripped, and everything else intact.
        let tbs = TbsCertificate::from_der(&entry.certificate).unwrap();
        let exts = tbs.extensions.as_ref().unwrap();
        assert!(exts.iter().all(|ext| ext.extn_id != CT_PRECERT_POISON));
        assert!(exts.iter().all(|ext| ext.extn_id != CT_PRECERT_SCTS));
        assert_eq!(tbs.subject, precert.tbs_certificate.subject);
        assert_eq!(
            exts.len(),
            precert.tbs_certificate.extensions.as_ref().unwrap().len() - 2
        );
    }

    #[test]
    fn test_precert_via_signing_certificate() {
        let (ca, pool) = setup();
        let pre_issuer =
            ca.issue_authority_with_ekus("CN=Precert Signing CA", vec![CT_PRECERT_SIGNING_CERT]);
        let precert = pre_issuer.issue_precert(&CertParams::server_auth("CN=precert.example"));
        let chain = vec![
            precert.to_der().unwrap(),
            pre_issuer.cert_der(),
            ca.cert_der(),
        ];

        let (entry, issuers) = validate_chain(
            &chain,
            &pool,
            &ChainPolicy::default(),
            FIXED_NOW,
            true,
        )
        .unwrap();

        // The issuer key hash skips the signing certificate.
        assert_eq!(
            entry.precert.as_ref().unwrap().issuer_key_hash,
            <[u8; 32]>::from(Sha256::digest(ca.spki_der()))
        );
        assert_eq!(issuers.len(), 2);

        // Issuance information is rewritten to the real issuer.
        let tbs = TbsCertificate::from_der(&entry.certificate).unwrap();
        assert_eq!(tbs.issuer, pre_issuer.cert.tbs_certificate.issuer);
        let (_, rewritten_aki) = tbs.get::<AuthorityKeyIdentifier>().unwrap().unwrap();
        let (_, pre_issuer_aki) = pre_issuer
            .cert
            .tbs_certificate
            .get::<AuthorityKeyIdentifier>()
            .unwrap()
            .unwrap();
        assert_eq!(rewritten_aki, pre_issuer_aki);
    }

    #[test]
    fn test_pre_issuer_without_issuer_rejected() {
        let (ca, pool) = setup();
        let pre_issuer =
            ca.issue_authority_with_ekus("CN=Precert Signing CA", vec![CT_PRECERT_SIGNING_CERT]);
        let precert = pre_issuer.issue_precert(&CertParams::server_auth("CN=precert.example"));

        // Build a pool where the pre-issuer itself is the accepted root, so
        // the chain ends at the pre-issuer with no issuer above it.
        let pool2 = CertPool::new(vec![pre_issuer.cert.clone()]).unwrap();
        let chain = vec![precert.to_der().unwrap(), pre_issuer.cert_der()];
        let err = validate_chain(&chain, &pool2, &ChainPolicy::default(), FIXED_NOW, true)
            .unwrap_err();
        assert!(matches!(err, StaticCtError::MissingPreIssuerIssuer));
        let _ = (ca, pool);
    }

    #[test]
    fn test_non_critical_poison_rejected() {
        let (ca, pool) = setup();
        let mut bad_poison = poison_extension();
        bad_poison.critical = false;
        let leaf = ca.issue_leaf(
            &CertParams::server_auth("CN=bad-poison.example").with_extension(bad_poison),
        );
        let chain = vec![leaf.to_der().unwrap(), ca.cert_der()];
        let err =
            validate_chain(&chain, &pool, &ChainPolicy::default(), FIXED_NOW, true).unwrap_err();
        assert!(matches!(err, StaticCtError::InvalidCtPoison));
    }

    #[test]
    fn test_build_precert_tbs_requires_poison() {
        let (ca, _) = setup();
        let leaf = ca.issue_leaf(&CertParams::server_auth("CN=leaf.example"));
        let err = build_precert_tbs(&leaf.tbs_certificate, None).unwrap_err();
        assert!(matches!(err, StaticCtError::InvalidCtPoison));
    }
}

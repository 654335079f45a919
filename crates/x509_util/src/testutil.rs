// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Deterministic certificate generation for tests.
//!
//! Chains are built from hand-assembled `TbsCertificate`s signed with P-256
//! keys derived from the subject name, so tests need no fixture files and
//! produce the same bytes on every run.

use der::{
    asn1::{BitString, Null, OctetString, UtcTime},
    oid::{
        db::{rfc5280::ID_KP_SERVER_AUTH, rfc5912::ECDSA_WITH_SHA_256, rfc6962},
        ObjectIdentifier,
    },
    Decode, Encode,
};
use p256::ecdsa::{signature::Signer, DerSignature, SigningKey};
use p256::pkcs8::EncodePublicKey;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use x509_cert::{
    ext::{
        pkix::{
            AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
            SubjectKeyIdentifier,
        },
        Extension,
    },
    name::Name,
    serial_number::SerialNumber,
    spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned},
    time::{Time, Validity},
    Certificate, TbsCertificate, Version,
};

/// Validation time used by tests: 2025-06-01T00:00:00Z, in milliseconds.
pub const FIXED_NOW: u64 = 1_748_736_000_000;

/// Default notBefore for generated certs: 2025-01-01T00:00:00Z.
pub const DEFAULT_NOT_BEFORE: u64 = 1_735_689_600_000;

/// Default notAfter for generated certs: 2026-01-01T00:00:00Z.
pub const DEFAULT_NOT_AFTER: u64 = 1_767_225_600_000;

static SERIAL: AtomicU64 = AtomicU64::new(1);

/// Parameters for an issued end-entity certificate.
pub struct CertParams {
    pub subject: String,
    pub not_before: u64,
    pub not_after: u64,
    pub ekus: Vec<ObjectIdentifier>,
    pub extra_extensions: Vec<Extension>,
}

impl CertParams {
    /// Returns parameters for a TLS server certificate with the defaults
    /// above.
    pub fn server_auth(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            not_before: DEFAULT_NOT_BEFORE,
            not_after: DEFAULT_NOT_AFTER,
            ekus: vec![ID_KP_SERVER_AUTH],
            extra_extensions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_not_before(mut self, not_before: u64) -> Self {
        self.not_before = not_before;
        self
    }

    #[must_use]
    pub fn with_ekus(mut self, ekus: Vec<ObjectIdentifier>) -> Self {
        self.ekus = ekus;
        self
    }

    #[must_use]
    pub fn with_extension(mut self, ext: Extension) -> Self {
        self.extra_extensions.push(ext);
        self
    }
}

/// The critical CT poison extension carried by precertificates.
pub fn poison_extension() -> Extension {
    Extension {
        extn_id: rfc6962::CT_PRECERT_POISON,
        critical: true,
        extn_value: OctetString::new(Null.to_der().unwrap()).unwrap(),
    }
}

/// An embedded SCT-list extension with opaque contents.
pub fn sct_list_extension(data: &[u8]) -> Extension {
    Extension {
        extn_id: rfc6962::CT_PRECERT_SCTS,
        critical: false,
        extn_value: OctetString::new(OctetString::new(data).unwrap().to_der().unwrap()).unwrap(),
    }
}

/// A certificate authority holding its P-256 signing key.
pub struct TestAuthority {
    pub key: SigningKey,
    pub cert: Certificate,
}

fn key_for(seed: &str) -> SigningKey {
    SigningKey::from_slice(&Sha256::digest(seed.as_bytes())).unwrap()
}

fn spki_for(key: &SigningKey) -> SubjectPublicKeyInfoOwned {
    let der = key.verifying_key().to_public_key_der().unwrap();
    SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).unwrap()
}

fn validity(not_before: u64, not_after: u64) -> Validity {
    Validity {
        not_before: Time::UtcTime(
            UtcTime::from_unix_duration(Duration::from_millis(not_before)).unwrap(),
        ),
        not_after: Time::UtcTime(
            UtcTime::from_unix_duration(Duration::from_millis(not_after)).unwrap(),
        ),
    }
}

fn next_serial() -> SerialNumber {
    let n = SERIAL.fetch_add(1, Ordering::Relaxed);
    let bytes = n.to_be_bytes();
    let first = bytes.iter().position(|&b| b != 0).unwrap_or(7);
    SerialNumber::new(&bytes[first..]).unwrap()
}

fn ecdsa_sha256() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: ECDSA_WITH_SHA_256,
        parameters: None,
    }
}

fn ski_bytes(spki: &SubjectPublicKeyInfoOwned) -> Vec<u8> {
    Sha256::digest(spki.to_der().unwrap())[..20].to_vec()
}

fn sign_tbs(tbs: TbsCertificate, issuer_key: &SigningKey) -> Certificate {
    let tbs_der = tbs.to_der().unwrap();
    let sig: DerSignature = issuer_key.sign(&tbs_der);
    Certificate {
        signature_algorithm: tbs.signature.clone(),
        tbs_certificate: tbs,
        signature: BitString::from_bytes(sig.as_bytes()).unwrap(),
    }
}

fn build_tbs(
    subject: &str,
    issuer: &Name,
    spki: SubjectPublicKeyInfoOwned,
    not_before: u64,
    not_after: u64,
    extensions: Vec<Extension>,
) -> TbsCertificate {
    TbsCertificate {
        version: Version::V3,
        serial_number: next_serial(),
        signature: ecdsa_sha256(),
        issuer: issuer.clone(),
        validity: validity(not_before, not_after),
        subject: Name::from_str(subject).unwrap(),
        subject_public_key_info: spki,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    }
}

impl TestAuthority {
    /// Returns a new self-signed root authority.
    ///
    /// # Panics
    ///
    /// Panics if the subject does not parse as an RFC 4514 name.
    pub fn new(subject: &str) -> Self {
        let key = key_for(subject);
        let spki = spki_for(&key);
        let name = Name::from_str(subject).unwrap();
        let extensions = vec![
            Extension {
                extn_id: der::oid::db::rfc5280::ID_CE_SUBJECT_KEY_IDENTIFIER,
                critical: false,
                extn_value: OctetString::new(
                    SubjectKeyIdentifier(OctetString::new(ski_bytes(&spki)).unwrap())
                        .to_der()
                        .unwrap(),
                )
                .unwrap(),
            },
            Extension {
                extn_id: der::oid::db::rfc5280::ID_CE_KEY_USAGE,
                critical: true,
                extn_value: OctetString::new(
                    KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign)
                        .to_der()
                        .unwrap(),
                )
                .unwrap(),
            },
            Extension {
                extn_id: der::oid::db::rfc5280::ID_CE_BASIC_CONSTRAINTS,
                critical: true,
                extn_value: OctetString::new(
                    BasicConstraints {
                        ca: true,
                        path_len_constraint: None,
                    }
                    .to_der()
                    .unwrap(),
                )
                .unwrap(),
            },
        ];
        let tbs = build_tbs(
            subject,
            &name,
            spki,
            DEFAULT_NOT_BEFORE,
            DEFAULT_NOT_AFTER,
            extensions,
        );
        let cert = sign_tbs(tbs, &key);
        Self { key, cert }
    }

    /// Issues a subordinate authority (an intermediate CA).
    pub fn issue_authority(&self, subject: &str) -> TestAuthority {
        self.issue_authority_with_ekus(subject, Vec::new())
    }

    /// Issues a subordinate authority carrying the given EKUs, e.g. the
    /// precertificate-signing EKU.
    pub fn issue_authority_with_ekus(
        &self,
        subject: &str,
        ekus: Vec<ObjectIdentifier>,
    ) -> TestAuthority {
        let key = key_for(subject);
        let spki = spki_for(&key);
        let mut extensions = vec![
            Extension {
                extn_id: der::oid::db::rfc5280::ID_CE_SUBJECT_KEY_IDENTIFIER,
                critical: false,
                extn_value: OctetString::new(
                    SubjectKeyIdentifier(OctetString::new(ski_bytes(&spki)).unwrap())
                        .to_der()
                        .unwrap(),
                )
                .unwrap(),
            },
            self.aki_extension(),
            Extension {
                extn_id: der::oid::db::rfc5280::ID_CE_KEY_USAGE,
                critical: true,
                extn_value: OctetString::new(
                    KeyUsage(KeyUsages::KeyCertSign | KeyUsages::CRLSign)
                        .to_der()
                        .unwrap(),
                )
                .unwrap(),
            },
            Extension {
                extn_id: der::oid::db::rfc5280::ID_CE_BASIC_CONSTRAINTS,
                critical: true,
                extn_value: OctetString::new(
                    BasicConstraints {
                        ca: true,
                        path_len_constraint: None,
                    }
                    .to_der()
                    .unwrap(),
                )
                .unwrap(),
            },
        ];
        if !ekus.is_empty() {
            extensions.push(Extension {
                extn_id: der::oid::db::rfc5280::ID_CE_EXT_KEY_USAGE,
                critical: false,
                extn_value: OctetString::new(ExtendedKeyUsage(ekus).to_der().unwrap()).unwrap(),
            });
        }
        let tbs = build_tbs(
            subject,
            &self.cert.tbs_certificate.subject,
            spki,
            DEFAULT_NOT_BEFORE,
            DEFAULT_NOT_AFTER,
            extensions,
        );
        let cert = sign_tbs(tbs, &self.key);
        TestAuthority { key, cert }
    }

    /// Issues an end-entity certificate.
    pub fn issue_leaf(&self, params: &CertParams) -> Certificate {
        sign_tbs(self.leaf_tbs(params), &self.key)
    }

    /// Issues a precertificate: an end-entity certificate carrying the
    /// critical CT poison extension.
    pub fn issue_precert(&self, params: &CertParams) -> Certificate {
        let mut tbs = self.leaf_tbs(params);
        tbs.extensions
            .as_mut()
            .unwrap()
            .push(poison_extension());
        sign_tbs(tbs, &self.key)
    }

    /// Issues a leaf whose declared signature algorithm is `sig_alg` rather
    /// than the algorithm actually used to sign it. Used to exercise the
    /// signature-algorithm policy gate.
    pub fn issue_leaf_with_sig_alg(
        &self,
        params: &CertParams,
        sig_alg: ObjectIdentifier,
    ) -> Certificate {
        let mut tbs = self.leaf_tbs(params);
        let alg = AlgorithmIdentifierOwned {
            oid: sig_alg,
            parameters: Some(der::Any::new(der::Tag::Null, []).unwrap()),
        };
        tbs.signature = alg.clone();
        let tbs_der = tbs.to_der().unwrap();
        let sig: DerSignature = self.key.sign(&tbs_der);
        Certificate {
            tbs_certificate: tbs,
            signature_algorithm: alg,
            signature: BitString::from_bytes(sig.as_bytes()).unwrap(),
        }
    }

    fn leaf_tbs(&self, params: &CertParams) -> TbsCertificate {
        let key = key_for(&params.subject);
        let spki = spki_for(&key);
        let mut extensions = vec![self.aki_extension()];
        if !params.ekus.is_empty() {
            extensions.push(Extension {
                extn_id: der::oid::db::rfc5280::ID_CE_EXT_KEY_USAGE,
                critical: false,
                extn_value: OctetString::new(
                    ExtendedKeyUsage(params.ekus.clone()).to_der().unwrap(),
                )
                .unwrap(),
            });
        }
        extensions.extend(params.extra_extensions.iter().cloned());
        build_tbs(
            &params.subject,
            &self.cert.tbs_certificate.subject,
            spki,
            params.not_before,
            params.not_after,
            extensions,
        )
    }

    // The AKI extension pointing at this authority's SKI.
    fn aki_extension(&self) -> Extension {
        let spki = spki_for(&self.key);
        Extension {
            extn_id: der::oid::db::rfc5280::ID_CE_AUTHORITY_KEY_IDENTIFIER,
            critical: false,
            extn_value: OctetString::new(
                AuthorityKeyIdentifier {
                    key_identifier: Some(OctetString::new(ski_bytes(&spki)).unwrap()),
                    authority_cert_issuer: None,
                    authority_cert_serial_number: None,
                }
                .to_der()
                .unwrap(),
            )
            .unwrap(),
        }
    }

    /// Returns the DER encoding of this authority's SubjectPublicKeyInfo.
    pub fn spki_der(&self) -> Vec<u8> {
        spki_for(&self.key).to_der().unwrap()
    }

    /// Returns the DER encoding of this authority's certificate.
    pub fn cert_der(&self) -> Vec<u8> {
        self.cert.to_der().unwrap()
    }
}

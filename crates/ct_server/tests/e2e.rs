// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! End-to-end submission scenarios driven through the HTTP surface.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::prelude::*;
use ct_server::antispam::AntispamIndex;
use ct_server::roots::RootPool;
use ct_server::storage::{MemoryLockBackend, MemoryObjectBackend, ObjectBackend};
use ct_server::{http as ct_http, now_millis, Log, LogConfig};
use http_body_util::BodyExt;
use p256::ecdsa::SigningKey as EcdsaSigningKey;
use sha2::{Digest, Sha256};
use static_ct_api::AddChainResponse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use x509_cert::der::Encode;
use x509_util::testutil::{CertParams, TestAuthority};
use x509_util::ChainPolicy;

struct TestServer {
    router: Router,
    log: Arc<Log>,
    object: Arc<MemoryObjectBackend>,
    ca: TestAuthority,
    signing_key: EcdsaSigningKey,
    _shutdown: tokio::sync::watch::Sender<bool>,
}

async fn setup(configure: impl FnOnce(&mut LogConfig)) -> TestServer {
    let ca = TestAuthority::new("CN=E2E Test Root");
    let mut config = LogConfig {
        origin: "ct.example.com/e2e".to_string(),
        batch_max_age: Duration::from_millis(25),
        checkpoint_interval: Duration::from_secs(3600),
        ..Default::default()
    };
    configure(&mut config);
    config.validate().unwrap();

    let signing_key = EcdsaSigningKey::from_slice(&Sha256::digest(b"e2e log key")).unwrap();
    let object = Arc::new(MemoryObjectBackend::new());
    let lock = Arc::new(MemoryLockBackend::new());
    let roots = Arc::new(RootPool::new(vec![ca.cert.clone()], HashSet::new()).unwrap());
    let antispam = AntispamIndex::open_in_memory(config.inmemory_antispam_cache_size).unwrap();

    let log = Arc::new(Log::new(
        config,
        signing_key.clone(),
        Vec::new(),
        roots,
        object.clone(),
        lock,
        antispam,
    ));
    log.init().await.unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(log.clone().sequencer_task(shutdown_rx));

    TestServer {
        router: ct_http::router(log.clone()),
        log,
        object,
        ca,
        signing_key,
        _shutdown: shutdown_tx,
    }
}

fn chain_body(chain: &[Vec<u8>]) -> Vec<u8> {
    let encoded: Vec<String> = chain.iter().map(|der| BASE64_STANDARD.encode(der)).collect();
    serde_json::to_vec(&serde_json::json!({ "chain": encoded })).unwrap()
}

async fn post(server: &TestServer, path: &str, body: Vec<u8>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

async fn get(server: &TestServer, path: &str) -> (StatusCode, Vec<u8>) {
    let response = server
        .router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, body)
}

async fn published_tree_size(server: &TestServer) -> u64 {
    let checkpoint = server
        .object
        .fetch("checkpoint")
        .await
        .unwrap()
        .expect("no published checkpoint");
    let (checkpoint, _) = static_ct_api::open_checkpoint(
        &server.log.config().origin,
        server.signing_key.verifying_key(),
        None,
        now_millis(),
        &checkpoint,
    )
    .unwrap();
    checkpoint.size()
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_single_add_chain() {
    let server = setup(|_| {}).await;
    let leaf = server
        .ca
        .issue_leaf(&CertParams::server_auth("CN=s1.example"));
    let chain = vec![leaf.to_der().unwrap(), server.ca.cert_der()];

    let (status, _, body) = post(&server, "/ct/v1/add-chain", chain_body(&chain)).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

    let sct: AddChainResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(sct.sct_version, 0);
    assert!(sct.timestamp > 0);
    assert!(sct.extensions.is_empty());
    assert_eq!(
        sct.id,
        static_ct_api::log_id_from_key(server.signing_key.verifying_key())
            .unwrap()
            .to_vec()
    );

    // The signature verifies over the reconstructed entry.
    let (pending, _) = static_ct_api::validate_chain(
        &chain,
        &RootPool::new(vec![server.ca.cert.clone()], HashSet::new())
            .unwrap()
            .snapshot(),
        &ChainPolicy::default(),
        now_millis(),
        false,
    )
    .unwrap();
    let entry = pending.into_entry(0, sct.timestamp);
    static_ct_api::verify_sct_signature(server.signing_key.verifying_key(), &entry, &sct.signature)
        .unwrap();

    assert!(published_tree_size(&server).await >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_duplicate_returns_original_timestamp() {
    let server = setup(|_| {}).await;
    let leaf = server
        .ca
        .issue_leaf(&CertParams::server_auth("CN=s2.example"));
    let body = chain_body(&[leaf.to_der().unwrap(), server.ca.cert_der()]);

    let (status, _, first) = post(&server, "/ct/v1/add-chain", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let first: AddChainResponse = serde_json::from_slice(&first).unwrap();

    let (status, _, second) = post(&server, "/ct/v1/add-chain", body).await;
    assert_eq!(status, StatusCode::OK);
    let second: AddChainResponse = serde_json::from_slice(&second).unwrap();

    assert_eq!(first.timestamp, second.timestamp);
    // Deterministic signing makes the whole response identical.
    assert_eq!(first.signature, second.signature);
    assert_eq!(published_tree_size(&server).await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_unknown_root_rejected() {
    let server = setup(|_| {}).await;
    let rogue = TestAuthority::new("CN=Rogue Root");
    let leaf = rogue.issue_leaf(&CertParams::server_auth("CN=s3.example"));
    let body = chain_body(&[leaf.to_der().unwrap(), rogue.cert_der()]);

    let (status, _, body) = post(&server, "/ct/v1/add-chain", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("root"));
}

#[tokio::test(flavor = "multi_thread")]
async fn s4_sha1_gate() {
    let sha1_rsa = der::oid::ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");

    // Gate closed: the algorithm itself is refused.
    let server = setup(|_| {}).await;
    let leaf = server
        .ca
        .issue_leaf_with_sig_alg(&CertParams::server_auth("CN=s4.example"), sha1_rsa);
    let body = chain_body(&[leaf.to_der().unwrap(), server.ca.cert_der()]);
    let (status, _, response) = post(&server, "/ct/v1/add-chain", body.clone()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&response).contains("unsupported signature algorithm"));

    // Gate open: the algorithm passes policy; this mislabeled test chain
    // then fails ordinary signature verification instead.
    let server = setup(|config| config.policy.accept_sha1 = true).await;
    let leaf = server
        .ca
        .issue_leaf_with_sig_alg(&CertParams::server_auth("CN=s4.example"), sha1_rsa);
    let body = chain_body(&[leaf.to_der().unwrap(), server.ca.cert_der()]);
    let (status, _, response) = post(&server, "/ct/v1/add-chain", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!String::from_utf8_lossy(&response).contains("unsupported signature algorithm"));
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_old_not_before_rate_limited() {
    let server = setup(|config| {
        config.rate_limit_old_not_before =
            Some((Duration::from_secs(30 * 86_400), 1.0));
    })
    .await;

    let old_not_before = now_millis() - 60 * 86_400 * 1_000;
    let mut successes = 0;
    let mut rejected = 0;
    for i in 0..5 {
        let leaf = server.ca.issue_leaf(
            &CertParams::server_auth(&format!("CN=s5-{i}.example"))
                .with_not_before(old_not_before),
        );
        let body = chain_body(&[leaf.to_der().unwrap(), server.ca.cert_der()]);
        let (status, headers, _) = post(&server, "/ct/v1/add-chain", body).await;
        match status {
            StatusCode::OK => successes += 1,
            StatusCode::TOO_MANY_REQUESTS => {
                rejected += 1;
                let retry_after: u64 = headers
                    .get(header::RETRY_AFTER)
                    .expect("missing Retry-After")
                    .to_str()
                    .unwrap()
                    .parse()
                    .unwrap();
                assert!((1..=5).contains(&retry_after));
            }
            other => panic!("unexpected status {other}"),
        }
    }
    assert!((1..=2).contains(&successes), "successes={successes}");
    assert!(rejected >= 3, "rejected={rejected}");
}

#[tokio::test(flavor = "multi_thread")]
async fn s6_precert_poison_stripped() {
    let server = setup(|_| {}).await;
    let precert = server.ca.issue_precert(
        &CertParams::server_auth("CN=s6.example")
            .with_extension(x509_util::testutil::sct_list_extension(b"scts")),
    );
    let chain = vec![precert.to_der().unwrap(), server.ca.cert_der()];

    let (status, _, body) = post(&server, "/ct/v1/add-pre-chain", chain_body(&chain)).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let sct: AddChainResponse = serde_json::from_slice(&body).unwrap();

    // Reconstruct the expected precert entry and check the signed bytes.
    let (pending, _) = static_ct_api::validate_chain(
        &chain,
        &RootPool::new(vec![server.ca.cert.clone()], HashSet::new())
            .unwrap()
            .snapshot(),
        &ChainPolicy::default(),
        now_millis(),
        true,
    )
    .unwrap();
    let precert_data = pending.precert.clone().unwrap();
    assert_eq!(
        precert_data.issuer_key_hash,
        <[u8; 32]>::from(Sha256::digest(server.ca.spki_der()))
    );

    // The canonical TBS no longer carries the poison or SCT-list
    // extensions.
    use der::Decode;
    let tbs = x509_cert::TbsCertificate::from_der(&pending.certificate).unwrap();
    let poison = der::oid::db::rfc6962::CT_PRECERT_POISON;
    let scts = der::oid::db::rfc6962::CT_PRECERT_SCTS;
    for ext in tbs.extensions.as_ref().unwrap() {
        assert_ne!(ext.extn_id, poison);
        assert_ne!(ext.extn_id, scts);
    }

    let entry = pending.into_entry(0, sct.timestamp);
    static_ct_api::verify_sct_signature(server.signing_key.verifying_key(), &entry, &sct.signature)
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn precert_on_wrong_endpoint_rejected() {
    let server = setup(|_| {}).await;
    let precert = server
        .ca
        .issue_precert(&CertParams::server_auth("CN=wrong.example"));
    let body = chain_body(&[precert.to_der().unwrap(), server.ca.cert_der()]);
    let (status, _, _) = post(&server, "/ct/v1/add-chain", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_body_rejected() {
    let server = setup(|_| {}).await;
    let (status, _, _) = post(&server, "/ct/v1/add-chain", b"not json".to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) = post(&server, "/ct/v1/add-chain", br#"{"chain":[]}"#.to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _, _) =
        post(&server, "/ct/v1/add-chain", br#"{"chain":["dGhpcyBpcyBub3QgREVS"]}"#.to_vec()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn get_roots_and_health() {
    let server = setup(|_| {}).await;
    let (status, body) = get(&server, "/ct/v1/get-roots").await;
    assert_eq!(status, StatusCode::OK);
    let roots: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let expected = BASE64_STANDARD.encode(server.ca.cert_der());
    assert_eq!(roots["certificates"][0].as_str().unwrap(), expected);

    let (status, body) = get(&server, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");

    let (status, body) = get(&server, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&body).contains("config_roots_total"));
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_method_rejected() {
    let server = setup(|_| {}).await;
    let (status, _) = get(&server, "/ct/v1/add-chain").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test(flavor = "multi_thread")]
async fn path_prefix_applies_to_submission_endpoints() {
    let server = setup(|config| config.path_prefix = "/logs/v1".to_string()).await;
    let leaf = server
        .ca
        .issue_leaf(&CertParams::server_auth("CN=prefix.example"));
    let body = chain_body(&[leaf.to_der().unwrap(), server.ca.cert_der()]);

    let (status, _, _) = post(&server, "/ct/v1/add-chain", body.clone()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = post(&server, "/logs/v1/ct/v1/add-chain", body).await;
    assert_eq!(status, StatusCode::OK);

    // Health stays unprefixed.
    let (status, _) = get(&server, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn always_reject_dedup_rate_limit() {
    let server = setup(|config| config.rate_limit_dedup = 0.0).await;
    let leaf = server
        .ca
        .issue_leaf(&CertParams::server_auth("CN=dedup.example"));
    let body = chain_body(&[leaf.to_der().unwrap(), server.ca.cert_der()]);

    let (status, _, _) = post(&server, "/ct/v1/add-chain", body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    let (status, headers, response) = post(&server, "/ct/v1/add-chain", body).await;
    assert_eq!(
        status,
        StatusCode::TOO_MANY_REQUESTS,
        "{}",
        String::from_utf8_lossy(&response)
    );
    assert!(headers.contains_key(header::RETRY_AFTER));
}

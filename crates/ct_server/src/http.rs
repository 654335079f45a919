// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The HTTP submission surface.
//!
//! Only the write endpoints live here; the monitoring APIs are the static
//! objects themselves, served straight from the object storage. Handlers
//! orchestrate the submission pipeline: parse, rate limit, validate, store
//! issuers, sequence, resolve duplicates, sign the SCT.

use crate::ctlog::{AddError, AddOutcome, Log};
use crate::now_millis;
use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use der::{Decode, Encode};
use rand::Rng;
use static_ct_api::{AddChainRequest, AddChainResponse, GetRootsResponse, StaticCtError};
use std::sync::Arc;
use std::time::Instant;
use x509_cert::Certificate;
use x509_util::ValidationError;

/// Builds the router for a log.
pub fn router(log: Arc<Log>) -> Router {
    let api = Router::new()
        .route("/ct/v1/add-chain", post(add_chain))
        .route("/ct/v1/add-pre-chain", post(add_pre_chain))
        .route("/ct/v1/get-roots", get(get_roots));
    let prefix = &log.config().path_prefix;
    let app = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    };
    app.route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(log)
}

// The error kinds distinguishable at the API boundary.
enum AppError {
    BadRequest(&'static str),
    BadChain(String),
    UnsupportedAlgorithm(String),
    RateLimited(&'static str),
    Internal(anyhow::Error),
}

impl From<StaticCtError> for AppError {
    fn from(e: StaticCtError) -> Self {
        match e {
            StaticCtError::Validation(ValidationError::UnsupportedSignatureAlgorithm(oid)) => {
                AppError::UnsupportedAlgorithm(format!("unsupported signature algorithm: {oid}"))
            }
            other => AppError::BadChain(other.to_string()),
        }
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_)
            | AppError::BadChain(_)
            | AppError::UnsupportedAlgorithm(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self, log: &Log) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::BadRequest(msg) => format!("Bad Request\n{msg}"),
            AppError::BadChain(msg) => format!("Bad Request\n{msg}"),
            AppError::UnsupportedAlgorithm(msg) => format!("Bad Request\n{msg}"),
            AppError::RateLimited(reason) => format!("Too Many Requests\n{reason}"),
            AppError::Internal(e) => {
                log::warn!("{}: internal error: {e:#}", log.config().origin);
                if log.config().mask_internal_errors {
                    "Internal Server Error".to_string()
                } else {
                    format!("Internal Server Error\n{e:#}")
                }
            }
        };
        let mut response = (status, body).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            // Jittered retry hint so pushed-back clients don't thunder back.
            let retry_after = rand::thread_rng().gen_range(1..6);
            response.headers_mut().insert(
                header::RETRY_AFTER,
                header::HeaderValue::from(retry_after),
            );
        }
        response
    }
}

async fn add_chain(State(log): State<Arc<Log>>, body: Bytes) -> Response {
    serve_add_chain(&log, "add-chain", &body, false).await
}

async fn add_pre_chain(State(log): State<Arc<Log>>, body: Bytes) -> Response {
    serve_add_chain(&log, "add-pre-chain", &body, true).await
}

async fn serve_add_chain(log: &Log, endpoint: &str, body: &[u8], expect_precert: bool) -> Response {
    let start = Instant::now();
    let deadline = log.config().http_deadline;
    let result = match tokio::time::timeout(deadline, add_chain_inner(log, body, expect_precert))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(AppError::Internal(anyhow!("request deadline exceeded"))),
    };
    let response = match result {
        Ok(sct) => match serde_json::to_vec(&sct) {
            Ok(json) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                json,
            )
                .into_response(),
            Err(e) => AppError::Internal(e.into()).into_response(log),
        },
        Err(e) => e.into_response(log),
    };
    log.metrics()
        .req_count
        .with_label_values(&[endpoint, response.status().as_str()])
        .inc();
    log.metrics()
        .req_duration
        .with_label_values(&[endpoint])
        .observe(start.elapsed().as_secs_f64());
    response
}

async fn add_chain_inner(
    log: &Log,
    body: &[u8],
    expect_precert: bool,
) -> Result<AddChainResponse, AppError> {
    let req: AddChainRequest = serde_json::from_slice(body)
        .map_err(|_| AppError::BadRequest("failed to parse add-chain body"))?;
    if req.chain.is_empty() {
        return Err(AppError::BadRequest("empty chain"));
    }

    let now = now_millis();
    let leaf = Certificate::from_der(&req.chain[0])
        .map_err(|_| AppError::BadRequest("malformed leaf certificate"))?;
    let not_before = u64::try_from(
        leaf.tbs_certificate
            .validity
            .not_before
            .to_unix_duration()
            .as_millis(),
    )
    .map_err(|_| AppError::BadRequest("malformed leaf validity"))?;
    if !log.rate_limits().accept_not_before(not_before, now) {
        log.metrics()
            .rate_limited
            .with_label_values(&["old_cert"])
            .inc();
        return Err(AppError::RateLimited("old_cert"));
    }

    let roots = log.roots().snapshot();
    let (pending, issuers) = static_ct_api::validate_chain(
        &req.chain,
        &roots,
        &log.config().policy,
        now,
        expect_precert,
    )?;

    let raw_issuer = leaf
        .tbs_certificate
        .issuer
        .to_der()
        .map_err(|e| AppError::Internal(e.into()))?;
    if !log.rate_limits().accept_issuer(&raw_issuer) {
        log.metrics()
            .rate_limited
            .with_label_values(&["issuer"])
            .inc();
        return Err(AppError::RateLimited("issuer"));
    }

    log.upload_issuers(&issuers)
        .await
        .map_err(AppError::Internal)?;

    let outcome = log.add_entry(pending.clone()).await.map_err(|e| match e {
        AddError::Pushback(p) => AppError::RateLimited(p.reason()),
        AddError::Internal(e) => AppError::Internal(e),
    })?;

    if outcome.is_dup() && !log.rate_limits().accept_dedup() {
        log.metrics()
            .rate_limited
            .with_label_values(&["dedup"])
            .inc();
        return Err(AppError::RateLimited("dedup"));
    }

    let entry = match outcome {
        AddOutcome::Pending { mut rx, .. } => {
            rx.changed()
                .await
                .map_err(|_| AppError::Internal(anyhow!("sequencing failed for this batch")))?;
            let (index, timestamp) = *rx.borrow();
            pending.into_entry(index, timestamp)
        }
        AddOutcome::Cached { index } => log
            .resolve_duplicate(pending, index)
            .await
            .map_err(AppError::Internal)?,
    };

    log.sign_sct(&entry)
        .map_err(|e| AppError::Internal(anyhow!("failed to sign SCT: {e}")))
}

async fn get_roots(State(log): State<Arc<Log>>) -> Response {
    let roots = log.roots().snapshot();
    match x509_util::certs_to_bytes(&roots.certs) {
        Ok(certificates) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            serde_json::to_vec(&GetRootsResponse { certificates }).unwrap_or_default(),
        )
            .into_response(),
        Err(e) => AppError::Internal(e.into()).into_response(&log),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(log): State<Arc<Log>>) -> Response {
    use crate::metrics::AsF64;
    log.metrics()
        .antispam_lag
        .set(log.antispam().lag().as_f64());
    log.metrics()
        .config_roots
        .set(log.roots().snapshot().len().as_f64());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        log.metrics().encode(),
    )
        .into_response()
}

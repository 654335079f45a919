// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The log server binary: flag parsing, wiring, and lifecycle.

use anyhow::Context;
use clap::Parser;
use ct_server::antispam::AntispamIndex;
use ct_server::config::{
    parse_duration, parse_ext_key_usages, parse_fingerprint, parse_not_before_limit, parse_oids,
};
use ct_server::storage::{PosixLockBackend, PosixObjectBackend};
use ct_server::{gc, http, roots, signer, Log, LogConfig};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use x509_cert::Certificate;

#[derive(Parser)]
#[command(about = "Write-path server for a static-ct-api log")]
struct Args {
    /// The log's origin: checkpoint name and submission prefix.
    #[arg(long)]
    origin: String,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Directory holding the public objects (tiles, bundles, checkpoint,
    /// issuers). Serve this directory read-only for the monitoring APIs.
    #[arg(long)]
    storage_dir: PathBuf,

    /// Directory for private server state (checkpoint lock, staging,
    /// anti-spam index). Must not be publicly served.
    #[arg(long)]
    state_dir: PathBuf,

    /// PKCS#8 PEM file with the log's ECDSA P-256 signing key.
    #[arg(long)]
    signing_key_file: PathBuf,

    /// File with an encoded Ed25519 note signer key for witness
    /// cosignatures. Repeatable.
    #[arg(long)]
    witness_key_file: Vec<PathBuf>,

    /// PEM file with the initial accepted roots.
    #[arg(long)]
    roots_pem_file: PathBuf,

    /// URL of a CCADB-style CSV of roots to fetch periodically.
    #[arg(long)]
    roots_remote_fetch_url: Option<String>,

    /// Interval between remote root fetches.
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    roots_remote_fetch_interval: Duration,

    /// Hex SHA-256 fingerprint of a root to reject regardless of source.
    /// Repeatable.
    #[arg(long)]
    reject_root: Vec<String>,

    /// Reject certificates that have already expired.
    #[arg(long)]
    reject_expired: bool,

    /// Reject certificates that have not yet expired.
    #[arg(long)]
    reject_unexpired: bool,

    /// Inclusive lower bound for leaf notAfter, RFC 3339.
    #[arg(long)]
    not_after_start: Option<String>,

    /// Exclusive upper bound for leaf notAfter, RFC 3339.
    #[arg(long)]
    not_after_limit: Option<String>,

    /// Comma-separated extended key usages submissions must carry, from
    /// {ServerAuth, ClientAuth, CodeSigning, EmailProtection, TimeStamping,
    /// OCSPSigning, Any}.
    #[arg(long, default_value = "")]
    ext_key_usages: String,

    /// Comma-separated extension OIDs submissions must not carry.
    #[arg(long, default_value = "")]
    reject_extension: String,

    /// Accept chains using SHA-1-based signature algorithms.
    #[arg(long)]
    accept_sha1_signing_algorithms: bool,

    /// Maximum entries per sequencing batch.
    #[arg(long, default_value_t = 256)]
    batch_max_size: usize,

    /// Maximum time a batch stays open.
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    batch_max_age: Duration,

    /// Re-sign the checkpoint after this long without growth.
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    checkpoint_interval: Duration,

    /// Re-publish the checkpoint unconditionally at this interval.
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    checkpoint_republish_interval: Duration,

    /// Reject submissions when this many entries await integration.
    #[arg(long, default_value_t = 4096)]
    pushback_max_outstanding: usize,

    /// Reject submissions when the anti-spam follower lags by more than
    /// this many entries.
    #[arg(long, default_value_t = 10_000)]
    pushback_max_antispam_lag: u64,

    /// Rate limit for old-notBefore submissions, as "<duration>:<qps>"
    /// (e.g. "30d:1").
    #[arg(long, value_parser = parse_not_before_limit)]
    rate_limit_old_not_before: Option<(Duration, f64)>,

    /// Per-issuer queries per second; negative disables.
    #[arg(long, default_value_t = -1.0, allow_hyphen_values = true)]
    rate_limit_issuer: f64,

    /// Duplicate resolutions per second; zero rejects all duplicates,
    /// negative means unlimited.
    #[arg(long, default_value_t = -1.0, allow_hyphen_values = true)]
    rate_limit_dedup: f64,

    /// Entries held by the in-memory anti-spam cache.
    #[arg(long, default_value_t = 65_536)]
    inmemory_antispam_cache_size: usize,

    /// Prefix for the submission endpoints.
    #[arg(long, default_value = "")]
    path_prefix: String,

    /// Mask internal error messages in HTTP 500 bodies.
    #[arg(long)]
    mask_internal_errors: bool,

    /// Deadline for a submission request, including sequencing.
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    http_deadline: Duration,

    /// Interval between garbage collection sweeps; "0s" disables.
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    garbage_collection_interval: Duration,
}

fn parse_rfc3339_millis(s: &str) -> anyhow::Result<u64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid RFC 3339 timestamp {s:?}"))?;
    u64::try_from(parsed.timestamp_millis()).context("timestamp before the Unix epoch")
}

fn config_from_args(args: &Args) -> anyhow::Result<LogConfig> {
    let mut reject_roots = HashSet::new();
    for fingerprint in &args.reject_root {
        reject_roots.insert(parse_fingerprint(fingerprint)?);
    }
    let mut config = LogConfig {
        origin: args.origin.clone(),
        roots_pem_file: Some(args.roots_pem_file.clone()),
        roots_remote_fetch_url: args.roots_remote_fetch_url.clone(),
        roots_remote_fetch_interval: args.roots_remote_fetch_interval,
        reject_roots,
        batch_max_size: args.batch_max_size,
        batch_max_age: args.batch_max_age,
        checkpoint_interval: args.checkpoint_interval,
        checkpoint_republish_interval: args.checkpoint_republish_interval,
        pushback_max_outstanding: args.pushback_max_outstanding,
        pushback_max_antispam_lag: args.pushback_max_antispam_lag,
        rate_limit_old_not_before: args.rate_limit_old_not_before,
        rate_limit_issuer: args.rate_limit_issuer,
        rate_limit_dedup: args.rate_limit_dedup,
        inmemory_antispam_cache_size: args.inmemory_antispam_cache_size,
        path_prefix: args.path_prefix.clone(),
        mask_internal_errors: args.mask_internal_errors,
        http_deadline: args.http_deadline,
        garbage_collection_interval: args.garbage_collection_interval,
        ..Default::default()
    };
    config.policy.accept_sha1 = args.accept_sha1_signing_algorithms;
    config.policy.reject_expired = args.reject_expired;
    config.policy.reject_unexpired = args.reject_unexpired;
    config.policy.not_after_start = args
        .not_after_start
        .as_deref()
        .map(parse_rfc3339_millis)
        .transpose()?;
    config.policy.not_after_limit = args
        .not_after_limit
        .as_deref()
        .map(parse_rfc3339_millis)
        .transpose()?;
    config.policy.ext_key_usages = parse_ext_key_usages(&args.ext_key_usages)?;
    config.policy.reject_extensions = parse_oids(&args.reject_extension)?;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = config_from_args(&args)?;

    let signing_key = signer::load_signing_key(&args.signing_key_file)?;
    let witnesses = args
        .witness_key_file
        .iter()
        .map(|path| signer::load_witness_key(path))
        .collect::<Result<Vec<_>, _>>()?;

    let object = Arc::new(PosixObjectBackend::new(&args.storage_dir).await?);
    let lock = Arc::new(PosixLockBackend::new(args.state_dir.join("lock")).await?);
    let antispam = AntispamIndex::open(
        &args.state_dir.join("antispam.db"),
        config.inmemory_antispam_cache_size,
    )?;

    // Seed the root pool from the PEM file plus any roots previously
    // mirrored from the remote source.
    let pem = std::fs::read(&args.roots_pem_file)
        .with_context(|| format!("reading {}", args.roots_pem_file.display()))?;
    let mut seed = Certificate::load_pem_chain(&pem).context("parsing roots PEM file")?;
    seed.extend(roots::load_backup_roots(object.as_ref()).await?);
    let root_pool = Arc::new(roots::RootPool::new(seed, config.reject_roots.clone())?);
    log::info!(
        "{}: accepting {} roots",
        config.origin,
        root_pool.snapshot().len()
    );

    let log = Arc::new(Log::new(
        config.clone(),
        signing_key,
        witnesses,
        root_pool.clone(),
        object.clone(),
        lock,
        antispam,
    ));
    log.init().await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let sequencer = tokio::spawn(log.clone().sequencer_task(shutdown_rx.clone()));
    tokio::spawn(log.clone().republish_task(shutdown_rx.clone()));
    tokio::spawn(gc::gc_task(
        object.clone(),
        config.garbage_collection_interval,
        shutdown_rx.clone(),
    ));
    if let (Some(url), interval) = (
        config.roots_remote_fetch_url.clone(),
        config.roots_remote_fetch_interval,
    ) {
        if !interval.is_zero() {
            // Fetch once at startup so the pool is complete before serving.
            let client = reqwest::Client::new();
            match roots::refresh_once(&root_pool, object.as_ref(), &client, &url).await {
                Ok(added) => log::info!("fetched remote roots at startup; added={added}"),
                Err(e) => log::warn!("startup root fetch failed: {e:#}"),
            }
            tokio::spawn(roots::refresh_task(
                root_pool.clone(),
                object.clone(),
                url,
                interval,
            ));
        }
    }
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    log::info!("{}: listening on {}", config.origin, args.listen);
    axum::serve(listener, http::router(log.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("shutting down");
        })
        .await?;

    // Drain the pool and publish a final checkpoint before exiting.
    shutdown_tx.send(true).ok();
    sequencer.await.ok();
    Ok(())
}

// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The dynamic pool of accepted roots.
//!
//! Readers load an immutable snapshot through an atomic pointer; mutation is
//! clone-modify-publish under a single writer lock, so a reader never
//! observes a partially applied batch. A configurable reject-list drops
//! roots regardless of their source, and remote-fetched roots are mirrored
//! into the roots backup store so a source outage cannot shrink the pool
//! across restarts.

use crate::ccadb;
use crate::storage::{CasStore, ObjectBackend};
use arc_swap::ArcSwap;
use der::{Decode, Encode};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use x509_cert::Certificate;
use x509_util::CertPool;

/// The shared set of accepted roots.
pub struct RootPool {
    current: ArcSwap<CertPool>,
    write_lock: Mutex<()>,
    reject: HashSet<[u8; 32]>,
}

impl RootPool {
    /// Returns a pool seeded with the given certificates, minus any on the
    /// reject-list.
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate cannot be encoded for
    /// fingerprinting.
    pub fn new(seed: Vec<Certificate>, reject: HashSet<[u8; 32]>) -> anyhow::Result<Self> {
        let mut pool = CertPool::default();
        for cert in seed {
            if !is_rejected(&cert, &reject)? {
                pool.add_cert(cert)?;
            }
        }
        Ok(Self {
            current: ArcSwap::from_pointee(pool),
            write_lock: Mutex::new(()),
            reject,
        })
    }

    /// Returns the current immutable snapshot. Lock-free.
    pub fn snapshot(&self) -> Arc<CertPool> {
        self.current.load_full()
    }

    /// Adds new roots via clone-modify-publish, returning how many were
    /// actually new. Roots on the reject-list are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a certificate cannot be encoded; in that case no
    /// snapshot is published.
    pub async fn add_roots(&self, certs: &[Certificate]) -> anyhow::Result<usize> {
        let _guard = self.write_lock.lock().await;
        let old = self.current.load();

        // Build the next snapshot before publishing anything.
        let mut candidates = Vec::new();
        for cert in certs {
            if !is_rejected(cert, &self.reject)? && !old.includes(cert)? {
                candidates.push(cert.clone());
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }
        let mut next = CertPool::new(old.certs.clone())?;
        for cert in &candidates {
            next.add_cert(cert.clone())?;
        }
        let added = next.len() - old.len();
        self.current.store(Arc::new(next));
        Ok(added)
    }
}

fn is_rejected(cert: &Certificate, reject: &HashSet<[u8; 32]>) -> anyhow::Result<bool> {
    let fingerprint: [u8; 32] = Sha256::digest(cert.to_der()?).into();
    Ok(reject.contains(&fingerprint))
}

/// Loads roots previously mirrored into the backup store.
///
/// # Errors
///
/// Returns an error if the store cannot be read; unparsable entries are
/// skipped with a warning.
pub async fn load_backup_roots(
    object: &dyn ObjectBackend,
) -> anyhow::Result<Vec<Certificate>> {
    let mut certs = Vec::new();
    for (_, der) in CasStore::roots().load_all(object).await? {
        match Certificate::from_der(&der) {
            Ok(cert) => certs.push(cert),
            Err(e) => log::warn!("skipping malformed backup root: {e}"),
        }
    }
    Ok(certs)
}

/// Periodically fetches remote roots, merges them into the pool, and mirrors
/// newly fetched roots into the backup store. Runs until cancelled.
pub async fn refresh_task(
    pool: Arc<RootPool>,
    object: Arc<dyn ObjectBackend>,
    url: String,
    interval: Duration,
) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match refresh_once(&pool, object.as_ref(), &client, &url).await {
            Ok(added) if added > 0 => log::info!("added {added} roots from {url}"),
            Ok(_) => log::debug!("no new roots at {url}"),
            Err(e) => log::warn!("failed to refresh roots from {url}: {e:#}"),
        }
    }
}

/// One fetch-merge-mirror round. Split out for tests.
///
/// # Errors
///
/// Returns an error if the fetch or the backup write fails.
pub async fn refresh_once(
    pool: &RootPool,
    object: &dyn ObjectBackend,
    client: &reqwest::Client,
    url: &str,
) -> anyhow::Result<usize> {
    let fetched = ccadb::fetch_roots(client, url).await?;
    let added = pool.add_roots(&fetched).await?;

    // Mirror everything fetched, not just what was new to the pool, so the
    // backup converges even if a previous mirror attempt failed.
    let ders = x509_util::certs_to_bytes(&fetched)?;
    let der_refs: Vec<&[u8]> = ders.iter().map(Vec::as_slice).collect();
    CasStore::roots()
        .add_if_not_exist(object, &der_refs)
        .await
        .map_err(anyhow::Error::from)?;

    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectBackend;
    use x509_util::testutil::TestAuthority;

    #[tokio::test]
    async fn test_snapshot_swap_is_atomic_per_batch() {
        let a = TestAuthority::new("CN=Root A");
        let b = TestAuthority::new("CN=Root B");
        let c = TestAuthority::new("CN=Root C");

        let pool = RootPool::new(vec![a.cert.clone()], HashSet::new()).unwrap();
        let before = pool.snapshot();
        assert_eq!(before.len(), 1);

        let added = pool
            .add_roots(&[b.cert.clone(), c.cert.clone()])
            .await
            .unwrap();
        assert_eq!(added, 2);

        // The old snapshot is untouched; the new one has the whole batch.
        assert_eq!(before.len(), 1);
        assert_eq!(pool.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicates_not_readded() {
        let a = TestAuthority::new("CN=Root A");
        let pool = RootPool::new(vec![a.cert.clone()], HashSet::new()).unwrap();
        assert_eq!(pool.add_roots(&[a.cert.clone()]).await.unwrap(), 0);
        assert_eq!(pool.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_list_applies_to_all_sources() {
        let a = TestAuthority::new("CN=Root A");
        let b = TestAuthority::new("CN=Root B");
        let mut reject = HashSet::new();
        reject.insert(<[u8; 32]>::from(Sha256::digest(a.cert_der())));

        let pool = RootPool::new(vec![a.cert.clone()], reject).unwrap();
        assert_eq!(pool.snapshot().len(), 0);
        assert_eq!(
            pool.add_roots(&[a.cert.clone(), b.cert.clone()])
                .await
                .unwrap(),
            1
        );
        assert_eq!(pool.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_round_trip() {
        let object = MemoryObjectBackend::new();
        let a = TestAuthority::new("CN=Backup Root");
        let der = a.cert_der();
        CasStore::roots()
            .add_if_not_exist(&object, &[der.as_slice()])
            .await
            .unwrap();

        let loaded = load_backup_roots(&object).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], a.cert);
    }
}

// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! The anti-spam index: a persistent map from leaf identity hash to
//! assigned index, deduplicating submissions across restarts.
//!
//! Two tiers: a bounded in-memory LRU answers hot lookups synchronously, and
//! a SQLite table holds the full history. New pairs are written by a
//! single-writer follower task fed from the sequencer; its backlog is the
//! follower lag that feeds pushback. A lookup that misses the cache falls
//! through to SQLite on a blocking worker thread.

use crate::SequenceMetadata;
use anyhow::Context;
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use static_ct_api::IdentityHash;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tlog_tiles::LeafIndex;
use tokio::sync::mpsc;

/// The persistent anti-spam index with its in-memory cache.
pub struct AntispamIndex {
    cache: Mutex<LruCache<IdentityHash, LeafIndex>>,
    conn: Arc<Mutex<Connection>>,
    tx: mpsc::UnboundedSender<Vec<(IdentityHash, LeafIndex)>>,
    // Entries handed to the follower but not yet committed.
    lag: Arc<AtomicU64>,
}

impl AntispamIndex {
    /// Opens (creating if needed) the index at `path` and spawns its
    /// follower task.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or its schema
    /// cannot be initialised.
    pub fn open(path: &Path, cache_size: usize) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening anti-spam index at {}", path.display()))?;
        Self::with_connection(conn, cache_size)
    }

    /// Opens an in-memory index, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be initialised.
    pub fn open_in_memory(cache_size: usize) -> anyhow::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, cache_size)
    }

    fn with_connection(conn: Connection, cache_size: usize) -> anyhow::Result<Self> {
        init_schema(&conn)?;
        let conn = Arc::new(Mutex::new(conn));
        let lag = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(follower(conn.clone(), rx, lag.clone()));
        Ok(Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_size.max(1)).unwrap(),
            )),
            conn,
            tx,
            lag,
        })
    }

    /// Looks up an identity hash, first in the cache, then in SQLite.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn lookup(&self, hash: &IdentityHash) -> anyhow::Result<Option<LeafIndex>> {
        if let Some(index) = self.cache.lock().unwrap().get(hash) {
            return Ok(Some(*index));
        }
        let conn = self.conn.clone();
        let hash = *hash;
        let found = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT leaf_index FROM dedup WHERE identity_hash = ?1",
                params![hash.as_slice()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })
        .await??;
        let found = found.map(|index| index as LeafIndex);
        if let Some(index) = found {
            self.cache.lock().unwrap().put(hash, index);
        }
        Ok(found)
    }

    /// Records newly sequenced entries: the cache picks them up
    /// synchronously and the follower persists them in the background.
    pub fn put_entries(&self, entries: &[(IdentityHash, SequenceMetadata)]) {
        if entries.is_empty() {
            return;
        }
        let batch: Vec<(IdentityHash, LeafIndex)> = {
            let mut cache = self.cache.lock().unwrap();
            entries
                .iter()
                .map(|(hash, (index, _))| {
                    cache.put(*hash, *index);
                    (*hash, *index)
                })
                .collect()
        };
        self.lag.fetch_add(batch.len() as u64, Ordering::Relaxed);
        if self.tx.send(batch).is_err() {
            // Follower gone; only possible during shutdown.
            log::warn!("anti-spam follower channel closed");
        }
    }

    /// Returns the follower's current backlog in entries.
    pub fn lag(&self) -> u64 {
        self.lag.load(Ordering::Relaxed)
    }

    /// Returns the number of persisted entries, for diagnostics and tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn persisted_count(&self) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM dedup", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS dedup (
            identity_hash BLOB PRIMARY KEY,
            leaf_index INTEGER NOT NULL
        ) WITHOUT ROWID;",
    )
}

// The single-writer follower: drains batches from the sequencer and commits
// them, decrementing the lag counter as batches land.
async fn follower(
    conn: Arc<Mutex<Connection>>,
    mut rx: mpsc::UnboundedReceiver<Vec<(IdentityHash, LeafIndex)>>,
    lag: Arc<AtomicU64>,
) {
    while let Some(batch) = rx.recv().await {
        let conn = conn.clone();
        let count = batch.len() as u64;
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO dedup (identity_hash, leaf_index) VALUES (?1, ?2)",
                )?;
                for (hash, index) in &batch {
                    stmt.execute(params![hash.as_slice(), *index as i64])?;
                }
            }
            tx.commit()
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("anti-spam follower write failed: {e}"),
            Err(e) => log::error!("anti-spam follower task failed: {e}"),
        }
        lag.fetch_sub(count, Ordering::Relaxed);
    }
}

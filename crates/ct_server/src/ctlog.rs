// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Core functionality of the log: pooling submissions, assigning indexes,
//! integrating batches into the tiled Merkle tree, signing checkpoints, and
//! resolving duplicates.
//!
//! One logical sequencer drives the batch loop. Request tasks add validated
//! entries to the pool and wait on a watch channel; the sequencer closes the
//! pool on a size or age trigger, assigns contiguous indexes, stages the new
//! entry bundles and tiles, commits the checkpoint to the lock backend with
//! a compare-and-swap, applies the staged uploads to the object backend, and
//! only then resolves the waiting futures. A batch is therefore durable
//! before any SCT for it exists.

use crate::antispam::AntispamIndex;
use crate::config::LogConfig;
use crate::metrics::{millis_diff_as_secs, AsF64, Metrics};
use crate::now_millis;
use crate::rate_limit::RateLimits;
use crate::roots::RootPool;
use crate::storage::{CasStore, LockBackend, ObjectBackend, UploadOptions};
use crate::SequenceMetadata;
use anyhow::{anyhow, bail};
use p256::ecdsa::SigningKey as EcdsaSigningKey;
use serde::{Deserialize, Serialize};
use signed_note::Ed25519NoteSigner;
use static_ct_api::{
    bundle_timestamp_at, BundleIterator, Entry, IdentityHash, PendingEntry, TreeWithTimestamp,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::sync::LazyLock;
use thiserror::Error;
use tlog_tiles::{Hash, HashReader, LeafIndex, TlogError, TlogTile, HASH_SIZE};
use tokio::sync::watch::{channel, Receiver, Sender};
use tokio::sync::{Mutex, Notify};

/// Path of the checkpoint in both the object and lock backends.
pub const CHECKPOINT_KEY: &str = "checkpoint";
/// Path of the staging bundle in the lock backend.
const STAGING_KEY: &str = "staging";
/// The maximum tile level is 63, so this is free to key the entry-bundle
/// edge tile.
const DATA_TILE_KEY: u8 = u8::MAX;

/// Why the sequencer refused a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushback {
    /// The anti-spam follower is too far behind.
    Antispam,
    /// Too many entries are awaiting integration.
    Integration,
    /// Lower-level storage refused the write.
    Other,
}

impl Pushback {
    /// The label used for metrics and error bodies.
    pub fn reason(self) -> &'static str {
        match self {
            Pushback::Antispam => "pushback_antispam",
            Pushback::Integration => "pushback_integration",
            Pushback::Other => "pushback_other",
        }
    }
}

/// An error from adding an entry to the log.
#[derive(Error, Debug)]
pub enum AddError {
    #[error("sequencer pushback: {}", .0.reason())]
    Pushback(Pushback),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of adding an entry: either the index of a previously sequenced
/// duplicate, or a future for an entry now awaiting sequencing.
#[derive(Debug)]
pub enum AddOutcome {
    /// The entry was sequenced in the past; the anti-spam index knows only
    /// its index, and the original timestamp must be recovered from the
    /// entry bundle.
    Cached { index: LeafIndex },
    /// The entry is in the pool (or was already, if `is_dup`).
    Pending {
        rx: Receiver<SequenceMetadata>,
        is_dup: bool,
    },
}

impl AddOutcome {
    /// Returns whether this submission duplicates an earlier one.
    pub fn is_dup(&self) -> bool {
        match self {
            AddOutcome::Cached { .. } => true,
            AddOutcome::Pending { is_dup, .. } => *is_dup,
        }
    }
}

// Entries waiting to be sequenced, with their watch senders, plus the
// deduplication maps covering both the open pool and the batch currently
// being sequenced.
#[derive(Default)]
struct PoolState {
    pending: Vec<(PendingEntry, Sender<SequenceMetadata>)>,
    pending_dedup: HashMap<IdentityHash, Receiver<SequenceMetadata>>,
    in_sequencing: usize,
    in_sequencing_dedup: HashMap<IdentityHash, Receiver<SequenceMetadata>>,
}

impl PoolState {
    fn check(&self, hash: &IdentityHash) -> Option<Receiver<SequenceMetadata>> {
        self.in_sequencing_dedup
            .get(hash)
            .or_else(|| self.pending_dedup.get(hash))
            .cloned()
    }
}

// State owned by the sequencing loop.
struct SequenceState {
    tree: TreeWithTimestamp,
    checkpoint: Vec<u8>,
    // Map from level to the right-most tile of that level; DATA_TILE_KEY
    // holds the right-most entry bundle.
    edge_tiles: HashMap<u8, TileWithBytes>,
}

/// A tile along with its contents.
#[derive(Clone, Debug)]
struct TileWithBytes {
    tile: TlogTile,
    b: Vec<u8>,
}

// An error from one sequencing round. Fatal errors invalidate the in-memory
// sequence state, which is reloaded from storage before the next round.
#[derive(Error, Debug)]
enum SequenceError {
    #[error("fatal sequencing error: {0}")]
    Fatal(String),
    #[error("non-fatal sequencing error: {0}")]
    NonFatal(String),
}

/// The log: all shared state behind one value, passed by reference into
/// handlers and tasks.
pub struct Log {
    config: LogConfig,
    signing_key: EcdsaSigningKey,
    witnesses: Vec<Ed25519NoteSigner>,
    roots: Arc<RootPool>,
    object: Arc<dyn ObjectBackend>,
    lock: Arc<dyn LockBackend>,
    antispam: AntispamIndex,
    rate_limits: RateLimits,
    metrics: Metrics,

    pool: StdMutex<PoolState>,
    sequence_state: Mutex<Option<SequenceState>>,
    batch_full: Notify,
    // Size of the last committed tree, for duplicate resolution.
    tree_size: AtomicU64,
    last_publish_millis: AtomicU64,
}

impl Log {
    /// Assembles a log from its parts. Call [`Log::init`] before serving.
    pub fn new(
        config: LogConfig,
        signing_key: EcdsaSigningKey,
        witnesses: Vec<Ed25519NoteSigner>,
        roots: Arc<RootPool>,
        object: Arc<dyn ObjectBackend>,
        lock: Arc<dyn LockBackend>,
        antispam: AntispamIndex,
    ) -> Self {
        let rate_limits = RateLimits::new(
            config.rate_limit_old_not_before,
            config.rate_limit_issuer,
            config.rate_limit_dedup,
        );
        Self {
            config,
            signing_key,
            witnesses,
            roots,
            object,
            lock,
            antispam,
            rate_limits,
            metrics: Metrics::new(),
            pool: StdMutex::new(PoolState::default()),
            sequence_state: Mutex::new(None),
            batch_full: Notify::new(),
            tree_size: AtomicU64::new(0),
            last_publish_millis: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn roots(&self) -> &RootPool {
        &self.roots
    }

    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    pub fn antispam(&self) -> &AntispamIndex {
        &self.antispam
    }

    pub fn object(&self) -> &dyn ObjectBackend {
        self.object.as_ref()
    }

    /// Returns the size of the latest committed tree.
    pub fn tree_size(&self) -> u64 {
        self.tree_size.load(Ordering::Acquire)
    }

    /// Creates the log in storage if it does not exist, and records the
    /// current tree size. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if storage is unreachable or holds an inconsistent
    /// checkpoint.
    pub async fn init(&self) -> anyhow::Result<()> {
        if let Ok(stored) = self.lock.get(CHECKPOINT_KEY).await {
            let (checkpoint, _) = static_ct_api::open_checkpoint(
                &self.config.origin,
                self.signing_key.verifying_key(),
                None,
                now_millis(),
                &stored,
            )?;
            self.tree_size.store(checkpoint.size(), Ordering::Release);
            log::info!(
                "{}: loaded log; size={}",
                self.config.origin,
                checkpoint.size()
            );
            return Ok(());
        }
        if self
            .object
            .fetch(CHECKPOINT_KEY)
            .await
            .map_err(|e| anyhow!("failed to retrieve checkpoint from object storage: {e}"))?
            .is_some()
        {
            bail!("checkpoint missing from lock backend but present in object storage");
        }

        let timestamp = now_millis();
        let tree = TreeWithTimestamp::new(0, tlog_tiles::EMPTY_HASH, timestamp);
        let checkpoint = tree
            .sign(
                &self.config.origin,
                &self.signing_key,
                &self.witness_refs(),
                &mut rand::thread_rng(),
            )
            .map_err(|e| anyhow!("failed to sign checkpoint: {e}"))?;
        self.lock.put(CHECKPOINT_KEY, &checkpoint).await?;
        self.object
            .upload(CHECKPOINT_KEY, &checkpoint, &OPTS_CHECKPOINT)
            .await?;
        self.last_publish_millis.store(timestamp, Ordering::Release);
        log::info!("{}: created log; timestamp={timestamp}", self.config.origin);
        Ok(())
    }

    fn witness_refs(&self) -> Vec<&Ed25519NoteSigner> {
        self.witnesses.iter().collect()
    }

    /// Stores the issuer certificates referenced by a submission.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a content-address collision.
    pub async fn upload_issuers(&self, issuers: &[Vec<u8>]) -> anyhow::Result<()> {
        let refs: Vec<&[u8]> = issuers.iter().map(Vec::as_slice).collect();
        let added = CasStore::issuers()
            .add_if_not_exist(self.object.as_ref(), &refs)
            .await
            .map_err(|e| anyhow!(e))?;
        for path in added {
            log::info!("{}: observed new issuer; path={path}", self.config.origin);
        }
        Ok(())
    }

    /// Adds a validated entry to the pool, deduplicating against pending
    /// entries, the in-memory cache, and the persistent anti-spam index.
    ///
    /// # Errors
    ///
    /// Returns [`AddError::Pushback`] when the log is overloaded, or an
    /// internal error if the anti-spam lookup fails.
    pub async fn add_entry(&self, entry: PendingEntry) -> Result<AddOutcome, AddError> {
        let hash = entry.identity_hash();

        if let Some(rx) = self.pool.lock().unwrap().check(&hash) {
            return Ok(AddOutcome::Pending { rx, is_dup: true });
        }
        if let Some(index) = self.antispam.lookup(&hash).await? {
            return Ok(AddOutcome::Cached { index });
        }

        if self.antispam.lag() > self.config.pushback_max_antispam_lag {
            self.metrics
                .rate_limited
                .with_label_values(&[Pushback::Antispam.reason()])
                .inc();
            return Err(AddError::Pushback(Pushback::Antispam));
        }

        let mut pool = self.pool.lock().unwrap();
        // The entry may have been pooled by a racing task during the
        // anti-spam lookup.
        if let Some(rx) = pool.check(&hash) {
            return Ok(AddOutcome::Pending { rx, is_dup: true });
        }
        if pool.pending.len() + pool.in_sequencing >= self.config.pushback_max_outstanding {
            self.metrics
                .rate_limited
                .with_label_values(&[Pushback::Integration.reason()])
                .inc();
            return Err(AddError::Pushback(Pushback::Integration));
        }

        let (tx, rx) = channel((0, 0));
        pool.pending.push((entry, tx));
        pool.pending_dedup.insert(hash, rx.clone());
        let batch_full = pool.pending.len() >= self.config.batch_max_size;
        drop(pool);
        if batch_full {
            self.batch_full.notify_one();
        }
        Ok(AddOutcome::Pending { rx, is_dup: false })
    }

    /// Recovers the original timestamp of a previously sequenced entry by
    /// reading the owning entry bundle, and returns the reconstructed entry
    /// for SCT signing.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle cannot be fetched or does not contain
    /// the entry.
    pub async fn resolve_duplicate(
        &self,
        pending: PendingEntry,
        index: LeafIndex,
    ) -> anyhow::Result<Entry> {
        let size = self.tree_size();
        if index >= size {
            bail!("duplicate index {index} beyond tree size {size}");
        }
        let bundle_index = index / u64::from(TlogTile::FULL_WIDTH);
        let width = if (bundle_index + 1) * u64::from(TlogTile::FULL_WIDTH) <= size {
            TlogTile::FULL_WIDTH
        } else {
            u16::try_from(size % u64::from(TlogTile::FULL_WIDTH)).unwrap()
        };
        let tile = TlogTile::new(0, bundle_index, width, true);
        let bundle = self
            .object
            .fetch(&tile.path())
            .await?
            .ok_or_else(|| anyhow!("no entry bundle at {}", tile.path()))?;
        let offset = usize::try_from(index % u64::from(TlogTile::FULL_WIDTH)).unwrap();
        let timestamp = bundle_timestamp_at(&bundle, offset)?;
        Ok(pending.into_entry(index, timestamp))
    }

    /// Signs an SCT for a sequenced entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing key cannot be encoded.
    pub fn sign_sct(
        &self,
        entry: &Entry,
    ) -> Result<static_ct_api::AddChainResponse, p256::pkcs8::spki::Error> {
        static_ct_api::signed_certificate_timestamp(&self.signing_key, entry)
    }

    /// Runs one sequencing round: closes the pool, integrates the batch, and
    /// publishes a new checkpoint if the tree grew or the checkpoint
    /// interval elapsed.
    ///
    /// # Errors
    ///
    /// Returns an error only for fatal rounds, after which the next round
    /// reloads the sequence state from storage.
    pub async fn sequence(&self) -> anyhow::Result<()> {
        let mut state_guard = self.sequence_state.lock().await;
        if state_guard.is_none() {
            match self.load_sequence_state().await {
                Ok(state) => {
                    self.tree_size.store(state.tree.size(), Ordering::Release);
                    *state_guard = Some(state);
                }
                Err(e) => {
                    self.metrics.seq_count.with_label_values(&["fatal"]).inc();
                    log::error!("{}: fatal sequencing error: {e:#}", self.config.origin);
                    return Err(e);
                }
            }
        }
        let state = state_guard.as_mut().unwrap();

        let entries = {
            let mut pool = self.pool.lock().unwrap();
            pool.in_sequencing_dedup = std::mem::take(&mut pool.pending_dedup);
            let entries = std::mem::take(&mut pool.pending);
            pool.in_sequencing = entries.len();
            entries
        };

        let checkpoint_due = now_millis()
            >= self.last_publish_millis.load(Ordering::Acquire)
                + u64::try_from(self.config.checkpoint_interval.as_millis()).unwrap();
        let result = if entries.is_empty() && !checkpoint_due {
            self.metrics.seq_count.with_label_values(&["skip"]).inc();
            Ok(())
        } else {
            self.metrics.seq_pool_size.observe(entries.len().as_f64());
            match self.sequence_entries(state, entries).await {
                Ok(()) => {
                    self.metrics.seq_count.with_label_values(&["none"]).inc();
                    Ok(())
                }
                Err(SequenceError::Fatal(e)) => {
                    self.metrics.seq_count.with_label_values(&["fatal"]).inc();
                    log::error!("{}: fatal sequencing error: {e}", self.config.origin);
                    *state_guard = None;
                    Err(anyhow!(e))
                }
                Err(SequenceError::NonFatal(e)) => {
                    self.metrics.seq_count.with_label_values(&["non-fatal"]).inc();
                    log::error!("{}: non-fatal sequencing error: {e}", self.config.origin);
                    Ok(())
                }
            }
        };

        // Entries are now either in the anti-spam index or failed; a
        // resubmission must not deduplicate against a failed round.
        {
            let mut pool = self.pool.lock().unwrap();
            pool.in_sequencing_dedup.clear();
            pool.in_sequencing = 0;
        }
        self.metrics.antispam_lag.set(self.antispam.lag().as_f64());

        result
    }

    // Integrates one batch. See the module comment for the commit protocol.
    #[allow(clippy::too_many_lines)]
    async fn sequence_entries(
        &self,
        state: &mut SequenceState,
        entries: Vec<(PendingEntry, Sender<SequenceMetadata>)>,
    ) -> Result<(), SequenceError> {
        let origin = &self.config.origin;
        let old_size = state.tree.size();
        let old_time = state.tree.time();
        let timestamp = now_millis();

        let mut tile_uploads: Vec<UploadAction> = Vec::new();
        let mut edge_tiles = state.edge_tiles.clone();

        // Start from the current partial bundle, if any.
        let mut data_tile = Vec::new();
        if let Some(t) = edge_tiles.get(&DATA_TILE_KEY) {
            if t.tile.width() < TlogTile::FULL_WIDTH {
                data_tile.clone_from(&t.b);
            }
        }

        let mut overlay = HashMap::new();
        let mut n = old_size;
        let mut sequenced_metadata = Vec::with_capacity(entries.len());
        let mut antispam_entries = Vec::with_capacity(entries.len());

        for (pending, sender) in entries {
            let metadata = (n, timestamp);
            antispam_entries.push((pending.identity_hash(), metadata));

            let entry = pending.into_entry(n, timestamp);
            let bundle_leaf = entry.bundle_leaf();
            self.metrics.seq_leaf_size.observe(bundle_leaf.len().as_f64());
            data_tile.extend(bundle_leaf);

            // Fold the new leaf into the hash storage overlay; the hashes
            // are used for later leaves and finally for the new tiles.
            let merkle_leaf = entry.merkle_tree_leaf();
            let hashes = tlog_tiles::stored_hashes(
                n,
                &merkle_leaf,
                &HashReaderWithOverlay {
                    edge_tiles: &edge_tiles,
                    overlay: &overlay,
                },
            )
            .map_err(|e| {
                SequenceError::NonFatal(format!("couldn't compute new hashes for leaf {n}: {e}"))
            })?;
            for (i, h) in hashes.iter().enumerate() {
                let id = tlog_tiles::stored_hash_index(0, n) + i as u64;
                overlay.insert(id, *h);
            }

            sequenced_metadata.push((sender, metadata));
            n += 1;

            if n % u64::from(TlogTile::FULL_WIDTH) == 0 {
                self.metrics
                    .seq_data_tile_size
                    .observe(data_tile.len().as_f64());
                stage_data_tile(n, &mut edge_tiles, &mut tile_uploads, std::mem::take(&mut data_tile));
            }
        }

        // Stage the leftover partial bundle, if any.
        if n != old_size && n % u64::from(TlogTile::FULL_WIDTH) != 0 {
            self.metrics
                .seq_data_tile_size
                .observe(data_tile.len().as_f64());
            stage_data_tile(n, &mut edge_tiles, &mut tile_uploads, std::mem::take(&mut data_tile));
        }

        // Produce and stage the new tree tiles.
        for tile in TlogTile::new_tiles(old_size, n) {
            let data = tile
                .read_data(&HashReaderWithOverlay {
                    edge_tiles: &edge_tiles,
                    overlay: &overlay,
                })
                .map_err(|e| {
                    SequenceError::NonFatal(format!("couldn't generate tile {tile:?}: {e}"))
                })?;
            // new_tiles produces tiles in order, so each should be at least
            // as far right as the current edge, but double check.
            if edge_tiles.get(&tile.level()).is_none_or(|t| {
                t.tile.level_index() < tile.level_index()
                    || (t.tile.level_index() == tile.level_index() && t.tile.width() < tile.width())
            }) {
                log::debug!(
                    "{origin}: staging tree tile; old_tree_size={old_size}, tree_size={n}, tile={tile:?}, size={}",
                    data.len()
                );
                edge_tiles.insert(
                    tile.level(),
                    TileWithBytes {
                        tile,
                        b: data.clone(),
                    },
                );
            }
            tile_uploads.push(UploadAction {
                key: tile.path(),
                data,
                opts: OPTS_HASH_TILE.clone(),
            });
        }

        let tree = TreeWithTimestamp::from_hash_reader(
            n,
            &HashReaderWithOverlay {
                edge_tiles: &edge_tiles,
                overlay: &overlay,
            },
            timestamp,
        )
        .map_err(|e| SequenceError::NonFatal(format!("couldn't compute tree head: {e}")))?;

        let checkpoint = tree
            .sign(
                origin,
                &self.signing_key,
                &self.witness_refs(),
                &mut rand::thread_rng(),
            )
            .map_err(|e| SequenceError::NonFatal(format!("couldn't sign checkpoint: {e}")))?;

        // Stage the uploads in the lock backend, where crash recovery can
        // replay them if we lose the race against our own object writes.
        let staged_uploads = marshal_staged_uploads(&tile_uploads, tree.size(), tree.hash())
            .map_err(|e| SequenceError::NonFatal(format!("couldn't marshal staged uploads: {e}")))?;
        self.lock
            .put(STAGING_KEY, &staged_uploads)
            .await
            .map_err(|e| SequenceError::NonFatal(format!("couldn't stage uploads: {e}")))?;

        // Committing the checkpoint is the point of no return. On failure we
        // don't know the lock backend's state, so the round is fatal and the
        // state is reloaded.
        self.lock
            .swap(CHECKPOINT_KEY, &state.checkpoint, &checkpoint)
            .await
            .map_err(|e| {
                SequenceError::Fatal(format!("couldn't commit checkpoint to lock backend: {e}"))
            })?;

        *state = SequenceState {
            tree,
            checkpoint,
            edge_tiles,
        };
        self.tree_size.store(n, Ordering::Release);

        // Use apply_staged_uploads rather than tile_uploads directly, to
        // exercise the same code path as crash recovery. A failure here is
        // fatal: a later round would not upload these tiles again, while a
        // reload replays them from the staging bundle.
        apply_staged_uploads(
            self.object.as_ref(),
            &staged_uploads,
            state.tree.size(),
            state.tree.hash(),
        )
        .await
        .map_err(|e| SequenceError::Fatal(format!("couldn't apply staged uploads: {e}")))?;

        // If the checkpoint upload fails, fail the round so we don't hand
        // out SCTs for a tree that monitors cannot see yet.
        self.object
            .upload(CHECKPOINT_KEY, state.checkpoint(), &OPTS_CHECKPOINT)
            .await
            .map_err(|e| {
                SequenceError::NonFatal(format!("couldn't publish checkpoint: {e}"))
            })?;
        self.last_publish_millis.store(timestamp, Ordering::Release);

        // The batch is durable and public; resolve the futures.
        for (sender, metadata) in sequenced_metadata {
            sender.send_replace(metadata);
        }

        // Feed the anti-spam index last. A failure here only produces
        // duplicate leaves, never missing ones.
        self.antispam.put_entries(&antispam_entries);

        log::info!(
            "{origin}: sequenced pool; tree_size={n}, entries={}, tiles={}, timestamp={timestamp}, duration={:.2}s, since_last={:.2}s",
            n - old_size,
            tile_uploads.len(),
            millis_diff_as_secs(timestamp, now_millis()),
            millis_diff_as_secs(old_time, timestamp),
        );
        self.metrics
            .seq_duration
            .observe(millis_diff_as_secs(timestamp, now_millis()));
        self.metrics.seq_tiles.inc_by(tile_uploads.len().as_f64());
        self.metrics.tree_size.set(n.as_f64());
        self.metrics.tree_time.set(timestamp.as_f64() / 1e3);

        Ok(())
    }

    // Loads the sequencing state from the backends: the authoritative
    // checkpoint from the lock backend, recovery of any staged uploads the
    // object backend is missing, and the verified right-edge tiles.
    async fn load_sequence_state(&self) -> anyhow::Result<SequenceState> {
        let origin = &self.config.origin;
        let stored_checkpoint = self.lock.get(CHECKPOINT_KEY).await?;
        let (checkpoint, timestamp) = static_ct_api::open_checkpoint(
            origin,
            self.signing_key.verifying_key(),
            None,
            now_millis(),
            &stored_checkpoint,
        )?;

        let object_checkpoint = self
            .object
            .fetch(CHECKPOINT_KEY)
            .await?
            .ok_or_else(|| anyhow!("no checkpoint in object storage"))?;
        let (c1, _) = static_ct_api::open_checkpoint(
            origin,
            self.signing_key.verifying_key(),
            None,
            now_millis(),
            &object_checkpoint,
        )?;

        match (c1.size().cmp(&checkpoint.size()), c1.hash() == checkpoint.hash()) {
            (std::cmp::Ordering::Equal, false) => {
                bail!(
                    "{origin}: checkpoint hash mismatch: {} != {}",
                    c1.hash(),
                    checkpoint.hash()
                );
            }
            (std::cmp::Ordering::Greater, _) => bail!(
                "{origin}: object storage checkpoint is newer than lock backend: {} > {}",
                c1.size(),
                checkpoint.size()
            ),
            (std::cmp::Ordering::Less, _) => {
                // We crashed between committing the checkpoint and applying
                // the staged uploads. Replay them before continuing.
                log::warn!(
                    "{origin}: object storage checkpoint is stale; old_size={}, size={}",
                    c1.size(),
                    checkpoint.size()
                );
                let staged_uploads = self.lock.get(STAGING_KEY).await?;
                apply_staged_uploads(
                    self.object.as_ref(),
                    &staged_uploads,
                    checkpoint.size(),
                    checkpoint.hash(),
                )
                .await?;
                self.object
                    .upload(CHECKPOINT_KEY, &stored_checkpoint, &OPTS_CHECKPOINT)
                    .await?;
            }
            (std::cmp::Ordering::Equal, true) => {}
        }

        let mut edge_tiles = HashMap::new();
        if checkpoint.size() > 0 {
            edge_tiles = read_edge_tiles(self.object.as_ref(), checkpoint.size()).await?;

            // The fetched tiles are trusted only once they reproduce the
            // committed root hash.
            let computed = tlog_tiles::tree_hash(
                checkpoint.size(),
                &HashReaderWithOverlay {
                    edge_tiles: &edge_tiles,
                    overlay: &HashMap::new(),
                },
            )?;
            if computed != *checkpoint.hash() {
                bail!(
                    "{origin}: edge tiles do not match checkpoint: {computed} != {}",
                    checkpoint.hash()
                );
            }

            // Fetch the right-most entry bundle and verify it against the
            // level-0 tile.
            let level0 = edge_tiles
                .get(&0)
                .ok_or_else(|| anyhow!("no level 0 edge tile"))?
                .clone();
            let bundle_tile = level0.tile.with_data();
            let bundle = self
                .object
                .fetch(&bundle_tile.path())
                .await?
                .ok_or_else(|| anyhow!("no entry bundle at {}", bundle_tile.path()))?;
            let start = u64::from(TlogTile::FULL_WIDTH) * bundle_tile.level_index();
            for (i, entry) in
                BundleIterator::new(bundle.clone(), bundle_tile.width() as usize, start).enumerate()
            {
                let entry = entry?;
                let got = entry.merkle_leaf_hash();
                let expected = level0.tile.hash_at_index(
                    &level0.b,
                    tlog_tiles::stored_hash_index(0, start + i as u64),
                )?;
                if got != expected {
                    bail!(
                        "entry bundle leaf {} hashes to {got}, level 0 hash is {expected}",
                        start + i as u64
                    );
                }
            }
            edge_tiles.insert(
                DATA_TILE_KEY,
                TileWithBytes {
                    tile: bundle_tile,
                    b: bundle,
                },
            );
        }

        log::info!(
            "{origin}: loaded sequencing state; size={}, timestamp={timestamp}",
            checkpoint.size()
        );
        Ok(SequenceState {
            tree: TreeWithTimestamp::new(checkpoint.size(), *checkpoint.hash(), timestamp),
            checkpoint: stored_checkpoint,
            edge_tiles,
        })
    }

    /// The sequencer: one logical task driving the batch loop until
    /// `shutdown` fires, then draining the pool one final time.
    pub async fn sequencer_task(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.batch_max_age);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = self.batch_full.notified() => {}
                _ = shutdown.changed() => {
                    if let Err(e) = self.sequence().await {
                        log::error!("{}: final sequencing failed: {e:#}", self.config.origin);
                    }
                    log::info!("{}: sequencer stopped", self.config.origin);
                    return;
                }
            }
            // Fatal errors are retried here: the next round reloads state.
            if let Err(e) = self.sequence().await {
                log::error!("{}: sequencing round failed: {e:#}", self.config.origin);
            }
        }
    }

    /// Re-publishes the current checkpoint to the object backend on the
    /// configured interval, so monitors see a fresh object even when the
    /// tree is idle.
    pub async fn republish_task(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.checkpoint_republish_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            let checkpoint = match self.lock.get(CHECKPOINT_KEY).await {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    log::warn!("{}: republish read failed: {e:#}", self.config.origin);
                    continue;
                }
            };
            if let Err(e) = self
                .object
                .upload(CHECKPOINT_KEY, &checkpoint, &OPTS_CHECKPOINT)
                .await
            {
                log::warn!("{}: republish upload failed: {e:#}", self.config.origin);
            }
        }
    }
}

// Stages an entry bundle covering the leaves up to n.
fn stage_data_tile(
    n: u64,
    edge_tiles: &mut HashMap<u8, TileWithBytes>,
    tile_uploads: &mut Vec<UploadAction>,
    data_tile: Vec<u8>,
) {
    let tile = TlogTile::from_index(tlog_tiles::stored_hash_index(0, n - 1)).with_data();
    edge_tiles.insert(
        DATA_TILE_KEY,
        TileWithBytes {
            tile,
            b: data_tile.clone(),
        },
    );
    tile_uploads.push(UploadAction {
        key: tile.path(),
        data: data_tile,
        opts: OPTS_DATA_TILE.clone(),
    });
}

// Fetches the right-most tile of every level for a tree of the given size.
async fn read_edge_tiles(
    object: &dyn ObjectBackend,
    tree_size: u64,
) -> anyhow::Result<HashMap<u8, TileWithBytes>> {
    let mut edge_tiles = HashMap::new();
    let mut level = 0u8;
    loop {
        let shift = u32::from(level) * u32::from(TlogTile::HEIGHT);
        if shift >= 64 || tree_size >> shift == 0 {
            break;
        }
        // Number of tree nodes at this tile level.
        let m = tree_size >> shift;
        let (index, width) = if m % u64::from(TlogTile::FULL_WIDTH) == 0 {
            (m / u64::from(TlogTile::FULL_WIDTH) - 1, TlogTile::FULL_WIDTH)
        } else {
            (
                m / u64::from(TlogTile::FULL_WIDTH),
                u16::try_from(m % u64::from(TlogTile::FULL_WIDTH)).unwrap(),
            )
        };
        let tile = TlogTile::new(level, index, width, false);
        let data = object
            .fetch(&tile.path())
            .await?
            .ok_or_else(|| anyhow!("missing edge tile {}", tile.path()))?;
        edge_tiles.insert(level, TileWithBytes { tile, b: data });
        level += 1;
    }
    Ok(edge_tiles)
}

impl SequenceState {
    fn checkpoint(&self) -> &[u8] {
        &self.checkpoint
    }
}

/// A pending upload, serialised into the staging bundle.
#[derive(Debug, Serialize, Deserialize)]
struct UploadAction {
    key: String,
    data: Vec<u8>,
    opts: UploadOptions,
}

// Marshals pending uploads into a staging bundle bound to the tree they
// produce: size, root hash, then the serialised actions.
fn marshal_staged_uploads(
    uploads: &[UploadAction],
    size: u64,
    hash: &Hash,
) -> anyhow::Result<Vec<u8>> {
    Ok(size
        .to_be_bytes()
        .into_iter()
        .chain(hash.0.iter().copied())
        .chain(serde_json::to_vec(uploads)?)
        .collect())
}

// Applies a staging bundle to the object backend, refusing bundles that do
// not match the expected tree.
async fn apply_staged_uploads(
    object: &dyn ObjectBackend,
    staged_uploads: &[u8],
    size: u64,
    hash: &Hash,
) -> anyhow::Result<()> {
    if staged_uploads.len() < 8 + HASH_SIZE {
        bail!("malformed staging bundle");
    }
    let staged_size = u64::from_be_bytes(staged_uploads[..8].try_into()?);
    let staged_hash = Hash(staged_uploads[8..8 + HASH_SIZE].try_into()?);
    if staged_size != size || staged_hash != *hash {
        bail!("staging bundle does not match current tree");
    }
    let uploads: Vec<UploadAction> = serde_json::from_slice(&staged_uploads[8 + HASH_SIZE..])?;
    for upload in &uploads {
        object.upload(&upload.key, &upload.data, &upload.opts).await?;
    }
    Ok(())
}

/// Returns hashes from the right-edge tiles or from the overlay of hashes
/// computed for the batch in progress.
struct HashReaderWithOverlay<'a> {
    edge_tiles: &'a HashMap<u8, TileWithBytes>,
    overlay: &'a HashMap<u64, Hash>,
}

impl HashReader for HashReaderWithOverlay<'_> {
    fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError> {
        let mut list = Vec::with_capacity(indexes.len());
        for &id in indexes {
            if let Some(h) = self.overlay.get(&id) {
                list.push(*h);
                continue;
            }
            let Some(t) = self.edge_tiles.get(&TlogTile::from_index(id).level()) else {
                return Err(TlogError::IndexesNotInTree);
            };
            list.push(t.tile.hash_at_index(&t.b, id)?);
        }
        Ok(list)
    }
}

/// Options for uploading checkpoints.
static OPTS_CHECKPOINT: LazyLock<UploadOptions> = LazyLock::new(|| UploadOptions {
    content_type: Some("text/plain; charset=utf-8".to_string()),
    immutable: false,
});
/// Options for uploading entry bundles.
static OPTS_DATA_TILE: LazyLock<UploadOptions> = LazyLock::new(|| UploadOptions {
    content_type: None,
    immutable: true,
});
/// Options for uploading hash tiles.
static OPTS_HASH_TILE: LazyLock<UploadOptions> = LazyLock::new(|| UploadOptions {
    content_type: None,
    immutable: true,
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antispam::AntispamIndex;
    use crate::storage::{MemoryLockBackend, MemoryObjectBackend};
    use std::collections::HashSet;
    use std::time::Duration;

    struct TestLog {
        log: Arc<Log>,
        object: Arc<MemoryObjectBackend>,
    }

    impl TestLog {
        async fn new() -> Self {
            Self::with_config(test_config()).await
        }

        async fn with_config(config: LogConfig) -> Self {
            let object = Arc::new(MemoryObjectBackend::new());
            let lock = Arc::new(MemoryLockBackend::new());
            Self::over_backends(config, object, lock).await
        }

        async fn over_backends(
            config: LogConfig,
            object: Arc<MemoryObjectBackend>,
            lock: Arc<MemoryLockBackend>,
        ) -> Self {
            let signing_key = EcdsaSigningKey::from_slice(&sha2::Sha256::digest(b"log key")).unwrap();
            let roots = Arc::new(RootPool::new(Vec::new(), HashSet::new()).unwrap());
            let antispam = AntispamIndex::open_in_memory(1024).unwrap();
            let log = Arc::new(Log::new(
                config,
                signing_key,
                Vec::new(),
                roots,
                object.clone(),
                lock,
                antispam,
            ));
            log.init().await.unwrap();
            TestLog { log, object }
        }

        async fn add(&self, i: u64) -> AddOutcome {
            self.log.add_entry(test_entry(i)).await.unwrap()
        }

        async fn resolve(&self, outcome: AddOutcome) -> SequenceMetadata {
            match outcome {
                AddOutcome::Pending { mut rx, .. } => {
                    rx.changed().await.unwrap();
                    *rx.borrow()
                }
                AddOutcome::Cached { index } => (index, 0),
            }
        }
    }

    fn test_config() -> LogConfig {
        let mut config = LogConfig {
            origin: "example.com/test-log".to_string(),
            checkpoint_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        config.validate().unwrap();
        config
    }

    fn test_entry(i: u64) -> PendingEntry {
        PendingEntry {
            certificate: format!("certificate {i}").into_bytes(),
            precert: None,
            chain_fingerprints: vec![[0xcc; 32]],
        }
    }

    use sha2::Digest;

    // An in-memory stored-hash array for verifying published trees.
    struct MemReader(Vec<Hash>);

    impl HashReader for MemReader {
        fn read_hashes(&self, indexes: &[u64]) -> Result<Vec<Hash>, TlogError> {
            indexes
                .iter()
                .map(|&i| {
                    self.0
                        .get(usize::try_from(i).unwrap())
                        .copied()
                        .ok_or(TlogError::IndexesNotInTree)
                })
                .collect()
        }
    }

    // Reconstructs the full stored-hash array from the published bundles,
    // verifying gap-free sequencing along the way.
    async fn reconstruct_hashes(t: &TestLog, size: u64) -> MemReader {
        let mut mem = MemReader(Vec::new());
        let mut next_index = 0u64;
        let full_bundles = size / u64::from(TlogTile::FULL_WIDTH);
        let leftover = size % u64::from(TlogTile::FULL_WIDTH);
        for b in 0..=full_bundles {
            let width = if b < full_bundles {
                TlogTile::FULL_WIDTH
            } else if leftover > 0 {
                u16::try_from(leftover).unwrap()
            } else {
                break;
            };
            let tile = TlogTile::new(0, b, width, true);
            let bundle = t.object.fetch(&tile.path()).await.unwrap().unwrap();
            for entry in BundleIterator::new(bundle, width as usize, b * 256) {
                let entry = entry.unwrap();
                assert_eq!(entry.leaf_index, next_index, "gap in sequencing");
                let hashes =
                    tlog_tiles::stored_hashes(next_index, &entry.merkle_tree_leaf(), &mem).unwrap();
                mem.0.extend(hashes);
                next_index += 1;
            }
        }
        assert_eq!(next_index, size);
        mem
    }

    async fn published_checkpoint(t: &TestLog) -> tlog_tiles::Checkpoint {
        let bytes = t.object.fetch(CHECKPOINT_KEY).await.unwrap().unwrap();
        let (checkpoint, _) = static_ct_api::open_checkpoint(
            &t.log.config.origin,
            t.log.signing_key.verifying_key(),
            None,
            now_millis(),
            &bytes,
        )
        .unwrap();
        checkpoint
    }

    #[tokio::test]
    async fn test_empty_log_created() {
        let t = TestLog::new().await;
        let checkpoint = published_checkpoint(&t).await;
        assert_eq!(checkpoint.size(), 0);
        assert_eq!(checkpoint.hash(), &tlog_tiles::EMPTY_HASH);
        // init is idempotent.
        t.log.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequence_assigns_contiguous_indexes() {
        let t = TestLog::new().await;
        let mut outcomes = Vec::new();
        for i in 0..10 {
            outcomes.push(t.add(i).await);
        }
        t.log.sequence().await.unwrap();
        for (i, outcome) in outcomes.into_iter().enumerate() {
            let (index, timestamp) = t.resolve(outcome).await;
            assert_eq!(index, i as u64);
            assert!(timestamp > 0);
        }
        assert_eq!(t.log.tree_size(), 10);
        assert_eq!(published_checkpoint(&t).await.size(), 10);
    }

    #[tokio::test]
    async fn test_tree_verifies_across_rounds() {
        let t = TestLog::new().await;
        let mut checkpoints = Vec::new();
        let mut i = 0u64;
        // Uneven rounds, crossing a bundle boundary.
        for round_size in [3u64, 250, 10, 1, 300] {
            for _ in 0..round_size {
                t.add(i).await;
                i += 1;
            }
            t.log.sequence().await.unwrap();
            checkpoints.push(published_checkpoint(&t).await);
        }
        let size = t.log.tree_size();
        assert_eq!(size, 564);

        let mem = reconstruct_hashes(&t, size).await;

        // The final tree hash matches the published checkpoint.
        let last = checkpoints.last().unwrap();
        assert_eq!(tlog_tiles::tree_hash(size, &mem).unwrap(), *last.hash());

        // Inclusion proofs verify for every leaf (spot check the edges and a
        // spread).
        for index in [0u64, 1, 255, 256, 511, 512, 563] {
            let entry_hash = {
                let tile = TlogTile::from_index(tlog_tiles::stored_hash_index(0, index));
                let data = tile.read_data(&mem).unwrap();
                tile.hash_at_index(&data, tlog_tiles::stored_hash_index(0, index))
                    .unwrap()
            };
            let proof = tlog_tiles::prove_record(size, index, &mem).unwrap();
            tlog_tiles::check_record(&proof, size, *last.hash(), index, entry_hash).unwrap();
        }

        // Checkpoint monotonicity: every earlier tree is a prefix of the
        // final one.
        for checkpoint in &checkpoints {
            let proof = tlog_tiles::prove_tree(size, checkpoint.size(), &mem).unwrap();
            tlog_tiles::check_tree(&proof, size, *last.hash(), checkpoint.size(), *checkpoint.hash())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_pool_deduplicates_concurrent_submissions() {
        let t = TestLog::new().await;
        let first = t.add(7).await;
        let second = t.add(7).await;
        assert!(!first.is_dup());
        assert!(second.is_dup());

        t.log.sequence().await.unwrap();
        let (index1, ts1) = t.resolve(first).await;
        let (index2, ts2) = t.resolve(second).await;
        assert_eq!(index1, index2);
        assert_eq!(ts1, ts2);
        assert_eq!(t.log.tree_size(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_after_sequencing_resolves_original_timestamp() {
        let t = TestLog::new().await;
        let first = t.add(3).await;
        t.log.sequence().await.unwrap();
        let (index, original_ts) = t.resolve(first).await;

        // Resubmitting the same logical entry hits the anti-spam index.
        let outcome = t.add(3).await;
        let AddOutcome::Cached { index: dup_index } = outcome else {
            panic!("expected cached outcome");
        };
        assert_eq!(dup_index, index);

        let entry = t
            .log
            .resolve_duplicate(test_entry(3), dup_index)
            .await
            .unwrap();
        assert_eq!(entry.leaf_index, index);
        assert_eq!(entry.timestamp, original_ts);
    }

    #[tokio::test]
    async fn test_integration_pushback() {
        let mut config = test_config();
        config.pushback_max_outstanding = 3;
        let t = TestLog::with_config(config).await;
        for i in 0..3 {
            t.add(i).await;
        }
        let err = t.log.add_entry(test_entry(99)).await.unwrap_err();
        assert!(matches!(err, AddError::Pushback(Pushback::Integration)));

        // Draining the pool clears the pushback.
        t.log.sequence().await.unwrap();
        t.add(99).await;
    }

    #[tokio::test]
    async fn test_state_reload_matches() {
        let object = Arc::new(MemoryObjectBackend::new());
        let lock = Arc::new(MemoryLockBackend::new());
        let t = TestLog::over_backends(test_config(), object.clone(), lock.clone()).await;
        for i in 0..300 {
            t.add(i).await;
        }
        t.log.sequence().await.unwrap();
        let checkpoint = published_checkpoint(&t).await;

        // A fresh instance over the same backends picks up where we left
        // off.
        let t2 = TestLog::over_backends(test_config(), object, lock).await;
        assert_eq!(t2.log.tree_size(), 300);
        t2.add(300).await;
        t2.log.sequence().await.unwrap();
        let checkpoint2 = published_checkpoint(&t2).await;
        assert_eq!(checkpoint2.size(), checkpoint.size() + 1);
    }

    #[tokio::test]
    async fn test_crash_recovery_replays_staged_uploads() {
        let object = Arc::new(MemoryObjectBackend::new());
        let lock = Arc::new(MemoryLockBackend::new());
        let t = TestLog::over_backends(test_config(), object.clone(), lock.clone()).await;

        for i in 0..3 {
            t.add(i).await;
        }
        t.log.sequence().await.unwrap();
        let good_checkpoint = object.fetch(CHECKPOINT_KEY).await.unwrap().unwrap();

        for i in 3..5 {
            t.add(i).await;
        }
        t.log.sequence().await.unwrap();
        let final_checkpoint = object.fetch(CHECKPOINT_KEY).await.unwrap().unwrap();

        // Simulate a crash after the lock commit but before the object
        // writes: revert the object checkpoint and delete the round's tiles.
        object
            .upload(CHECKPOINT_KEY, &good_checkpoint, &OPTS_CHECKPOINT)
            .await
            .unwrap();
        for key in object.list("tile/").await.unwrap() {
            object.delete(&key).await.unwrap();
        }

        let t2 = TestLog::over_backends(test_config(), object.clone(), lock).await;
        t2.log.sequence().await.unwrap();
        assert_eq!(t2.log.tree_size(), 5);
        assert_eq!(
            object.fetch(CHECKPOINT_KEY).await.unwrap().unwrap(),
            final_checkpoint
        );
        // The entry bundle is back.
        let bundle_tile = TlogTile::new(0, 0, 5, true);
        assert!(object.fetch(&bundle_tile.path()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_idle_round_skips_checkpoint() {
        let t = TestLog::new().await;
        t.add(0).await;
        t.log.sequence().await.unwrap();
        let first = t.object.fetch(CHECKPOINT_KEY).await.unwrap().unwrap();

        // Nothing new and the checkpoint interval has not elapsed.
        t.log.sequence().await.unwrap();
        let second = t.object.fetch(CHECKPOINT_KEY).await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_idle_checkpoint_resigned_after_interval() {
        let mut config = test_config();
        config.checkpoint_interval = Duration::from_millis(0);
        let t = TestLog::with_config(config).await;
        t.add(0).await;
        t.log.sequence().await.unwrap();
        let first = t.object.fetch(CHECKPOINT_KEY).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        t.log.sequence().await.unwrap();
        let second = t.object.fetch(CHECKPOINT_KEY).await.unwrap().unwrap();
        // Same tree, fresh signature.
        assert_ne!(first, second);
        let checkpoint = published_checkpoint(&t).await;
        assert_eq!(checkpoint.size(), 1);
    }
}

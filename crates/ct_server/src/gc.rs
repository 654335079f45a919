// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Garbage collection of superseded partial tiles and entry bundles.
//!
//! As the tree grows, each partial tile is replaced by a wider partial and
//! eventually by the full tile; the old partials remain in the object store
//! but are no longer referenced by any tree head the log serves. Sweeps are
//! best-effort and idempotent: a failed delete is retried on the next pass,
//! and deleting an already-deleted object is a no-op.

use crate::storage::ObjectBackend;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tlog_tiles::TlogTile;

/// Runs one sweep: deletes every partial tile or bundle whose content is
/// covered by a full tile or a wider partial. Returns the deleted keys.
///
/// # Errors
///
/// Returns an error if the listing fails; individual delete failures are
/// logged and skipped.
pub async fn sweep(object: &dyn ObjectBackend) -> anyhow::Result<Vec<String>> {
    let keys = object.list("tile/").await?;

    // Group tiles by coordinate, tracking the widest version present.
    let mut widest: HashMap<(u8, u64, bool), u16> = HashMap::new();
    let mut partials = Vec::new();
    for key in &keys {
        let Ok(tile) = TlogTile::from_path(key) else {
            continue;
        };
        let coord = (tile.level(), tile.level_index(), tile.is_data());
        let entry = widest.entry(coord).or_insert(0);
        *entry = (*entry).max(tile.width());
        if tile.is_partial() {
            partials.push((key.clone(), tile, coord));
        }
    }

    let mut deleted = Vec::new();
    for (key, tile, coord) in partials {
        if widest[&coord] > tile.width() {
            match object.delete(&key).await {
                Ok(()) => deleted.push(key),
                Err(e) => log::warn!("failed to delete obsolete tile {key}: {e:#}"),
            }
        }
    }
    if !deleted.is_empty() {
        log::info!("garbage collected {} obsolete tiles", deleted.len());
    }
    Ok(deleted)
}

/// Periodic garbage collection until `shutdown` fires.
pub async fn gc_task(
    object: Arc<dyn ObjectBackend>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        if let Err(e) = sweep(object.as_ref()).await {
            log::warn!("garbage collection sweep failed: {e:#}");
        }
    }
}

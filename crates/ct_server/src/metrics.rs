// Copyright (c) 2025 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

//! Metrics for CT log operations.

use prometheus::{
    self, register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry, Counter, CounterVec, Gauge, Histogram, HistogramVec,
    Registry, TextEncoder,
};

#[derive(Debug)]
pub struct Metrics {
    pub registry: Registry,

    pub req_count: CounterVec,
    pub req_duration: HistogramVec,
    pub rate_limited: CounterVec,

    pub seq_count: CounterVec,
    pub seq_pool_size: Histogram,
    pub seq_duration: Histogram,
    pub seq_leaf_size: Histogram,
    pub seq_tiles: Counter,
    pub seq_data_tile_size: Histogram,

    pub tree_size: Gauge,
    pub tree_time: Gauge,

    pub antispam_lag: Gauge,
    pub config_roots: Gauge,
}

impl Metrics {
    #[allow(clippy::too_many_lines)]
    pub fn new() -> Self {
        let r = Registry::new();
        let req_count = register_counter_vec_with_registry!(
            "requests_total",
            "Submission requests, by endpoint and status code.",
            &["endpoint", "code"],
            r
        )
        .unwrap();
        let req_duration = register_histogram_vec_with_registry!(
            "request_duration_seconds",
            "Submission request serving latencies in seconds, by endpoint.",
            &["endpoint"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0],
            r,
        )
        .unwrap();
        let rate_limited = register_counter_vec_with_registry!(
            "rate_limited_requests_total",
            "Requests rejected with 429, by reason.",
            &["reason"],
            r
        )
        .unwrap();
        let seq_count = register_counter_vec_with_registry!(
            "sequencing_rounds_total",
            "Number of sequencing rounds, by error category if failed.",
            &["error"],
            r
        )
        .unwrap();
        let seq_pool_size = register_histogram_with_registry!(
            "sequencing_pool_entries",
            "Number of entries in the pools being sequenced.",
            vec![0.0, 10.0, 100.0, 1000.0, 2000.0, 4000.0],
            r
        )
        .unwrap();
        let seq_duration = register_histogram_with_registry!(
            "sequencing_duration_seconds",
            "Duration of sequencing rounds, successful or not.",
            vec![0.1, 0.5, 1.0, 2.0, 4.0, 8.0],
            r
        )
        .unwrap();
        let seq_leaf_size = register_histogram_with_registry!(
            "sequencing_leaf_bytes",
            "Size of leaves in sequencing rounds, successful or not.",
            vec![1000.0, 1500.0, 2000.0, 4000.0],
            r
        )
        .unwrap();
        let seq_tiles = register_counter_with_registry!(
            "sequencing_uploaded_tiles_total",
            "Number of tiles uploaded in successful rounds, including partials.",
            r
        )
        .unwrap();
        let seq_data_tile_size = register_histogram_with_registry!(
            "sequencing_data_tiles_bytes",
            "Size of uploaded entry bundles, including partials.",
            vec![10_000.0, 100_000.0, 1_000_000.0],
            r
        )
        .unwrap();
        let tree_size = register_gauge_with_registry!(
            "tree_size_leaves_total",
            "Size of the latest published tree head.",
            r
        )
        .unwrap();
        let tree_time = register_gauge_with_registry!(
            "tree_timestamp_seconds",
            "Timestamp of the latest published tree head.",
            r
        )
        .unwrap();
        let antispam_lag = register_gauge_with_registry!(
            "antispam_follower_lag_entries",
            "Entries handed to the anti-spam follower but not yet persisted.",
            r
        )
        .unwrap();
        let config_roots =
            register_gauge_with_registry!("config_roots_total", "Number of accepted roots.", r)
                .unwrap();
        Self {
            registry: r,
            req_count,
            req_duration,
            rate_limited,
            seq_count,
            seq_pool_size,
            seq_duration,
            seq_leaf_size,
            seq_tiles,
            seq_data_tile_size,
            tree_size,
            tree_time,
            antispam_lag,
            config_roots,
        }
    }

    /// Renders the registry in Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        TextEncoder::new()
            .encode_utf8(&self.registry.gather(), &mut buffer)
            .unwrap();
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

// Perform a potentially-lossy conversion to f64 from the input type.
pub trait AsF64 {
    fn as_f64(&self) -> f64;
}

macro_rules! impl_as_f64 {
    ($($t:ty),*) => {
        $(
            #[allow(clippy::cast_precision_loss)]
            impl AsF64 for $t {
                fn as_f64(&self) -> f64 {
                    *self as f64
                }
            }
        )*
    };
}

impl_as_f64!(usize, u64, i64);

pub fn millis_diff_as_secs(start: u64, end: u64) -> f64 {
    (end.as_f64() - start.as_f64()) / 1e3
}

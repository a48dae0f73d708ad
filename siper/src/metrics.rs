//! Pass/drop packet and byte counters, sharded per execution context.
//!
//! Each shard owns one [`DataRec`]-shaped pair of atomics per category and
//! sits on its own cache line. Writers only touch their shard; readers sum
//! every shard without stopping writers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter as PromCounter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;
use serde::Serialize;
use siper_common::{Category, DataRec};

/// Monotonic 64-bit counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct CategoryCounters {
    packets: Counter,
    bytes: Counter,
}

impl CategoryCounters {
    fn read(&self) -> DataRec {
        DataRec {
            packets: self.packets.get(),
            bytes: self.bytes.get(),
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    categories: [CategoryCounters; 2],
}

/// Totals per category, as read by [`MetricsCounters::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pass: DataRec,
    pub drop: DataRec,
}

impl MetricsSnapshot {
    pub fn get(&self, category: Category) -> DataRec {
        match category {
            Category::Pass => self.pass,
            Category::Drop => self.drop,
        }
    }
}

static NEXT_SHARD_HINT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD_HINT: usize = NEXT_SHARD_HINT.fetch_add(1, Ordering::Relaxed);
}

/// Stable per-thread index; threads are numbered in order of first use.
pub fn current_shard_hint() -> usize {
    SHARD_HINT.with(|hint| *hint)
}

/// Sharded pass/drop counters.
#[derive(Debug)]
pub struct MetricsCounters {
    shards: Box<[CachePadded<Shard>]>,
}

impl Default for MetricsCounters {
    fn default() -> Self {
        Self::new(default_shards())
    }
}

/// One shard per available CPU.
pub fn default_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl MetricsCounters {
    /// Counters with `shards` independent shards (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| CachePadded::new(Shard::default()))
            .collect();
        Self { shards }
    }

    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Count one frame of `bytes` length on the calling thread's shard.
    #[inline]
    pub fn record(&self, category: Category, bytes: u64) {
        self.record_on(current_shard_hint(), category, bytes);
    }

    /// Count one frame on shard `shard % shards()`.
    #[inline]
    pub fn record_on(&self, shard: usize, category: Category, bytes: u64) {
        let counters = &self.shards[shard % self.shards.len()].categories[category.index()];
        counters.packets.add(1);
        counters.bytes.add(bytes);
    }

    /// Sum of every shard. Each counter is read once, so no counter can go
    /// backwards between two snapshots taken by the same reader.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.shards
            .iter()
            .fold(MetricsSnapshot::default(), |acc, shard| MetricsSnapshot {
                pass: acc.pass.merge(shard.categories[Category::Pass.index()].read()),
                drop: acc.drop.merge(shard.categories[Category::Drop.index()].read()),
            })
    }

    /// Totals held by a single shard, `None` when out of range.
    pub fn shard_snapshot(&self, shard: usize) -> Option<MetricsSnapshot> {
        let shard = self.shards.get(shard)?;
        Some(MetricsSnapshot {
            pass: shard.categories[Category::Pass.index()].read(),
            drop: shard.categories[Category::Drop.index()].read(),
        })
    }
}

// ── Prometheus Export ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct VerdictLabels {
    verdict: String,
}

/// Renders snapshots in the Prometheus text format.
pub struct PrometheusExporter {
    registry: Registry,
    packets: Family<VerdictLabels, PromCounter>,
    bytes: Family<VerdictLabels, PromCounter>,
}

impl Default for PrometheusExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusExporter {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let packets = Family::<VerdictLabels, PromCounter>::default();
        let bytes = Family::<VerdictLabels, PromCounter>::default();

        registry.register(
            "siper_packets",
            "Frames classified, by verdict",
            packets.clone(),
        );
        registry.register(
            "siper_bytes",
            "Bytes classified, by verdict",
            bytes.clone(),
        );

        Self {
            registry,
            packets,
            bytes,
        }
    }

    /// Advance the exported counters to `snapshot` and render them.
    ///
    /// Takes `&mut self` because the read-then-advance of each counter is not
    /// atomic; concurrent encoders would add the same delta twice.
    pub fn encode(&mut self, snapshot: &MetricsSnapshot) -> Result<String, std::fmt::Error> {
        for category in Category::ALL {
            let labels = VerdictLabels {
                verdict: category.as_str().to_string(),
            };
            let rec = snapshot.get(category);
            // Prometheus counters only go up, so advance by the delta.
            let packets = self.packets.get_or_create(&labels);
            let seen = packets.get();
            if rec.packets > seen {
                packets.inc_by(rec.packets - seen);
            }
            let bytes = self.bytes.get_or_create(&labels);
            let seen = bytes.get();
            if rec.bytes > seen {
                bytes.inc_by(rec.bytes - seen);
            }
        }

        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

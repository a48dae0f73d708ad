//! User-space delivery loop: frames from a hex dump, classified on a pool of
//! worker threads that each own one counter shard.

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;

use crate::blocklist::Blocklist;
use crate::config::Config;
use crate::{Decision, FirewallEngine, MetricsCounters, PrefixTable};

/// Fresh table and counters with the configured blocklist installed. A
/// missing blocklist file means an empty table.
pub fn build_engine(config: &Config) -> anyhow::Result<FirewallEngine> {
    let table = match config.capacity_limit() {
        Some(limit) => PrefixTable::with_capacity(limit),
        None => PrefixTable::new(),
    };
    let blocklist = Blocklist::load_or_new(&config.blocklist_path)?;
    blocklist.install(&table)?;
    Ok(FirewallEngine::new(
        Arc::new(table),
        Arc::new(MetricsCounters::new(config.shards)),
    ))
}

/// Decode one hex frame per line. Blank lines and `#` comments are skipped,
/// whitespace inside a line is ignored. `origin` names the source in errors.
pub fn parse_frames(content: &str, origin: &str) -> anyhow::Result<Vec<Vec<u8>>> {
    content
        .lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            let compact: String = line.split_whitespace().collect();
            hex::decode(&compact).with_context(|| format!("{origin}:{n}: bad hex"))
        })
        .collect()
}

pub fn read_frames(path: &Path) -> anyhow::Result<Vec<Vec<u8>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_frames(&content, &path.display().to_string())
}

/// Run every frame through the engine on `workers` threads, worker `i`
/// recording on shard `i`. Returns the number of drops.
pub fn replay(engine: &FirewallEngine, frames: &[Vec<u8>], workers: usize) -> anyhow::Result<usize> {
    let workers = workers.max(1);
    let chunk = frames.len().div_ceil(workers).max(1);

    std::thread::scope(|s| {
        let handles: Vec<_> = frames
            .chunks(chunk)
            .enumerate()
            .map(|(shard, batch)| {
                s.spawn(move || {
                    batch
                        .iter()
                        .filter(|frame| engine.process_on(shard, frame) == Decision::Drop)
                        .count()
                })
            })
            .collect();

        let mut dropped = 0;
        for (worker, handle) in handles.into_iter().enumerate() {
            dropped += handle
                .join()
                .map_err(|_| anyhow::anyhow!("replay worker {worker} panicked"))?;
        }
        Ok(dropped)
    })
}

//! The per-frame decision path.
//!
//! `Start -> EthernetParsed -> Ipv4Parsed -> Decided`. A parse failure or a
//! non-IPv4 ethertype jumps straight to `Decided(Pass)`: traffic this engine
//! cannot classify is not its to drop.

use std::sync::Arc;

use siper_common::{Decision, LpmKey, ETH_P_IP};

use crate::error::{ParseError, Result};
use crate::lpm::PrefixTable;
use crate::metrics::{current_shard_hint, MetricsCounters, MetricsSnapshot};
use crate::parser::{parse_ethernet, parse_ipv4, Cursor};

/// The state a frame ended classification in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    /// Shorter than an Ethernet header.
    Truncated,
    /// Ethernet header parsed, payload is not IPv4.
    NotIpv4(u16),
    /// IPv4 header missing, short or with a bad IHL.
    MalformedIpv4(ParseError),
    /// Source address not covered by any stored prefix.
    NoMatch { src: u32 },
    /// Longest matching prefix is marked allowed.
    Allowed { src: u32, prefix: LpmKey },
    /// Longest matching prefix is marked blocked.
    Blocked { src: u32, prefix: LpmKey },
}

/// A decision together with the reason it was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub decision: Decision,
    pub reason: Reason,
}

impl Verdict {
    fn pass(reason: Reason) -> Self {
        Self {
            decision: Decision::Pass,
            reason,
        }
    }
}

/// Classifies frames against a shared [`PrefixTable`] and counts the
/// outcome in shared [`MetricsCounters`].
///
/// Cheap to clone; clones share the table and counters.
#[derive(Debug, Clone)]
pub struct FirewallEngine {
    table: Arc<PrefixTable>,
    metrics: Arc<MetricsCounters>,
}

impl FirewallEngine {
    pub fn new(table: Arc<PrefixTable>, metrics: Arc<MetricsCounters>) -> Self {
        Self { table, metrics }
    }

    pub fn table(&self) -> &Arc<PrefixTable> {
        &self.table
    }

    pub fn metrics(&self) -> &Arc<MetricsCounters> {
        &self.metrics
    }

    /// Classify `frame` without touching the counters.
    pub fn classify(&self, frame: &[u8]) -> Verdict {
        let cursor = Cursor::new(frame);

        let (ethertype, cursor) = match parse_ethernet(cursor) {
            Ok(parsed) => parsed,
            Err(_) => return Verdict::pass(Reason::Truncated),
        };
        if ethertype != ETH_P_IP {
            return Verdict::pass(Reason::NotIpv4(ethertype));
        }

        let src = match parse_ipv4(cursor) {
            Ok((src, _)) => src,
            Err(e) => return Verdict::pass(Reason::MalformedIpv4(e)),
        };

        match self.table.longest_match(src) {
            Some((prefix, true)) => Verdict {
                decision: Decision::Drop,
                reason: Reason::Blocked { src, prefix },
            },
            Some((prefix, false)) => Verdict::pass(Reason::Allowed { src, prefix }),
            None => Verdict::pass(Reason::NoMatch { src }),
        }
    }

    /// Decide on `frame` and count it on the calling thread's shard.
    #[inline]
    pub fn process(&self, frame: &[u8]) -> Decision {
        self.process_on(current_shard_hint(), frame)
    }

    /// Decide on `frame` and count it on `shard`.
    ///
    /// Never fails: malformed input is passed and counted as such.
    pub fn process_on(&self, shard: usize, frame: &[u8]) -> Decision {
        let total_length = frame.len() as u64;
        let verdict = self.classify(frame);
        if let Reason::Blocked { src, prefix } = verdict.reason {
            tracing::trace!(
                src = %std::net::Ipv4Addr::from(src),
                prefix = %std::net::Ipv4Addr::from(prefix.data),
                prefix_len = prefix.prefix_len,
                "drop"
            );
        }
        self.metrics
            .record_on(shard, verdict.decision.category(), total_length);
        verdict.decision
    }

    /// Mark `address/length` as blocked (or explicitly allowed).
    pub fn insert_prefix(&self, address: u32, length: u32, blocked: bool) -> Result<()> {
        self.table.insert(address, length, blocked)?;
        Ok(())
    }

    /// Forget `address/length`. Absent prefixes are fine.
    pub fn remove_prefix(&self, address: u32, length: u32) -> Result<()> {
        self.table.remove(address, length)?;
        Ok(())
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use siper_common::DataRec;

    fn engine() -> FirewallEngine {
        FirewallEngine::new(Arc::new(PrefixTable::new()), Arc::new(MetricsCounters::new(2)))
    }

    fn ipv4_frame(src: [u8; 4]) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf.extend_from_slice(&ETH_P_IP.to_be_bytes());
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[12..16].copy_from_slice(&src);
        buf.extend_from_slice(&ip);
        buf
    }

    #[test]
    fn test_blocked_source_dropped() {
        let engine = engine();
        engine.insert_prefix(0x0a00_0000, 8, true).unwrap();

        let frame = ipv4_frame([10, 9, 8, 7]);
        let verdict = engine.classify(&frame);
        assert_eq!(verdict.decision, Decision::Drop);
        assert_eq!(
            verdict.reason,
            Reason::Blocked {
                src: 0x0a09_0807,
                prefix: LpmKey::new(0x0a00_0000, 8)
            }
        );

        assert_eq!(engine.process(&frame), Decision::Drop);
        let snap = engine.get_metrics();
        assert_eq!(snap.drop, DataRec { packets: 1, bytes: 34 });
        assert_eq!(snap.pass, DataRec::default());
    }

    #[test]
    fn test_allowed_prefix_passes() {
        let engine = engine();
        engine.insert_prefix(0x0a00_0000, 8, true).unwrap();
        engine.insert_prefix(0x0a01_0200, 24, false).unwrap();
        assert_eq!(engine.process(&ipv4_frame([10, 1, 2, 5])), Decision::Pass);
        assert_eq!(engine.process(&ipv4_frame([10, 2, 0, 1])), Decision::Drop);
    }

    #[test]
    fn test_non_ipv4_passes() {
        let engine = engine();
        engine.insert_prefix(0, 0, true).unwrap();
        let mut frame = ipv4_frame([1, 2, 3, 4]);
        frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
        assert_eq!(engine.classify(&frame).reason, Reason::NotIpv4(0x86dd));
        assert_eq!(engine.process(&frame), Decision::Pass);
    }

    #[test]
    fn test_malformed_ipv4_passes() {
        let engine = engine();
        engine.insert_prefix(0, 0, true).unwrap();
        let frame = &ipv4_frame([1, 2, 3, 4])[..30];
        assert!(matches!(
            engine.classify(frame).reason,
            Reason::MalformedIpv4(ParseError::Truncated { .. })
        ));
        assert_eq!(engine.process(frame), Decision::Pass);
        assert_eq!(engine.get_metrics().pass.bytes, 30);
    }

    #[test]
    fn test_control_plane_errors_surface() {
        let engine = engine();
        assert_eq!(
            engine.insert_prefix(0, 33, true),
            Err(Error::InvalidPrefixLength(33))
        );
        assert_eq!(engine.remove_prefix(0, 64), Err(Error::InvalidPrefixLength(64)));
        assert!(engine.table().is_empty());
        assert_eq!(engine.remove_prefix(0x0a00_0000, 8), Ok(()));
    }

    #[test]
    fn test_clones_share_state() {
        let engine = engine();
        let other = engine.clone();
        other.insert_prefix(0xc633_6400, 24, true).unwrap();
        assert_eq!(engine.process_on(1, &ipv4_frame([198, 51, 100, 1])), Decision::Drop);
        assert_eq!(other.get_metrics().drop.packets, 1);
        assert_eq!(engine.metrics().shard_snapshot(1).unwrap().drop.packets, 1);
    }
}

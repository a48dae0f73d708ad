//! siper: per-frame source-prefix firewall.
//!
//! A frame goes through [`parser`] to find its IPv4 source address, the
//! address is matched against [`lpm::PrefixTable`], and the resulting
//! [`Decision`] is counted in [`metrics::MetricsCounters`].
//! [`engine::FirewallEngine`] ties the three together.

pub mod blocklist;
pub mod config;
pub mod engine;
pub mod error;
pub mod lpm;
pub mod metrics;
pub mod parser;
pub mod replay;

pub use engine::{FirewallEngine, Reason, Verdict};
pub use error::{Error, ParseError, Result};
pub use lpm::{LpmTrie, PrefixTable};
pub use metrics::{MetricsCounters, MetricsSnapshot, PrometheusExporter};
pub use siper_common::{Category, DataRec, Decision, LpmKey};

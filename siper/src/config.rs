use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

/// Tool configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Blocklist JSON file.
    #[serde(default = "default_blocklist_path")]
    pub blocklist_path: PathBuf,

    /// Counter shards, also the number of replay workers.
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Maximum prefixes in the table. 0 = unbounded.
    #[serde(default = "default_table_capacity")]
    pub table_capacity: usize,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,
}

fn default_blocklist_path() -> PathBuf {
    PathBuf::from(DEFAULT_BLOCKLIST_PATH)
}

fn default_shards() -> usize {
    crate::metrics::default_shards()
}

fn default_table_capacity() -> usize {
    DEFAULT_TABLE_CAPACITY
}

pub const DEFAULT_BLOCKLIST_PATH: &str = "./blocklist.json";
pub const DEFAULT_TABLE_CAPACITY: usize = 65535;

impl Default for Config {
    fn default() -> Self {
        Self {
            blocklist_path: default_blocklist_path(),
            shards: default_shards(),
            table_capacity: default_table_capacity(),
            quiet: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(ref path) = cli.path {
            self.blocklist_path = path.clone();
        }
        if let Some(shards) = cli.shards {
            self.shards = shards;
        }
        if let Some(capacity) = cli.capacity {
            self.table_capacity = capacity;
        }
        if cli.quiet {
            self.quiet = true;
        }
    }

    /// Table capacity as a limit, `None` when unbounded.
    pub fn capacity_limit(&self) -> Option<usize> {
        (self.table_capacity > 0).then_some(self.table_capacity)
    }
}

use clap::{Parser, Subcommand};

/// siper: source-prefix firewall for raw Ethernet frames
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to YAML config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Blocklist JSON file [default: ./blocklist.json].
    #[arg(short, long, global = true)]
    pub path: Option<PathBuf>,

    /// Counter shards / replay workers [default: available CPUs].
    #[arg(long, global = true)]
    pub shards: Option<usize>,

    /// Maximum prefixes in the table, 0 for unbounded [default: 65535].
    #[arg(long, global = true)]
    pub capacity: Option<usize>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Add a CIDR to the blocklist.
    Add {
        /// Prefix to block, e.g. 198.51.100.0/24. A bare address is a /32.
        #[arg(long)]
        cidr: String,
        /// Free-form note stored with the rule.
        #[arg(long, default_value = "")]
        comment: String,
        /// Where the rule came from.
        #[arg(long, default_value = "")]
        source: String,
        /// Store the rule without enforcing it.
        #[arg(long)]
        disabled: bool,
    },
    /// Delete a rule by CIDR or by id.
    Del {
        #[arg(long, conflicts_with = "id", required_unless_present = "id")]
        cidr: Option<String>,
        #[arg(long)]
        id: Option<String>,
    },
    /// Print the blocklist rules.
    List,
    /// Report which prefix, if any, decides an address.
    Check {
        /// IPv4 address to look up.
        address: std::net::Ipv4Addr,
    },
    /// Classify hex-encoded frames from a file and print the counters.
    Replay {
        /// One frame per line as hex; blank lines and `#` comments are skipped.
        file: PathBuf,
    },
}

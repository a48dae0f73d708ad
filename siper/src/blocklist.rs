use anyhow::{bail, Context};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::lpm::PrefixTable;

/// One blocked prefix as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub id: String,
    pub cidr: String,
    pub family: String,
    pub enabled: bool,
    pub source: String,
    pub comment: String,
    pub created_at: String,
}

impl Rule {
    /// The rule's prefix. Fails on text that is not canonical IPv4 CIDR.
    pub fn network(&self) -> anyhow::Result<Ipv4Net> {
        self.cidr
            .parse::<Ipv4Net>()
            .with_context(|| format!("rule {}: bad cidr {:?}", self.id, self.cidr))
    }
}

/// The blocklist file: a versioned list of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Blocklist {
    pub version: String,
    pub created_at: String,
    pub updated_at: String,
    pub rules: Vec<Rule>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Parse `a.b.c.d[/len]` and clear the host bits. A bare address is a /32.
pub fn parse_cidr(text: &str) -> anyhow::Result<Ipv4Net> {
    let text = text.trim();
    let net = if text.contains('/') {
        text.parse::<Ipv4Net>()
            .with_context(|| format!("not an IPv4 CIDR: {text:?}"))?
    } else {
        let addr = text
            .parse::<Ipv4Addr>()
            .with_context(|| format!("not an IPv4 address: {text:?}"))?;
        Ipv4Net::from(addr)
    };
    Ok(net.trunc())
}

/// Canonical text form of a CIDR, e.g. `10.1.2.3/8` -> `10.0.0.0/8`.
pub fn canonicalize_cidr(text: &str) -> anyhow::Result<String> {
    Ok(parse_cidr(text)?.to_string())
}

impl Blocklist {
    pub fn new(version: &str) -> Self {
        let created = now();
        Self {
            version: version.to_string(),
            created_at: created.clone(),
            updated_at: created,
            rules: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read blocklist {}", path.display()))?;
        // from_str rejects trailing data after the document.
        let blocklist: Blocklist = serde_json::from_str(&content)
            .with_context(|| format!("decode {}", path.display()))?;
        Ok(blocklist)
    }

    /// Load `path`, or start an empty list when it does not exist yet.
    pub fn load_or_new(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("{} not found, starting a new blocklist", path.display());
            Ok(Self::new("1"))
        }
    }

    /// Write to a temporary file beside `path`, sync it and rename it over
    /// `path`, so readers never see a half-written list.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix("blocklist-")
            .suffix(".json")
            .tempfile_in(dir)
            .context("creating temp file")?;

        let json = serde_json::to_vec_pretty(self).context("marshal blocklist")?;
        tmp.write_all(&json).context("write temp blocklist")?;
        tmp.as_file().sync_all().context("fsync temp blocklist")?;
        tmp.persist(path)
            .with_context(|| format!("atomic rename to {}", path.display()))?;
        Ok(())
    }

    /// Add a rule for `cidr`. A CIDR already on the list has its existing
    /// rule updated instead.
    pub fn add_cidr(
        &mut self,
        cidr: &str,
        source: &str,
        comment: &str,
        enabled: bool,
    ) -> anyhow::Result<Rule> {
        let canon = canonicalize_cidr(cidr)?;
        let stamp = now();
        self.updated_at = stamp.clone();

        if let Some(rule) = self.rules.iter_mut().find(|r| r.cidr == canon) {
            rule.enabled = enabled;
            rule.source = source.to_string();
            rule.comment = comment.to_string();
            return Ok(rule.clone());
        }

        let rule = Rule {
            id: uuid::Uuid::new_v4().to_string(),
            cidr: canon,
            family: "ipv4".to_string(),
            enabled,
            source: source.to_string(),
            comment: comment.to_string(),
            created_at: stamp,
        };
        self.rules.push(rule.clone());
        Ok(rule)
    }

    pub fn delete_by_cidr(&mut self, cidr: &str) -> anyhow::Result<Rule> {
        if self.rules.is_empty() {
            bail!("blocklist is empty");
        }
        let canon = canonicalize_cidr(cidr)?;
        match self.rules.iter().position(|r| r.cidr == canon) {
            Some(i) => {
                self.updated_at = now();
                Ok(self.rules.remove(i))
            }
            None => bail!("cidr not found in blocklist: {canon}"),
        }
    }

    pub fn delete_by_id(&mut self, id: &str) -> anyhow::Result<Rule> {
        if self.rules.is_empty() {
            bail!("blocklist is empty");
        }
        match self.rules.iter().position(|r| r.id == id) {
            Some(i) => {
                self.updated_at = now();
                Ok(self.rules.remove(i))
            }
            None => bail!("ID not found in blocklist: {id}"),
        }
    }

    /// Insert every enabled rule into `table` as blocked. Returns how many
    /// were installed.
    pub fn install(&self, table: &PrefixTable) -> anyhow::Result<usize> {
        let mut installed = 0;
        for rule in self.rules.iter().filter(|r| r.enabled) {
            let net = rule.network()?;
            table
                .insert(u32::from(net.network()), u32::from(net.prefix_len()), true)
                .with_context(|| format!("installing {}", rule.cidr))?;
            installed += 1;
        }
        tracing::info!(installed, total = self.rules.len(), "blocklist installed");
        Ok(installed)
    }
}

//! Longest-prefix-match table over IPv4 source addresses.
//!
//! [`LpmTrie`] is a persistent binary trie: one level per address bit, most
//! significant bit first. Mutations copy only the nodes on the path they
//! touch and share every other subtree with the previous version, so a
//! clone-modify-publish cycle costs at most 33 node allocations.
//!
//! [`PrefixTable`] publishes tries through an [`ArcSwap`]. Lookups load the
//! current trie without taking any lock. Writers serialise on a mutex, build
//! the next version off to the side and swap it in.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use siper_common::{LpmKey, MAX_PREFIX_LEN};

use crate::error::{Error, Result};

#[derive(Debug)]
struct Node<V> {
    value: Option<V>,
    children: [Option<Arc<Node<V>>>; 2],
}

impl<V: Clone> Node<V> {
    fn empty() -> Self {
        Self {
            value: None,
            children: [None, None],
        }
    }

    fn copy_of(node: Option<&Arc<Node<V>>>) -> Self {
        match node {
            Some(n) => Self {
                value: n.value.clone(),
                children: n.children.clone(),
            },
            None => Self::empty(),
        }
    }

    /// Drop nodes that carry neither a value nor children.
    fn into_pruned(self) -> Option<Arc<Self>> {
        if self.value.is_none() && self.children.iter().all(Option::is_none) {
            None
        } else {
            Some(Arc::new(self))
        }
    }
}

/// Bit `depth` of `addr`, counting from the most significant bit.
#[inline(always)]
fn bit(addr: u32, depth: u32) -> usize {
    ((addr >> (MAX_PREFIX_LEN - 1 - depth)) & 1) as usize
}

/// Immutable-friendly binary trie keyed by [`LpmKey`].
#[derive(Debug)]
pub struct LpmTrie<V> {
    root: Option<Arc<Node<V>>>,
    len: usize,
}

impl<V> Clone for LpmTrie<V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<V> Default for LpmTrie<V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<V: Clone> LpmTrie<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Store `value` under `key`, returning the value it replaced.
    ///
    /// `key` is re-normalised, so unmasked host bits are ignored.
    pub fn insert(&mut self, key: LpmKey, value: V) -> Option<V> {
        let key = LpmKey::new(key.data, key.prefix_len);
        let (root, previous) = Self::insert_at(self.root.as_ref(), key, 0, value);
        self.root = Some(root);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    fn insert_at(
        node: Option<&Arc<Node<V>>>,
        key: LpmKey,
        depth: u32,
        value: V,
    ) -> (Arc<Node<V>>, Option<V>) {
        let mut copy = Node::copy_of(node);
        if depth == key.prefix_len {
            let previous = copy.value.replace(value);
            return (Arc::new(copy), previous);
        }
        let b = bit(key.data, depth);
        let (child, previous) = Self::insert_at(copy.children[b].as_ref(), key, depth + 1, value);
        copy.children[b] = Some(child);
        (Arc::new(copy), previous)
    }

    /// Remove the entry stored under exactly `key`, if any.
    pub fn remove(&mut self, key: LpmKey) -> Option<V> {
        let key = LpmKey::new(key.data, key.prefix_len);
        let root = self.root.as_ref()?;
        let (replacement, removed) = Self::remove_at(root, key, 0)?;
        self.root = replacement;
        self.len -= 1;
        Some(removed)
    }

    fn remove_at(node: &Arc<Node<V>>, key: LpmKey, depth: u32) -> Option<(Option<Arc<Node<V>>>, V)> {
        if depth == key.prefix_len {
            let removed = node.value.clone()?;
            let copy = Node {
                value: None,
                children: node.children.clone(),
            };
            return Some((copy.into_pruned(), removed));
        }
        let b = bit(key.data, depth);
        let child = node.children[b].as_ref()?;
        let (replacement, removed) = Self::remove_at(child, key, depth + 1)?;
        let mut copy = Node::copy_of(Some(node));
        copy.children[b] = replacement;
        Some((copy.into_pruned(), removed))
    }

    /// Value stored under exactly `key`.
    pub fn get(&self, key: LpmKey) -> Option<&V> {
        let key = LpmKey::new(key.data, key.prefix_len);
        let mut node = self.root.as_deref()?;
        for depth in 0..key.prefix_len {
            node = node.children[bit(key.data, depth)].as_deref()?;
        }
        node.value.as_ref()
    }

    /// Deepest stored prefix covering `addr`, with its value.
    ///
    /// Walks at most 32 levels. Every node on the path that carries a value
    /// replaces the best match so far, so the last one seen is the longest.
    pub fn longest_match(&self, addr: u32) -> Option<(LpmKey, &V)> {
        let mut node = self.root.as_deref()?;
        let mut best = node.value.as_ref().map(|v| (0, v));
        for depth in 0..MAX_PREFIX_LEN {
            match node.children[bit(addr, depth)].as_deref() {
                Some(child) => {
                    node = child;
                    if let Some(v) = node.value.as_ref() {
                        best = Some((depth + 1, v));
                    }
                }
                None => break,
            }
        }
        best.map(|(len, v)| (LpmKey::new(addr, len), v))
    }

    /// Value of the longest prefix covering `addr`.
    #[inline]
    pub fn lookup(&self, addr: u32) -> Option<&V> {
        self.longest_match(addr).map(|(_, v)| v)
    }

    /// All entries, parents before children, zero branch before one.
    pub fn entries(&self) -> Vec<(LpmKey, V)> {
        let mut out = Vec::with_capacity(self.len);
        if let Some(root) = self.root.as_deref() {
            Self::collect(root, 0, 0, &mut out);
        }
        out
    }

    fn collect(node: &Node<V>, prefix: u32, depth: u32, out: &mut Vec<(LpmKey, V)>) {
        if let Some(v) = node.value.as_ref() {
            out.push((LpmKey::new(prefix, depth), v.clone()));
        }
        for (b, child) in node.children.iter().enumerate() {
            if let Some(child) = child.as_deref() {
                let next = prefix | ((b as u32) << (MAX_PREFIX_LEN - 1 - depth));
                Self::collect(child, next, depth + 1, out);
            }
        }
    }
}

fn validate(prefix_len: u32) -> Result<()> {
    if prefix_len > MAX_PREFIX_LEN {
        return Err(Error::InvalidPrefixLength(prefix_len));
    }
    Ok(())
}

/// Concurrent blocked/allowed prefix table.
///
/// Reads never wait on writes: each lookup sees one complete published trie.
#[derive(Debug)]
pub struct PrefixTable {
    current: ArcSwap<LpmTrie<bool>>,
    writer: Mutex<()>,
    capacity: Option<usize>,
}

impl Default for PrefixTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTable {
    /// Empty, unbounded table.
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(LpmTrie::new()),
            writer: Mutex::new(()),
            capacity: None,
        }
    }

    /// Empty table that refuses new prefixes once it holds `limit` of them.
    pub fn with_capacity(limit: usize) -> Self {
        Self {
            capacity: Some(limit),
            ..Self::new()
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Store `blocked` for `network_address/prefix_len`, returning the value it
    /// replaced. Host bits of the address are discarded.
    pub fn insert(&self, network_address: u32, prefix_len: u32, blocked: bool) -> Result<Option<bool>> {
        validate(prefix_len)?;
        let key = LpmKey::new(network_address, prefix_len);

        let _guard = self.writer.lock();
        let mut next: LpmTrie<bool> = (**self.current.load()).clone();
        if let Some(capacity) = self.capacity {
            if next.len() >= capacity && next.get(key).is_none() {
                tracing::warn!(capacity, "prefix table full, rejecting {:?}", key);
                return Err(Error::TableFull { capacity });
            }
        }
        let previous = next.insert(key, blocked);
        self.current.store(Arc::new(next));
        tracing::debug!(
            prefix = key.data,
            prefix_len,
            blocked,
            replaced = previous.is_some(),
            "prefix inserted"
        );
        Ok(previous)
    }

    /// Remove `network_address/prefix_len`. Absent prefixes are not an error.
    pub fn remove(&self, network_address: u32, prefix_len: u32) -> Result<Option<bool>> {
        validate(prefix_len)?;
        let key = LpmKey::new(network_address, prefix_len);

        let _guard = self.writer.lock();
        let mut next: LpmTrie<bool> = (**self.current.load()).clone();
        let removed = next.remove(key);
        if removed.is_some() {
            self.current.store(Arc::new(next));
            tracing::debug!(prefix = key.data, prefix_len, "prefix removed");
        }
        Ok(removed)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let _guard = self.writer.lock();
        self.current.store(Arc::new(LpmTrie::new()));
    }

    /// Value of the longest stored prefix covering `addr`.
    #[inline]
    pub fn lookup(&self, addr: u32) -> Option<bool> {
        self.current.load().lookup(addr).copied()
    }

    /// Longest stored prefix covering `addr`, with its value.
    #[inline]
    pub fn longest_match(&self, addr: u32) -> Option<(LpmKey, bool)> {
        self.current
            .load()
            .longest_match(addr)
            .map(|(key, v)| (key, *v))
    }

    /// Value stored under exactly `network_address/prefix_len`.
    pub fn get(&self, network_address: u32, prefix_len: u32) -> Result<Option<bool>> {
        validate(prefix_len)?;
        Ok(self
            .current
            .load()
            .get(LpmKey::new(network_address, prefix_len))
            .copied())
    }

    pub fn entries(&self) -> Vec<(LpmKey, bool)> {
        self.current.load().entries()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The currently published trie. Later writes do not affect it.
    pub fn snapshot(&self) -> Arc<LpmTrie<bool>> {
        self.current.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> u32 {
        u32::from(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = PrefixTable::new();
        table.insert(ip(10, 0, 0, 0), 8, true).unwrap();
        table.insert(ip(10, 1, 2, 0), 24, false).unwrap();

        assert_eq!(table.lookup(ip(10, 1, 2, 5)), Some(false));
        assert_eq!(table.lookup(ip(10, 2, 0, 1)), Some(true));
        assert_eq!(table.lookup(ip(11, 0, 0, 1)), None);

        let (key, blocked) = table.longest_match(ip(10, 1, 2, 5)).unwrap();
        assert_eq!(key, LpmKey::new(ip(10, 1, 2, 0), 24));
        assert!(!blocked);
    }

    #[test]
    fn test_default_route_is_fallback() {
        let table = PrefixTable::new();
        table.insert(0, 0, true).unwrap();
        table.insert(ip(192, 168, 0, 0), 16, false).unwrap();

        assert_eq!(table.lookup(ip(8, 8, 8, 8)), Some(true));
        assert_eq!(table.lookup(ip(192, 168, 4, 4)), Some(false));
        assert_eq!(table.longest_match(ip(1, 1, 1, 1)).unwrap().0.prefix_len, 0);
    }

    #[test]
    fn test_host_route() {
        let table = PrefixTable::new();
        table.insert(ip(203, 0, 113, 7), 32, true).unwrap();
        assert_eq!(table.lookup(ip(203, 0, 113, 7)), Some(true));
        assert_eq!(table.lookup(ip(203, 0, 113, 6)), None);
        assert_eq!(table.lookup(ip(203, 0, 113, 8)), None);
    }

    #[test]
    fn test_insert_masks_host_bits() {
        let table = PrefixTable::new();
        table.insert(ip(198, 51, 100, 77), 24, true).unwrap();
        assert_eq!(table.get(ip(198, 51, 100, 0), 24).unwrap(), Some(true));
        assert_eq!(table.entries(), vec![(LpmKey::new(ip(198, 51, 100, 0), 24), true)]);
    }

    #[test]
    fn test_overwrite_keeps_single_entry() {
        let table = PrefixTable::new();
        assert_eq!(table.insert(ip(172, 16, 0, 0), 12, true).unwrap(), None);
        assert_eq!(table.insert(ip(172, 16, 0, 0), 12, false).unwrap(), Some(true));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(ip(172, 16, 0, 0), 12).unwrap(), Some(false));
    }

    #[test]
    fn test_remove_restores_no_match() {
        let table = PrefixTable::new();
        table.insert(ip(198, 51, 100, 0), 24, true).unwrap();
        assert_eq!(table.lookup(ip(198, 51, 100, 9)), Some(true));

        assert_eq!(table.remove(ip(198, 51, 100, 0), 24).unwrap(), Some(true));
        assert_eq!(table.lookup(ip(198, 51, 100, 9)), None);
        assert!(table.is_empty());

        // absent prefix
        assert_eq!(table.remove(ip(198, 51, 100, 0), 24).unwrap(), None);
    }

    #[test]
    fn test_remove_keeps_nested_prefixes() {
        let table = PrefixTable::new();
        table.insert(ip(10, 0, 0, 0), 8, true).unwrap();
        table.insert(ip(10, 1, 0, 0), 16, false).unwrap();

        table.remove(ip(10, 0, 0, 0), 8).unwrap();
        assert_eq!(table.lookup(ip(10, 1, 9, 9)), Some(false));
        assert_eq!(table.lookup(ip(10, 2, 0, 0)), None);

        table.insert(ip(10, 0, 0, 0), 8, true).unwrap();
        table.remove(ip(10, 1, 0, 0), 16).unwrap();
        assert_eq!(table.lookup(ip(10, 1, 9, 9)), Some(true));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_invalid_prefix_length_rejected() {
        let table = PrefixTable::new();
        assert_eq!(table.insert(0, 33, true), Err(Error::InvalidPrefixLength(33)));
        assert_eq!(table.remove(0, 40), Err(Error::InvalidPrefixLength(40)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let table = PrefixTable::with_capacity(2);
        table.insert(ip(1, 0, 0, 0), 8, true).unwrap();
        table.insert(ip(2, 0, 0, 0), 8, true).unwrap();
        assert_eq!(
            table.insert(ip(3, 0, 0, 0), 8, true),
            Err(Error::TableFull { capacity: 2 })
        );
        // overwrites still allowed when full
        assert_eq!(table.insert(ip(2, 0, 0, 0), 8, false).unwrap(), Some(true));
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(ip(3, 3, 3, 3)), None);
    }

    #[test]
    fn test_snapshot_is_isolated_from_writes() {
        let table = PrefixTable::new();
        table.insert(ip(10, 0, 0, 0), 8, true).unwrap();
        let before = table.snapshot();
        table.insert(ip(10, 0, 0, 0), 8, false).unwrap();
        table.clear();

        assert_eq!(before.lookup(ip(10, 9, 9, 9)), Some(&true));
        assert_eq!(table.lookup(ip(10, 9, 9, 9)), None);
    }

    #[test]
    fn test_entries_order() {
        let mut trie = LpmTrie::new();
        trie.insert(LpmKey::new(ip(128, 0, 0, 0), 1), 'b');
        trie.insert(LpmKey::new(0, 0), 'a');
        trie.insert(LpmKey::new(ip(10, 0, 0, 0), 8), 'c');
        let keys: Vec<_> = trie.entries().into_iter().map(|(k, v)| (k.prefix_len, v)).collect();
        assert_eq!(keys, vec![(0, 'a'), (8, 'c'), (1, 'b')]);
    }

    #[test]
    fn test_readers_during_writes() {
        let table = Arc::new(PrefixTable::new());
        table.insert(ip(10, 0, 0, 0), 8, true).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                let table = table.clone();
                s.spawn(move || {
                    for _ in 0..10_000 {
                        // /8 is never removed, so every read sees it or something longer
                        assert!(table.lookup(ip(10, 1, 1, 1)).is_some());
                    }
                });
            }
            for i in 0..500u32 {
                table.insert(ip(10, 1, 0, 0) | (i & 0xff), 32, i % 2 == 0).unwrap();
                table.remove(ip(10, 1, 0, 0) | ((i + 7) & 0xff), 32).unwrap();
            }
        });
    }

    mod proptest_lpm {
        use super::*;
        use proptest::prelude::*;

        /// Linear-scan reference: longest stored prefix covering the address.
        fn oracle(entries: &[(LpmKey, u8)], addr: u32) -> Option<u8> {
            entries
                .iter()
                .filter(|(k, _)| k.contains(addr))
                .max_by_key(|(k, _)| k.prefix_len)
                .map(|(_, v)| *v)
        }

        fn op_strategy() -> impl Strategy<Value = (bool, u32, u32, u8)> {
            // addresses drawn from a narrow range so prefixes overlap
            (any::<bool>(), 0u32..0x0000_0fff, 0u32..=32, any::<u8>())
                .prop_map(|(ins, low, len, v)| (ins, 0x0a00_0000 | (low << 12), len, v))
        }

        proptest! {
            #[test]
            fn prop_matches_linear_scan(
                ops in prop::collection::vec(op_strategy(), 1..64),
                queries in prop::collection::vec(0u32..0x00ff_ffff, 1..32),
            ) {
                let mut trie = LpmTrie::new();
                let mut reference: Vec<(LpmKey, u8)> = Vec::new();

                for (ins, addr, len, v) in ops {
                    let key = LpmKey::new(addr, len);
                    reference.retain(|(k, _)| *k != key);
                    if ins {
                        trie.insert(key, v);
                        reference.push((key, v));
                    } else {
                        trie.remove(key);
                    }
                }

                prop_assert_eq!(trie.len(), reference.len());
                for query in queries {
                    let addr = 0x0a00_0000 | query;
                    prop_assert_eq!(trie.lookup(addr).copied(), oracle(&reference, addr));
                }
            }
        }
    }
}

#![no_std]

//! Plain data shared between the classification core and whatever delivers
//! frames to it (an XDP/TC program, a user-space polling loop, a test).
//!
//! Everything here is `#[repr(C)]` and `Copy` so it can cross a map or a
//! ring buffer without translation.

/// Length of an Ethernet II header: two MAC addresses and the ethertype.
pub const ETH_HDR_LEN: usize = 14;

/// Ethertype for IPv4, host byte order.
pub const ETH_P_IP: u16 = 0x0800;

/// Smallest legal IPv4 header (IHL = 5).
pub const IPV4_MIN_HDR_LEN: usize = 20;

/// Longest IPv4 prefix.
pub const MAX_PREFIX_LEN: u32 = 32;

/// Metrics slot for passed frames.
pub const METRICS_PASS: u32 = 0;
/// Metrics slot for dropped frames.
pub const METRICS_DROP: u32 = 1;

/// Key of the prefix table: a network address and the number of significant
/// leading bits.
///
/// `data` is in host byte order. Only the top `prefix_len` bits carry
/// meaning; [`LpmKey::new`] clears the rest.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct LpmKey {
    /// Number of significant bits, 0..=32.
    pub prefix_len: u32,
    /// Network address, host byte order.
    pub data: u32,
}

impl LpmKey {
    /// Build a key, masking `data` down to its top `prefix_len` bits.
    ///
    /// Lengths above 32 are clamped; callers that must reject them validate
    /// before constructing a key.
    pub const fn new(data: u32, prefix_len: u32) -> Self {
        let prefix_len = if prefix_len > MAX_PREFIX_LEN {
            MAX_PREFIX_LEN
        } else {
            prefix_len
        };
        Self {
            prefix_len,
            data: data & prefix_mask(prefix_len),
        }
    }

    /// Whether `addr` falls inside this prefix.
    pub const fn contains(&self, addr: u32) -> bool {
        addr & prefix_mask(self.prefix_len) == self.data
    }
}

/// Netmask with the top `prefix_len` bits set.
pub const fn prefix_mask(prefix_len: u32) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= MAX_PREFIX_LEN {
        u32::MAX
    } else {
        u32::MAX << (MAX_PREFIX_LEN - prefix_len)
    }
}

/// Packet and byte totals for one metrics slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct DataRec {
    pub packets: u64,
    pub bytes: u64,
}

impl DataRec {
    /// Field-wise sum, saturating.
    pub const fn merge(self, other: DataRec) -> DataRec {
        DataRec {
            packets: self.packets.saturating_add(other.packets),
            bytes: self.bytes.saturating_add(other.bytes),
        }
    }
}

/// What to do with a frame.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum Decision {
    Pass,
    Drop,
}

impl Decision {
    /// The metrics category this decision is counted under.
    pub const fn category(self) -> Category {
        match self {
            Decision::Pass => Category::Pass,
            Decision::Drop => Category::Drop,
        }
    }
}

/// Metrics category. The discriminants are the slot indices.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum Category {
    Pass = METRICS_PASS,
    Drop = METRICS_DROP,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Pass, Category::Drop];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Category::Pass => "pass",
            Category::Drop => "drop",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_masks_host_bits() {
        let key = LpmKey::new(u32::from_be_bytes([10, 1, 2, 3]), 8);
        assert_eq!(key.data, u32::from_be_bytes([10, 0, 0, 0]));
        assert_eq!(key.prefix_len, 8);

        let all = LpmKey::new(0xdead_beef, 0);
        assert_eq!(all.data, 0);
        assert!(all.contains(0xffff_ffff));
    }

    #[test]
    fn test_prefix_mask_edges() {
        assert_eq!(prefix_mask(0), 0);
        assert_eq!(prefix_mask(1), 0x8000_0000);
        assert_eq!(prefix_mask(24), 0xffff_ff00);
        assert_eq!(prefix_mask(32), u32::MAX);
    }

    #[test]
    fn test_decision_category_slots() {
        assert_eq!(Decision::Pass.category().index(), METRICS_PASS as usize);
        assert_eq!(Decision::Drop.category().index(), METRICS_DROP as usize);
    }
}

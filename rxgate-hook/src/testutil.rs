//! In-memory table stubs and frame builders for host tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use rxgate_common::{counter, RuleEntry, RuleKey};

use crate::dissect::{IPPROTO_TCP, IPPROTO_UDP};
use crate::tables::{CounterTable, RuleTable};

/// Rule table stub carrying the control plane's mutation surface.
#[derive(Default)]
pub struct MemRuleTable {
    entries: RwLock<HashMap<RuleKey, RuleEntry>>,
}

impl MemRuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: RuleKey, entry: RuleEntry) {
        self.entries.write().unwrap().insert(key, entry);
    }

    pub fn remove(&self, key: &RuleKey) {
        self.entries.write().unwrap().remove(key);
    }
}

impl RuleTable for MemRuleTable {
    fn lookup(&self, key: &RuleKey) -> Option<RuleEntry> {
        self.entries.read().unwrap().get(key).copied()
    }
}

/// Counter stub partitioned like the per-CPU map: each simulated
/// processing unit increments its own slots, reads aggregate across all.
pub struct MemCounters {
    units: Vec<Vec<AtomicU64>>,
}

impl MemCounters {
    pub fn new(units: usize) -> Self {
        let units = (0..units)
            .map(|_| (0..counter::SLOTS as usize).map(|_| AtomicU64::new(0)).collect())
            .collect();
        Self { units }
    }

    /// Handle for one simulated processing unit.
    pub fn unit(&self, index: usize) -> UnitCounters<'_> {
        UnitCounters { slots: &self.units[index] }
    }

    /// Aggregate one slot across units, the way the control plane reads.
    pub fn total(&self, slot: u32) -> u64 {
        self.units
            .iter()
            .map(|slots| slots[slot as usize].load(Ordering::Relaxed))
            .sum()
    }
}

pub struct UnitCounters<'a> {
    slots: &'a [AtomicU64],
}

impl CounterTable for UnitCounters<'_> {
    fn increment(&self, slot: u32) {
        if let Some(cell) = self.slots.get(slot as usize) {
            cell.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Ethernet + IPv4 frame with a minimal 20-byte header. TCP/UDP frames
/// get their port pair plus a few payload bytes; other protocols get a
/// payload only.
pub fn ipv4_frame(
    src: [u8; 4],
    dst: [u8; 4],
    protocol: u8,
    src_port: u16,
    dst_port: u16,
) -> Vec<u8> {
    ipv4_frame_with_options(src, dst, protocol, src_port, dst_port, 0)
}

/// Same as [`ipv4_frame`] but with `options_len` bytes of IPv4 options
/// (must be a multiple of 4, at most 40).
pub fn ipv4_frame_with_options(
    src: [u8; 4],
    dst: [u8; 4],
    protocol: u8,
    src_port: u16,
    dst_port: u16,
    options_len: usize,
) -> Vec<u8> {
    assert!(options_len % 4 == 0 && options_len <= 40);
    let ihl = 20 + options_len;

    let mut frame = Vec::new();
    // Ethernet: dst mac, src mac, EtherType.
    frame.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    frame.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x02]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());

    // IPv4 header.
    let payload_len: usize = 8;
    let total_len = (ihl + payload_len) as u16;
    frame.push(0x40 | (ihl / 4) as u8); // version 4, IHL in words
    frame.push(0); // TOS
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0x40, 0]); // id, flags (DF)
    frame.push(64); // TTL
    frame.push(protocol);
    frame.extend_from_slice(&[0, 0]); // checksum, unset
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&dst);
    frame.resize(frame.len() + options_len, 1); // NOP options

    if protocol == IPPROTO_TCP || protocol == IPPROTO_UDP {
        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&[0, 0, 0, 0]);
    } else {
        frame.extend_from_slice(&[0; 8]);
    }

    frame
}

/// Address key in the rule table's byte order (the packet's own).
pub fn ip_key(octets: [u8; 4]) -> u32 {
    u32::from_ne_bytes(octets)
}

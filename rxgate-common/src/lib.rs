//! Shared ABI between the rxgate XDP program and userspace.
//!
//! Everything here is `#[repr(C)]` and laid out identically on both sides
//! of the map boundary. Userspace-only impls (`aya::Pod`, serde) are gated
//! behind the `user` feature so the eBPF build stays dependency-free.

#![no_std]

/// Maximum entries in the rule table.
pub const MAX_RULES: u32 = 1024;

/// Maximum redirect-target slots.
pub const MAX_REDIRECT_TARGETS: u32 = 64;

/// Classification dimension a rule key matches on.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "kebab-case"))]
pub enum RuleKind {
    SrcIp = 0,
    DstIp = 1,
    SrcPort = 2,
    DstPort = 3,
    Protocol = 4,
}

impl RuleKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RuleKind::SrcIp),
            1 => Some(RuleKind::DstIp),
            2 => Some(RuleKind::SrcPort),
            3 => Some(RuleKind::DstPort),
            4 => Some(RuleKind::Protocol),
            _ => None,
        }
    }
}

/// What a matched rule does with the frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "user", serde(rename_all = "kebab-case"))]
pub enum RuleAction {
    Pass = 0,
    Drop = 1,
    Redirect = 2,
}

impl RuleAction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(RuleAction::Pass),
            1 => Some(RuleAction::Drop),
            2 => Some(RuleAction::Redirect),
            _ => None,
        }
    }
}

/// Rule table key: one classification dimension plus its value.
///
/// Addresses are stored as the packet's native four bytes read into a
/// `u32` (network byte order in memory); ports and protocol numbers are
/// host-order values widened to `u32`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub kind: u8,
    pub _pad: [u8; 3],
    pub value: u32,
}

impl RuleKey {
    pub const fn new(kind: RuleKind, value: u32) -> Self {
        Self { kind: kind as u8, _pad: [0; 3], value }
    }

    pub const fn src_ip(addr: u32) -> Self {
        Self::new(RuleKind::SrcIp, addr)
    }

    pub const fn dst_ip(addr: u32) -> Self {
        Self::new(RuleKind::DstIp, addr)
    }

    pub const fn src_port(port: u16) -> Self {
        Self::new(RuleKind::SrcPort, port as u32)
    }

    pub const fn dst_port(port: u16) -> Self {
        Self::new(RuleKind::DstPort, port as u32)
    }

    pub const fn protocol(proto: u8) -> Self {
        Self::new(RuleKind::Protocol, proto as u32)
    }
}

/// Rule table value. Written only by the control plane; the hook never
/// mutates entries, so per-rule hit counts live in the counter table.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleEntry {
    pub action: u8,
    pub _pad: [u8; 3],
    /// Redirect-target slot, meaningful only when `action` is `Redirect`.
    pub redirect_target: u32,
}

impl RuleEntry {
    pub const fn pass() -> Self {
        Self { action: RuleAction::Pass as u8, _pad: [0; 3], redirect_target: 0 }
    }

    pub const fn drop() -> Self {
        Self { action: RuleAction::Drop as u8, _pad: [0; 3], redirect_target: 0 }
    }

    pub const fn redirect(target: u32) -> Self {
        Self { action: RuleAction::Redirect as u8, _pad: [0; 3], redirect_target: target }
    }

    pub fn action(&self) -> Option<RuleAction> {
        RuleAction::from_u8(self.action)
    }
}

/// Counter table slots, indexed by classification outcome.
pub mod counter {
    /// Every frame the hook saw.
    pub const TOTAL: u32 = 0;
    /// No rule matched, default policy passed the frame.
    pub const DEFAULT_PASSED: u32 = 1;
    /// No rule matched, default policy dropped the frame.
    pub const DEFAULT_DROPPED: u32 = 2;
    /// A pass rule matched.
    pub const RULE_PASSED: u32 = 3;
    /// A drop rule matched.
    pub const RULE_DROPPED: u32 = 4;
    /// A redirect rule matched.
    pub const REDIRECTED: u32 = 5;
    /// Key extraction failed (short frame, non-IPv4, bad IHL).
    pub const UNCLASSIFIED: u32 = 6;

    /// Size of the counter array map.
    pub const SLOTS: u32 = 8;
}

/// Config table slots.
pub mod config {
    /// Default policy when no rule matches: 0 = pass, anything else = drop.
    pub const DEFAULT_POLICY: u32 = 0;

    /// Size of the config array map.
    pub const SLOTS: u32 = 4;
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RuleKey {}
#[cfg(feature = "user")]
unsafe impl aya::Pod for RuleEntry {}

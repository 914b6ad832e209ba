//! Handles to the shared tables the hook consults.
//!
//! The hook never owns these tables; it holds handles injected by the
//! embedding environment. The XDP program backs them with BPF maps, host
//! tests with in-memory stubs.

use rxgate_common::{RuleEntry, RuleKey};

/// Bounded-time rule lookup. Must not block or allocate; a miss is a
/// normal, cheap outcome, not an error.
pub trait RuleTable {
    fn lookup(&self, key: &RuleKey) -> Option<RuleEntry>;
}

/// Outcome counter sink. Increments land in the caller's own partition
/// and must not stall; out-of-range slots are ignored.
pub trait CounterTable {
    fn increment(&self, slot: u32);
}

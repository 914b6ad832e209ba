//! Verdict computation: one bounded decision per frame.

use rxgate_common::{counter, RuleAction, RuleEntry, RuleKey};

use crate::dissect::{dissect, FlowFields};
use crate::tables::{CounterTable, RuleTable};
use crate::view::PacketView;

/// Per-frame decision handed back to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Continue up the normal stack.
    Pass,
    /// Discard with no further work.
    Drop,
    /// Hand the frame to the named redirect-target slot, bypassing the
    /// normal stack.
    Redirect(u32),
}

/// Policy applied when no rule matches, and to frames the hook cannot
/// classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DefaultPolicy {
    #[default]
    Pass,
    Drop,
}

impl DefaultPolicy {
    /// Decode the config-table slot value. Unknown values fail closed.
    pub fn from_config(raw: u32) -> Self {
        if raw == 0 {
            DefaultPolicy::Pass
        } else {
            DefaultPolicy::Drop
        }
    }
}

/// Classify one frame against the current rule snapshot.
///
/// Pure with respect to the frame bytes and the per-key rule snapshot:
/// at most five lookups and three counter increments, no other effect.
#[inline(always)]
pub fn classify<R: RuleTable, C: CounterTable>(
    view: &PacketView,
    default_policy: DefaultPolicy,
    rules: &R,
    counters: &C,
) -> Verdict {
    counters.increment(counter::TOTAL);

    let fields = match dissect(view) {
        Some(fields) => fields,
        None => {
            counters.increment(counter::UNCLASSIFIED);
            return default_verdict(default_policy, counters);
        }
    };

    match match_rule(&fields, rules) {
        Some(entry) => apply_rule(&entry, counters),
        None => default_verdict(default_policy, counters),
    }
}

/// Probe the rule table in fixed order; first match wins. A port of 0
/// means "no transport header" and is never used as a key.
#[inline(always)]
fn match_rule<R: RuleTable>(fields: &FlowFields, rules: &R) -> Option<RuleEntry> {
    if let Some(entry) = rules.lookup(&RuleKey::src_ip(fields.src_ip)) {
        return Some(entry);
    }
    if let Some(entry) = rules.lookup(&RuleKey::dst_ip(fields.dst_ip)) {
        return Some(entry);
    }
    if fields.src_port != 0 {
        if let Some(entry) = rules.lookup(&RuleKey::src_port(fields.src_port)) {
            return Some(entry);
        }
    }
    if fields.dst_port != 0 {
        if let Some(entry) = rules.lookup(&RuleKey::dst_port(fields.dst_port)) {
            return Some(entry);
        }
    }
    rules.lookup(&RuleKey::protocol(fields.protocol))
}

#[inline(always)]
fn apply_rule<C: CounterTable>(entry: &RuleEntry, counters: &C) -> Verdict {
    match entry.action() {
        Some(RuleAction::Pass) => {
            counters.increment(counter::RULE_PASSED);
            Verdict::Pass
        }
        Some(RuleAction::Drop) => {
            counters.increment(counter::RULE_DROPPED);
            Verdict::Drop
        }
        Some(RuleAction::Redirect) => {
            counters.increment(counter::REDIRECTED);
            Verdict::Redirect(entry.redirect_target)
        }
        // Corrupt action byte: never widen the permit set.
        None => {
            counters.increment(counter::RULE_DROPPED);
            Verdict::Drop
        }
    }
}

#[inline(always)]
fn default_verdict<C: CounterTable>(policy: DefaultPolicy, counters: &C) -> Verdict {
    match policy {
        DefaultPolicy::Pass => {
            counters.increment(counter::DEFAULT_PASSED);
            Verdict::Pass
        }
        DefaultPolicy::Drop => {
            counters.increment(counter::DEFAULT_DROPPED);
            Verdict::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissect::{IPPROTO_TCP, IPPROTO_UDP};
    use crate::testutil::{ip_key, ipv4_frame, MemCounters, MemRuleTable};

    fn classify_once(
        frame: &[u8],
        policy: DefaultPolicy,
        rules: &MemRuleTable,
        counters: &MemCounters,
    ) -> Verdict {
        let view = PacketView::new(frame);
        classify(&view, policy, rules, &counters.unit(0))
    }

    #[test]
    fn test_empty_table_passes_by_default() {
        // Scenario A: attached, empty rule table, one inbound frame.
        let rules = MemRuleTable::new();
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_UDP, 5000, 53);

        let verdict = classify_once(&frame, DefaultPolicy::Pass, &rules, &counters);

        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(counters.total(counter::TOTAL), 1);
        assert_eq!(counters.total(counter::DEFAULT_PASSED), 1);
        assert_eq!(counters.total(counter::RULE_DROPPED), 0);
    }

    #[test]
    fn test_drop_rule_matches_source_ip() {
        // Scenario B: {src ip X -> DROP}, frame from X.
        let rules = MemRuleTable::new();
        rules.insert(RuleKey::src_ip(ip_key([10, 0, 0, 1])), RuleEntry::drop());
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([10, 0, 0, 1], [192, 168, 1, 9], IPPROTO_TCP, 1234, 80);

        let verdict = classify_once(&frame, DefaultPolicy::Pass, &rules, &counters);

        assert_eq!(verdict, Verdict::Drop);
        assert_eq!(counters.total(counter::RULE_DROPPED), 1);
        assert_eq!(counters.total(counter::DEFAULT_PASSED), 0);
        assert_eq!(counters.total(counter::RULE_PASSED), 0);
    }

    #[test]
    fn test_redirect_rule_names_its_target() {
        // Scenario C: {src ip X -> REDIRECT(T)}.
        let rules = MemRuleTable::new();
        rules.insert(RuleKey::src_ip(ip_key([172, 16, 0, 7])), RuleEntry::redirect(3));
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([172, 16, 0, 7], [10, 0, 0, 2], IPPROTO_UDP, 9, 9);

        let verdict = classify_once(&frame, DefaultPolicy::Pass, &rules, &counters);

        assert_eq!(verdict, Verdict::Redirect(3));
        assert_eq!(counters.total(counter::REDIRECTED), 1);
        assert_eq!(counters.total(counter::DEFAULT_PASSED), 0);
    }

    #[test]
    fn test_default_policy_flip() {
        // The same no-match frame follows whichever default is configured.
        let rules = MemRuleTable::new();
        let frame = ipv4_frame([1, 2, 3, 4], [5, 6, 7, 8], IPPROTO_TCP, 1000, 2000);

        let counters = MemCounters::new(1);
        assert_eq!(
            classify_once(&frame, DefaultPolicy::Pass, &rules, &counters),
            Verdict::Pass
        );
        assert_eq!(
            classify_once(&frame, DefaultPolicy::Drop, &rules, &counters),
            Verdict::Drop
        );
        assert_eq!(counters.total(counter::DEFAULT_PASSED), 1);
        assert_eq!(counters.total(counter::DEFAULT_DROPPED), 1);
    }

    #[test]
    fn test_default_policy_from_config() {
        assert_eq!(DefaultPolicy::from_config(0), DefaultPolicy::Pass);
        assert_eq!(DefaultPolicy::from_config(1), DefaultPolicy::Drop);
        // Garbage config fails closed.
        assert_eq!(DefaultPolicy::from_config(7), DefaultPolicy::Drop);
    }

    #[test]
    fn test_same_snapshot_same_verdict() {
        let rules = MemRuleTable::new();
        rules.insert(RuleKey::dst_port(443), RuleEntry::drop());
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([10, 1, 1, 1], [10, 1, 1, 2], IPPROTO_TCP, 50000, 443);

        let first = classify_once(&frame, DefaultPolicy::Pass, &rules, &counters);
        for _ in 0..100 {
            assert_eq!(
                classify_once(&frame, DefaultPolicy::Pass, &rules, &counters),
                first
            );
        }
    }

    #[test]
    fn test_rule_update_becomes_visible() {
        let rules = MemRuleTable::new();
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([10, 9, 8, 7], [10, 0, 0, 2], IPPROTO_UDP, 7, 7);
        let key = RuleKey::src_ip(ip_key([10, 9, 8, 7]));

        assert_eq!(
            classify_once(&frame, DefaultPolicy::Pass, &rules, &counters),
            Verdict::Pass
        );

        rules.insert(key, RuleEntry::drop());
        assert_eq!(
            classify_once(&frame, DefaultPolicy::Pass, &rules, &counters),
            Verdict::Drop
        );

        rules.remove(&key);
        assert_eq!(
            classify_once(&frame, DefaultPolicy::Pass, &rules, &counters),
            Verdict::Pass
        );
    }

    #[test]
    fn test_truncated_frames_take_the_default() {
        // Every prefix of a valid frame must classify without reading past
        // the end marker; with an empty table the verdict is the default.
        let rules = MemRuleTable::new();
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_TCP, 1234, 80);

        for len in 0..=frame.len() {
            let verdict = classify_once(&frame[..len], DefaultPolicy::Pass, &rules, &counters);
            assert_eq!(verdict, Verdict::Pass, "prefix of {} bytes", len);
        }
        assert_eq!(counters.total(counter::TOTAL), frame.len() as u64 + 1);
        assert_eq!(
            counters.total(counter::DEFAULT_PASSED),
            frame.len() as u64 + 1
        );
        // Prefixes shorter than Ethernet + minimal IP never dissect.
        use crate::dissect::{ETH_HDR_LEN, IPV4_HDR_MIN_LEN};
        assert_eq!(
            counters.total(counter::UNCLASSIFIED),
            (ETH_HDR_LEN + IPV4_HDR_MIN_LEN) as u64
        );
    }

    #[test]
    fn test_source_ip_wins_over_port_rule() {
        let rules = MemRuleTable::new();
        rules.insert(RuleKey::src_ip(ip_key([10, 0, 0, 1])), RuleEntry::pass());
        rules.insert(RuleKey::dst_port(80), RuleEntry::drop());
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_TCP, 1234, 80);

        assert_eq!(
            classify_once(&frame, DefaultPolicy::Drop, &rules, &counters),
            Verdict::Pass
        );
        assert_eq!(counters.total(counter::RULE_PASSED), 1);
    }

    #[test]
    fn test_portless_frame_skips_port_rules() {
        let rules = MemRuleTable::new();
        // A port-0 rule must never match an ICMP frame's placeholder ports.
        rules.insert(RuleKey::src_port(0), RuleEntry::drop());
        rules.insert(RuleKey::dst_port(0), RuleEntry::drop());
        rules.insert(RuleKey::protocol(1), RuleEntry::drop());
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 0, 0);

        let verdict = classify_once(&frame, DefaultPolicy::Pass, &rules, &counters);

        // The protocol rule matches, not the port ones.
        assert_eq!(verdict, Verdict::Drop);
        assert_eq!(counters.total(counter::RULE_DROPPED), 1);
    }

    #[test]
    fn test_unknown_action_fails_closed() {
        let rules = MemRuleTable::new();
        rules.insert(
            RuleKey::src_ip(ip_key([10, 0, 0, 1])),
            RuleEntry { action: 0xFF, _pad: [0; 3], redirect_target: 0 },
        );
        let counters = MemCounters::new(1);
        let frame = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_UDP, 1, 2);

        assert_eq!(
            classify_once(&frame, DefaultPolicy::Pass, &rules, &counters),
            Verdict::Drop
        );
        assert_eq!(counters.total(counter::RULE_DROPPED), 1);
    }

    #[test]
    fn test_no_lost_counts_across_units() {
        // N simulated processing units, M frames each: every slot the
        // frames touch must add up exactly.
        use std::thread;

        const UNITS: usize = 8;
        const FRAMES_PER_UNIT: usize = 5_000;

        let rules = MemRuleTable::new();
        rules.insert(RuleKey::dst_port(9999), RuleEntry::drop());
        let counters = MemCounters::new(UNITS);
        let frame = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 2], IPPROTO_UDP, 4000, 9999);

        thread::scope(|scope| {
            for unit_index in 0..UNITS {
                let unit = counters.unit(unit_index);
                let rules = &rules;
                let frame = &frame;
                scope.spawn(move || {
                    let view = PacketView::new(frame);
                    for _ in 0..FRAMES_PER_UNIT {
                        let verdict = classify(&view, DefaultPolicy::Pass, rules, &unit);
                        assert_eq!(verdict, Verdict::Drop);
                    }
                });
            }
        });

        let expected = (UNITS * FRAMES_PER_UNIT) as u64;
        assert_eq!(counters.total(counter::TOTAL), expected);
        assert_eq!(counters.total(counter::RULE_DROPPED), expected);
        assert_eq!(counters.total(counter::DEFAULT_PASSED), 0);
    }
}

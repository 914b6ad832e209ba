//! rxgate XDP program.
//!
//! Thin glue around the `rxgate-hook` core: defines the shared BPF maps,
//! wraps them in the core's table handles, and translates the verdict
//! into an XDP action. All classification logic lives in the core crate.

#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{DevMap, HashMap, PerCpuArray},
    programs::XdpContext,
};
use rxgate_common::{config, counter, RuleEntry, RuleKey, MAX_REDIRECT_TARGETS, MAX_RULES};
use rxgate_hook::{classify, CounterTable, DefaultPolicy, PacketView, RuleTable, Verdict};

// =============================================================================
// Maps
// =============================================================================

/// Rule table. The control plane is the only writer.
#[map]
static RULES: HashMap<RuleKey, RuleEntry> = HashMap::with_max_entries(MAX_RULES, 0);

/// Outcome counters (per-CPU for lock-free updates), slots per
/// `rxgate_common::counter`.
#[map]
static COUNTERS: PerCpuArray<u64> = PerCpuArray::with_max_entries(counter::SLOTS, 0);

/// Configuration, slots per `rxgate_common::config`.
#[map]
static CONFIG: PerCpuArray<u32> = PerCpuArray::with_max_entries(config::SLOTS, 0);

/// Redirect targets: slot -> interface, populated by the control plane.
#[map]
static REDIRECT_TARGETS: DevMap = DevMap::with_max_entries(MAX_REDIRECT_TARGETS, 0);

// =============================================================================
// Table handles
// =============================================================================

struct MapRules;

impl RuleTable for MapRules {
    #[inline(always)]
    fn lookup(&self, key: &RuleKey) -> Option<RuleEntry> {
        unsafe { RULES.get(key) }.copied()
    }
}

struct MapCounters;

impl CounterTable for MapCounters {
    #[inline(always)]
    fn increment(&self, slot: u32) {
        if let Some(count) = COUNTERS.get_ptr_mut(slot) {
            unsafe { *count += 1 };
        }
    }
}

// =============================================================================
// XDP entry
// =============================================================================

#[xdp]
pub fn rxgate(ctx: XdpContext) -> u32 {
    match try_rxgate(&ctx) {
        Ok(ret) => ret,
        Err(_) => xdp_action::XDP_PASS,
    }
}

#[inline(always)]
fn try_rxgate(ctx: &XdpContext) -> Result<u32, ()> {
    let view = unsafe { PacketView::from_raw(ctx.data(), ctx.data_end()) };
    let policy =
        DefaultPolicy::from_config(CONFIG.get(config::DEFAULT_POLICY).copied().unwrap_or(0));

    Ok(match classify(&view, policy, &MapRules, &MapCounters) {
        Verdict::Pass => xdp_action::XDP_PASS,
        Verdict::Drop => xdp_action::XDP_DROP,
        // An unpopulated target slot fails closed: once a redirect rule
        // matched, the frame must not continue up the normal stack.
        Verdict::Redirect(target) => REDIRECT_TARGETS
            .redirect(target, 0)
            .unwrap_or(xdp_action::XDP_DROP),
    })
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

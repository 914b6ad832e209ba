//! rxgate - userspace control surface for the XDP gate.
//!
//! Loads and attaches the rxgate eBPF program and owns its shared tables:
//! - rule table create/update/delete/snapshot-read
//! - default policy and redirect-target configuration
//! - outcome counter read and reset
//!
//! The hook itself only ever reads rules and writes counters; everything
//! here is the other side of that contract.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use aya::{
    maps::{DevMap, HashMap, PerCpuArray, PerCpuValues},
    programs::{Xdp, XdpFlags},
    Ebpf,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use rxgate_common::{config, counter, RuleAction, RuleEntry, RuleKey, RuleKind};
pub use rxgate_hook::DefaultPolicy;

// =============================================================================
// Rules as the control plane sees them
// =============================================================================

/// One rule in control-plane form: human-readable value, map-encodable
/// via [`Rule::to_key`] / [`Rule::to_entry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub kind: RuleKind,
    /// IPv4 address, port, or protocol (number or tcp/udp/icmp),
    /// depending on `kind`.
    pub value: String,
    pub action: RuleAction,
    /// Redirect-target slot; required when `action` is `redirect`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<u32>,
}

impl Rule {
    pub fn drop_src_ip(addr: Ipv4Addr) -> Self {
        Self { kind: RuleKind::SrcIp, value: addr.to_string(), action: RuleAction::Drop, redirect_target: None }
    }

    pub fn drop_dst_ip(addr: Ipv4Addr) -> Self {
        Self { kind: RuleKind::DstIp, value: addr.to_string(), action: RuleAction::Drop, redirect_target: None }
    }

    pub fn drop_src_port(port: u16) -> Self {
        Self { kind: RuleKind::SrcPort, value: port.to_string(), action: RuleAction::Drop, redirect_target: None }
    }

    pub fn drop_dst_port(port: u16) -> Self {
        Self { kind: RuleKind::DstPort, value: port.to_string(), action: RuleAction::Drop, redirect_target: None }
    }

    pub fn drop_protocol(proto: u8) -> Self {
        Self { kind: RuleKind::Protocol, value: proto.to_string(), action: RuleAction::Drop, redirect_target: None }
    }

    pub fn pass_src_ip(addr: Ipv4Addr) -> Self {
        Self { kind: RuleKind::SrcIp, value: addr.to_string(), action: RuleAction::Pass, redirect_target: None }
    }

    pub fn redirect_src_ip(addr: Ipv4Addr, target: u32) -> Self {
        Self {
            kind: RuleKind::SrcIp,
            value: addr.to_string(),
            action: RuleAction::Redirect,
            redirect_target: Some(target),
        }
    }

    /// Encode the key for the shared rule table.
    pub fn to_key(&self) -> Result<RuleKey> {
        let value = match self.kind {
            RuleKind::SrcIp | RuleKind::DstIp => {
                let addr: Ipv4Addr = self
                    .value
                    .parse()
                    .with_context(|| format!("invalid IPv4 address: {}", self.value))?;
                // The hook compares the packet's raw bytes, so keys keep
                // network byte order in memory.
                u32::from_ne_bytes(addr.octets())
            }
            RuleKind::SrcPort | RuleKind::DstPort => {
                let port: u16 = self
                    .value
                    .parse()
                    .with_context(|| format!("invalid port: {}", self.value))?;
                if port == 0 {
                    bail!("port 0 is reserved for frames without a transport header");
                }
                port as u32
            }
            RuleKind::Protocol => parse_protocol(&self.value)? as u32,
        };
        Ok(RuleKey::new(self.kind, value))
    }

    /// Encode the value for the shared rule table.
    pub fn to_entry(&self) -> Result<RuleEntry> {
        Ok(match self.action {
            RuleAction::Pass => RuleEntry::pass(),
            RuleAction::Drop => RuleEntry::drop(),
            RuleAction::Redirect => {
                let target = self
                    .redirect_target
                    .context("redirect rule needs a redirect_target slot")?;
                if target >= rxgate_common::MAX_REDIRECT_TARGETS {
                    bail!("redirect target slot {} out of range", target);
                }
                RuleEntry::redirect(target)
            }
        })
    }

    /// Decode a table entry back into control-plane form. `None` for
    /// encodings this version does not understand.
    pub fn from_parts(key: &RuleKey, entry: &RuleEntry) -> Option<Self> {
        let kind = RuleKind::from_u8(key.kind)?;
        let value = match kind {
            RuleKind::SrcIp | RuleKind::DstIp => {
                Ipv4Addr::from(key.value.to_ne_bytes()).to_string()
            }
            RuleKind::SrcPort | RuleKind::DstPort => (key.value as u16).to_string(),
            RuleKind::Protocol => protocol_name(key.value as u8),
        };
        let action = entry.action()?;
        let redirect_target =
            (action == RuleAction::Redirect).then_some(entry.redirect_target);
        Some(Self { kind, value, action, redirect_target })
    }
}

/// A serializable rule-set document (the loader's `apply` format).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    /// "pass" or "drop"; left unchanged when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_policy: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

pub fn parse_policy(name: &str) -> Result<DefaultPolicy> {
    match name {
        "pass" => Ok(DefaultPolicy::Pass),
        "drop" => Ok(DefaultPolicy::Drop),
        other => bail!("unknown policy: {} (expected pass or drop)", other),
    }
}

fn parse_protocol(value: &str) -> Result<u8> {
    match value {
        "tcp" => Ok(6),
        "udp" => Ok(17),
        "icmp" => Ok(1),
        other => other
            .parse()
            .with_context(|| format!("invalid protocol: {}", other)),
    }
}

fn protocol_name(proto: u8) -> String {
    match proto {
        1 => "icmp".to_string(),
        6 => "tcp".to_string(),
        17 => "udp".to_string(),
        other => other.to_string(),
    }
}

// =============================================================================
// Gate - load/attach and table ownership
// =============================================================================

/// Aggregated outcome counters, summed across processing units.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GateCounters {
    pub total: u64,
    pub default_passed: u64,
    pub default_dropped: u64,
    pub rule_passed: u64,
    pub rule_dropped: u64,
    pub redirected: u64,
    pub unclassified: u64,
}

/// Where `cargo xtask build-ebpf` leaves the compiled eBPF object.
#[cfg(debug_assertions)]
pub const DEFAULT_PROGRAM_PATH: &str = "target/bpfel-unknown-none/debug/rxgate-ebpf";
#[cfg(not(debug_assertions))]
pub const DEFAULT_PROGRAM_PATH: &str = "target/bpfel-unknown-none/release/rxgate-ebpf";

/// Loaded-and-attached gate. Owns the eBPF object and with it every
/// shared table; dropping it detaches the hook (subsequent packets only,
/// in-flight invocations always run to completion).
pub struct Gate {
    bpf: Arc<RwLock<Ebpf>>,
    interface: String,
}

impl Gate {
    /// Load the object from [`DEFAULT_PROGRAM_PATH`] and attach to
    /// `interface` with the default flags, falling back to SKB mode
    /// where the driver lacks native XDP.
    pub fn new(interface: &str) -> Result<Self> {
        Self::from_file(DEFAULT_PROGRAM_PATH, interface, XdpFlags::default())
    }

    pub fn from_file(program: impl AsRef<Path>, interface: &str, flags: XdpFlags) -> Result<Self> {
        let program = program.as_ref();
        // Load-time rejection is fatal to attachment: a program the
        // verifier does not accept never sees a packet.
        let mut bpf = Ebpf::load_file(program)
            .with_context(|| format!("failed to load eBPF object {}", program.display()))?;

        let program: &mut Xdp = bpf
            .program_mut("rxgate")
            .context("rxgate program not found")?
            .try_into()
            .context("rxgate program is not XDP")?;
        program.load().context("verifier rejected the rxgate program")?;

        match program.attach(interface, flags) {
            Ok(_) => {
                info!("rxgate attached to {}", interface);
            }
            Err(e) if !flags.contains(XdpFlags::SKB_MODE) => {
                warn!("requested XDP mode failed ({}), trying SKB mode", e);
                program
                    .attach(interface, XdpFlags::SKB_MODE)
                    .with_context(|| format!("failed to attach to {}", interface))?;
                info!("rxgate attached to {} in SKB mode", interface);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to attach to {}", interface));
            }
        }

        Ok(Self { bpf: Arc::new(RwLock::new(bpf)), interface: interface.to_string() })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Detach from the interface. Affects subsequent packets only.
    pub fn detach(self) {
        drop(self);
    }

    // =========================================================================
    // Counter table
    // =========================================================================

    /// Read the counters, summing per-unit partitions.
    pub async fn counters(&self) -> Result<GateCounters> {
        let bpf = self.bpf.read().await;
        let counters: PerCpuArray<_, u64> =
            bpf.map("COUNTERS").context("COUNTERS map not found")?.try_into()?;

        let slot = |i: u32| counters.get(&i, 0).map(|v| sum_percpu(&v)).unwrap_or(0);
        Ok(GateCounters {
            total: slot(counter::TOTAL),
            default_passed: slot(counter::DEFAULT_PASSED),
            default_dropped: slot(counter::DEFAULT_DROPPED),
            rule_passed: slot(counter::RULE_PASSED),
            rule_dropped: slot(counter::RULE_DROPPED),
            redirected: slot(counter::REDIRECTED),
            unclassified: slot(counter::UNCLASSIFIED),
        })
    }

    /// Zero every counter partition.
    pub async fn reset_counters(&self) -> Result<()> {
        let mut bpf = self.bpf.write().await;
        let mut counters: PerCpuArray<_, u64> =
            bpf.map_mut("COUNTERS").context("COUNTERS map not found")?.try_into()?;

        let num_cpus = nr_cpus()?;
        for slot in 0..counter::SLOTS {
            counters.set(slot, PerCpuValues::try_from(vec![0u64; num_cpus])?, 0)?;
        }
        info!("counters reset");
        Ok(())
    }

    // =========================================================================
    // Config table
    // =========================================================================

    /// Set the verdict applied when no rule matches.
    pub async fn set_default_policy(&self, policy: DefaultPolicy) -> Result<()> {
        let mut bpf = self.bpf.write().await;
        let mut cfg: PerCpuArray<_, u32> =
            bpf.map_mut("CONFIG").context("CONFIG map not found")?.try_into()?;

        let raw = match policy {
            DefaultPolicy::Pass => 0u32,
            DefaultPolicy::Drop => 1u32,
        };
        let num_cpus = nr_cpus()?;
        cfg.set(config::DEFAULT_POLICY, PerCpuValues::try_from(vec![raw; num_cpus])?, 0)?;
        info!("default policy set to {:?}", policy);
        Ok(())
    }

    pub async fn default_policy(&self) -> Result<DefaultPolicy> {
        let bpf = self.bpf.read().await;
        let cfg: PerCpuArray<_, u32> =
            bpf.map("CONFIG").context("CONFIG map not found")?.try_into()?;
        let raw = cfg
            .get(&config::DEFAULT_POLICY, 0)
            .ok()
            .and_then(|v| v.iter().next().copied())
            .unwrap_or(0);
        Ok(DefaultPolicy::from_config(raw))
    }

    // =========================================================================
    // Rule table
    // =========================================================================

    pub async fn add_rule(&self, rule: &Rule) -> Result<()> {
        let key = rule.to_key()?;
        let entry = rule.to_entry()?;
        let mut bpf = self.bpf.write().await;
        let mut rules: HashMap<_, RuleKey, RuleEntry> =
            bpf.map_mut("RULES").context("RULES map not found")?.try_into()?;
        rules
            .insert(key, entry, 0)
            .with_context(|| format!("failed to insert rule {:?} = {}", rule.kind, rule.value))?;
        info!("added rule: {:?} {} -> {:?}", rule.kind, rule.value, rule.action);
        Ok(())
    }

    pub async fn remove_rule(&self, rule: &Rule) -> Result<()> {
        let key = rule.to_key()?;
        let mut bpf = self.bpf.write().await;
        let mut rules: HashMap<_, RuleKey, RuleEntry> =
            bpf.map_mut("RULES").context("RULES map not found")?.try_into()?;
        rules.remove(&key)?;
        info!("removed rule: {:?} {}", rule.kind, rule.value);
        Ok(())
    }

    /// Snapshot the rule table. Entries are key-consistent; the snapshot
    /// as a whole is not atomic against concurrent mutation.
    pub async fn list_rules(&self) -> Result<Vec<Rule>> {
        let bpf = self.bpf.read().await;
        let rules: HashMap<_, RuleKey, RuleEntry> =
            bpf.map("RULES").context("RULES map not found")?.try_into()?;

        let mut result = Vec::new();
        for item in rules.iter() {
            if let Ok((key, entry)) = item {
                if let Some(rule) = Rule::from_parts(&key, &entry) {
                    result.push(rule);
                }
            }
        }
        Ok(result)
    }

    pub async fn clear_rules(&self) -> Result<()> {
        let mut bpf = self.bpf.write().await;
        let mut rules: HashMap<_, RuleKey, RuleEntry> =
            bpf.map_mut("RULES").context("RULES map not found")?.try_into()?;
        let keys: Vec<RuleKey> = rules.keys().filter_map(|k| k.ok()).collect();
        for key in keys {
            let _ = rules.remove(&key);
        }
        info!("all rules cleared");
        Ok(())
    }

    /// Apply a whole rule-set document. Returns the number of rules added.
    pub async fn apply(&self, set: &RuleSet) -> Result<usize> {
        if let Some(name) = &set.default_policy {
            self.set_default_policy(parse_policy(name)?).await?;
        }
        for rule in &set.rules {
            self.add_rule(rule).await?;
        }
        Ok(set.rules.len())
    }

    // =========================================================================
    // Redirect targets
    // =========================================================================

    /// Point a redirect-target slot at an interface index.
    pub async fn set_redirect_target(&self, slot: u32, ifindex: u32) -> Result<()> {
        let mut bpf = self.bpf.write().await;
        let mut targets: DevMap<_> = bpf
            .map_mut("REDIRECT_TARGETS")
            .context("REDIRECT_TARGETS map not found")?
            .try_into()?;
        targets.set(slot, ifindex, None, 0)?;
        info!("redirect target {} -> ifindex {}", slot, ifindex);
        Ok(())
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        // aya detaches the link when the object is dropped.
        info!("detaching rxgate from {}", self.interface);
    }
}

fn sum_percpu(values: &PerCpuValues<u64>) -> u64 {
    values.iter().sum()
}

fn nr_cpus() -> Result<usize> {
    aya::util::nr_cpus().map_err(|(msg, e)| anyhow::anyhow!("{}: {}", msg, e))
}

// =============================================================================
// Tests
// =============================================================================

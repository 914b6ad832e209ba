//! rxgate loader CLI
//!
//! Attaches the gate to an interface and drives its control surface:
//! rules, default policy, redirect targets, counters.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use aya::programs::XdpFlags;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use rxgate::{parse_policy, Gate, Rule, RuleSet, DEFAULT_PROGRAM_PATH};
use rxgate_common::{RuleAction, RuleKind};

#[derive(Parser, Debug)]
#[command(name = "rxgate-loader")]
#[command(about = "Attach the rxgate XDP program and manage its tables")]
struct Args {
    /// Interface to attach to
    #[arg(short, long)]
    interface: String,

    /// Compiled eBPF object (see `cargo xtask build-ebpf`)
    #[arg(long, default_value = DEFAULT_PROGRAM_PATH)]
    program: PathBuf,

    /// Try native XDP mode first (falls back to SKB mode)
    #[arg(long)]
    native: bool,

    /// Default verdict when no rule matches: pass or drop
    #[arg(long, default_value = "pass")]
    policy: String,

    /// JSON rule-set file applied right after attach
    #[arg(long)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Periodically print counters
    Stats {
        /// Update interval in seconds
        #[arg(short = 'n', long, default_value = "1")]
        interval: u64,
    },
    /// Add a rule, then keep the gate attached until Ctrl-C
    Add {
        /// Rule kind: src-ip, dst-ip, src-port, dst-port, protocol
        #[arg(short, long)]
        kind: String,
        /// IPv4 address, port, or protocol (number or tcp/udp/icmp)
        #[arg(short, long)]
        value: String,
        /// pass, drop, or redirect
        #[arg(short, long, default_value = "drop")]
        action: String,
        /// Redirect-target slot (redirect action only)
        #[arg(long)]
        target: Option<u32>,
    },
    /// Point a redirect-target slot at an interface, then wait
    RedirectTarget {
        #[arg(long)]
        slot: u32,
        #[arg(long)]
        iface: String,
    },
    /// Print the current rule table
    List,
    /// Remove every rule, then wait
    Clear,
    /// Zero all counters, then wait
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let flags = if args.native { XdpFlags::DRV_MODE } else { XdpFlags::default() };

    info!("loading rxgate on {}", args.interface);
    let gate = Gate::from_file(&args.program, &args.interface, flags)?;

    gate.set_default_policy(parse_policy(&args.policy)?).await?;

    if let Some(path) = &args.rules {
        let doc = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let set: RuleSet = serde_json::from_str(&doc)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        let count = gate.apply(&set).await?;
        info!("applied {} rules from {}", count, path.display());
    }

    match args.command {
        Some(Command::Stats { interval }) => run_stats_loop(&gate, interval).await?,
        Some(Command::Add { kind, value, action, target }) => {
            let rule = parse_rule(&kind, &value, &action, target)?;
            gate.add_rule(&rule).await?;
            println!("added rule: {:?} {} -> {:?}", rule.kind, rule.value, rule.action);
            wait_detached(&gate).await?;
        }
        Some(Command::RedirectTarget { slot, iface }) => {
            let index = ifindex(&iface)?;
            gate.set_redirect_target(slot, index).await?;
            println!("redirect target {} -> {} (ifindex {})", slot, iface, index);
            wait_detached(&gate).await?;
        }
        Some(Command::List) => {
            let rules = gate.list_rules().await?;
            if rules.is_empty() {
                println!("no rules configured");
            } else {
                println!("{:<10} {:<20} {:<10} {:<8}", "KIND", "VALUE", "ACTION", "TARGET");
                for rule in rules {
                    println!(
                        "{:<10} {:<20} {:<10} {:<8}",
                        format!("{:?}", rule.kind),
                        rule.value,
                        format!("{:?}", rule.action),
                        rule.redirect_target.map(|t| t.to_string()).unwrap_or_default(),
                    );
                }
            }
        }
        Some(Command::Clear) => {
            gate.clear_rules().await?;
            println!("all rules cleared");
            wait_detached(&gate).await?;
        }
        Some(Command::Reset) => {
            gate.reset_counters().await?;
            println!("counters reset");
            wait_detached(&gate).await?;
        }
        None => wait_detached(&gate).await?,
    }

    Ok(())
}

fn parse_rule(kind: &str, value: &str, action: &str, target: Option<u32>) -> Result<Rule> {
    let kind = match kind.to_lowercase().as_str() {
        "src-ip" | "src_ip" => RuleKind::SrcIp,
        "dst-ip" | "dst_ip" => RuleKind::DstIp,
        "src-port" | "src_port" => RuleKind::SrcPort,
        "dst-port" | "dst_port" => RuleKind::DstPort,
        "protocol" | "proto" => RuleKind::Protocol,
        other => anyhow::bail!(
            "unknown rule kind: {} (use src-ip, dst-ip, src-port, dst-port, protocol)",
            other
        ),
    };
    let action = match action.to_lowercase().as_str() {
        "pass" => RuleAction::Pass,
        "drop" => RuleAction::Drop,
        "redirect" => RuleAction::Redirect,
        other => anyhow::bail!("unknown action: {} (use pass, drop, redirect)", other),
    };
    Ok(Rule { kind, value: value.to_string(), action, redirect_target: target })
}

/// Interface name to kernel ifindex.
fn ifindex(name: &str) -> Result<u32> {
    let path = format!("/sys/class/net/{}/ifindex", name);
    let raw = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path))?;
    raw.trim().parse().with_context(|| format!("bad ifindex in {}", path))
}

/// Keep the gate attached until Ctrl-C.
async fn wait_detached(gate: &Gate) -> Result<()> {
    info!("rxgate active on {}, Ctrl-C to detach", gate.interface());
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn run_stats_loop(gate: &Gate, interval: u64) -> Result<()> {
    println!("monitoring {} (Ctrl-C to stop)...", gate.interface());
    println!();

    let mut last = gate.counters().await?;
    let mut iteration = 0u64;

    loop {
        tokio::time::sleep(Duration::from_secs(interval)).await;

        let counters = gate.counters().await?;
        let pps = counters.total.saturating_sub(last.total) / interval;
        let drops = counters.rule_dropped + counters.default_dropped;
        let last_drops = last.rule_dropped + last.default_dropped;
        let drops_ps = drops.saturating_sub(last_drops) / interval;

        if iteration % 10 == 0 {
            println!(
                "{:<12} {:<12} {:<12} {:<12} {:<12} {:<12}",
                "TOTAL", "PASSED", "DROPPED", "REDIRECTED", "PPS", "DROPS/S"
            );
        }
        println!(
            "{:<12} {:<12} {:<12} {:<12} {:<12} {:<12}",
            counters.total,
            counters.default_passed + counters.rule_passed,
            drops,
            counters.redirected,
            pps,
            drops_ps,
        );

        last = counters;
        iteration += 1;
    }
}

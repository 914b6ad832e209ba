//! Build helper for the eBPF program

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
enum Cli {
    /// Build the eBPF program
    BuildEbpf {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Build everything (eBPF + userspace)
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,
    },
    /// Build and run the loader
    Run {
        /// Interface to attach to
        #[arg(short, long)]
        interface: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_userspace(release)
        }
        Cli::Run { interface } => run(&interface),
    }
}

fn build_ebpf(release: bool) -> Result<()> {
    println!("Building eBPF program...");

    let mut args = vec![
        "+nightly",
        "build",
        "-p",
        "rxgate-ebpf",
        "--target",
        "bpfel-unknown-none",
        "-Z",
        "build-std=core",
    ];

    if release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .args(&args)
        .env("CARGO_CFG_BPF_TARGET_ARCH", std::env::consts::ARCH)
        .status()
        .context("Failed to run cargo")?;

    if !status.success() {
        bail!("eBPF build failed");
    }

    println!("eBPF build complete");
    Ok(())
}

fn build_userspace(release: bool) -> Result<()> {
    println!("Building userspace programs...");

    let mut args = vec!["build"];
    if release {
        args.push("--release");
    }

    let status = Command::new("cargo")
        .args(&args)
        .status()
        .context("Failed to run cargo")?;

    if !status.success() {
        bail!("Userspace build failed");
    }

    println!("Userspace build complete");
    Ok(())
}

fn run(interface: &str) -> Result<()> {
    build_ebpf(true)?;
    build_userspace(true)?;

    println!("Running loader on interface {}...", interface);

    let status = Command::new("sudo")
        .args(["./target/release/loader", "--interface", interface])
        .status()
        .context("Failed to run loader")?;

    if !status.success() {
        bail!("Loader exited with error");
    }

    Ok(())
}

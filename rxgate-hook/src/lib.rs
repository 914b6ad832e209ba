//! rxgate data-plane core.
//!
//! The verdict logic of the XDP hook, kept free of any BPF dependency so
//! the same code runs under the in-kernel verifier and under host tests:
//! - `PacketView`: bounds-delimited view over one frame
//! - `dissect`: classification-key extraction
//! - `RuleTable` / `CounterTable`: injected shared-table handles
//! - `classify`: the per-frame verdict function
//!
//! Everything on the classification path is statically bounded: no heap,
//! no recursion, no loops over packet data, at most five table lookups
//! and three counter increments per frame.

#![cfg_attr(not(test), no_std)]

pub mod classify;
pub mod dissect;
pub mod tables;
pub mod view;

pub use classify::{classify, DefaultPolicy, Verdict};
pub use tables::{CounterTable, RuleTable};
pub use view::PacketView;

#[cfg(test)]
mod testutil;

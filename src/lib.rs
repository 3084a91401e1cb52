//! Purpose: Shared library crate used by the `tally` CLI, server, and tests.
//! Exports: `api` (stable surface), `core` (keys, records, backends, stores), `server`.
//! Role: Durable per-key counters with strict per-key serialization.
//! Invariants: All counter mutations go through `core::store::CounterStore`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
mod data_paths;
pub mod server;

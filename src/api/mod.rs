//! Purpose: Define the public Rust API boundary for tally.
//! Exports: Key normalization, counter stores, backends, and the local client.
//! Role: Additive-only surface used by the CLI, the server, and tests.
//! Invariants: Callers reach counters only through a `StoreLocator`.

mod client;

pub use crate::core::backend::{Backend, CommitGate, FileBackend};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::key::{CounterKey, GLOBAL_KEY, MAX_KEY_LEN, normalize};
pub use crate::core::store::{CounterStore, DEFAULT_IO_TIMEOUT, Registry, StoreLocator};
pub use client::{ApiResult, LocalClient};

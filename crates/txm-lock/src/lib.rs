//! Distributed locks with expiry for the txm saga coordinator.
//!
//! The coordinator only needs two operations from a lock store: an atomic
//! check-and-set with a TTL, and a release. [`LockProvider`] is that seam.
//! [`KvLockProvider`] implements it over any [`KeyValueConnection`] offering
//! `SET NX EX` style semantics, and [`MemoryKeyValue`] is an in-process
//! connection suitable for tests and single-node deployments.

mod error;
mod kv;
mod memory;
mod provider;

pub use error::LockError;
pub use kv::{KeyValueConnection, KvLockProvider};
pub use memory::MemoryKeyValue;
pub use provider::{LockProvider, LockToken, release_best_effort};

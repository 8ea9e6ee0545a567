//! Core types shared by the txm crates.
//!
//! A saga submission is identified by a [`TransactionIdentity`], from which
//! the transaction-level and per-branch lock keys are derived.

mod error;
mod identity;

pub use error::IdentityError;
pub use identity::TransactionIdentity;

/// Error returned by forward and compensating actions.
pub type ActionError = Box<dyn std::error::Error + Send + Sync + 'static>;

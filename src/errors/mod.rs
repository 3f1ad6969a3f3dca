//! # Error Handling
//!
//! Error types for the trust store, event log and authority journal.

pub mod types;

pub use types::{Result, TrustplaneError};

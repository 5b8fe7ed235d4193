//! Shared domain types for the order-admission pipeline.
//!
//! Signals, feature snapshots, verdicts and the injectable clock live here so
//! every pipeline stage speaks the same vocabulary.

pub mod clock;
pub mod error;
pub mod types;

pub use clock::*;
pub use error::*;
pub use types::*;

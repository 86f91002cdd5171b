//! Core data models for turnjudge.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with degraded fallbacks

mod config;
mod error;
mod record;
mod verdict;

pub use config::*;
pub use error::*;
pub use record::*;
pub use verdict::*;

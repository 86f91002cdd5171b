//! Turn executor: retry policy and per-record bounded concurrency.

mod retry;
mod runner;

pub use retry::*;
pub use runner::*;

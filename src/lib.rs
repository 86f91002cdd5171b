//! turnjudge - Concurrent multi-turn inference and three-judge grading.
//!
//! ## Architecture
//!
//! turnjudge drives multi-turn conversations through one of four backend
//! adaptors and records every turn's output:
//! - **Hosted**: one chat-completion call per turn, per-record concurrency
//! - **Streaming**: one streamed reply per turn, per-record concurrency
//! - **Session**: one stateful chat session per record, restarted on failure
//! - **Batch**: round-synchronized vectorized generation on a local engine
//!
//! ## Pipelines
//!
//! - **Inference Pipeline**: Dataset → Adaptor → Outputs sorted by index
//! - **Judge Pipeline**: Outputs → 3 judge runs per turn → Parse → Vote
//!
//! ## Epistemic Design
//!
//! - K_i (Knowledge): Compile-time enforced invariants (types, enums)
//! - B_i (Beliefs): Runtime fallible operations (Result, Option)
//! - I^R (Resolvable): User-configurable parameters
//! - I^B (Bounded): Network/API uncertainties (retry, restart, degrade)

pub mod adaptor;
pub mod client;
pub mod executor;
pub mod judge;
pub mod models;
pub mod pipeline;
pub mod scheduler;

// Re-exports for convenience
pub use adaptor::{Adaptor, initialize};
pub use judge::{parse_transcript, vote};
pub use models::{Config, ConsensusDecision, ConversationRecord, EvalError, JudgeParse, Result, RunStats};
pub use pipeline::{InferencePipeline, JudgePipeline};

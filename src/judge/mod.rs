//! Judge Voting Engine.
//!
//! Three judge transcripts per graded turn are parsed into verdict sets and
//! reduced to one `ConsensusDecision`.

mod parse;
mod prompt;
mod vote;

pub use parse::*;
pub use prompt::*;
pub use vote::*;

/// Independent judge runs per graded turn.
pub const JUDGES_PER_TURN: usize = 3;

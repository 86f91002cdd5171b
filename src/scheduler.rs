//! Round-synchronized batch scheduling.
//!
//! Epistemic foundation:
//! - K_i: Every active record advances exactly one turn per round, so after
//!   round k every active record has completed k turns
//! - K_i: A record's turn k+1 is scheduled only after its turn k was applied
//! - K_i: System turns are applied in place and never take an inference slot

use crate::models::{ConversationRecord, Turn, TurnOutput};
use tracing::debug;

/// One round's inference members.
#[derive(Debug)]
pub struct Round {
    /// 1-based round number
    pub number: usize,
    /// Records whose next turn needs inference, in stable order
    pub members: Vec<ConversationRecord>,
}

/// Partition-and-requeue scheduler over an explicit active set.
#[derive(Debug, Default)]
pub struct RoundScheduler {
    active: Vec<ConversationRecord>,
    /// System-advanced records waiting for the next round
    requeued: Vec<ConversationRecord>,
    done: Vec<ConversationRecord>,
    round: usize,
}

impl RoundScheduler {
    pub fn new(records: Vec<ConversationRecord>) -> Self {
        Self {
            active: records,
            ..Self::default()
        }
    }

    /// Build the next round.
    ///
    /// Complete records move to the done set. Records whose next turn is a
    /// system turn get the placeholder and are requeued for the next round.
    /// Returns `None` once nothing is active. A round may have no members
    /// when every active record was on a system turn.
    pub fn next_round(&mut self) -> Option<Round> {
        let mut candidates = std::mem::take(&mut self.active);
        candidates.append(&mut self.requeued);

        let mut members = Vec::new();
        for mut record in candidates {
            match record.next_turn().map(Turn::is_system) {
                None => self.done.push(record),
                Some(true) => {
                    record.advance(TurnOutput::system_placeholder());
                    self.requeued.push(record);
                }
                Some(false) => members.push(record),
            }
        }

        if members.is_empty() && self.requeued.is_empty() {
            return None;
        }

        self.round += 1;
        debug!(
            round = self.round,
            members = members.len(),
            system_advanced = self.requeued.len(),
            done = self.done.len(),
            "Scheduled round"
        );

        Some(Round {
            number: self.round,
            members,
        })
    }

    /// Return a round's members after their outputs were applied.
    pub fn requeue(&mut self, members: Vec<ConversationRecord>) {
        self.active.extend(members);
    }

    pub fn rounds_run(&self) -> usize {
        self.round
    }

    /// Every record, once `next_round` has returned `None`.
    pub fn into_done(mut self) -> Vec<ConversationRecord> {
        self.done.append(&mut self.active);
        self.done.append(&mut self.requeued);
        self.done
    }
}

/// Keep the first and last `max / 2` tokens of an over-long prompt.
pub fn truncate_center(tokens: Vec<u32>, max: usize) -> Vec<u32> {
    if tokens.len() <= max {
        return tokens;
    }
    let half = max / 2;
    let mut truncated = Vec::with_capacity(half * 2);
    truncated.extend_from_slice(&tokens[..half]);
    truncated.extend_from_slice(&tokens[tokens.len() - half..]);
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use serde_json::json;

    fn record(index: usize, roles: &[Role]) -> ConversationRecord {
        let turns = roles
            .iter()
            .enumerate()
            .map(|(i, r)| Turn::new(*r, format!("r{index}t{i}")))
            .collect();
        ConversationRecord::new(json!(index), turns)
    }

    fn answer(record: &mut ConversationRecord) {
        let prompt = record.pending_messages();
        let last = prompt.last().map(|m| m.content.clone()).unwrap_or_default();
        record.advance(TurnOutput {
            response: format!("re:{last}"),
            ..TurnOutput::default()
        });
    }

    #[test]
    fn test_rounds_shrink_with_turn_counts() {
        let records = vec![
            record(0, &[Role::User]),
            record(1, &[Role::User, Role::User]),
            record(2, &[Role::User, Role::User, Role::User]),
        ];
        let mut scheduler = RoundScheduler::new(records);
        let mut sizes = Vec::new();

        while let Some(mut round) = scheduler.next_round() {
            sizes.push(round.members.len());
            for member in &mut round.members {
                assert_eq!(member.completed_turns(), round.number - 1);
                if round.number > 1 {
                    let prompt = member.pending_messages();
                    let previous = &prompt[prompt.len() - 2];
                    assert_eq!(previous.role, Role::Assistant);
                    assert_eq!(
                        previous.content,
                        format!("re:{}", member.turns()[round.number - 2].message)
                    );
                }
                answer(member);
            }
            scheduler.requeue(round.members);
        }

        assert_eq!(sizes, vec![3, 2, 1]);
        let done = scheduler.into_done();
        assert_eq!(done.len(), 3);
        assert!(done.iter().all(|r| r.is_complete()));
    }

    #[test]
    fn test_system_turns_skip_inference_slot() {
        let records = vec![
            record(0, &[Role::System, Role::User]),
            record(1, &[Role::User, Role::User]),
        ];
        let mut scheduler = RoundScheduler::new(records);

        let mut round = scheduler.next_round().unwrap();
        assert_eq!(round.members.len(), 1);
        assert_eq!(round.members[0].index, json!(1));
        round.members.iter_mut().for_each(answer);
        scheduler.requeue(round.members);

        let mut round = scheduler.next_round().unwrap();
        assert_eq!(round.members.len(), 2);
        round.members.iter_mut().for_each(answer);
        scheduler.requeue(round.members);

        assert!(scheduler.next_round().is_none());
        assert_eq!(scheduler.rounds_run(), 2);

        let done = scheduler.into_done();
        let sys = done.iter().find(|r| r.index == json!(0)).unwrap();
        assert_eq!(sys.outputs()[0], TurnOutput::system_placeholder());
        assert_eq!(sys.outputs()[1].response, "re:r0t1");
    }

    #[test]
    fn test_only_system_turns_yield_empty_round() {
        let mut scheduler = RoundScheduler::new(vec![record(0, &[Role::System])]);
        let round = scheduler.next_round().unwrap();
        assert!(round.members.is_empty());
        assert!(scheduler.next_round().is_none());
        assert!(scheduler.into_done()[0].is_complete());
    }

    #[test]
    fn test_truncate_center() {
        let tokens: Vec<u32> = (0..10).collect();
        assert_eq!(truncate_center(tokens.clone(), 4), vec![0, 1, 8, 9]);
        assert_eq!(truncate_center(tokens.clone(), 10), tokens);
        assert_eq!(truncate_center(tokens, 5), vec![0, 1, 8, 9]);
    }
}

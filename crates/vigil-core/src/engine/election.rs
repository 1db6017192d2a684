//! Epoch-numbered leader election.
//!
//! Votes are per primary and per epoch: a supervisor grants its vote to
//! the first candidate that asks in a given epoch and repeats the same
//! answer to everyone else. The winner must gather an absolute majority
//! of voters and at least the primary's configured quorum.

use std::collections::HashMap;

use rand::Rng;
use vigil_types::constants::MAX_DESYNC_MS;
use vigil_types::{Epoch, EventLevel, RunId};

use crate::instance::Primary;
use crate::EngineOutput;

use super::{emit, EmitCtx, Engine};

impl Engine {
    /// Considers granting our vote for `req_runid` in `req_epoch`.
    ///
    /// Returns the stored vote, which may be one granted earlier in the
    /// same epoch to a different candidate.
    pub(super) fn vote_leader(
        &mut self,
        primary: &mut Primary,
        req_epoch: Epoch,
        req_runid: &RunId,
        now: u64,
        out: &mut EngineOutput,
    ) -> (Option<RunId>, Epoch) {
        let ctx = EmitCtx::of(primary);

        if req_epoch > self.current_epoch {
            self.current_epoch = req_epoch;
            emit(
                out,
                Some(&ctx),
                EventLevel::Warning,
                "+new-epoch",
                self.current_epoch.to_string(),
            );
        }

        if primary.leader_epoch < req_epoch && self.current_epoch <= req_epoch {
            primary.leader = Some(req_runid.clone());
            primary.leader_epoch = self.current_epoch;
            emit(
                out,
                Some(&ctx),
                EventLevel::Warning,
                "+vote-for-leader",
                format!("{req_runid} {}", primary.leader_epoch),
            );
            // Voting for someone else delays our own candidacy by a random
            // offset, reducing split votes across supervisors.
            if *req_runid != self.run_id {
                primary.failover_start_at = now + self.rng.gen_range(0..MAX_DESYNC_MS);
            }
        }

        (primary.leader.clone(), primary.leader_epoch)
    }

    /// Counts the known votes for `epoch` and returns the winner, if one
    /// has both an absolute majority of voters and the primary's quorum.
    ///
    /// Casts our own vote as a side effect: for the current front-runner
    /// when there is one, else for ourselves.
    pub(super) fn get_leader(
        &mut self,
        primary: &mut Primary,
        epoch: Epoch,
        now: u64,
        out: &mut EngineOutput,
    ) -> Option<RunId> {
        debug_assert!(primary.is_o_down() || primary.failover_in_progress());

        let mut counters: HashMap<RunId, u32> = HashMap::new();
        let voters = primary.peers.len() as u32 + 1;

        for peer in primary.peers.values() {
            if let Some((candidate, vote_epoch)) = &peer.vote {
                if *vote_epoch == self.current_epoch {
                    *counters.entry(candidate.clone()).or_insert(0) += 1;
                }
            }
        }

        let front_runner = max_vote(&counters);

        // Our own vote goes to the front-runner, or to us if none.
        let my_candidate = front_runner.unwrap_or_else(|| self.run_id.clone());
        let (my_vote, my_vote_epoch) = self.vote_leader(primary, epoch, &my_candidate, now, out);
        if let Some(vote) = my_vote {
            if my_vote_epoch == epoch {
                *counters.entry(vote).or_insert(0) += 1;
            }
        }

        let winner = max_vote(&counters)?;
        let votes = counters[&winner];
        let majority = voters / 2 + 1;
        if votes < majority || votes < primary.quorum {
            return None;
        }
        Some(winner)
    }
}

/// Highest vote count; ties break toward the lexicographically smallest
/// run id so every supervisor computes the same front-runner.
fn max_vote(counters: &HashMap<RunId, u32>) -> Option<RunId> {
    counters
        .iter()
        .max_by(|(id_a, votes_a), (id_b, votes_b)| {
            votes_a.cmp(votes_b).then_with(|| id_b.cmp(id_a))
        })
        .map(|(id, _)| id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runid(c: char) -> RunId {
        RunId::new(c.to_string().repeat(40))
    }

    #[test]
    fn max_vote_prefers_count_then_smallest_runid() {
        let mut counters = HashMap::new();
        counters.insert(runid('b'), 2);
        counters.insert(runid('a'), 1);
        assert_eq!(max_vote(&counters), Some(runid('b')));

        counters.insert(runid('a'), 2);
        assert_eq!(max_vote(&counters), Some(runid('a')));
    }

    #[test]
    fn max_vote_empty_is_none() {
        assert_eq!(max_vote(&HashMap::new()), None);
    }
}

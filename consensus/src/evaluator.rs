//! Consensus evaluation
//!
//! Decides when a vote has reached quorum and drives the finalization
//! transition. Evaluation is recomputation: the confirmed-entry count of
//! the current round is the single source of truth.

use std::sync::Arc;

use ballot_core::{BallotResult, BallotError, VoteStatus};
use ballot_store::VoteStore;

use crate::quorum;
use crate::rounds::RoundManager;

/// Result of evaluating a vote's current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusOutcome {
    /// Unsettled entries remain and quorum has not been reached.
    StillPending,
    /// Quorum reached. `newly` is true only for the evaluation that
    /// performed the transition, so side effects fire exactly once.
    Finalized { newly: bool },
    /// The round settled below quorum (or the vote is terminally failed).
    Failed { round: u32 },
}

#[derive(Clone)]
pub struct ConsensusEvaluator {
    store: Arc<VoteStore>,
    rounds: Arc<RoundManager>,
}

impl ConsensusEvaluator {
    pub fn new(store: Arc<VoteStore>, rounds: Arc<RoundManager>) -> Self {
        ConsensusEvaluator { store, rounds }
    }

    /// Evaluate a vote against its current round.
    ///
    /// Idempotent: an already-finalized vote returns `Finalized` without
    /// touching any state, no matter how often it is called. Runs under
    /// the vote lock, so the count it persists always belongs to the
    /// round it read.
    pub async fn evaluate(&self, vote_id: &str) -> BallotResult<ConsensusOutcome> {
        let lock = self.rounds.vote_lock(vote_id);
        let _guard = lock.lock().await;

        let vote = self
            .store
            .get(vote_id)
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;

        match vote.status {
            VoteStatus::Finalized => return Ok(ConsensusOutcome::Finalized { newly: false }),
            VoteStatus::Failed | VoteStatus::Expired => {
                return Ok(ConsensusOutcome::Failed {
                    round: vote.current_round,
                })
            }
            VoteStatus::Pending => {}
        }

        let round = match self.rounds.current_round(vote_id) {
            Some(round) => round,
            // No round opened yet
            None => return Ok(ConsensusOutcome::StillPending),
        };

        let confirmed = round.confirmed_count();
        if quorum::has_quorum(confirmed, vote.required_confirmations) {
            let (_, newly) = self.store.finalize(vote_id, confirmed)?;
            return Ok(ConsensusOutcome::Finalized { newly });
        }

        if round.is_settled() {
            self.store.set_confirmation_count(vote_id, confirmed)?;
            log::warn!(
                "round {} of vote {} settled below quorum: {}/{}",
                round.number,
                vote_id,
                confirmed,
                vote.required_confirmations
            );
            return Ok(ConsensusOutcome::Failed {
                round: round.number,
            });
        }

        Ok(ConsensusOutcome::StillPending)
    }
}

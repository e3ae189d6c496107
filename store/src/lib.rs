//! BallotNet Vote Record Store
//!
//! Holds votes and their confirmation state. Creation is append-only and
//! enforces the one-vote-per-(voter, election) constraint atomically;
//! status changes go through the monotonic transition helpers.

pub mod snapshot;

pub use snapshot::{SnapshotStore, StoreError};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use ballot_core::types::{CandidateId, ElectionId, VoteId, VoterId};
use ballot_core::{BallotError, BallotResult, Vote, VoteStatus};

/// Lifecycle phase of an election, as far as consensus cares.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ElectionPhase {
    Active,
    Ended,
}

/// Per-election vote counters for the dashboard query interface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ElectionStats {
    pub total: usize,
    pub pending: usize,
    pub finalized: usize,
    pub failed: usize,
}

/// Serializable export of the store, used by [`SnapshotStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteTableSnapshot {
    pub votes: Vec<Vote>,
    pub elections: Vec<(ElectionId, ElectionPhase)>,
}

/// In-memory vote table with an atomic uniqueness index.
pub struct VoteStore {
    votes: DashMap<VoteId, Vote>,
    /// (voter, election) -> vote id. Insert-or-fail on this index is what
    /// prevents double voting under concurrent requests.
    by_ballot: DashMap<(VoterId, ElectionId), VoteId>,
    elections: DashMap<ElectionId, ElectionPhase>,
}

impl VoteStore {
    pub fn new() -> Self {
        VoteStore {
            votes: DashMap::new(),
            by_ballot: DashMap::new(),
            elections: DashMap::new(),
        }
    }

    pub fn open_election(&self, election_id: ElectionId) {
        self.elections.insert(election_id, ElectionPhase::Active);
    }

    pub fn end_election(&self, election_id: &str) -> BallotResult<()> {
        let mut phase = self
            .elections
            .get_mut(election_id)
            .ok_or_else(|| BallotError::ElectionNotFound(election_id.to_string()))?;
        *phase = ElectionPhase::Ended;
        Ok(())
    }

    pub fn is_election_active(&self, election_id: &str) -> bool {
        self.elections
            .get(election_id)
            .map(|p| *p == ElectionPhase::Active)
            .unwrap_or(false)
    }

    /// True only when the election is known and has been ended.
    pub fn election_ended(&self, election_id: &str) -> bool {
        self.elections
            .get(election_id)
            .map(|p| *p == ElectionPhase::Ended)
            .unwrap_or(false)
    }

    /// Create a vote, failing if one already exists for (voter, election).
    ///
    /// The check and the insert happen under the index entry lock, so two
    /// concurrent casts for the same ballot race for exactly one slot.
    pub fn create(
        &self,
        voter_id: VoterId,
        candidate_id: CandidateId,
        election_id: ElectionId,
        required_confirmations: u32,
    ) -> BallotResult<Vote> {
        let key = (voter_id.clone(), election_id.clone());
        match self.by_ballot.entry(key) {
            Entry::Occupied(_) => Err(BallotError::DuplicateVote {
                voter_id,
                election_id,
            }),
            Entry::Vacant(slot) => {
                let vote = Vote::new(voter_id, candidate_id, election_id, required_confirmations);
                self.votes.insert(vote.id.clone(), vote.clone());
                slot.insert(vote.id.clone());
                Ok(vote)
            }
        }
    }

    pub fn get(&self, vote_id: &str) -> Option<Vote> {
        self.votes.get(vote_id).map(|v| v.clone())
    }

    fn get_mut_required(
        &self,
        vote_id: &str,
    ) -> BallotResult<dashmap::mapref::one::RefMut<'_, VoteId, Vote>> {
        self.votes
            .get_mut(vote_id)
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))
    }

    /// Open the next confirmation round, returning its number.
    pub fn begin_round(&self, vote_id: &str) -> BallotResult<u32> {
        let mut vote = self.get_mut_required(vote_id)?;
        vote.current_round += 1;
        vote.confirmation_count = 0;
        Ok(vote.current_round)
    }

    /// Persist the confirmed-entry count for the current round.
    pub fn set_confirmation_count(&self, vote_id: &str, count: u32) -> BallotResult<()> {
        let mut vote = self.get_mut_required(vote_id)?;
        vote.confirmation_count = count;
        Ok(())
    }

    /// Mark a vote finalized. Returns the vote and whether this call
    /// performed the transition; idempotent on already-finalized votes.
    pub fn finalize(&self, vote_id: &str, confirmation_count: u32) -> BallotResult<(Vote, bool)> {
        let mut vote = self.get_mut_required(vote_id)?;
        if vote.status == VoteStatus::Finalized {
            return Ok((vote.clone(), false));
        }
        vote.transition(VoteStatus::Finalized)?;
        vote.confirmation_count = confirmation_count;
        log::info!(
            "vote {} finalized with {}/{} confirmations",
            vote.id,
            vote.confirmation_count,
            vote.required_confirmations
        );
        Ok((vote.clone(), true))
    }

    /// Move a vote to the terminal `Failed` state.
    pub fn fail(&self, vote_id: &str) -> BallotResult<Vote> {
        let mut vote = self.get_mut_required(vote_id)?;
        vote.transition(VoteStatus::Failed)?;
        Ok(vote.clone())
    }

    /// Move a vote to the terminal `Expired` state.
    pub fn expire(&self, vote_id: &str) -> BallotResult<Vote> {
        let mut vote = self.get_mut_required(vote_id)?;
        vote.transition(VoteStatus::Expired)?;
        Ok(vote.clone())
    }

    pub fn votes_for_election(&self, election_id: &str) -> Vec<Vote> {
        self.votes
            .iter()
            .filter(|v| v.election_id == election_id)
            .map(|v| v.clone())
            .collect()
    }

    pub fn election_stats(&self, election_id: &str) -> ElectionStats {
        let mut stats = ElectionStats {
            total: 0,
            pending: 0,
            finalized: 0,
            failed: 0,
        };
        for vote in self.votes.iter() {
            if vote.election_id != election_id {
                continue;
            }
            stats.total += 1;
            match vote.status {
                VoteStatus::Pending => stats.pending += 1,
                VoteStatus::Finalized => stats.finalized += 1,
                VoteStatus::Failed | VoteStatus::Expired => stats.failed += 1,
            }
        }
        stats
    }

    pub fn count(&self) -> usize {
        self.votes.len()
    }

    /// Export for snapshot persistence.
    pub fn export(&self) -> VoteTableSnapshot {
        VoteTableSnapshot {
            votes: self.votes.iter().map(|v| v.clone()).collect(),
            elections: self
                .elections
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    /// Rebuild a store from a snapshot, restoring the uniqueness index.
    pub fn from_snapshot(snapshot: VoteTableSnapshot) -> Self {
        let store = VoteStore::new();
        for (election_id, phase) in snapshot.elections {
            store.elections.insert(election_id, phase);
        }
        for vote in snapshot.votes {
            store
                .by_ballot
                .insert((vote.voter_id.clone(), vote.election_id.clone()), vote.id.clone());
            store.votes.insert(vote.id.clone(), vote);
        }
        store
    }
}

impl Default for VoteStore {
    fn default() -> Self {
        Self::new()
    }
}

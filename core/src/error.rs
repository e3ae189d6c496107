//! Consensus error taxonomy

use thiserror::Error;

use crate::types::VoteStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BallotError {
    /// A vote already exists for this (voter, election). User-facing;
    /// nothing was mutated.
    #[error("duplicate vote: voter {voter_id} already voted in election {election_id}")]
    DuplicateVote {
        voter_id: String,
        election_id: String,
    },

    /// No active nodes available to open a round. Recoverable; the vote
    /// stays pending and the round is retried later.
    #[error("no active nodes available for election {election_id}")]
    InsufficientNodes { election_id: String },

    /// No pending log entry for (vote, node, round). Guards against
    /// duplicate and stale confirmations.
    #[error("no pending round entry for vote {vote_id}, node {node_id}, round {round}")]
    UnknownRoundEntry {
        vote_id: String,
        node_id: String,
        round: u32,
    },

    /// All confirmation rounds spent without reaching quorum.
    #[error("vote {vote_id} exhausted all {rounds} confirmation rounds")]
    RoundExhausted { vote_id: String, rounds: u32 },

    /// The owning election ended; in-flight confirmations are stale.
    #[error("election {election_id} has ended")]
    ElectionEnded { election_id: String },

    #[error("vote not found: {0}")]
    VoteNotFound(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("election not found: {0}")]
    ElectionNotFound(String),

    #[error("invalid status transition for vote {vote_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        vote_id: String,
        from: VoteStatus,
        to: VoteStatus,
    },
}

pub type BallotResult<T> = Result<T, BallotError>;

//! BallotNet Core Library
//!
//! Shared data model for the distributed vote-confirmation subsystem:
//! votes, election nodes, consensus rounds and their log entries.

pub mod error;
pub mod fingerprint;
pub mod types;

pub use error::{BallotError, BallotResult};
pub use fingerprint::{signature_token, vote_fingerprint};
pub use types::{
    CandidateId, ConsensusLogEntry, ConsensusRound, ElectionId, ElectionNode, EntryStatus, NodeId,
    NodeStatus, Vote, VoteId, VoteStatus, VoterId,
};

/// Quorum threshold assigned to a vote at creation time.
pub const DEFAULT_REQUIRED_CONFIRMATIONS: u32 = 3;

/// Maximum confirmation rounds before a vote is permanently failed.
pub const DEFAULT_MAX_ROUNDS: u32 = 3;

/// Number of election nodes seeded per election.
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Smoothing factor for the rolling response-time average.
pub const RESPONSE_TIME_SMOOTHING: f64 = 0.2;

/// Sliding window size for the heartbeat uptime ratio.
pub const UPTIME_WINDOW: usize = 20;

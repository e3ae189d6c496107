//! Vote and election-node type definitions

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BallotError, BallotResult};
use crate::fingerprint::vote_fingerprint;
use crate::{RESPONSE_TIME_SMOOTHING, UPTIME_WINDOW};

pub type VoteId = String;
pub type NodeId = String;
pub type ElectionId = String;
pub type VoterId = String;
pub type CandidateId = String;

/// Lifecycle status of a vote.
///
/// `Finalized`, `Failed` and `Expired` are terminal; a vote never leaves
/// them once entered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Pending,
    Finalized,
    Failed,
    Expired,
}

impl VoteStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, VoteStatus::Pending)
    }
}

/// Operational status of an election node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Inactive,
    Unreachable,
}

/// Status of a single node's confirmation within a round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Confirmed,
    Rejected,
    TimedOut,
}

impl EntryStatus {
    /// A settled entry is immutable.
    pub fn is_settled(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }
}

/// An independent confirming node participating in an election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionNode {
    pub id: NodeId,
    pub election_id: ElectionId,
    /// Network address, `ip:port`.
    pub address: String,
    pub status: NodeStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Exponential moving average of heartbeat response times.
    pub avg_response_ms: f64,
    /// Sliding window of on-time flags, newest last.
    uptime_samples: VecDeque<bool>,
    pub registered_at: DateTime<Utc>,
}

impl ElectionNode {
    pub fn new(election_id: ElectionId, address: String) -> Self {
        ElectionNode {
            id: Uuid::new_v4().to_string(),
            election_id,
            address,
            status: NodeStatus::Active,
            last_heartbeat: None,
            avg_response_ms: 0.0,
            uptime_samples: VecDeque::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    /// Record a heartbeat. `on_time` is true when the heartbeat arrived
    /// within the expected interval since the previous one.
    pub fn record_heartbeat(&mut self, response_ms: f64, on_time: bool) {
        self.status = NodeStatus::Active;
        self.last_heartbeat = Some(Utc::now());

        if self.uptime_samples.is_empty() {
            self.avg_response_ms = response_ms;
        } else {
            self.avg_response_ms = RESPONSE_TIME_SMOOTHING * response_ms
                + (1.0 - RESPONSE_TIME_SMOOTHING) * self.avg_response_ms;
        }

        self.uptime_samples.push_back(on_time);
        while self.uptime_samples.len() > UPTIME_WINDOW {
            self.uptime_samples.pop_front();
        }
    }

    /// Percentage of heartbeats in the sliding window that arrived on time.
    pub fn uptime_percentage(&self) -> f64 {
        if self.uptime_samples.is_empty() {
            return 0.0;
        }
        let on_time = self.uptime_samples.iter().filter(|s| **s).count();
        (on_time as f64 / self.uptime_samples.len() as f64) * 100.0
    }

    pub fn deactivate(&mut self) {
        self.status = NodeStatus::Inactive;
    }

    pub fn mark_unreachable(&mut self) {
        self.status = NodeStatus::Unreachable;
    }
}

/// A cast vote tracked through quorum confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub voter_id: VoterId,
    pub candidate_id: CandidateId,
    pub election_id: ElectionId,
    pub status: VoteStatus,
    /// Quorum threshold, fixed at creation.
    pub required_confirmations: u32,
    /// Confirmed entries in the current round.
    pub confirmation_count: u32,
    /// Highest round number opened so far; 0 before the first round.
    pub current_round: u32,
    /// Content fingerprint used for audit and replay detection.
    pub fingerprint: String,
    pub cast_at: DateTime<Utc>,
}

impl Vote {
    pub fn new(
        voter_id: VoterId,
        candidate_id: CandidateId,
        election_id: ElectionId,
        required_confirmations: u32,
    ) -> Self {
        let nonce: u64 = rand::random();
        let fingerprint = vote_fingerprint(&voter_id, &candidate_id, &election_id, nonce);
        Vote {
            id: Uuid::new_v4().to_string(),
            voter_id,
            candidate_id,
            election_id,
            status: VoteStatus::Pending,
            required_confirmations,
            confirmation_count: 0,
            current_round: 0,
            fingerprint,
            cast_at: Utc::now(),
        }
    }

    /// Enforce the monotonic status machine. Re-entering the same terminal
    /// state is a no-op; any other transition out of a terminal state fails.
    pub fn transition(&mut self, to: VoteStatus) -> BallotResult<()> {
        if self.status == to {
            return Ok(());
        }
        if self.status.is_terminal() {
            return Err(BallotError::InvalidTransition {
                vote_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// One per (vote, node, round): a node's confirmation slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusLogEntry {
    pub vote_id: VoteId,
    pub node_id: NodeId,
    pub round: u32,
    pub status: EntryStatus,
    /// Deterministic signature token, see [`crate::signature_token`].
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

/// One attempt at gathering confirmations from a selected node subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRound {
    pub vote_id: VoteId,
    /// Strictly increasing per vote, starting at 1.
    pub number: u32,
    pub opened_at: DateTime<Utc>,
    pub entries: Vec<ConsensusLogEntry>,
}

impl ConsensusRound {
    pub fn confirmed_count(&self) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Confirmed)
            .count() as u32
    }

    /// All entries have reached a settled state.
    pub fn is_settled(&self) -> bool {
        self.entries.iter().all(|e| e.status.is_settled())
    }

    pub fn entry_mut(&mut self, node_id: &str) -> Option<&mut ConsensusLogEntry> {
        self.entries.iter_mut().find(|e| e.node_id == node_id)
    }
}

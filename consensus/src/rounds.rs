//! Consensus round management
//!
//! Opens confirmation rounds and records node confirmations. All mutation
//! for a single vote goes through that vote's mutex, so round-opening and
//! confirmation recording never interleave and double-count toward
//! quorum. Unrelated votes share no lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use ballot_core::types::VoteId;
use ballot_core::{
    signature_token, BallotError, BallotResult, ConsensusLogEntry, ConsensusRound, EntryStatus,
    Vote, VoteStatus,
};
use ballot_store::VoteStore;

use crate::quorum;
use crate::registry::NodeRegistry;

/// A node's verdict on a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed,
    Rejected,
}

/// What happened when a settled, below-quorum round was advanced.
#[derive(Debug, Clone)]
pub enum RoundAdvance {
    /// A fresh round was opened; `confirmed` is the failed round's tally.
    Reopened {
        confirmed: u32,
        round: ConsensusRound,
    },
    /// The retry budget is spent; the vote was moved to failed.
    Exhausted { confirmed: u32, vote: Vote },
    /// Another worker already advanced or settled this vote.
    AlreadyHandled,
}

pub struct RoundManager {
    store: Arc<VoteStore>,
    registry: Arc<NodeRegistry>,
    /// Round history per vote, newest last.
    rounds: DashMap<VoteId, Vec<ConsensusRound>>,
    /// Per-vote single-writer locks.
    locks: DashMap<VoteId, Arc<Mutex<()>>>,
}

impl RoundManager {
    pub fn new(store: Arc<VoteStore>, registry: Arc<NodeRegistry>) -> Self {
        RoundManager {
            store,
            registry,
            rounds: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub(crate) fn vote_lock(&self, vote_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(vote_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Open the next confirmation round for a vote.
    ///
    /// Selects up to `required_confirmations` active nodes and creates a
    /// pending log entry per node, each carrying its deterministic
    /// signature token. With zero active nodes this fails with
    /// `InsufficientNodes` and leaves the vote untouched; a partial
    /// selection opens a short round. While the current round is still
    /// unsettled, opening is idempotent and returns that round.
    pub async fn open_round(&self, vote_id: &str) -> BallotResult<ConsensusRound> {
        let lock = self.vote_lock(vote_id);
        let _guard = lock.lock().await;
        self.open_round_locked(vote_id)
    }

    /// Advance a vote whose round `failed_round` settled below quorum:
    /// open a fresh round while the budget lasts, otherwise fail the vote.
    ///
    /// Evaluation runs concurrently on the task queue, so the caller's
    /// view may be stale; everything is re-checked under the vote lock and
    /// a lost race reports `AlreadyHandled` instead of double-advancing.
    pub async fn advance_after_failure(
        &self,
        vote_id: &str,
        failed_round: u32,
        max_rounds: u32,
    ) -> BallotResult<RoundAdvance> {
        let lock = self.vote_lock(vote_id);
        let _guard = lock.lock().await;

        let vote = self
            .store
            .get(vote_id)
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;
        if vote.status.is_terminal() || vote.current_round != failed_round {
            return Ok(RoundAdvance::AlreadyHandled);
        }

        let confirmed = match self.current_round(vote_id) {
            Some(round)
                if round.number == failed_round
                    && round.is_settled()
                    && !quorum::has_quorum(round.confirmed_count(), vote.required_confirmations) =>
            {
                round.confirmed_count()
            }
            _ => return Ok(RoundAdvance::AlreadyHandled),
        };

        if quorum::rounds_remaining(failed_round, max_rounds) == 0 {
            let vote = self.store.fail(vote_id)?;
            return Ok(RoundAdvance::Exhausted { confirmed, vote });
        }

        let round = self.open_round_locked(vote_id)?;
        Ok(RoundAdvance::Reopened { confirmed, round })
    }

    fn open_round_locked(&self, vote_id: &str) -> BallotResult<ConsensusRound> {
        let vote = self
            .store
            .get(vote_id)
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;

        if self.store.election_ended(&vote.election_id) {
            return Err(BallotError::ElectionEnded {
                election_id: vote.election_id,
            });
        }
        if vote.status.is_terminal() {
            return Err(BallotError::InvalidTransition {
                vote_id: vote.id,
                from: vote.status,
                to: VoteStatus::Pending,
            });
        }

        let nodes = self
            .registry
            .select_active_nodes(&vote.election_id, vote.required_confirmations as usize);
        if nodes.is_empty() {
            return Err(BallotError::InsufficientNodes {
                election_id: vote.election_id,
            });
        }

        // At most one unsettled round per vote: while the current round is
        // still collecting confirmations, opening again returns it instead
        // of burning the retry budget
        if let Some(current) = self.current_round(vote_id) {
            if !current.is_settled() {
                return Ok(current);
            }
        }

        let number = self.store.begin_round(vote_id)?;
        let opened_at = Utc::now();
        let entries = nodes
            .iter()
            .map(|node| ConsensusLogEntry {
                vote_id: vote.id.clone(),
                node_id: node.id.clone(),
                round: number,
                status: EntryStatus::Pending,
                signature: signature_token(&vote.fingerprint, &node.id),
                timestamp: opened_at,
            })
            .collect();

        let round = ConsensusRound {
            vote_id: vote.id.clone(),
            number,
            opened_at,
            entries,
        };

        self.rounds
            .entry(vote.id.clone())
            .or_default()
            .push(round.clone());

        log::info!(
            "opened round {} for vote {} with {} nodes",
            number,
            vote.id,
            round.entries.len()
        );
        Ok(round)
    }

    /// Record a node's confirmation for the current round.
    ///
    /// Idempotent: repeating an identical verdict on a settled entry is a
    /// no-op. Anything else without a pending entry (unknown node, stale
    /// round, flipped verdict) is `UnknownRoundEntry` and dropped.
    pub async fn record_confirmation(
        &self,
        vote_id: &str,
        node_id: &str,
        outcome: ConfirmationOutcome,
    ) -> BallotResult<EntryStatus> {
        let lock = self.vote_lock(vote_id);
        let _guard = lock.lock().await;

        let vote = self
            .store
            .get(vote_id)
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;

        // Confirmations for an ended election are stale, not applied
        if self.store.election_ended(&vote.election_id) {
            return Err(BallotError::ElectionEnded {
                election_id: vote.election_id,
            });
        }

        let wanted = match outcome {
            ConfirmationOutcome::Confirmed => EntryStatus::Confirmed,
            ConfirmationOutcome::Rejected => EntryStatus::Rejected,
        };

        let mut history = self.rounds.get_mut(vote_id).ok_or_else(|| {
            BallotError::UnknownRoundEntry {
                vote_id: vote_id.to_string(),
                node_id: node_id.to_string(),
                round: vote.current_round,
            }
        })?;
        let round = history
            .last_mut()
            .ok_or_else(|| BallotError::UnknownRoundEntry {
                vote_id: vote_id.to_string(),
                node_id: node_id.to_string(),
                round: vote.current_round,
            })?;

        let entry = round
            .entry_mut(node_id)
            .ok_or_else(|| BallotError::UnknownRoundEntry {
                vote_id: vote_id.to_string(),
                node_id: node_id.to_string(),
                round: vote.current_round,
            })?;

        match entry.status {
            EntryStatus::Pending => {
                entry.status = wanted;
                entry.timestamp = Utc::now();
            }
            settled if settled == wanted => return Ok(settled),
            _ => {
                return Err(BallotError::UnknownRoundEntry {
                    vote_id: vote_id.to_string(),
                    node_id: node_id.to_string(),
                    round: round.number,
                });
            }
        }

        let confirmed = round.confirmed_count();
        drop(history);
        self.store.set_confirmation_count(vote_id, confirmed)?;

        log::debug!(
            "vote {} node {} recorded {:?}, {} confirmed",
            vote_id,
            node_id,
            wanted,
            confirmed
        );
        Ok(wanted)
    }

    /// Settle every pending entry of the current round as timed out.
    /// Returns how many entries changed.
    pub async fn time_out_pending(&self, vote_id: &str) -> BallotResult<usize> {
        let lock = self.vote_lock(vote_id);
        let _guard = lock.lock().await;

        let mut history =
            self.rounds
                .get_mut(vote_id)
                .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;
        let round = history
            .last_mut()
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;

        let now = Utc::now();
        let mut changed = 0;
        for entry in round.entries.iter_mut() {
            if entry.status == EntryStatus::Pending {
                entry.status = EntryStatus::TimedOut;
                entry.timestamp = now;
                changed += 1;
            }
        }
        if changed > 0 {
            log::warn!(
                "timed out {} pending entries in round {} of vote {}",
                changed,
                round.number,
                vote_id
            );
        }
        Ok(changed)
    }

    /// The newest round for a vote, if any has been opened.
    pub fn current_round(&self, vote_id: &str) -> Option<ConsensusRound> {
        self.rounds
            .get(vote_id)
            .and_then(|h| h.last().cloned())
    }

    /// All log entries across rounds, for the status query interface.
    pub fn log_entries(&self, vote_id: &str) -> Vec<ConsensusLogEntry> {
        self.rounds
            .get(vote_id)
            .map(|h| h.iter().flat_map(|r| r.entries.iter().cloned()).collect())
            .unwrap_or_default()
    }

    /// Votes whose current round is unsettled and older than `age`.
    pub fn stale_votes(&self, age: Duration) -> Vec<VoteId> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(age.as_millis() as i64);
        self.rounds
            .iter()
            .filter(|h| {
                h.value()
                    .last()
                    .map(|r| !r.is_settled() && r.opened_at < cutoff)
                    .unwrap_or(false)
            })
            .map(|h| h.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixture(replication: usize) -> (Arc<VoteStore>, Arc<NodeRegistry>, RoundManager) {
        let store = Arc::new(VoteStore::new());
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(30)));
        store.open_election("election1".into());
        registry.register_for_election("election1", replication);
        let rounds = RoundManager::new(Arc::clone(&store), Arc::clone(&registry));
        (store, registry, rounds)
    }

    #[tokio::test]
    async fn test_open_round_creates_pending_entries() {
        let (store, _registry, rounds) = fixture(5);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();

        let round = rounds.open_round(&vote.id).await.unwrap();
        assert_eq!(round.number, 1);
        assert_eq!(round.entries.len(), 3);
        assert!(round
            .entries
            .iter()
            .all(|e| e.status == EntryStatus::Pending));
        assert!(round.entries[0]
            .signature
            .starts_with(&format!("sig_{}", vote.fingerprint)));
        assert_eq!(store.get(&vote.id).unwrap().current_round, 1);
    }

    #[tokio::test]
    async fn test_round_numbers_strictly_increase() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();

        let r1 = rounds.open_round(&vote.id).await.unwrap();
        for entry in &r1.entries {
            rounds
                .record_confirmation(&vote.id, &entry.node_id, ConfirmationOutcome::Rejected)
                .await
                .unwrap();
        }
        let r2 = rounds.open_round(&vote.id).await.unwrap();
        assert_eq!(r1.number, 1);
        assert_eq!(r2.number, 2);
        // current round is always the newest
        assert_eq!(rounds.current_round(&vote.id).unwrap().number, 2);
    }

    #[tokio::test]
    async fn test_open_round_reuses_unsettled_round() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();

        let first = rounds.open_round(&vote.id).await.unwrap();
        // A second open while confirmations are outstanding does not burn
        // a round
        let again = rounds.open_round(&vote.id).await.unwrap();
        assert_eq!(first.number, 1);
        assert_eq!(again.number, 1);
        assert_eq!(store.get(&vote.id).unwrap().current_round, 1);
        assert_eq!(rounds.log_entries(&vote.id).len(), 3);
    }

    #[tokio::test]
    async fn test_advance_reopens_after_failed_round() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        let round = rounds.open_round(&vote.id).await.unwrap();
        for entry in &round.entries {
            rounds
                .record_confirmation(&vote.id, &entry.node_id, ConfirmationOutcome::Rejected)
                .await
                .unwrap();
        }

        match rounds.advance_after_failure(&vote.id, 1, 3).await.unwrap() {
            RoundAdvance::Reopened { confirmed, round } => {
                assert_eq!(confirmed, 0);
                assert_eq!(round.number, 2);
            }
            other => panic!("expected reopen, got {:?}", other),
        }

        // A second worker evaluating the same stale round loses the race
        let repeat = rounds.advance_after_failure(&vote.id, 1, 3).await.unwrap();
        assert!(matches!(repeat, RoundAdvance::AlreadyHandled));
    }

    #[tokio::test]
    async fn test_advance_exhausts_budget_and_fails_vote() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        let round = rounds.open_round(&vote.id).await.unwrap();
        rounds
            .record_confirmation(&vote.id, &round.entries[0].node_id, ConfirmationOutcome::Confirmed)
            .await
            .unwrap();
        for entry in round.entries.iter().skip(1) {
            rounds
                .record_confirmation(&vote.id, &entry.node_id, ConfirmationOutcome::Rejected)
                .await
                .unwrap();
        }

        match rounds.advance_after_failure(&vote.id, 1, 1).await.unwrap() {
            RoundAdvance::Exhausted { confirmed, vote } => {
                assert_eq!(confirmed, 1);
                assert_eq!(vote.status, VoteStatus::Failed);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }

        // Terminal vote: nothing further to advance
        let repeat = rounds.advance_after_failure(&vote.id, 1, 1).await.unwrap();
        assert!(matches!(repeat, RoundAdvance::AlreadyHandled));
    }

    #[tokio::test]
    async fn test_advance_ignores_unsettled_round() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        rounds.open_round(&vote.id).await.unwrap();

        let advance = rounds.advance_after_failure(&vote.id, 1, 3).await.unwrap();
        assert!(matches!(advance, RoundAdvance::AlreadyHandled));
        assert_eq!(rounds.current_round(&vote.id).unwrap().number, 1);
    }

    #[tokio::test]
    async fn test_open_round_without_nodes_fails() {
        let store = Arc::new(VoteStore::new());
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(30)));
        store.open_election("election1".into());
        let rounds = RoundManager::new(Arc::clone(&store), registry);

        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        let err = rounds.open_round(&vote.id).await.unwrap_err();
        assert!(matches!(err, BallotError::InsufficientNodes { .. }));
        // Vote untouched: no round was consumed
        assert_eq!(store.get(&vote.id).unwrap().current_round, 0);
    }

    #[tokio::test]
    async fn test_open_round_with_partial_selection() {
        let (store, _registry, rounds) = fixture(2);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();

        let round = rounds.open_round(&vote.id).await.unwrap();
        assert_eq!(round.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_record_confirmation_updates_count() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        let round = rounds.open_round(&vote.id).await.unwrap();

        rounds
            .record_confirmation(&vote.id, &round.entries[0].node_id, ConfirmationOutcome::Confirmed)
            .await
            .unwrap();
        rounds
            .record_confirmation(&vote.id, &round.entries[1].node_id, ConfirmationOutcome::Rejected)
            .await
            .unwrap();

        let current = rounds.current_round(&vote.id).unwrap();
        assert_eq!(current.confirmed_count(), 1);
        assert_eq!(store.get(&vote.id).unwrap().confirmation_count, 1);
    }

    #[tokio::test]
    async fn test_duplicate_confirmation_is_noop() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        let round = rounds.open_round(&vote.id).await.unwrap();
        let node = round.entries[0].node_id.clone();

        rounds
            .record_confirmation(&vote.id, &node, ConfirmationOutcome::Confirmed)
            .await
            .unwrap();
        let second = rounds
            .record_confirmation(&vote.id, &node, ConfirmationOutcome::Confirmed)
            .await
            .unwrap();

        assert_eq!(second, EntryStatus::Confirmed);
        assert_eq!(store.get(&vote.id).unwrap().confirmation_count, 1);
    }

    #[tokio::test]
    async fn test_flipped_verdict_rejected() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        let round = rounds.open_round(&vote.id).await.unwrap();
        let node = round.entries[0].node_id.clone();

        rounds
            .record_confirmation(&vote.id, &node, ConfirmationOutcome::Confirmed)
            .await
            .unwrap();
        let err = rounds
            .record_confirmation(&vote.id, &node, ConfirmationOutcome::Rejected)
            .await
            .unwrap_err();
        assert!(matches!(err, BallotError::UnknownRoundEntry { .. }));
    }

    #[tokio::test]
    async fn test_unknown_node_rejected() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        rounds.open_round(&vote.id).await.unwrap();

        let err = rounds
            .record_confirmation(&vote.id, "intruder", ConfirmationOutcome::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, BallotError::UnknownRoundEntry { .. }));
    }

    #[tokio::test]
    async fn test_stale_confirmation_after_election_end() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        let round = rounds.open_round(&vote.id).await.unwrap();

        store.end_election("election1").unwrap();

        let err = rounds
            .record_confirmation(&vote.id, &round.entries[0].node_id, ConfirmationOutcome::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, BallotError::ElectionEnded { .. }));
        // Nothing applied
        assert_eq!(rounds.current_round(&vote.id).unwrap().confirmed_count(), 0);
    }

    #[tokio::test]
    async fn test_time_out_pending_settles_round() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        let round = rounds.open_round(&vote.id).await.unwrap();

        rounds
            .record_confirmation(&vote.id, &round.entries[0].node_id, ConfirmationOutcome::Confirmed)
            .await
            .unwrap();

        let changed = rounds.time_out_pending(&vote.id).await.unwrap();
        assert_eq!(changed, 2);
        assert!(rounds.current_round(&vote.id).unwrap().is_settled());
    }

    #[tokio::test]
    async fn test_stale_votes_reports_old_unsettled_rounds() {
        let (store, _registry, rounds) = fixture(3);
        let vote = store
            .create("voter1".into(), "cand1".into(), "election1".into(), 3)
            .unwrap();
        rounds.open_round(&vote.id).await.unwrap();

        assert!(rounds.stale_votes(Duration::from_secs(60)).is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stale = rounds.stale_votes(Duration::from_millis(10));
        assert_eq!(stale, vec![vote.id.clone()]);

        rounds.time_out_pending(&vote.id).await.unwrap();
        assert!(rounds.stale_votes(Duration::from_millis(10)).is_empty());
    }
}

//! Consensus engine
//!
//! Wires the store, node registry, round manager, evaluator and task
//! queue together. `cast_vote` acknowledges immediately; quorum
//! verification happens in the background and is observed through the
//! status queries or the notification sink.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use ballot_core::types::{CandidateId, ElectionId, VoterId};
use ballot_core::{BallotError, BallotResult, ConsensusLogEntry, ElectionNode, VoteStatus};
use ballot_store::{ElectionStats, VoteStore};

use crate::config::ConsensusConfig;
use crate::evaluator::{ConsensusEvaluator, ConsensusOutcome};
use crate::hooks::{self, CacheInvalidator, NotificationSink};
use crate::registry::{NodeRegistry, NodeSummary};
use crate::rounds::{ConfirmationOutcome, RoundAdvance, RoundManager};
use crate::tasks::{RetryPolicy, TaskHandler, TaskQueue};

/// Immediate acknowledgment returned by [`ConsensusEngine::cast_vote`].
#[derive(Debug, Clone, Serialize)]
pub struct CastAck {
    pub vote_id: String,
    pub status: VoteStatus,
    pub message: String,
}

/// Read-only vote view for the dashboard query interface.
#[derive(Debug, Clone, Serialize)]
pub struct VoteStatusReport {
    pub vote_id: String,
    pub status: VoteStatus,
    pub confirmation_count: u32,
    pub required_confirmations: u32,
    pub current_round: u32,
    pub fingerprint: String,
    pub log_entries: Vec<ConsensusLogEntry>,
}

pub struct ConsensusEngine {
    config: ConsensusConfig,
    store: Arc<VoteStore>,
    registry: Arc<NodeRegistry>,
    rounds: Arc<RoundManager>,
    evaluator: ConsensusEvaluator,
    queue: TaskQueue,
    sink: Arc<dyn NotificationSink>,
    cache: Arc<dyn CacheInvalidator>,
}

impl ConsensusEngine {
    pub fn new(
        config: ConsensusConfig,
        sink: Arc<dyn NotificationSink>,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Arc<Self> {
        let store = Arc::new(VoteStore::new());
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(
            config.heartbeat_interval_secs,
        )));
        let rounds = Arc::new(RoundManager::new(Arc::clone(&store), Arc::clone(&registry)));
        let evaluator = ConsensusEvaluator::new(Arc::clone(&store), Arc::clone(&rounds));

        Arc::new_cyclic(|weak: &Weak<ConsensusEngine>| {
            let handler: TaskHandler = {
                let weak = weak.clone();
                Arc::new(move |vote_id: String| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(engine) => engine.drive_consensus(&vote_id).await,
                            // Engine dropped; nothing left to evaluate
                            None => Ok(()),
                        }
                    })
                })
            };
            let queue = TaskQueue::start(
                handler,
                RetryPolicy {
                    max_retries: config.task_max_retries,
                    backoff: Duration::from_millis(config.task_backoff_ms),
                },
                Arc::clone(&sink),
            );

            ConsensusEngine {
                config,
                store,
                registry,
                rounds,
                evaluator,
                queue,
                sink,
                cache,
            }
        })
    }

    /// Register an election and seed its confirming nodes.
    pub fn setup_election(&self, election_id: &str) -> Vec<ElectionNode> {
        self.store.open_election(election_id.to_string());
        self.registry
            .register_for_election(election_id, self.config.replication_factor)
    }

    /// End an election. Votes still in flight keep their state, but any
    /// further confirmations for them are rejected as stale.
    pub fn end_election(&self, election_id: &str) -> BallotResult<()> {
        self.store.end_election(election_id)?;
        self.cache
            .invalidate(&hooks::election_stats_key(election_id));
        self.sink.notify(
            hooks::ADMIN_TOPIC,
            json!({ "event": "election_ended", "election_id": election_id }),
        );
        Ok(())
    }

    /// Cast a vote. Returns a pending acknowledgment immediately;
    /// verification is scheduled in the background.
    pub fn cast_vote(
        &self,
        voter_id: VoterId,
        candidate_id: CandidateId,
        election_id: ElectionId,
    ) -> BallotResult<CastAck> {
        if self.store.election_ended(&election_id) {
            return Err(BallotError::ElectionEnded { election_id });
        }
        if !self.store.is_election_active(&election_id) {
            return Err(BallotError::ElectionNotFound(election_id));
        }

        let vote = self.store.create(
            voter_id,
            candidate_id,
            election_id.clone(),
            self.config.required_confirmations,
        )?;

        self.cache
            .invalidate(&hooks::election_stats_key(&election_id));
        self.queue.schedule(&vote.id);
        log::info!("vote {} cast in election {}", vote.id, election_id);

        Ok(CastAck {
            vote_id: vote.id,
            status: VoteStatus::Pending,
            message: "Vote cast. Quorum verification is in progress.".to_string(),
        })
    }

    /// Apply a node's confirmation and schedule re-evaluation.
    pub async fn record_confirmation(
        &self,
        vote_id: &str,
        node_id: &str,
        outcome: ConfirmationOutcome,
    ) -> BallotResult<()> {
        match self
            .rounds
            .record_confirmation(vote_id, node_id, outcome)
            .await
        {
            Ok(_) => {
                self.cache.invalidate(&hooks::vote_status_key(vote_id));
                self.queue.schedule(vote_id);
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "dropped confirmation from node {} for vote {}: {}",
                    node_id,
                    vote_id,
                    e
                );
                Err(e)
            }
        }
    }

    pub fn record_heartbeat(&self, node_id: &str, response_ms: f64) -> BallotResult<()> {
        self.registry.record_heartbeat(node_id, response_ms)
    }

    /// One consensus work unit for a vote: ensure a round is open,
    /// evaluate it, and act on the outcome. Runs on the task queue with
    /// at-least-once semantics; errors bubble up for retry there.
    async fn drive_consensus(&self, vote_id: &str) -> BallotResult<()> {
        let vote = self
            .store
            .get(vote_id)
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;
        if vote.status.is_terminal() {
            return Ok(());
        }

        if self.rounds.current_round(vote_id).is_none() {
            self.rounds.open_round(vote_id).await?;
        }

        match self.evaluator.evaluate(vote_id).await? {
            ConsensusOutcome::StillPending => Ok(()),
            ConsensusOutcome::Finalized { newly } => {
                if newly {
                    self.on_finalized(vote_id);
                }
                Ok(())
            }
            ConsensusOutcome::Failed { round } => self.on_round_failed(vote_id, round).await,
        }
    }

    fn on_finalized(&self, vote_id: &str) {
        let Some(vote) = self.store.get(vote_id) else {
            return;
        };
        self.cache.invalidate(&hooks::vote_status_key(vote_id));
        self.cache
            .invalidate(&hooks::election_stats_key(&vote.election_id));
        self.sink.notify(
            &hooks::vote_topic(vote_id),
            json!({
                "event": "finalized",
                "vote_id": vote_id,
                "election_id": vote.election_id,
                "confirmation_count": vote.confirmation_count,
                "required_confirmations": vote.required_confirmations,
            }),
        );
    }

    /// A round settled below quorum: retry with a fresh round while the
    /// budget lasts, otherwise fail the vote permanently. The round
    /// manager arbitrates concurrent evaluations of the same round, so
    /// events here fire once per failed round.
    async fn on_round_failed(&self, vote_id: &str, failed_round: u32) -> BallotResult<()> {
        let advance = self
            .rounds
            .advance_after_failure(vote_id, failed_round, self.config.max_rounds)
            .await?;

        match advance {
            RoundAdvance::Reopened { confirmed, round } => {
                self.sink.notify(
                    &hooks::vote_topic(vote_id),
                    json!({
                        "event": "round_failed",
                        "vote_id": vote_id,
                        "round": failed_round,
                        "confirmation_count": confirmed,
                    }),
                );
                log::info!(
                    "vote {} retrying in round {} after {}/{} confirmations",
                    vote_id,
                    round.number,
                    confirmed,
                    self.config.required_confirmations
                );
                Ok(())
            }
            RoundAdvance::Exhausted { confirmed, vote } => {
                self.sink.notify(
                    &hooks::vote_topic(vote_id),
                    json!({
                        "event": "round_failed",
                        "vote_id": vote_id,
                        "round": failed_round,
                        "confirmation_count": confirmed,
                    }),
                );
                let exhausted = BallotError::RoundExhausted {
                    vote_id: vote_id.to_string(),
                    rounds: failed_round,
                };
                log::error!("{}; vote moves to failed", exhausted);
                self.cache.invalidate(&hooks::vote_status_key(vote_id));
                self.cache
                    .invalidate(&hooks::election_stats_key(&vote.election_id));
                self.sink.notify(
                    hooks::ADMIN_TOPIC,
                    json!({
                        "event": "vote_failed",
                        "vote_id": vote_id,
                        "election_id": vote.election_id,
                        "rounds": failed_round,
                    }),
                );
                Ok(())
            }
            RoundAdvance::AlreadyHandled => Ok(()),
        }
    }

    /// Background maintenance: sweep unreachable nodes and time out
    /// rounds that outlived the round deadline.
    pub fn spawn_maintenance(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let tick = Duration::from_secs(engine.config.heartbeat_interval_secs);
            let heartbeat_timeout = Duration::from_secs(engine.config.heartbeat_timeout_secs);
            let round_timeout = Duration::from_secs(engine.config.round_timeout_secs);
            loop {
                tokio::time::sleep(tick).await;
                engine.registry.sweep_unreachable(heartbeat_timeout);
                for vote_id in engine.rounds.stale_votes(round_timeout) {
                    if let Err(e) = engine.rounds.time_out_pending(&vote_id).await {
                        log::warn!("failed to time out round for vote {}: {}", vote_id, e);
                        continue;
                    }
                    engine.queue.schedule(&vote_id);
                }
            }
        })
    }

    /// Confirm every pending entry of the vote's current round.
    ///
    /// Placeholder for a real node-to-node confirmation protocol; used by
    /// demos and tests. Production deployments drive
    /// [`record_confirmation`](Self::record_confirmation) from actual
    /// node callbacks instead.
    pub async fn simulate_confirmations(&self, vote_id: &str) -> BallotResult<()> {
        let round = self
            .rounds
            .current_round(vote_id)
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;
        for entry in round.entries {
            if entry.status == ballot_core::EntryStatus::Pending {
                self.record_confirmation(vote_id, &entry.node_id, ConfirmationOutcome::Confirmed)
                    .await?;
            }
        }
        Ok(())
    }

    // ----- read-only query interface -----

    pub fn vote_status(&self, vote_id: &str) -> BallotResult<VoteStatusReport> {
        let vote = self
            .store
            .get(vote_id)
            .ok_or_else(|| BallotError::VoteNotFound(vote_id.to_string()))?;
        Ok(VoteStatusReport {
            vote_id: vote.id,
            status: vote.status,
            confirmation_count: vote.confirmation_count,
            required_confirmations: vote.required_confirmations,
            current_round: vote.current_round,
            fingerprint: vote.fingerprint,
            log_entries: self.rounds.log_entries(vote_id),
        })
    }

    pub fn election_nodes(&self, election_id: &str) -> Vec<NodeSummary> {
        self.registry.node_statuses(election_id)
    }

    pub fn election_stats(&self, election_id: &str) -> ElectionStats {
        self.store.election_stats(election_id)
    }

    // ----- component access for embedding and tests -----

    pub fn store(&self) -> Arc<VoteStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> Arc<NodeRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn rounds(&self) -> Arc<RoundManager> {
        Arc::clone(&self.rounds)
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }
}

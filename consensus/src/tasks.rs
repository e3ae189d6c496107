//! Background evaluation queue
//!
//! Consensus evaluation runs off the request path with at-least-once
//! semantics: transient failures are retried with linear backoff, final
//! failures are dead-lettered to the log and the admin channel, never
//! silently dropped.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use ballot_core::BallotResult;

use crate::hooks::{NotificationSink, ADMIN_TOPIC};

pub type TaskFuture = Pin<Box<dyn Future<Output = BallotResult<()>> + Send>>;
pub type TaskHandler = Arc<dyn Fn(String) -> TaskFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Queue of per-vote consensus work units.
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<String>,
}

impl TaskQueue {
    /// Spawn the dispatcher. Each scheduled vote id runs on its own task,
    /// so a slow vote never blocks the others.
    pub fn start(
        handler: TaskHandler,
        policy: RetryPolicy,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(vote_id) = rx.recv().await {
                let handler = Arc::clone(&handler);
                let policy = policy.clone();
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    run_with_retries(handler, vote_id, policy, sink).await;
                });
            }
        });

        TaskQueue { tx }
    }

    /// Enqueue evaluation work for a vote. Never blocks.
    pub fn schedule(&self, vote_id: &str) {
        if self.tx.send(vote_id.to_string()).is_err() {
            log::error!("task queue closed, dropping evaluation for vote {}", vote_id);
        }
    }
}

async fn run_with_retries(
    handler: TaskHandler,
    vote_id: String,
    policy: RetryPolicy,
    sink: Arc<dyn NotificationSink>,
) {
    let mut last_err = None;
    for attempt in 0..=policy.max_retries {
        match handler(vote_id.clone()).await {
            Ok(()) => return,
            Err(e) => {
                log::warn!(
                    "consensus task for vote {} failed on attempt {}: {}",
                    vote_id,
                    attempt + 1,
                    e
                );
                last_err = Some(e);
                if attempt < policy.max_retries {
                    tokio::time::sleep(policy.backoff * (attempt + 1)).await;
                }
            }
        }
    }

    // Dead letter: the unit is surfaced, never dropped on the floor
    let reason = last_err.map(|e| e.to_string()).unwrap_or_default();
    log::error!(
        "consensus task for vote {} dead-lettered after {} attempts: {}",
        vote_id,
        policy.max_retries + 1,
        reason
    );
    sink.notify(
        ADMIN_TOPIC,
        json!({
            "event": "consensus_task_dead_letter",
            "vote_id": vote_id,
            "reason": reason,
        }),
    );
}

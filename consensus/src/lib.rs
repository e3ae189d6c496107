//! BallotNet Consensus
//!
//! N-of-M vote confirmation: each cast vote is confirmed by a quorum of
//! election nodes before it is treated as final. One authoritative
//! coordinator, several semi-trusted confirming nodes; not a
//! Byzantine-fault-tolerant protocol.

pub mod config;
pub mod engine;
pub mod evaluator;
pub mod hooks;
pub mod quorum;
pub mod registry;
pub mod rounds;
pub mod tasks;

pub use config::{ConfigError, ConsensusConfig};
pub use engine::{CastAck, ConsensusEngine, VoteStatusReport};
pub use evaluator::{ConsensusEvaluator, ConsensusOutcome};
pub use hooks::{CacheInvalidator, LogSink, NoopCache, NotificationSink};
pub use registry::{NodeRegistry, NodeSummary};
pub use rounds::{ConfirmationOutcome, RoundAdvance, RoundManager};
pub use tasks::{RetryPolicy, TaskQueue};

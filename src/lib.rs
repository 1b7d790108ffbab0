//! Stale-sweeper - finds long-running workflow instances in a Flowable
//! engine, classifies them, and removes the abandoned ones with an audit
//! trail.

pub mod backends;
pub mod config;
pub mod observability;
pub mod sweeper;

pub use backends::{EngineError, EngineErrorKind, EngineGateway, MemoryEngine, PostgresEngine};
pub use config::{ConfigError, SweeperConfig};
pub use sweeper::{
    AuditSink, Candidate, Classification, DeleteMode, DeleteOutcome, DeleteResultCode,
    DeleteWorker, Orchestrator, RecommendedAction, ReviewService, RunOptions, Scanner,
    VerificationSnapshot,
};

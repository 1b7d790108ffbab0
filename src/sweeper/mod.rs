//! Scan, classify, order, delete, verify and audit.

pub mod activity;
pub mod audit;
pub mod classifier;
pub mod export;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod prefetch;
pub mod retry;
pub mod review;
pub mod scanner;
pub mod tokens;
pub mod verifier;
pub mod worker;

pub use activity::ActivityNames;
pub use audit::{
    AuditError, AuditEvent, AuditIdentity, AuditKind, AuditRecord, AuditSink, FanoutAuditSink,
    JsonlAuditSink, MemoryAuditSink, PostgresAuditMirror,
};
pub use classifier::{ClassifierConfig, classify};
pub use export::export_csv;
pub use model::{
    Candidate, Classification, DeleteMode, DeleteOutcome, DeleteResultCode, FailureTag,
    FilterCriteria, RecommendedAction, TaskSummary, VerificationSnapshot,
};
pub use monitor::{MonitorConfig, StuckInstance, StuckMonitor, spawn_stuck_monitor};
pub use orchestrator::{InFlightSet, Orchestrator, RunOptions};
pub use prefetch::{PrefetchStrategy, Prefetcher};
pub use retry::LinearBackoff;
pub use review::{
    DeleteResult, PageInfo, PageResult, ProcessDetail, ProcessSummary, ReviewConfig,
    ReviewService, ServiceError, SummaryCounts, TerminateAllRequest, TerminateRequest,
};
pub use scanner::{Scanner, ScannerConfig};
pub use verifier::Verifier;
pub use worker::{DeletePolicy, DeleteWorker};

//! Workflow engine gateways.

mod base;
mod memory;
mod postgres;

pub use base::{
    EngineError, EngineErrorKind, EngineGateway, EngineResult, ExecutionRecord, HistoricInstance,
    HistoryQuery, JobRecord, KNOWN_DEFECT_MARKER, TaskRecord, UserRecord,
};
pub use memory::{EngineCall, InstanceSeed, MemoryEngine, TaskSeed};
pub use postgres::{FlowableTables, PostgresEngine};

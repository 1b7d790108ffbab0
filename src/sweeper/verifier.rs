//! Residue check after a delete.

use std::sync::Arc;

use tracing::debug;

use super::model::VerificationSnapshot;
use crate::backends::{EngineGateway, EngineResult};

/// Re-reads the engine for anything still tied to an instance id.
#[derive(Clone)]
pub struct Verifier {
    engine: Arc<dyn EngineGateway>,
}

impl Verifier {
    pub fn new(engine: Arc<dyn EngineGateway>) -> Self {
        Self { engine }
    }

    /// Five independent counts, issued concurrently.
    pub async fn verify(&self, id: &str) -> EngineResult<VerificationSnapshot> {
        let (process_instances, tasks, jobs, timers, executions) = tokio::try_join!(
            self.engine.count_process_instances(id),
            self.engine.count_tasks(id),
            self.engine.count_jobs(id),
            self.engine.count_timers(id),
            self.engine.count_executions(id),
        )?;
        let snapshot = VerificationSnapshot {
            process_instances,
            tasks,
            jobs,
            timers,
            executions,
        };
        debug!(instance_id = %id, %snapshot, deleted = snapshot.is_deleted(), "verification snapshot");
        Ok(snapshot)
    }
}

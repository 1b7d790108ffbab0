//! Ordering, dedup and dispatch of delete targets.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::audit::{AuditEvent, AuditSink};
use super::model::{
    Candidate, Classification, DeleteMode, DeleteOutcome, DeleteResultCode, FailureTag,
};
use super::worker::DeleteWorker;
use crate::backends::EngineGateway;

pub const ALREADY_IN_PROGRESS: &str = "already in progress";
pub const NOT_ELIGIBLE: &str = "Not eligible or not found";
pub const NOT_STARTED: &str = "interrupted before start";

/// Instance ids with a delete currently running.
#[derive(Clone, Debug, Default)]
pub struct InFlightSet {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id`, or returns `None` if another task holds it.
    pub fn try_register(&self, id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.clone(),
            id: id.to_string(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the claim on drop, whatever the outcome.
#[derive(Debug)]
pub struct InFlightGuard {
    set: InFlightSet,
    id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

pub const DEFAULT_REASON: &str = "Ops cleanup";

/// Per-run knobs supplied by the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: DeleteMode,
    pub parallelism: usize,
    pub dry_run: bool,
    pub verify: bool,
    pub reason: String,
    /// Recorded as the audit user when set.
    pub actor: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: DeleteMode::Safe,
            parallelism: 1,
            dry_run: true,
            verify: true,
            reason: DEFAULT_REASON.to_string(),
            actor: None,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    engine: Arc<dyn EngineGateway>,
    worker: Arc<DeleteWorker>,
    audit: Arc<dyn AuditSink>,
    in_flight: InFlightSet,
    /// Pause between sequential deletes.
    delete_pause: Duration,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn EngineGateway>,
        worker: DeleteWorker,
        audit: Arc<dyn AuditSink>,
        delete_pause: Duration,
    ) -> Self {
        Self {
            engine,
            worker: Arc::new(worker),
            audit,
            in_flight: InFlightSet::new(),
            delete_pause,
        }
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Delete every target in `candidates`, deepest sub-process first.
    ///
    /// One outcome per target; a failing task never aborts its siblings.
    /// Once the worker's shutdown token fires no new delete starts.
    pub async fn run(&self, candidates: &[Candidate], options: &RunOptions) -> Vec<DeleteOutcome> {
        let targets = ordered_targets(candidates, options.mode);
        info!(
            mode = %options.mode,
            targets = targets.len(),
            parallelism = options.parallelism,
            dry_run = options.dry_run,
            "starting delete run"
        );

        if options.dry_run {
            let mut outcomes = Vec::with_capacity(targets.len());
            for candidate in targets {
                outcomes.push(self.price(candidate, options).await);
            }
            return outcomes;
        }

        if options.parallelism <= 1 {
            let shutdown = self.worker.shutdown();
            let mut outcomes = Vec::with_capacity(targets.len());
            for (index, candidate) in targets.iter().enumerate() {
                if index > 0 && !self.delete_pause.is_zero() {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = tokio::time::sleep(self.delete_pause) => {}
                    }
                }
                if shutdown.is_cancelled() {
                    outcomes.push(self.not_started(candidate, options).await);
                    continue;
                }
                outcomes.push(self.delete_one(candidate, options).await);
            }
            return outcomes;
        }

        self.run_parallel(targets, options).await
    }

    async fn run_parallel(
        &self,
        targets: Vec<&Candidate>,
        options: &RunOptions,
    ) -> Vec<DeleteOutcome> {
        let shutdown = self.worker.shutdown().clone();
        let semaphore = Arc::new(Semaphore::new(options.parallelism));
        let mut outcomes: Vec<Option<DeleteOutcome>> = vec![None; targets.len()];
        let mut spawned = Vec::with_capacity(targets.len());
        let mut handles = Vec::with_capacity(targets.len());
        for (index, candidate) in targets.into_iter().enumerate() {
            let permit = if shutdown.is_cancelled() {
                None
            } else {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                }
            };
            let Some(permit) = permit else {
                outcomes[index] = Some(self.not_started(candidate, options).await);
                continue;
            };
            let this = self.clone();
            let candidate = candidate.clone();
            let options = options.clone();
            spawned.push((index, candidate.process_instance_id.clone()));
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.delete_one(&candidate, &options).await
            }));
        }

        let joined = futures::future::join_all(handles).await;
        for ((index, id), joined) in spawned.into_iter().zip(joined) {
            outcomes[index] = Some(match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(instance_id = %id, error = %err, "delete task aborted");
                    DeleteOutcome::fail(
                        &id,
                        err.to_string(),
                        0,
                        Duration::ZERO,
                        FailureTag::Interrupted,
                    )
                }
            });
        }
        outcomes.into_iter().flatten().collect()
    }

    /// Audited `FAIL`/`INTERRUPTED` outcome for a target left untouched
    /// after shutdown.
    async fn not_started(&self, candidate: &Candidate, options: &RunOptions) -> DeleteOutcome {
        let id = candidate.process_instance_id.as_str();
        warn!(instance_id = %id, "shutdown requested; delete not started");
        let outcome = DeleteOutcome::fail(
            id,
            NOT_STARTED,
            0,
            Duration::ZERO,
            FailureTag::Interrupted,
        );
        self.audit
            .record(
                &AuditEvent::delete(candidate, &outcome, &options.reason)
                    .by(options.actor.as_deref()),
            )
            .await;
        outcome
    }

    /// Run the worker for one candidate unless another task already is.
    pub async fn delete_one(&self, candidate: &Candidate, options: &RunOptions) -> DeleteOutcome {
        let id = candidate.process_instance_id.as_str();
        let actor = options.actor.as_deref();
        let Some(guard) = self.in_flight.try_register(id) else {
            warn!(instance_id = %id, "delete already in progress");
            let outcome = DeleteOutcome::skipped(id, ALREADY_IN_PROGRESS, 0, Duration::ZERO);
            self.audit
                .record(&AuditEvent::skip(candidate, ALREADY_IN_PROGRESS).by(actor))
                .await;
            return outcome;
        };
        let outcome = self
            .worker
            .delete_process(id, &options.reason, options.verify)
            .await;
        drop(guard);

        self.audit_outcome(candidate, &outcome, options).await;
        outcome
    }

    /// Records an id that could not be loaded for deletion.
    pub async fn skip_unloadable(&self, id: &str, options: &RunOptions) -> DeleteOutcome {
        let placeholder = Candidate::new(id, chrono::Utc::now(), chrono::Utc::now());
        self.audit
            .record(&AuditEvent::skip(&placeholder, NOT_ELIGIBLE).by(options.actor.as_deref()))
            .await;
        DeleteOutcome::skipped(id, NOT_ELIGIBLE, 0, Duration::ZERO)
    }

    async fn price(&self, candidate: &Candidate, options: &RunOptions) -> DeleteOutcome {
        let id = candidate.process_instance_id.as_str();
        let active = match self.engine.is_active(id).await {
            Ok(active) => active,
            Err(err) => {
                warn!(instance_id = %id, error = %err, "dry-run lookup failed");
                false
            }
        };
        let actor = options.actor.as_deref();
        if active {
            let outcome = DeleteOutcome::dry_run(id);
            self.audit
                .record(&AuditEvent::delete(candidate, &outcome, &options.reason).by(actor))
                .await;
            outcome
        } else {
            self.audit
                .record(&AuditEvent::skip(candidate, NOT_ELIGIBLE).by(actor))
                .await;
            DeleteOutcome::skipped(id, NOT_ELIGIBLE, 0, Duration::ZERO)
        }
    }

    async fn audit_outcome(
        &self,
        candidate: &Candidate,
        outcome: &DeleteOutcome,
        options: &RunOptions,
    ) {
        let actor = options.actor.as_deref();
        if outcome.result == DeleteResultCode::Skipped {
            let reason = outcome.error.as_deref().unwrap_or("skipped");
            self.audit
                .record(&AuditEvent::skip(candidate, reason).by(actor))
                .await;
            return;
        }
        self.audit
            .record(&AuditEvent::delete(candidate, outcome, &options.reason).by(actor))
            .await;
        if let Some(snapshot) = outcome.verification.as_ref() {
            self.audit
                .record(
                    &AuditEvent::verify(candidate, snapshot, outcome.error.as_deref()).by(actor),
                )
                .await;
        }
    }
}

/// Targets for `mode`, stable-sorted by sub-process depth, deepest first.
pub fn ordered_targets(candidates: &[Candidate], mode: DeleteMode) -> Vec<&Candidate> {
    let by_id: HashMap<&str, &Candidate> = candidates
        .iter()
        .map(|c| (c.process_instance_id.as_str(), c))
        .collect();
    let mut targets: Vec<(usize, &Candidate)> = candidates
        .iter()
        .filter(|c| match mode {
            DeleteMode::Safe => c.classification == Some(Classification::SafeToDelete),
            DeleteMode::Selected | DeleteMode::All => true,
        })
        .map(|c| (subprocess_depth(c, &by_id), c))
        .collect();
    targets.sort_by(|a, b| b.0.cmp(&a.0));
    targets.into_iter().map(|(_, c)| c).collect()
}

/// Parent hops within the candidate set. An unknown parent still counts as
/// one level.
pub fn subprocess_depth(candidate: &Candidate, by_id: &HashMap<&str, &Candidate>) -> usize {
    if !candidate.is_subprocess {
        return 0;
    }
    let mut depth = 0;
    let mut seen: HashSet<&str> = HashSet::from([candidate.process_instance_id.as_str()]);
    let mut current = candidate.parent_instance_id.as_deref();
    while let Some(parent_id) = current {
        depth += 1;
        if !seen.insert(parent_id) {
            break;
        }
        let Some(parent) = by_id.get(parent_id) else {
            break;
        };
        current = parent.parent_instance_id.as_deref();
    }
    depth
}

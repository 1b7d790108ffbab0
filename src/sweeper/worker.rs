//! Single-instance delete with retry, suspend and verification.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{DeleteOutcome, FailureTag};
use super::retry::LinearBackoff;
use super::verifier::Verifier;
use crate::backends::{EngineError, EngineErrorKind, EngineGateway};

/// Knobs for one delete sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeletePolicy {
    /// Extra attempts after the first; the loop runs `retry_count + 1` times.
    pub retry_count: u32,
    pub backoff: LinearBackoff,
    pub suspend_before_delete: bool,
    /// Purge history rows after an unverified delete. Best effort.
    pub delete_historic: bool,
    pub known_defect_fallback: bool,
}

impl Default for DeletePolicy {
    fn default() -> Self {
        Self {
            retry_count: 2,
            backoff: LinearBackoff::new(500),
            suspend_before_delete: false,
            delete_historic: false,
            known_defect_fallback: true,
        }
    }
}

enum Step {
    Retry,
    Done(DeleteOutcome),
}

#[derive(Clone)]
pub struct DeleteWorker {
    engine: Arc<dyn EngineGateway>,
    verifier: Verifier,
    policy: DeletePolicy,
    shutdown: CancellationToken,
}

impl DeleteWorker {
    pub fn new(
        engine: Arc<dyn EngineGateway>,
        policy: DeletePolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            verifier: Verifier::new(engine.clone()),
            engine,
            policy,
            shutdown,
        }
    }

    pub fn policy(&self) -> &DeletePolicy {
        &self.policy
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Delete one instance. Never returns an error: every path ends in an
    /// outcome the caller can audit.
    pub async fn delete_process(&self, id: &str, reason: &str, verify: bool) -> DeleteOutcome {
        let started = Instant::now();

        match self.engine.is_active(id).await {
            Ok(true) => {}
            Ok(false) => return DeleteOutcome::skipped(id, "not active", 0, started.elapsed()),
            Err(err) if err.kind == EngineErrorKind::NotFound => {
                return DeleteOutcome::skipped(id, "not active", 0, started.elapsed());
            }
            Err(err) => {
                warn!(instance_id = %id, error = %err, "liveness check failed");
                let tag = FailureTag::for_error(&err);
                return DeleteOutcome::fail(id, err.to_string(), 0, started.elapsed(), tag);
            }
        }

        let max_attempts = self.policy.retry_count;
        let mut attempts = 0;
        for attempt in 0..=max_attempts {
            attempts += 1;
            if self.policy.suspend_before_delete {
                match self.engine.suspend_instance(id).await {
                    Ok(()) => debug!(instance_id = %id, attempt, "suspended before delete"),
                    Err(err) if err.kind == EngineErrorKind::NotFound => {
                        info!(instance_id = %id, attempt, "instance already gone at suspend");
                        return DeleteOutcome::ok(id, attempts, started.elapsed());
                    }
                    Err(err) => {
                        warn!(instance_id = %id, attempt, error = %err, "suspend failed; deleting anyway");
                    }
                }
            }

            let step = match self.engine.delete_instance(id, reason).await {
                Ok(()) if verify => match self.verifier.verify(id).await {
                    Ok(snapshot) if snapshot.is_deleted() => {
                        info!(instance_id = %id, attempt, "deleted and verified");
                        Step::Done(
                            DeleteOutcome::ok(id, attempts, started.elapsed())
                                .with_verification(Some(snapshot)),
                        )
                    }
                    Ok(snapshot) => {
                        warn!(instance_id = %id, attempt, %snapshot, "residue remains after delete");
                        if attempt < max_attempts {
                            Step::Retry
                        } else {
                            Step::Done(
                                DeleteOutcome::fail(
                                    id,
                                    "verification failed",
                                    attempts,
                                    started.elapsed(),
                                    FailureTag::Verify,
                                )
                                .with_verification(Some(snapshot)),
                            )
                        }
                    }
                    Err(err) => {
                        self.on_error(id, reason, err, attempt, &mut attempts, started)
                            .await
                    }
                },
                Ok(()) => {
                    if self.policy.delete_historic
                        && let Err(err) = self.engine.delete_history(id).await
                    {
                        debug!(instance_id = %id, error = %err, "history purge failed");
                    }
                    info!(instance_id = %id, attempt, "deleted");
                    Step::Done(DeleteOutcome::ok(id, attempts, started.elapsed()))
                }
                Err(err) => {
                    self.on_error(id, reason, err, attempt, &mut attempts, started)
                        .await
                }
            };

            match step {
                Step::Done(outcome) => return outcome,
                Step::Retry => {
                    let delay = self.policy.backoff.delay(attempt + 1);
                    debug!(instance_id = %id, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            warn!(instance_id = %id, attempt, "interrupted during backoff");
                            return DeleteOutcome::fail(
                                id,
                                "interrupted during backoff",
                                attempts,
                                started.elapsed(),
                                FailureTag::Interrupted,
                            );
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        DeleteOutcome::fail(
            id,
            "retry budget exhausted",
            attempts,
            started.elapsed(),
            FailureTag::RetryExhausted,
        )
    }

    async fn on_error(
        &self,
        id: &str,
        reason: &str,
        err: EngineError,
        attempt: u32,
        attempts: &mut u32,
        started: Instant,
    ) -> Step {
        match err.kind {
            EngineErrorKind::NotFound => {
                info!(instance_id = %id, attempt, "instance already gone");
                Step::Done(DeleteOutcome::ok(id, *attempts, started.elapsed()))
            }
            EngineErrorKind::KnownDefect if self.policy.known_defect_fallback => {
                warn!(instance_id = %id, attempt, error = %err, "known engine defect; trying recovery delete");
                *attempts += 1;
                Step::Done(self.recover_known_defect(id, reason, *attempts, started).await)
            }
            _ if err.is_retryable() && attempt < self.policy.retry_count => {
                warn!(instance_id = %id, attempt, kind = %err.kind, error = %err, "retryable delete failure");
                Step::Retry
            }
            _ => {
                warn!(instance_id = %id, attempt, kind = %err.kind, error = %err, "delete failed");
                let tag = FailureTag::for_error(&err);
                Step::Done(DeleteOutcome::fail(
                    id,
                    err.to_string(),
                    *attempts,
                    started.elapsed(),
                    tag,
                ))
            }
        }
    }

    /// Force-suspend then delete exactly once more, outside the retry budget.
    async fn recover_known_defect(
        &self,
        id: &str,
        reason: &str,
        attempts: u32,
        started: Instant,
    ) -> DeleteOutcome {
        if let Err(err) = self.engine.suspend_instance(id).await {
            if err.kind == EngineErrorKind::NotFound {
                return DeleteOutcome::ok(id, attempts, started.elapsed());
            }
            debug!(instance_id = %id, error = %err, "recovery suspend failed");
        }
        match self.engine.delete_instance(id, reason).await {
            Ok(()) => {
                info!(instance_id = %id, "recovery delete succeeded");
                DeleteOutcome::ok(id, attempts, started.elapsed())
            }
            Err(err) if err.kind == EngineErrorKind::NotFound => {
                DeleteOutcome::ok(id, attempts, started.elapsed())
            }
            Err(err) => {
                warn!(instance_id = %id, error = %err, "recovery delete failed; quarantining");
                DeleteOutcome::quarantined(id, err.to_string(), attempts, started.elapsed())
            }
        }
    }
}

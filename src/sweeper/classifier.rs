//! Pure mapping from a candidate's pending work to a verdict.

use super::model::{Candidate, Classification, RecommendedAction};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Open tasks younger than this are given time before escalation.
    pub task_escalation_hours: i64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            task_escalation_hours: 6,
        }
    }
}

/// First matching rule wins. The task age comparison is strict, so a task
/// exactly at the threshold escalates.
pub fn classify(
    candidate: &Candidate,
    config: &ClassifierConfig,
) -> (Classification, RecommendedAction) {
    let open_tasks = candidate.open_task_count();
    let safe = open_tasks == 0
        && candidate.timers == 0
        && candidate.overdue_jobs == 0
        && candidate.overdue_timers == 0;
    if safe {
        return (Classification::SafeToDelete, RecommendedAction::Terminate);
    }
    if candidate.timers > 0 && candidate.overdue_timers == 0 {
        return (Classification::ReviewOnly, RecommendedAction::Wait);
    }
    if open_tasks > 0
        && candidate
            .oldest_task_age_hours()
            .is_some_and(|age| age < config.task_escalation_hours)
    {
        return (Classification::ReviewOnly, RecommendedAction::Wait);
    }
    (Classification::ReviewOnly, RecommendedAction::Escalate)
}

/// Classify in place; the only place a candidate's verdict is written.
pub fn apply(candidate: &mut Candidate, config: &ClassifierConfig) {
    let (classification, action) = classify(candidate, config);
    candidate.classification = Some(classification);
    candidate.recommended_action = Some(action);
}

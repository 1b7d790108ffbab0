//! CSV export of scan candidates.

use std::io::{self, Write};

use super::model::Candidate;

pub const CSV_HEADER: &str = "pid,procDefKey,startTime,hoursRunning,classification,recommendedAction,openTasksCount,oldestTaskAge,timerCount,overdueJobCount,overdueTimerCount,starterUserId,starterEmail,isSubprocess,parentPid";

/// Writes the header and one row per candidate.
pub fn export_csv<'a, W, I>(candidates: I, mut out: W) -> io::Result<usize>
where
    W: Write,
    I: IntoIterator<Item = &'a Candidate>,
{
    writeln!(out, "{CSV_HEADER}")?;
    let mut rows = 0;
    for c in candidates {
        writeln!(
            out,
            "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
            quote(Some(c.process_instance_id.as_str())),
            quote(c.process_definition_key.as_deref()),
            quote(Some(c.start_time.to_rfc3339().as_str())),
            c.hours_running,
            quote(c.classification.map(|v| v.as_str())),
            quote(c.recommended_action.map(|v| v.as_str())),
            c.open_task_count(),
            c.oldest_task_age_hours()
                .map(|age| age.to_string())
                .unwrap_or_default(),
            c.timers,
            c.overdue_jobs,
            c.overdue_timers,
            quote(c.started_by_user_id.as_deref()),
            quote(c.started_by_email.as_deref()),
            c.is_subprocess,
            quote(c.parent_instance_id.as_deref()),
        )?;
        rows += 1;
    }
    out.flush()?;
    Ok(rows)
}

fn quote(value: Option<&str>) -> String {
    match value {
        None => String::new(),
        Some(v) => format!("\"{}\"", v.replace('"', "\"\"")),
    }
}

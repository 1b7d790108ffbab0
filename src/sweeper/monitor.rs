//! Background watch for instances that stay terminable poll after poll.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::FilterCriteria;
use super::review::{ReviewService, ServiceResult};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Falls back to the review default when not positive.
    pub threshold_hours: i64,
    pub repeat_count: u64,
    pub sample_size: usize,
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_hours: 24,
            repeat_count: 3,
            sample_size: 20,
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckInstance {
    pub process_instance_id: String,
    pub process_definition_key: Option<String>,
    pub hours_running: i64,
    pub seen_count: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StuckMonitor {
    service: ReviewService,
    config: MonitorConfig,
    seen: Arc<Mutex<HashMap<String, StuckInstance>>>,
}

impl StuckMonitor {
    pub fn new(service: ReviewService, config: MonitorConfig) -> Self {
        Self {
            service,
            config,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// One observation pass. Returns the current stuck sample.
    pub async fn poll(&self) -> ServiceResult<Vec<StuckInstance>> {
        let review = self.service.config();
        let threshold_hours = if self.config.threshold_hours > 0 {
            self.config.threshold_hours
        } else {
            review.default_hours
        };
        let criteria = FilterCriteria {
            hours: Some(threshold_hours),
            action: Some("TERMINATE".to_string()),
            page: 0,
            size: self.config.sample_size.min(review.max_page_size),
            ..FilterCriteria::default()
        };
        let page = self.service.find_candidates(&criteria).await?;
        let now = Utc::now();

        {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            let mut current = HashSet::new();
            for item in &page.items {
                current.insert(item.process_instance_id.clone());
                let entry = seen
                    .entry(item.process_instance_id.clone())
                    .or_insert_with(|| StuckInstance {
                        process_instance_id: item.process_instance_id.clone(),
                        process_definition_key: item.process_definition_key.clone(),
                        hours_running: 0,
                        seen_count: 0,
                        last_seen: now,
                    });
                entry.seen_count += 1;
                entry.last_seen = now;
                entry.hours_running = item.hours_running;
            }
            seen.retain(|id, _| current.contains(id));
        }

        let stuck = self.stuck();
        if !stuck.is_empty() {
            let sample: Vec<String> = stuck
                .iter()
                .map(|s| {
                    format!(
                        "{}|{}|{}h",
                        s.process_instance_id,
                        s.process_definition_key.as_deref().unwrap_or(""),
                        s.hours_running
                    )
                })
                .collect();
            warn!(
                total = page.page.total_items,
                threshold_hours,
                repeat_count = self.config.repeat_count,
                sample = ?sample,
                "stuck backlog detected"
            );
        }
        Ok(stuck)
    }

    /// Instances seen at least `repeat_count` polls in a row, longest
    /// running first, capped at the sample size.
    pub fn stuck(&self) -> Vec<StuckInstance> {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stuck: Vec<StuckInstance> = seen
            .values()
            .filter(|s| s.seen_count >= self.config.repeat_count)
            .cloned()
            .collect();
        stuck.sort_by(|a, b| b.hours_running.cmp(&a.hours_running));
        stuck.truncate(self.config.sample_size);
        stuck
    }

    pub async fn run(self, shutdown: CancellationToken) {
        if !self.config.enabled {
            debug!("stuck monitor disabled");
            return;
        }
        info!(
            interval_secs = self.config.interval.as_secs(),
            repeat_count = self.config.repeat_count,
            "stuck monitor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stuck monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(err) = self.poll().await {
                        warn!(error = %err, "stuck monitor poll failed");
                    }
                }
            }
        }
    }
}

pub fn spawn_stuck_monitor(
    monitor: StuckMonitor,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(monitor.run(shutdown))
}

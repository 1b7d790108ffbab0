//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `SWEEPER_DATABASE_URL`: PostgreSQL connection string for the engine database
//! - `SWEEPER_TABLE_PREFIX`: engine table prefix (default: ACT_)
//! - `SWEEPER_DB_MAX_CONNECTIONS`: pool size (default: 10)
//! - `SWEEPER_IN_CLAUSE_LIMIT`: max ids per batched query (default: 1000)
//! - `SWEEPER_QUERY_STRATEGY`: `batched` or `per-instance` (default: batched)
//! - `SWEEPER_HOURS`: age cutoff in hours (default: 6)
//! - `SWEEPER_TASK_ESCALATION_HOURS`: task age before escalation (default: 6)
//! - `SWEEPER_MAX_PER_RUN`: scan result cap (default: 5000)
//! - `SWEEPER_PAGE_SIZE`: history page size (default: 200)
//! - `SWEEPER_ALLOW_KEYS` / `SWEEPER_DENY_KEYS`: comma-separated definition keys
//! - `SWEEPER_INCLUDE_SUBPROCESSES`: (default: true)
//! - `SWEEPER_DELETE_MODE`: SAFE, SELECTED or ALL (default: SAFE)
//! - `SWEEPER_DRY_RUN`: (default: true)
//! - `SWEEPER_REASON`: delete reason (default: Ops cleanup)
//! - `SWEEPER_VERIFY`: verify after delete (default: true)
//! - `SWEEPER_RETRY_COUNT`: extra delete attempts (default: 2)
//! - `SWEEPER_RETRY_BACKOFF_MS`: linear backoff base (default: 500)
//! - `SWEEPER_PARALLELISM`: concurrent deletes (default: 1)
//! - `SWEEPER_DELETE_PAUSE_MS`: pause between sequential deletes (default: 100)
//! - `SWEEPER_SUSPEND_BEFORE_DELETE`, `SWEEPER_DELETE_HISTORIC`: (default: false)
//! - `SWEEPER_KNOWN_DEFECT_FALLBACK`: (default: true)
//! - `SWEEPER_AUDIT_FILE`: JSONL audit path (default: stale-sweeper-audit.jsonl)
//! - `SWEEPER_AUDIT_DB`: mirror audit events into Postgres (default: false)
//! - `SWEEPER_REVIEW_ENABLED`, `SWEEPER_MAX_PAGE_SIZE`, `SWEEPER_MAX_BULK_DELETE`
//! - `SWEEPER_MONITOR_ENABLED`, `SWEEPER_MONITOR_THRESHOLD_HOURS`,
//!   `SWEEPER_MONITOR_REPEAT_COUNT`, `SWEEPER_MONITOR_SAMPLE_SIZE`,
//!   `SWEEPER_MONITOR_INTERVAL_SECS`

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::sweeper::{
    ClassifierConfig, DeleteMode, DeletePolicy, LinearBackoff, MonitorConfig, PrefetchStrategy,
    ReviewConfig, RunOptions, ScannerConfig,
};

pub const DEFAULT_TABLE_PREFIX: &str = "ACT_";
pub const DEFAULT_AUDIT_FILE: &str = "stale-sweeper-audit.jsonl";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SWEEPER_DATABASE_URL is required")]
    MissingDatabaseUrl,
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("{name} must not be negative")]
    Negative { name: &'static str },
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub database_url: Option<String>,
    pub table_prefix: String,
    pub db_max_connections: u32,
    pub in_clause_limit: usize,
    pub query_strategy: PrefetchStrategy,

    pub hours: i64,
    pub task_escalation_hours: i64,
    pub max_per_run: usize,
    pub page_size: usize,
    pub allow_list: HashSet<String>,
    pub deny_list: HashSet<String>,
    pub include_subprocesses: bool,

    pub delete_mode: DeleteMode,
    pub dry_run: bool,
    pub reason: String,
    pub verify: bool,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub parallelism: usize,
    pub delete_pause_ms: u64,
    pub suspend_before_delete: bool,
    pub delete_historic: bool,
    pub known_defect_fallback: bool,

    pub audit_file: PathBuf,
    pub audit_db: bool,

    pub review_enabled: bool,
    pub max_page_size: usize,
    pub max_bulk_delete: usize,

    pub monitor: MonitorConfig,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            db_max_connections: 10,
            in_clause_limit: 1000,
            query_strategy: PrefetchStrategy::Batched,
            hours: 6,
            task_escalation_hours: 6,
            max_per_run: 5000,
            page_size: 200,
            allow_list: HashSet::new(),
            deny_list: HashSet::new(),
            include_subprocesses: true,
            delete_mode: DeleteMode::Safe,
            dry_run: true,
            reason: "Ops cleanup".to_string(),
            verify: true,
            retry_count: 2,
            retry_backoff_ms: 500,
            parallelism: 1,
            delete_pause_ms: 100,
            suspend_before_delete: false,
            delete_historic: false,
            known_defect_fallback: true,
            audit_file: PathBuf::from(DEFAULT_AUDIT_FILE),
            audit_db: false,
            review_enabled: true,
            max_page_size: 200,
            max_bulk_delete: 200,
            monitor: MonitorConfig::default(),
        }
    }
}

impl SweeperConfig {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let query_strategy = match get("SWEEPER_QUERY_STRATEGY") {
            Some(value) => value
                .parse()
                .map_err(|err: String| anyhow!(err))
                .context("invalid SWEEPER_QUERY_STRATEGY")?,
            None => defaults.query_strategy,
        };
        let delete_mode = match get("SWEEPER_DELETE_MODE") {
            Some(value) => value
                .parse()
                .map_err(|err: String| anyhow!(err))
                .context("invalid SWEEPER_DELETE_MODE")?,
            None => defaults.delete_mode,
        };

        let monitor = MonitorConfig {
            enabled: parse_bool(get("SWEEPER_MONITOR_ENABLED"), defaults.monitor.enabled),
            threshold_hours: parse_or(
                get("SWEEPER_MONITOR_THRESHOLD_HOURS"),
                "SWEEPER_MONITOR_THRESHOLD_HOURS",
                defaults.monitor.threshold_hours,
            )?,
            repeat_count: parse_or(
                get("SWEEPER_MONITOR_REPEAT_COUNT"),
                "SWEEPER_MONITOR_REPEAT_COUNT",
                defaults.monitor.repeat_count,
            )?,
            sample_size: parse_or(
                get("SWEEPER_MONITOR_SAMPLE_SIZE"),
                "SWEEPER_MONITOR_SAMPLE_SIZE",
                defaults.monitor.sample_size,
            )?,
            interval: Duration::from_secs(parse_or(
                get("SWEEPER_MONITOR_INTERVAL_SECS"),
                "SWEEPER_MONITOR_INTERVAL_SECS",
                defaults.monitor.interval.as_secs(),
            )?),
        };

        Ok(Self {
            database_url: get("SWEEPER_DATABASE_URL"),
            table_prefix: get("SWEEPER_TABLE_PREFIX").unwrap_or(defaults.table_prefix),
            db_max_connections: parse_or(
                get("SWEEPER_DB_MAX_CONNECTIONS"),
                "SWEEPER_DB_MAX_CONNECTIONS",
                defaults.db_max_connections,
            )?,
            in_clause_limit: parse_or(
                get("SWEEPER_IN_CLAUSE_LIMIT"),
                "SWEEPER_IN_CLAUSE_LIMIT",
                defaults.in_clause_limit,
            )?,
            query_strategy,
            hours: parse_or(get("SWEEPER_HOURS"), "SWEEPER_HOURS", defaults.hours)?,
            task_escalation_hours: parse_or(
                get("SWEEPER_TASK_ESCALATION_HOURS"),
                "SWEEPER_TASK_ESCALATION_HOURS",
                defaults.task_escalation_hours,
            )?,
            max_per_run: parse_or(
                get("SWEEPER_MAX_PER_RUN"),
                "SWEEPER_MAX_PER_RUN",
                defaults.max_per_run,
            )?,
            page_size: parse_or(get("SWEEPER_PAGE_SIZE"), "SWEEPER_PAGE_SIZE", defaults.page_size)?,
            allow_list: parse_list(get("SWEEPER_ALLOW_KEYS")),
            deny_list: parse_list(get("SWEEPER_DENY_KEYS")),
            include_subprocesses: parse_bool(
                get("SWEEPER_INCLUDE_SUBPROCESSES"),
                defaults.include_subprocesses,
            ),
            delete_mode,
            dry_run: parse_bool(get("SWEEPER_DRY_RUN"), defaults.dry_run),
            reason: get("SWEEPER_REASON").unwrap_or(defaults.reason),
            verify: parse_bool(get("SWEEPER_VERIFY"), defaults.verify),
            retry_count: parse_or(
                get("SWEEPER_RETRY_COUNT"),
                "SWEEPER_RETRY_COUNT",
                defaults.retry_count,
            )?,
            retry_backoff_ms: parse_or(
                get("SWEEPER_RETRY_BACKOFF_MS"),
                "SWEEPER_RETRY_BACKOFF_MS",
                defaults.retry_backoff_ms,
            )?,
            parallelism: parse_or(
                get("SWEEPER_PARALLELISM"),
                "SWEEPER_PARALLELISM",
                defaults.parallelism,
            )?,
            delete_pause_ms: parse_or(
                get("SWEEPER_DELETE_PAUSE_MS"),
                "SWEEPER_DELETE_PAUSE_MS",
                defaults.delete_pause_ms,
            )?,
            suspend_before_delete: parse_bool(
                get("SWEEPER_SUSPEND_BEFORE_DELETE"),
                defaults.suspend_before_delete,
            ),
            delete_historic: parse_bool(get("SWEEPER_DELETE_HISTORIC"), defaults.delete_historic),
            known_defect_fallback: parse_bool(
                get("SWEEPER_KNOWN_DEFECT_FALLBACK"),
                defaults.known_defect_fallback,
            ),
            audit_file: get("SWEEPER_AUDIT_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.audit_file),
            audit_db: parse_bool(get("SWEEPER_AUDIT_DB"), defaults.audit_db),
            review_enabled: parse_bool(get("SWEEPER_REVIEW_ENABLED"), defaults.review_enabled),
            max_page_size: parse_or(
                get("SWEEPER_MAX_PAGE_SIZE"),
                "SWEEPER_MAX_PAGE_SIZE",
                defaults.max_page_size,
            )?,
            max_bulk_delete: parse_or(
                get("SWEEPER_MAX_BULK_DELETE"),
                "SWEEPER_MAX_BULK_DELETE",
                defaults.max_bulk_delete,
            )?,
            monitor,
        })
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self, needs_database: bool) -> Result<(), ConfigError> {
        if needs_database && self.database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        let sizes = [
            ("SWEEPER_IN_CLAUSE_LIMIT", self.in_clause_limit),
            ("SWEEPER_PAGE_SIZE", self.page_size),
            ("SWEEPER_MAX_PAGE_SIZE", self.max_page_size),
            ("SWEEPER_MAX_BULK_DELETE", self.max_bulk_delete),
        ];
        if let Some(&(name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { name });
        }
        if self.hours < 0 {
            return Err(ConfigError::Negative {
                name: "SWEEPER_HOURS",
            });
        }
        if self.task_escalation_hours < 0 {
            return Err(ConfigError::Negative {
                name: "SWEEPER_TASK_ESCALATION_HOURS",
            });
        }
        Ok(())
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            max_per_run: self.max_per_run,
            allow_list: self.allow_list.clone(),
            deny_list: self.deny_list.clone(),
            include_subprocesses: self.include_subprocesses,
            page_size: self.page_size,
        }
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            task_escalation_hours: self.task_escalation_hours,
        }
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        DeletePolicy {
            retry_count: self.retry_count,
            backoff: LinearBackoff::new(self.retry_backoff_ms),
            suspend_before_delete: self.suspend_before_delete,
            delete_historic: self.delete_historic,
            known_defect_fallback: self.known_defect_fallback,
        }
    }

    pub fn review_config(&self) -> ReviewConfig {
        ReviewConfig {
            enabled: self.review_enabled,
            default_hours: self.hours,
            max_page_size: self.max_page_size,
            max_bulk_delete: self.max_bulk_delete,
            dry_run: self.dry_run,
        }
    }

    pub fn run_options(&self, actor: Option<&str>) -> RunOptions {
        RunOptions {
            mode: self.delete_mode,
            parallelism: self.parallelism,
            dry_run: self.dry_run,
            verify: self.verify,
            reason: self.reason.clone(),
            actor: actor.map(str::to_string),
        }
    }

    pub fn delete_pause(&self) -> Duration {
        Duration::from_millis(self.delete_pause_ms)
    }
}

fn parse_or<T>(value: Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|err: T::Err| anyhow!("{err}"))
            .with_context(|| format!("invalid {name} value '{raw}'")),
    }
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

/// Comma-separated, trimmed, blanks dropped.
pub fn parse_list(value: Option<String>) -> HashSet<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<SweeperConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SweeperConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = load(&[]).unwrap();
        assert_eq!(config.hours, 6);
        assert_eq!(config.max_per_run, 5000);
        assert_eq!(config.delete_mode, DeleteMode::Safe);
        assert!(config.dry_run);
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.audit_file, PathBuf::from(DEFAULT_AUDIT_FILE));
        assert_eq!(config.table_prefix, "ACT_");
    }

    #[test]
    fn test_values_are_parsed() {
        let config = load(&[
            ("SWEEPER_HOURS", "12"),
            ("SWEEPER_ALLOW_KEYS", "invoice, payroll ,,"),
            ("SWEEPER_DELETE_MODE", "all"),
            ("SWEEPER_DRY_RUN", "false"),
            ("SWEEPER_QUERY_STRATEGY", "per-instance"),
            ("SWEEPER_MONITOR_REPEAT_COUNT", "5"),
        ])
        .unwrap();
        assert_eq!(config.hours, 12);
        assert_eq!(config.allow_list.len(), 2);
        assert!(config.allow_list.contains("payroll"));
        assert_eq!(config.delete_mode, DeleteMode::All);
        assert!(!config.dry_run);
        assert_eq!(config.query_strategy, PrefetchStrategy::PerInstance);
        assert_eq!(config.monitor.repeat_count, 5);
        assert_eq!(config.review_config().default_hours, 12);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = load(&[("SWEEPER_RETRY_COUNT", "many")]).unwrap_err();
        assert!(err.to_string().contains("SWEEPER_RETRY_COUNT"));
        assert!(load(&[("SWEEPER_DELETE_MODE", "some")]).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = load(&[]).unwrap();
        assert_eq!(config.validate(true), Err(ConfigError::MissingDatabaseUrl));
        assert!(config.validate(false).is_ok());
        config.in_clause_limit = 0;
        assert_eq!(
            config.validate(false),
            Err(ConfigError::Zero {
                name: "SWEEPER_IN_CLAUSE_LIMIT"
            })
        );
    }
}

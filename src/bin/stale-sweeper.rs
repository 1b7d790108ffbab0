//! stale-sweeper - scan a Flowable engine for long-running instances and
//! remove the abandoned ones.
//!
//! Configuration comes from `SWEEPER_*` environment variables (see
//! `stale_sweeper::config`); flags given here override them.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stale_sweeper::backends::{EngineGateway, PostgresEngine};
use stale_sweeper::config::SweeperConfig;
use stale_sweeper::observability;
use stale_sweeper::sweeper::{
    AuditIdentity, AuditSink, Candidate, DeleteMode, DeleteWorker, FanoutAuditSink,
    FilterCriteria, JsonlAuditSink, Orchestrator, PostgresAuditMirror, Prefetcher,
    ProcessSummary, RecommendedAction, ReviewService, Scanner, StuckMonitor, export_csv,
    spawn_stuck_monitor, tokens,
};

#[derive(Parser, Debug)]
#[command(name = "stale-sweeper", about = "Find and remove stuck workflow instances")]
struct Cli {
    /// Actor recorded in the audit trail (defaults to $USER)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Engine database URL
    #[arg(long, global = true, env = "SWEEPER_DATABASE_URL")]
    database_url: Option<String>,

    /// Audit JSONL file
    #[arg(long, global = true)]
    audit_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List candidates without changing anything
    Scan(ScanArgs),
    /// Delete candidates
    Delete(DeleteArgs),
    /// Show one instance in full
    Details {
        pid: String,
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Watch for a stuck backlog until interrupted
    Monitor,
}

#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Age cutoff in hours
    #[arg(long)]
    hours: Option<i64>,
    /// Only this process definition key
    #[arg(long)]
    key: Option<String>,
    /// Only instances started by this user
    #[arg(long)]
    started_by: Option<String>,
    /// ALL, TERMINATE, WAIT or ESCALATE
    #[arg(long)]
    action: Option<String>,
    /// Only instances with (true) or without (false) open tasks
    #[arg(long)]
    has_tasks: Option<bool>,
}

impl FilterArgs {
    fn criteria(&self) -> FilterCriteria {
        FilterCriteria {
            hours: self.hours,
            action: self.action.clone(),
            definition_key: self.key.clone(),
            started_by: self.started_by.clone(),
            has_tasks: self.has_tasks,
            ..FilterCriteria::default()
        }
    }
}

#[derive(Args, Debug)]
struct ScanArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// Write matching candidates as CSV
    #[arg(long)]
    export: Option<PathBuf>,
    /// Print candidates as JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct DeleteArgs {
    #[command(flatten)]
    filter: FilterArgs,
    /// SAFE, SELECTED or ALL
    #[arg(long)]
    mode: Option<DeleteMode>,
    /// Required for any deletion
    #[arg(long)]
    confirm: bool,
    /// Confirmation token matching the mode
    #[arg(long)]
    token: Option<String>,
    /// Skip the interactive prompt
    #[arg(long)]
    yes: bool,
    /// Comma-separated instance ids
    #[arg(long, value_delimiter = ',')]
    selected: Vec<String>,
    /// File with one instance id per line
    #[arg(long)]
    selected_file: Option<PathBuf>,
    /// Ignore the age cutoff for selected ids
    #[arg(long)]
    force: bool,
    /// Override SWEEPER_DRY_RUN
    #[arg(long)]
    dry_run: Option<bool>,
    #[arg(long)]
    parallelism: Option<usize>,
    #[arg(long)]
    reason: Option<String>,
    /// Write candidates as CSV before deleting
    #[arg(long)]
    export: Option<PathBuf>,
}

struct App {
    config: SweeperConfig,
    service: ReviewService,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init();
    let cli = Cli::parse();

    let mut config = SweeperConfig::from_env()?;
    if cli.database_url.is_some() {
        config.database_url = cli.database_url.clone();
    }
    if let Some(path) = cli.audit_file.clone() {
        config.audit_file = path;
    }
    config.validate(true)?;

    let app = build(config, cli.user.as_deref()).await?;
    let shutdown = app.shutdown.clone();
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(()) => {
                warn!("shutdown requested; no new deletes will start");
                shutdown.cancel();
            }
            Err(err) => warn!(error = %err, "failed to install signal handlers"),
        }
    });

    match cli.command {
        Command::Scan(args) => scan(&app, &args, cli.user.as_deref()).await,
        Command::Delete(args) => delete(&app, args, cli.user.as_deref()).await,
        Command::Details { pid, hours } => details(&app, &pid, hours).await,
        Command::Monitor => monitor(&app).await,
    }
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Ctrl+C received");
            }
            _ = terminate.recv() => {
                info!("SIGTERM received");
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl+C received");
        Ok(())
    }
}

async fn build(config: SweeperConfig, user: Option<&str>) -> Result<App> {
    let database_url = config
        .database_url
        .clone()
        .context("SWEEPER_DATABASE_URL environment variable is required")?;
    let postgres = PostgresEngine::connect(
        &database_url,
        &config.table_prefix,
        config.db_max_connections,
    )
    .await
    .context("connect to engine database")?;
    info!(prefix = %config.table_prefix, "connected to engine database");

    let identity = AuditIdentity::detect(user);
    let mut sinks: Vec<Arc<dyn AuditSink>> = vec![Arc::new(
        JsonlAuditSink::open(&config.audit_file, identity.clone())
            .with_context(|| format!("open audit file {}", config.audit_file.display()))?,
    )];
    if config.audit_db {
        let mirror = PostgresAuditMirror::new(postgres.pool().clone(), identity.clone());
        mirror
            .ensure_table()
            .await
            .context("create audit mirror table")?;
        sinks.push(Arc::new(mirror));
    }
    let audit: Arc<dyn AuditSink> = Arc::new(FanoutAuditSink::new(sinks));
    info!(run_id = %identity.run_id, host = %identity.host, user = %identity.user, "audit identity");

    let engine: Arc<dyn EngineGateway> = Arc::new(postgres);
    let shutdown = CancellationToken::new();
    let prefetcher = Prefetcher::new(engine.clone(), config.query_strategy, config.in_clause_limit);
    let scanner = Scanner::new(engine.clone(), prefetcher, config.scanner_config());
    let worker = DeleteWorker::new(engine.clone(), config.delete_policy(), shutdown.clone());
    let orchestrator = Orchestrator::new(engine, worker, audit, config.delete_pause());
    let service = ReviewService::new(
        scanner,
        config.classifier_config(),
        orchestrator.clone(),
        config.review_config(),
    );
    Ok(App {
        config,
        service,
        orchestrator,
        shutdown,
    })
}

/// Scan, classify and audit, honouring the post-classification filters.
async fn evaluate(app: &App, filter: &FilterArgs, user: Option<&str>) -> Result<Vec<Candidate>> {
    let criteria = filter.criteria();
    let hours = criteria.hours_or(app.config.hours);
    let now = Utc::now();
    let cutoff = now - ChronoDuration::hours(hours);
    let scanned = app.service.scanner().scan(cutoff, now, Some(&criteria)).await?;
    let mut candidates = app.service.evaluate(scanned, user).await;
    candidates.retain(|c| criteria.matches_action(c.action()) && criteria.matches_tasks(c));
    log_summary(&candidates, hours);
    Ok(candidates)
}

fn log_summary(candidates: &[Candidate], hours: i64) {
    let mut by_action: HashMap<&'static str, usize> = HashMap::new();
    for candidate in candidates {
        let label = candidate
            .recommended_action
            .map(|a| a.as_str())
            .unwrap_or("NONE");
        *by_action.entry(label).or_default() += 1;
    }
    info!(
        total = candidates.len(),
        hours,
        terminate = by_action.get(RecommendedAction::Terminate.as_str()).copied().unwrap_or(0),
        wait = by_action.get(RecommendedAction::Wait.as_str()).copied().unwrap_or(0),
        escalate = by_action.get(RecommendedAction::Escalate.as_str()).copied().unwrap_or(0),
        "scan summary"
    );
}

fn write_export(path: &Path, candidates: &[Candidate]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let rows = export_csv(candidates, BufWriter::new(file))?;
    info!(rows, path = %path.display(), "exported candidates");
    Ok(())
}

async fn scan(app: &App, args: &ScanArgs, user: Option<&str>) -> Result<()> {
    let candidates = evaluate(app, &args.filter, user).await?;
    if let Some(path) = &args.export {
        write_export(path, &candidates)?;
    }
    if args.json {
        let rows: Vec<ProcessSummary> = candidates.iter().map(ProcessSummary::from).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for c in &candidates {
        println!(
            "{}\t{}\t{}h\t{}\ttasks={}\ttimers={}\toverdue_jobs={}",
            c.process_instance_id,
            c.process_definition_key.as_deref().unwrap_or("-"),
            c.hours_running,
            c.recommended_action.map(|a| a.as_str()).unwrap_or("-"),
            c.open_task_count(),
            c.timers,
            c.overdue_jobs
        );
    }
    Ok(())
}

async fn selected_ids(args: &DeleteArgs) -> Result<Vec<String>> {
    let mut ids: Vec<String> = args.selected.clone();
    if let Some(path) = &args.selected_file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        ids.extend(text.lines().map(str::to_string));
    }
    Ok(ids
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect())
}

async fn delete(app: &App, args: DeleteArgs, user: Option<&str>) -> Result<()> {
    let mut options = app.config.run_options(user);
    if let Some(mode) = args.mode {
        options.mode = mode;
    }
    if let Some(dry_run) = args.dry_run {
        options.dry_run = dry_run;
    }
    if let Some(parallelism) = args.parallelism {
        options.parallelism = parallelism;
    }
    if let Some(reason) = args.reason.clone() {
        options.reason = reason;
    }

    let ids = selected_ids(&args).await?;
    if options.mode == DeleteMode::Selected && ids.is_empty() {
        bail!("SELECTED mode needs --selected or --selected-file");
    }

    let candidates = if ids.is_empty() {
        evaluate(app, &args.filter, user).await?
    } else {
        let hours = args.filter.hours.filter(|h| *h > 0).unwrap_or(app.config.hours);
        let now = Utc::now();
        let cutoff = now - ChronoDuration::hours(hours);
        let scanned = app
            .service
            .scanner()
            .scan_selected(&ids, cutoff, now, args.force)
            .await?;
        let candidates = app.service.evaluate(scanned, user).await;
        log_summary(&candidates, hours);
        candidates
    };
    if let Some(path) = &args.export {
        write_export(path, &candidates)?;
    }

    if !args.confirm || !tokens::is_valid_for_mode(options.mode, args.token.as_deref()) {
        warn!(
            mode = %options.mode,
            expected = tokens::expected_token(options.mode),
            "deletion confirmation not satisfied; pass --confirm and the matching --token"
        );
        return Ok(());
    }
    if !options.dry_run && !args.yes && !prompt_confirmation(options.mode, candidates.len()).await? {
        info!("deletion aborted by operator");
        return Ok(());
    }

    let outcomes = app.orchestrator.run(&candidates, &options).await;
    let mut tally: HashMap<&'static str, usize> = HashMap::new();
    for outcome in &outcomes {
        *tally.entry(outcome.result.as_str()).or_default() += 1;
        println!(
            "{}\t{}\tattempts={}\t{}ms\t{}",
            outcome.instance_id,
            outcome.result,
            outcome.attempts,
            outcome.duration_ms(),
            outcome.error.as_deref().unwrap_or("")
        );
    }
    info!(results = ?tally, dry_run = options.dry_run, "delete run finished");
    Ok(())
}

async fn prompt_confirmation(mode: DeleteMode, count: usize) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(format!("Delete {count} {mode} candidates now? (yes/no) ").as_bytes())
        .await?;
    stdout.flush().await?;
    let answer = lines.next_line().await?.unwrap_or_default();
    if !answer.trim().eq_ignore_ascii_case("yes") {
        return Ok(false);
    }

    let expected = tokens::expected_token(mode);
    stdout
        .write_all(format!("Type {expected} to confirm: ").as_bytes())
        .await?;
    stdout.flush().await?;
    let token = lines.next_line().await?;
    Ok(tokens::is_valid_for_mode(mode, token.as_deref()))
}

async fn details(app: &App, pid: &str, hours: Option<i64>) -> Result<()> {
    let detail = app.service.details(pid, hours).await?;
    println!("{}", serde_json::to_string_pretty(&detail)?);
    Ok(())
}

async fn monitor(app: &App) -> Result<()> {
    let mut monitor_config = app.config.monitor.clone();
    monitor_config.enabled = true;
    let monitor = StuckMonitor::new(app.service.clone(), monitor_config);
    spawn_stuck_monitor(monitor, app.shutdown.clone())
        .await
        .context("stuck monitor task")?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::Command;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_sigterm_requests_shutdown() {
        let waiter = tokio::spawn(wait_for_shutdown());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}

//! Cadence simulator - drives a job queue with synthetic work.
//!
//! Enqueues a batch of jobs across several users and priorities, starts the
//! dispatch loop, claims every result and reports dispatch order and outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use colored::*;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

use cadence_core::prelude::*;
use cadence_core::telemetry::{describe_metrics, init_logging, LogFormat};

/// Output format selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum OutputFormat {
    /// Render as a formatted table
    #[default]
    Table,
    /// Render as JSON
    Json,
}

/// Cadence - job queue simulator
#[derive(Parser)]
#[command(
    name = "cadence-sim",
    author = "Aezi <aezi.zhu@icloud.com>",
    version = "0.1.0",
    about = "Run synthetic jobs through a rate-limited priority queue",
    propagate_version = true
)]
struct Cli {
    /// Number of jobs to submit
    #[arg(short, long, default_value_t = 12)]
    jobs: usize,

    /// Concurrency ceiling for the dispatch loop
    #[arg(short = 'c', long)]
    max_concurrent: Option<usize>,

    /// Number of distinct users submitting jobs
    #[arg(short, long, default_value_t = 3)]
    users: usize,

    /// Make every Nth job fail (0 disables failures)
    #[arg(long, default_value_t = 4)]
    fail_every: usize,

    /// Configuration file layered under CADENCE__* environment variables
    #[arg(long, env = "CADENCE_CONFIG")]
    config: Option<String>,

    /// Log filter for the simulator run
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Output format
    #[arg(short, long, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

/// One row of the simulation report.
#[derive(Debug, Clone, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "User")]
    user: String,
    #[tabled(rename = "Priority")]
    priority: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

#[derive(Debug, Serialize)]
struct Report {
    jobs: Vec<JobRow>,
    status: QueueStatus,
    dispatched: u64,
    peak_concurrent: u64,
}

struct Submitted {
    id: Option<JobId>,
    user: String,
    priority: JobPriority,
    rejection: Option<CadenceError>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let loaded = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };
    let mut config = loaded.unwrap_or_else(|e| {
        print_error(&format!("Could not load config: {}. Using defaults.", e));
        Config::default()
    });

    config.logging.level = cli.log_level.clone();
    config.logging.format = LogFormat::Compact;
    init_logging(&config.logging)?;
    describe_metrics();

    if let Some(max_concurrent) = cli.max_concurrent {
        config.queue.max_concurrent_jobs = max_concurrent;
    }
    config.validate()?;

    let queue: JobQueue<String> = JobQueue::new(config.queue.clone(), config.rate_limit.clone());
    let started = Arc::new(AtomicUsize::new(0));
    let start_order: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));

    let policy = RetryPolicy::exponential(Duration::from_millis(20), 2.0, Duration::from_millis(200))
        .retries(2)
        .named("simulated_job");

    let users = cli.users.max(1);
    let mut submitted = Vec::with_capacity(cli.jobs);
    for index in 0..cli.jobs {
        let user = format!("user-{}", index % users);
        let priority = match index % 3 {
            0 => JobPriority::Normal,
            1 => JobPriority::Low,
            _ => JobPriority::High,
        };
        let fails = cli.fail_every > 0 && (index + 1) % cli.fail_every == 0;

        let started = Arc::clone(&started);
        let start_order = Arc::clone(&start_order);
        let mut first_attempt = true;
        let work = with_retry(policy.clone(), move || {
            if first_attempt {
                first_attempt = false;
                let position = started.fetch_add(1, Ordering::SeqCst) + 1;
                start_order.lock().push((index, position));
            }
            let delay = Duration::from_millis(rand::thread_rng().gen_range(50..250));
            async move {
                tokio::time::sleep(delay).await;
                if fails {
                    Err(CadenceError::external_service(
                        "simulated-backend",
                        format!("job {} failed", index),
                    ))
                } else {
                    Ok(format!("done in {}ms", delay.as_millis()))
                }
            }
        });

        let options = JobOptions::new(user.clone())
            .priority(priority)
            .organization("org-sim")
            .description(format!("simulated job {}", index));

        match queue.add_job(work, options) {
            Ok(id) => submitted.push(Submitted {
                id: Some(id),
                user,
                priority,
                rejection: None,
            }),
            Err(e) => submitted.push(Submitted {
                id: None,
                user,
                priority,
                rejection: Some(e),
            }),
        }
    }

    let worker = JobWorker::new(config.worker.clone()).start(queue.clone())?;

    let outcomes = futures::future::join_all(submitted.iter().map(|job| {
        let queue = queue.clone();
        let id = job.id.clone();
        async move {
            match id {
                Some(id) => Some(queue.get_result(&id).await),
                None => None,
            }
        }
    }))
    .await;

    let dispatched = worker.stats().dispatched();
    let peak_concurrent = worker.stats().peak_concurrent();
    worker.stop().await;

    let order = start_order.lock().clone();
    let rows: Vec<JobRow> = submitted
        .into_iter()
        .zip(outcomes)
        .enumerate()
        .map(|(index, (job, outcome))| {
            let started = order
                .iter()
                .find(|(job_index, _)| *job_index == index)
                .map(|(_, position)| position.to_string())
                .unwrap_or_else(|| "-".to_string());
            let (outcome, detail) = match (job.rejection, outcome) {
                (Some(e), _) => ("rejected".to_string(), e.message().to_string()),
                (None, Some(Ok(value))) => ("ok".to_string(), value),
                (None, Some(Err(e))) => (e.code().to_string(), e.message().to_string()),
                (None, None) => ("unknown".to_string(), String::new()),
            };
            JobRow {
                job_id: job.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                user: job.user,
                priority: job.priority.to_string(),
                started,
                outcome,
                detail,
            }
        })
        .collect();

    let report = Report {
        jobs: rows,
        status: queue.get_status(),
        dispatched,
        peak_concurrent,
    };

    match cli.output {
        OutputFormat::Table => print_report(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(())
}

fn print_report(report: &Report) {
    let table = Table::new(&report.jobs)
        .with(Style::rounded())
        .with(Modify::new(Columns::first()).with(Alignment::left()))
        .to_string();
    println!("{}", table);
    println!();
    println!(
        "  {}: {}  {}: {}  {}: {}",
        "queued".cyan(),
        report.status.queued_jobs,
        "running".cyan(),
        report.status.running_jobs,
        "unclaimed".cyan(),
        report.status.completed_jobs
    );

    let failed = report
        .jobs
        .iter()
        .filter(|row| row.outcome != "ok" && row.outcome != "rejected")
        .count();
    let rejected = report.jobs.iter().filter(|row| row.outcome == "rejected").count();
    print_success(&format!(
        "{} dispatched (peak {} concurrent), {} failed, {} rejected at admission",
        report.dispatched, report.peak_concurrent, failed, rejected
    ));
}

fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

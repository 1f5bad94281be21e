mod ingest;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sift_client::OpenAiExtractor;
use sift_client::llm::DEFAULT_BASE_URL;
use sift_core::job::{JobStatus, RetryConfig, WorkerConfig};
use sift_core::job_queue::JobQueue;
use sift_core::models::CanonicalRecord;
use sift_core::traits::{GroupStore, RawUnitStore, RecordStore};
use sift_core::{
    CircuitBreaker, CircuitBreakerConfig, DedupConfig, ExtractionPipeline, PipelineConfig,
    TracingTriageSink, TracingWorkerReporter, ValidationMode, WorkerService, load_examples,
};
use sift_db::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(name = "sift", version, about = "Extraction, merge and dedup pipeline for posted listings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upsert raw units from a JSON or NDJSON file and enqueue the changed ones
    Ingest {
        /// File holding a JSON array or one raw unit per line
        #[arg(short, long)]
        file: PathBuf,

        #[arg(long, env = "SIFT_PIPELINE_VERSION", default_value = "v1")]
        pipeline_version: String,

        /// Store the units without enqueueing extraction work
        #[arg(long, default_value_t = false)]
        no_enqueue: bool,
    },

    /// Enqueue extraction for an already stored raw unit
    Enqueue {
        /// Raw unit id
        raw_ref: Uuid,

        #[arg(long, env = "SIFT_PIPELINE_VERSION", default_value = "v1")]
        pipeline_version: String,
    },

    /// Run an extraction worker until interrupted
    Worker {
        /// LLM model to use (e.g., "gpt-4o-mini")
        #[arg(short, long, env = "SIFT_MODEL", default_value = "gpt-4o-mini")]
        model: String,

        /// OpenAI-compatible API base URL
        #[arg(short, long, env = "SIFT_BASE_URL", default_value = DEFAULT_BASE_URL)]
        base_url: String,

        #[arg(short, long, env = "SIFT_API_KEY")]
        api_key: String,

        /// JSON file of few-shot extraction examples
        #[arg(long)]
        examples: Option<PathBuf>,

        /// off, report_only or enforce
        #[arg(long, env = "SIFT_VALIDATION_MODE", default_value = "enforce")]
        validation_mode: ValidationMode,

        #[arg(long, env = "SIFT_PIPELINE_VERSION", default_value = "v1")]
        pipeline_version: String,

        #[arg(long, env = "SIFT_WORKER_CONCURRENCY", default_value_t = 4)]
        concurrency: usize,

        #[arg(long, env = "SIFT_BATCH_SIZE", default_value_t = 10)]
        batch_size: usize,

        /// Seconds to wait when the queue is empty
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,

        #[arg(long, default_value_t = 5)]
        max_attempts: u32,

        /// Stable worker id (random if omitted)
        #[arg(long)]
        worker_id: Option<String>,
    },

    /// Return abandoned claims to the queue
    Reclaim {
        /// Claims older than this many seconds are stale
        #[arg(long, default_value_t = 600)]
        stale_after: u64,
    },

    /// Inspect the job queue
    Jobs {
        #[command(subcommand)]
        action: JobsCommand,
    },

    /// Inspect canonical records
    Record {
        #[command(subcommand)]
        action: RecordCommand,
    },

    /// Show a duplicate group and its members
    Group {
        group_id: Uuid,
    },
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List recent jobs
    List {
        /// pending, processing, ok, failed, filtered or invalid
        #[arg(short, long)]
        status: Option<JobStatus>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one job with its diagnostics
    Show { job_id: Uuid },
    /// Count jobs per status
    Stats,
}

#[derive(Subcommand)]
enum RecordCommand {
    /// Show one record by id or record key
    Show { id_or_key: String },
    /// List the most recently observed records
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sift=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db = connect_db().await?;

    match cli.command {
        Commands::Ingest {
            file,
            pipeline_version,
            no_enqueue,
        } => cmd_ingest(&db, &file, &pipeline_version, !no_enqueue).await?,
        Commands::Enqueue {
            raw_ref,
            pipeline_version,
        } => {
            let unit = db
                .raw_unit_repo()
                .get(raw_ref)
                .await?
                .with_context(|| format!("Raw unit {raw_ref} not found"))?;
            let result = db
                .job_repo(RetryConfig::default())
                .enqueue(unit.id, &pipeline_version)
                .await?;
            if result.enqueued() {
                println!("Enqueued job {}", result.job_id());
            } else {
                println!("Job {} already active", result.job_id());
            }
        }
        Commands::Worker {
            model,
            base_url,
            api_key,
            examples,
            validation_mode,
            pipeline_version,
            concurrency,
            batch_size,
            poll_interval,
            max_attempts,
            worker_id,
        } => {
            let mut pipeline_config = PipelineConfig::default()
                .with_model(model)
                .with_validation_mode(validation_mode);
            if let Some(path) = examples {
                pipeline_config = pipeline_config.with_examples(load_examples(&path)?);
            }

            let mut config = WorkerConfig::default()
                .with_pipeline_version(pipeline_version)
                .with_concurrency(concurrency)
                .with_batch_size(batch_size)
                .with_poll_interval(Duration::from_secs(poll_interval));
            if let Some(id) = worker_id {
                config = config.with_worker_id(id);
            }
            config.retry_config = RetryConfig {
                max_attempts,
                ..RetryConfig::default()
            };

            cmd_worker(&db, &api_key, &base_url, pipeline_config, config).await?;
        }
        Commands::Reclaim { stale_after } => {
            let count = db
                .job_repo(RetryConfig::default())
                .reclaim_stale(Duration::from_secs(stale_after))
                .await?;
            println!("Reclaimed {count} stale jobs");
        }
        Commands::Jobs { action } => cmd_jobs(&db, action).await?,
        Commands::Record { action } => cmd_record(&db, action).await?,
        Commands::Group { group_id } => {
            let groups = db.group_repo();
            let group = groups
                .get_group(group_id)
                .await?
                .with_context(|| format!("Group {group_id} not found"))?;
            let members = groups.list_members(group_id).await?;
            let output = serde_json::json!({ "group": group, "members": members });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

async fn cmd_ingest(
    db: &Database,
    file: &Path,
    pipeline_version: &str,
    enqueue: bool,
) -> Result<()> {
    let units = ingest::read_units(file)?;
    let raw_units = db.raw_unit_repo();
    let jobs = db.job_repo(RetryConfig::default());

    let (mut changed, mut enqueued) = (0usize, 0usize);
    for unit in &units {
        let (stored, was_changed) = raw_units
            .upsert(unit)
            .await
            .with_context(|| format!("Failed to store {}:{}", unit.source_id, unit.native_id))?;
        if !was_changed {
            continue;
        }
        changed += 1;
        if enqueue && jobs.enqueue(stored.id, pipeline_version).await?.enqueued() {
            enqueued += 1;
        }
    }

    tracing::info!(total = units.len(), changed, enqueued, "Ingest complete");
    println!(
        "{} units read, {changed} new or changed, {enqueued} jobs enqueued",
        units.len()
    );
    Ok(())
}

async fn cmd_worker(
    db: &Database,
    api_key: &str,
    base_url: &str,
    pipeline_config: PipelineConfig,
    config: WorkerConfig,
) -> Result<()> {
    let extractor = OpenAiExtractor::with_base_url(api_key, base_url)?;
    let pipeline = ExtractionPipeline::new(
        extractor,
        db.record_repo(),
        db.group_repo(),
        CircuitBreaker::new("extraction", CircuitBreakerConfig::default()),
        pipeline_config,
        DedupConfig::default(),
    );
    let worker = WorkerService::new(
        db.job_repo(config.retry_config.clone()),
        db.raw_unit_repo(),
        pipeline,
        config,
    );

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            token.cancel();
        }
    });

    worker
        .run(cancel, &TracingWorkerReporter, &TracingTriageSink)
        .await?;
    Ok(())
}

async fn cmd_jobs(db: &Database, action: JobsCommand) -> Result<()> {
    let jobs = db.job_repo(RetryConfig::default());
    match action {
        JobsCommand::List { status, limit } => {
            let list = jobs.list_jobs(status, limit).await?;
            if list.is_empty() {
                println!("No jobs found");
                return Ok(());
            }
            for job in &list {
                println!(
                    "  {} [{}] raw={} attempts={}/{} {}",
                    job.id,
                    job.status,
                    job.raw_ref,
                    job.attempt_count,
                    job.max_attempts,
                    job.last_error.as_deref().unwrap_or(""),
                );
            }
            println!("\nTotal: {} jobs", list.len());
        }
        JobsCommand::Show { job_id } => {
            let job = jobs
                .get_job(job_id)
                .await?
                .with_context(|| format!("Job {job_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsCommand::Stats => {
            for status in [
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Ok,
                JobStatus::Filtered,
                JobStatus::Invalid,
                JobStatus::Failed,
            ] {
                println!("{:<11} {}", status.as_str(), jobs.count_by_status(status).await?);
            }
        }
    }
    Ok(())
}

async fn cmd_record(db: &Database, action: RecordCommand) -> Result<()> {
    let records = db.record_repo();
    match action {
        RecordCommand::Show { id_or_key } => {
            let record = match id_or_key.parse::<Uuid>() {
                Ok(id) => records.get(id).await?,
                Err(_) => records.find_by_key(&id_or_key).await?,
            }
            .with_context(|| format!("Record {id_or_key} not found"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        RecordCommand::List { limit, format } => {
            let list = records.list_recent(limit).await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&list)?),
                OutputFormat::Csv => write_records_csv(&list, std::io::stdout())?,
            }
        }
    }
    Ok(())
}

const CSV_HEADER: [&str; 12] = [
    "id",
    "record_key",
    "source_id",
    "natural_key",
    "status",
    "title",
    "subjects",
    "levels",
    "postal_code",
    "rate",
    "last_observed",
    "duplicate_group_id",
];

fn write_records_csv<W: Write>(records: &[CanonicalRecord], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(CSV_HEADER)?;
    for r in records {
        let join = |set: &std::collections::BTreeSet<String>| {
            set.iter().cloned().collect::<Vec<_>>().join("|")
        };
        writer.write_record([
            r.id.to_string(),
            r.record_key.clone(),
            r.source_id.clone(),
            r.natural_key.clone().unwrap_or_default(),
            r.status.to_string(),
            r.title.clone().unwrap_or_default(),
            join(&r.signals.subjects),
            join(&r.signals.levels),
            r.signals.postal_code.clone().unwrap_or_default(),
            r.signals
                .rate
                .map(|rate| format!("{}-{}", rate.min, rate.max))
                .unwrap_or_default(),
            r.last_observed.to_rfc3339(),
            r.duplicate_group_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

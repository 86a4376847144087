//! # jobwarden: durable job scheduler CLI
//!
//! Usage:
//!   jobwarden init                               # Write a default config
//!   jobwarden run                                # Run until Ctrl-C
//!   jobwarden run --until when_all_done          # Drain the queue and exit
//!   jobwarden submit shell --payload '{"command":"date"}' --key nightly
//!   jobwarden status                             # Store-wide counts
//!   jobwarden list --state failed --limit 20
//!   jobwarden purge --days 30

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jobwarden_core::{JobState, JobStore, NewJob, StopMode, WardenConfig};
use jobwarden_scheduler::{HandlerRegistry, Scheduler, SqliteJobStore, register_builtins};

#[derive(Parser)]
#[command(
    name = "jobwarden",
    version,
    about = "⏰ jobwarden: durable multi-worker job scheduler"
)]
struct Cli {
    /// Config file (default: ~/.jobwarden/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scheduler with the built-in handlers
    Run {
        /// Concurrent job slots
        #[arg(long)]
        pool_size: Option<usize>,
        /// Milliseconds between ticks
        #[arg(long)]
        tick_ms: Option<u64>,
        /// Stop mode requested at startup (e.g. when_all_done)
        #[arg(long, default_value = "never")]
        until: StopMode,
    },
    /// Enqueue a job
    Submit {
        /// Handler name
        name: String,
        /// JSON payload
        #[arg(long, default_value = "null")]
        payload: String,
        /// Serialization key
        #[arg(long)]
        key: Option<String>,
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        priority: i64,
    },
    /// Show job counts
    Status,
    /// List recent jobs
    List {
        /// waiting, running, succeeded or failed
        #[arg(long)]
        state: Option<JobState>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Delete finished jobs older than N days
    Purge {
        #[arg(long)]
        days: u32,
    },
    /// Write a default config file
    Init,
}

fn load_config(path: Option<&PathBuf>) -> Result<WardenConfig> {
    let config = match path {
        Some(path) => WardenConfig::load_from(path)?,
        None => WardenConfig::load()?,
    };
    Ok(config)
}

fn init_logging(config: &WardenConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let directives = format!("jobwarden={level},jobwarden_core={level},jobwarden_scheduler={level}");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Init = cli.command {
        let path = cli.config.clone().unwrap_or_else(WardenConfig::default_path);
        if path.exists() {
            println!("⚠️  Config already exists at {}", path.display());
            return Ok(());
        }
        WardenConfig::default().save_to(&path)?;
        println!("✅ Wrote default config to {}", path.display());
        return Ok(());
    }

    let mut config = load_config(cli.config.as_ref())?;
    init_logging(&config, cli.verbose);

    let store = Arc::new(
        SqliteJobStore::from_config(&config.store)
            .with_context(|| format!("failed to open {}", config.store.expanded_path().display()))?,
    );

    match cli.command {
        Command::Run {
            pool_size,
            tick_ms,
            until,
        } => {
            if let Some(n) = pool_size {
                config.scheduler.pool_size = n;
            }
            if let Some(ms) = tick_ms {
                config.scheduler.tick_interval_ms = ms;
            }
            config.validate()?;
            run(store, config, until).await?;
        }
        Command::Submit {
            name,
            payload,
            key,
            priority,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload must be valid JSON")?;
            let mut job = NewJob::new(&name, payload).with_priority(priority);
            if let Some(key) = key.as_deref() {
                job = job.with_key(key);
            }
            let id = store.submit(job).await?;
            println!("✅ Submitted job {id} '{name}'");
        }
        Command::Status => {
            let counts = store.counts().await?;
            println!("⏰ jobwarden v{}", env!("CARGO_PKG_VERSION"));
            println!("   🗄️  Database:  {}", config.store.expanded_path().display());
            println!("   ⏳ Waiting:   {}", counts.waiting);
            println!("   ▶️  Running:   {}", counts.running);
            println!("   ✅ Succeeded: {}", counts.succeeded);
            println!("   ❌ Failed:    {}", counts.failed);
        }
        Command::List { state, limit } => {
            let jobs = store.list_jobs(state, limit).await?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                let key = match job.serialization_key_id {
                    Some(key_id) => store
                        .find_key(key_id)
                        .await?
                        .map(|k| k.key)
                        .unwrap_or_default(),
                    None => String::new(),
                };
                println!(
                    "{:>6}  {:<9}  p{:<4} {:<16} {:<16} {}",
                    job.id,
                    job.state().to_string(),
                    job.priority,
                    job.name,
                    key,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(err) = job.error_message.as_deref() {
                    println!("        └─ {}", err.lines().next().unwrap_or_default());
                }
            }
        }
        Command::Purge { days } => {
            let before = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
            let removed = store.purge(before).await?;
            println!("🧹 Purged {removed} finished job(s) older than {days} day(s)");
        }
        Command::Init => {}
    }

    Ok(())
}

async fn run(store: Arc<SqliteJobStore>, config: WardenConfig, until: StopMode) -> Result<()> {
    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry)?;
    tracing::debug!("🧩 Handlers: {}", registry.names().join(", "));

    let channel = Box::new(store.channel());
    let (scheduler, handle) = Scheduler::new(store, channel, registry, config.scheduler);
    if until != StopMode::Never {
        handle.stop(until, None);
    }

    // First Ctrl-C finishes running jobs, the second cancels them.
    let signals = handle.clone();
    tokio::spawn(async move {
        let mut escalation = [StopMode::WhenCurrentDone, StopMode::Now].into_iter();
        while tokio::signal::ctrl_c().await.is_ok() {
            match escalation.next() {
                Some(mode) => {
                    signals.stop(mode, None);
                }
                None => break,
            }
        }
    });

    scheduler.start().await?;
    Ok(())
}

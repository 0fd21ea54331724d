#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use council_harness::config::{
    ConfigProvider, CouncilConfig, JsonFileConfigProvider, RuntimeSettings, StaticConfigProvider,
};
use council_harness::conversation::ConversationStore;
use council_harness::gateway::openrouter::OpenRouterAdapter;
use council_harness::gateway::{GatewayConfig, ProviderGateway, TracingUsageSink};
use council_harness::jobs::{CancelOutcome, CouncilEngine, JobLifecycleManager, JobStatus};
use council_harness::store::SqliteStore;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "council", version, about = "LLM council CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one council job and print it as JSON
    Ask {
        query: String,
        /// Council config JSON (defaults to the built-in council)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Attach the job to a conversation
        #[arg(long)]
        conversation: Option<String>,
        /// Skip waiting for billed costs
        #[arg(long)]
        no_reconcile: bool,
        /// Write the job JSON here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Show one job
    Status {
        #[arg(long)]
        job_id: Uuid,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List recent jobs
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Show a conversation with its turns
    Conversation {
        #[arg(long)]
        id: String,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// List conversations with title, message count and cost
    Conversations {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = RuntimeSettings::from_env();

    match cli.command {
        Commands::Ask {
            query,
            config,
            db,
            conversation,
            no_reconcile,
            out,
        } => {
            let store = Arc::new(SqliteStore::new(db.unwrap_or(settings.db_path.clone()))?);
            let config: Arc<dyn ConfigProvider> = match config {
                Some(path) => Arc::new(JsonFileConfigProvider::new(path)),
                None => Arc::new(StaticConfigProvider(CouncilConfig::default())),
            };
            // Fail fast on a bad config file instead of failing the job.
            config.load()?;

            let gateway = ProviderGateway::with_config(
                OpenRouterAdapter::from_env()?,
                Arc::new(TracingUsageSink),
                GatewayConfig {
                    max_concurrent_calls: settings.max_concurrent_calls,
                },
            );

            let engine = CouncilEngine::builder(Arc::new(gateway), config, store.clone())
                .conversations(store)
                .workers(settings.workers)
                .reconcile_grace(settings.reconcile_grace)
                .reconcile(!no_reconcile)
                .build();

            let job_id = match conversation {
                Some(id) => engine.submit_in_conversation(query, id).await?,
                None => engine.submit(query).await?,
            };
            eprintln!("[council] job {job_id} submitted");

            let mut job = tokio::select! {
                job = engine.wait_for_terminal(job_id, POLL_INTERVAL) => job?,
                _ = tokio::signal::ctrl_c() => {
                    match engine.request_cancel(job_id).await? {
                        CancelOutcome::Accepted => {
                            eprintln!("[council] cancel requested; waiting for the current stage")
                        }
                        CancelOutcome::Rejected(reason) => {
                            eprintln!("[council] cancel rejected: {reason:?}")
                        }
                    }
                    engine.wait_for_terminal(job_id, POLL_INTERVAL).await?
                }
            };

            if job.status() == JobStatus::Completed && !no_reconcile {
                eprintln!("[council] waiting for billed costs...");
            }
            engine.wait_idle().await;
            job = engine.get_status(job_id).await?;

            let json = serde_json::to_string_pretty(&job)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("[council] job written to {}", path.display());
                }
                None => println!("{json}"),
            }

            if job.status() != JobStatus::Completed {
                eprintln!(
                    "[council] job {} {}: {}",
                    job_id,
                    job.status(),
                    job.error().unwrap_or_default()
                );
                std::process::exit(1);
            }
        }
        Commands::Status { job_id, db } => {
            let store = Arc::new(SqliteStore::new(db.unwrap_or(settings.db_path))?);
            let job = JobLifecycleManager::new(store).get(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Jobs { limit, db } => {
            let store = Arc::new(SqliteStore::new(db.unwrap_or(settings.db_path))?);
            let jobs = JobLifecycleManager::new(store).list(limit).await?;
            let rows: Vec<serde_json::Value> = jobs
                .iter()
                .map(|job| {
                    serde_json::json!({
                        "id": job.id,
                        "status": job.status(),
                        "created_at": job.created_at,
                        "query": job.query,
                        "total_cost_nanodollars": job.result().map(|r| r.total_cost()),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Conversation { id, db } => {
            let store = SqliteStore::new(db.unwrap_or(settings.db_path))?;
            match store.get_conversation(&id).await? {
                Some(conversation) => {
                    println!("{}", serde_json::to_string_pretty(&conversation)?)
                }
                None => return Err(format!("conversation {id} not found").into()),
            }
        }
        Commands::Conversations { limit, db } => {
            let store = SqliteStore::new(db.unwrap_or(settings.db_path))?;
            let rows = store.list_conversations(limit).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

//! # Text-to-MQL CLI (`mql`)
//!
//! Ask questions about a MongoDB database in plain English, or serve the
//! same workflow over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! mql --config ./config/mql.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mql serve` | Start the HTTP API |
//! | `mql ask "<question>"` | Run one question through the workflow |
//! | `mql collections` | List user collections |
//! | `mql schema <name>` | Show the inferred schema of a collection |
//!
//! ## Examples
//!
//! ```bash
//! # Ask against the configured MongoDB
//! mql ask "How many students are enrolled in total?"
//!
//! # Full response envelope as JSON
//! mql ask "List teachers with highest salaries" --json
//!
//! # Offline, against a fixtures file
//! mql --memory ./demos/school.json collections
//! ```

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use text_to_mql::catalog::SchemaCatalog;
use text_to_mql::config::{self, Config};
use text_to_mql::workflow::Workflow;
use text_to_mql::{db, llm, server};
use text_to_mql_core::models::{QueryRequest, ResponseEnvelope, StepStatus};

/// Text-to-MQL: natural-language questions answered with MongoDB
/// aggregation pipelines.
#[derive(Parser)]
#[command(
    name = "mql",
    about = "Text-to-MQL: natural-language questions answered with MongoDB aggregation pipelines",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/mql.toml`. A missing file means all defaults.
    #[arg(long, global = true, default_value = "./config/mql.toml")]
    config: PathBuf,

    /// Use an in-memory database loaded from a `{ collection: [documents] }`
    /// JSON file instead of MongoDB.
    #[arg(long, global = true)]
    memory: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Answer one question.
    Ask {
        /// The question, in plain language.
        question: String,

        /// Print the full response envelope as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List user collections.
    Collections,

    /// Show the inferred schema of one collection.
    Schema {
        /// Collection name.
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_logging(&cfg);

    let database = db::connect(&cfg, cli.memory.as_deref()).await?;

    match cli.command {
        Commands::Serve => {
            let provider = llm::create_provider(&cfg.llm)?;
            let workflow = Arc::new(Workflow::new(&cfg, database, provider));
            server::run_server(&cfg, workflow).await?;
        }
        Commands::Ask { question, json } => {
            let request = QueryRequest::new(question);
            if request.is_blank() {
                bail!("question must not be empty");
            }
            let provider = llm::create_provider(&cfg.llm)?;
            let workflow = Workflow::new(&cfg, database, provider);
            let envelope = workflow.run(&request).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&envelope)?);
            } else {
                print_envelope(&envelope);
            }
            if !envelope.success {
                std::process::exit(1);
            }
        }
        Commands::Collections => {
            let catalog = SchemaCatalog::new(database, &cfg.database);
            for stats in catalog.collection_stats().await? {
                println!("{}\t{}", stats.name, stats.document_count);
            }
        }
        Commands::Schema { name } => {
            let catalog = SchemaCatalog::new(database, &cfg.database);
            let schema = catalog.get_schema(&name).await?;
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over `[logging].level`. Logs go to stderr so `--json`
/// output stays clean.
fn init_logging(cfg: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_envelope(envelope: &ResponseEnvelope) {
    for step in &envelope.workflow_steps {
        let mark = match step.status {
            StepStatus::Success => "ok",
            StepStatus::Failed => "FAILED",
            StepStatus::Pending => "..",
        };
        match &step.detail {
            Some(detail) => println!("[{:>6}] {} ({})", mark, step.name, detail),
            None => println!("[{:>6}] {}", mark, step.name),
        }
    }
    if let Some(command) = &envelope.generated_command {
        println!("\n{}", command);
    }
    if let Some(answer) = &envelope.formatted_answer {
        println!("\n{}", answer);
    }
    if let Some(error) = &envelope.error {
        println!("\nerror: {}", error);
    }
}

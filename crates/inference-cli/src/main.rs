use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use inference_cli::{CliConfig, FsDocumentSource, HttpBackend, JsonFileRetriever};
use inference_coordination::config::FusionConfig;
use inference_coordination::{
    merge, ModelRegistry, Orchestrator, PriorityWeights, ProcessRequest, SearchQuery,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Core TOML config (overrides INFERENCE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Documents root (overrides INFERENCE_DOCUMENTS_ROOT)
    #[arg(long, global = true)]
    documents_root: Option<PathBuf>,

    /// Backend base URL (overrides INFERENCE_BACKEND_URL)
    #[arg(long, global = true)]
    backend_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run task types over one document and print results and errors
    Process {
        #[arg(long)]
        org: String,
        #[arg(long)]
        doc: String,
        /// Comma-separated task types, e.g. summary,risk
        #[arg(long, value_delimiter = ',', required = true)]
        tasks: Vec<String>,
        #[arg(long)]
        cost: Option<f64>,
        #[arg(long)]
        speed: Option<f64>,
        #[arg(long)]
        accuracy: Option<f64>,
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Question for qa tasks
        #[arg(long)]
        question: Option<String>,
    },
    /// Search through the orchestrator with ranked lists from JSON files
    Search {
        #[arg(long)]
        org: String,
        #[arg(long, default_value = "")]
        text: String,
        /// Comma-separated query embedding
        #[arg(long, value_delimiter = ',')]
        embedding: Vec<f32>,
        #[arg(long)]
        vector: PathBuf,
        #[arg(long)]
        keyword: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Fuse two ranked JSON lists with reciprocal rank fusion
    Fuse {
        #[arg(long)]
        vector: PathBuf,
        #[arg(long)]
        keyword: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Smoothing constant (defaults to the core config)
        #[arg(long)]
        k: Option<f64>,
    },
    /// Print the model catalog and circuit health
    Models,
}

fn weights(
    cost: Option<f64>,
    speed: Option<f64>,
    accuracy: Option<f64>,
) -> Result<PriorityWeights> {
    match (cost, speed, accuracy) {
        (None, None, None) => Ok(PriorityWeights::default()),
        (Some(c), Some(s), Some(a)) => {
            PriorityWeights::new(c, s, a).context("Invalid priority weights")
        }
        _ => bail!("--cost, --speed and --accuracy must be given together"),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to render output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut cli = CliConfig::default();
    if let Some(path) = args.config {
        cli.core_config = Some(path);
    }
    if let Some(root) = args.documents_root {
        cli.documents_root = root;
    }
    if let Some(url) = args.backend_url {
        cli.backend_url = url;
    }
    let core = cli.load_core()?;

    match args.command {
        Command::Process {
            org,
            doc,
            tasks,
            cost,
            speed,
            accuracy,
            deadline_secs,
            question,
        } => {
            let backend = HttpBackend::new(&cli.backend_url, cli.api_key(), cli.http_timeout)?;
            info!(
                backend = backend.endpoint(),
                root = %cli.documents_root.display(),
                "inference-cli: processing"
            );
            let orchestrator = Orchestrator::builder(core)
                .backend(Arc::new(backend))
                .documents(Arc::new(FsDocumentSource::new(&cli.documents_root)))
                .build()
                .context("Failed to build orchestrator")?;

            let mut request = ProcessRequest::new(org, doc, tasks)
                .with_weights(weights(cost, speed, accuracy)?);
            if let Some(secs) = deadline_secs {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            if let Some(question) = question {
                request = request.with_question(question);
            }

            let report = orchestrator.process_document_tasks(request).await?;
            print_json(&report)?;
        }
        Command::Search {
            org,
            text,
            embedding,
            vector,
            keyword,
            limit,
        } => {
            // Search needs no backend; the HTTP client is never called.
            let backend = HttpBackend::new(&cli.backend_url, None, cli.http_timeout)?;
            let orchestrator = Orchestrator::builder(core)
                .backend(Arc::new(backend))
                .documents(Arc::new(FsDocumentSource::new(&cli.documents_root)))
                .vector_retriever(Arc::new(JsonFileRetriever::new(vector)))
                .keyword_retriever(Arc::new(JsonFileRetriever::new(keyword)))
                .build()
                .context("Failed to build orchestrator")?;

            let response = orchestrator
                .search(&SearchQuery::new(org, embedding, text, limit))
                .await?;
            print_json(&response)?;
        }
        Command::Fuse {
            vector,
            keyword,
            limit,
            k,
        } => {
            let vector = JsonFileRetriever::new(vector).load().await?;
            let keyword = JsonFileRetriever::new(keyword).load().await?;
            let fusion = FusionConfig {
                k: k.unwrap_or(core.fusion.k),
                ..core.fusion
            };
            if fusion.k <= 0.0 || !fusion.k.is_finite() {
                bail!("--k must be a positive number");
            }
            let outcome = merge(&vector, &keyword, limit, &fusion);
            print_json(&outcome)?;
        }
        Command::Models => {
            let registry = ModelRegistry::from_config(&core.registry)?;
            print_json(&json!({
                "catalog": registry.catalog(),
                "health": registry.health_snapshot(),
            }))?;
        }
    }

    Ok(())
}

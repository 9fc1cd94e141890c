use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use notesrag::answer::AnswerEvent;
use notesrag::config::Config;
use notesrag::context::{AppContext, QueryRequest};
use notesrag::server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "notesrag", version, about = "Per-client notes assistant with cited, streamed answers")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Override `server.bind`
        #[arg(long)]
        bind: Option<String>,
    },
    /// Register a new client
    CreateClient { name: String },
    /// List known clients
    Clients,
    /// Store documents for a client (run `ingest` afterwards)
    Upload {
        client: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Index new and changed documents
    Ingest {
        client: String,
        /// Re-process every document
        #[arg(long)]
        force: bool,
    },
    /// Ask a question and stream the answer to stdout
    Ask {
        client: String,
        query: String,
        /// Restrict retrieval to these documents
        #[arg(long = "document")]
        documents: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // 1. Load config
    let config = Config::load(&cli.config)?;

    // 2. Build the context (catalog, indexes, providers)
    let ctx = Arc::new(AppContext::from_config(config)?);

    // 3. Dispatch
    let result = run(ctx.clone(), cli.command).await;
    ctx.shutdown().context("failed to flush indexes")?;
    result
}

async fn run(ctx: Arc<AppContext>, command: Command) -> Result<()> {
    match command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| ctx.config.server.bind.clone());
            server::serve(ctx, &bind).await?;
        }
        Command::CreateClient { name } => {
            let client = ctx.registry.create(&name)?;
            println!("{}", client.id);
        }
        Command::Clients => {
            for client in ctx.registry.list()? {
                let summary = ctx.registry.summary(&client.id)?;
                println!(
                    "{}\t{}\t{} documents ({} ingested), {} chunks",
                    client.id,
                    client.display_name,
                    summary.stats.documents,
                    summary.stats.ingested,
                    summary.stats.chunks
                );
            }
        }
        Command::Upload { client, files } => {
            for path in files {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("invalid file name: {}", path.display()))?;
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let record = ctx.registry.upload_document(&client, filename, &bytes)?;
                println!("{}\t{} bytes\t{:?}", record.filename, record.size_bytes, record.status);
            }
        }
        Command::Ingest { client, force } => {
            let report = ctx.ingest(&client, force).await?;
            for outcome in &report.outcomes {
                match &outcome.error {
                    Some(error) => println!("{}\t{:?}\t{error}", outcome.filename, outcome.status),
                    None => println!(
                        "{}\t{:?}\t{} chunks",
                        outcome.filename, outcome.status, outcome.chunks
                    ),
                }
            }
            info!(
                "Ingest finished: {} processed, {} skipped, {} failed",
                report.processed, report.skipped, report.failed
            );
        }
        Command::Ask {
            client,
            query,
            documents,
            top_k,
        } => {
            let request = QueryRequest {
                client_id: client,
                query,
                document_ids: (!documents.is_empty()).then_some(documents),
                history: Vec::new(),
                top_k,
                session_id: None,
            };
            ask(&ctx, &request).await?;
        }
    }
    Ok(())
}

async fn ask(ctx: &AppContext, request: &QueryRequest) -> Result<()> {
    use std::io::Write;

    let mut stream = ctx.ask(request).await?;
    let mut sources = Vec::new();
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        match event {
            AnswerEvent::Metadata { sources: s } => sources = s,
            AnswerEvent::Content { content } => {
                print!("{content}");
                stdout.flush()?;
            }
            AnswerEvent::Done => println!(),
            AnswerEvent::Error { content } => bail!("{content}"),
        }
    }

    if !sources.is_empty() {
        println!("\nSources:");
        for (n, source) in sources.iter().enumerate() {
            println!("  [{}] {} ({}, score {:.3})", n + 1, source.filename, source.chunk_id, source.score);
        }
    }
    Ok(())
}

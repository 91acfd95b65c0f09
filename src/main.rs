/*!
 * Cumulus CLI - Command Line Interface
 *
 * `fetch` downloads a file from a pre-resolved ticket (one URL, or six for
 * CloudRAID) and `plan` prints the chunk plan for a file size.
 */

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cumulus::{
    cli_progress::{format_bytes, ProgressRenderer},
    config::EngineConfig,
    error::{TransferError, EXIT_FATAL, EXIT_SUCCESS},
    logging,
    transfer::plan::plan_chunks,
    transfer::{JsonDirResumeStore, ResumeStore},
    Artifact, DownloadRequest, DownloadTarget, FileKey, ReqwestTransport, Scheduler,
    StaticTicketApi,
};

#[derive(Parser)]
#[command(name = "cumulus")]
#[command(version, about = "Chunked, encrypted cloud-storage transfers", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Write JSON logs to this file instead of stderr
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file from a ticket
    Fetch(FetchArgs),

    /// Print the chunk plan for a file of the given size
    Plan {
        /// File size in bytes
        #[arg(long)]
        size: u64,
    },
}

#[derive(Args)]
struct FetchArgs {
    /// JSON ticket: {"size": N, "urls": [...], "name": "..."}
    #[arg(long, value_name = "FILE")]
    ticket: PathBuf,

    /// File key, base64url
    #[arg(long)]
    key: String,

    /// Destination path
    #[arg(short = 'o', long = "out", value_name = "PATH")]
    out: PathBuf,

    /// Identity used for resume records (defaults to the destination path)
    #[arg(long)]
    handle: Option<String>,

    /// Directory holding resume records
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Neither load nor save resume records
    #[arg(long)]
    no_resume: bool,

    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<TransferError>()
                .map_or(EXIT_FATAL, TransferError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    config.logging.verbose |= cli.verbose;
    if cli.log.is_some() {
        config.logging.log_file = cli.log.clone();
    }
    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Plan { size } => {
            print_plan(size, &config);
            Ok(())
        }
        Commands::Fetch(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting async runtime")?;
            runtime.block_on(fetch(args, config))
        }
    }
}

fn print_plan(size: u64, config: &EngineConfig) {
    let plan = plan_chunks(size, &config.chunks);
    println!("{} in {} chunks", format_bytes(size), plan.len());
    for (index, chunk) in plan.iter().enumerate() {
        println!(
            "{:>5}  {:>14}  {:>14}  {}",
            index,
            chunk.offset,
            chunk.end(),
            format_bytes(chunk.size)
        );
    }
}

async fn fetch(args: FetchArgs, config: EngineConfig) -> Result<()> {
    let ticket = tokio::fs::read_to_string(&args.ticket)
        .await
        .with_context(|| format!("reading ticket {}", args.ticket.display()))?;
    let api = StaticTicketApi::from_json(&ticket)?;
    let key = FileKey::from_base64(&args.key)?;
    let name = api.ticket().name.clone();

    let http = ReqwestTransport::new(Duration::from_secs(30), config.timeouts.chunk_request())
        .context("building HTTP client")?;
    let resume: Option<Arc<dyn ResumeStore>> = if args.no_resume {
        None
    } else {
        let dir = args
            .state_dir
            .clone()
            .unwrap_or_else(EngineConfig::default_state_dir);
        Some(Arc::new(JsonDirResumeStore::new(dir)?))
    };

    let (scheduler, mut events) = Scheduler::new(config, Arc::new(http), Arc::new(api), resume)?;
    let handle = scheduler.downloads().enqueue(DownloadRequest {
        handle: args
            .handle
            .clone()
            .unwrap_or_else(|| args.out.display().to_string()),
        key,
        target: DownloadTarget::File(args.out.clone()),
        name,
    });

    let mut renderer = ProgressRenderer::new(!args.no_progress);
    let wait = handle.wait();
    tokio::pin!(wait);
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            Some(event) = events.recv() => renderer.handle(event),
        }
    };
    for event in events.drain() {
        renderer.handle(event);
    }

    let summary = result?;
    if let Artifact::File(path) = &summary.artifact {
        println!(
            "Saved {} ({}) in {:.2}s",
            path.display(),
            format_bytes(summary.size),
            summary.elapsed.as_secs_f64()
        );
    }
    Ok(())
}

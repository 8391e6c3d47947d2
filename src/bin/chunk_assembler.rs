use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::thread;

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use chunk_assembler::assembler::{Assembler, ChunkOutcome};
use chunk_assembler::config::{ConfigLoader, ResolvedConfig};
use chunk_assembler::domain::{ChunkRequest, FileId, FileName};
use chunk_assembler::error::AssemblerError;
use chunk_assembler::output::{FragmentsResult, JsonOutput, SweepResult, UploadReport};
use chunk_assembler::store::{ChunkStore, FsChunkStore};

#[derive(Parser)]
#[command(name = "chunk-assembler")]
#[command(about = "Assemble resumable chunked uploads into durable files")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Submit one chunk from a file or stdin")]
    Put(PutArgs),
    #[command(about = "Split a local file and submit its chunks concurrently")]
    Upload(UploadArgs),
    #[command(about = "List fragments stored for an upload")]
    Fragments(FragmentsArgs),
    #[command(about = "Reclaim chunk storage idle longer than the configured window")]
    Sweep,
}

#[derive(Args)]
struct PutArgs {
    #[arg(long)]
    file_id: String,

    #[arg(long)]
    file_name: String,

    #[arg(long)]
    index: u32,

    #[arg(long)]
    total: u32,

    /// Reads the chunk from stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
}

#[derive(Args)]
struct UploadArgs {
    path: PathBuf,

    #[arg(long, default_value_t = 1024 * 1024)]
    chunk_size: usize,

    #[arg(long)]
    file_id: Option<String>,

    #[arg(long)]
    file_name: Option<String>,

    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[derive(Args)]
struct FragmentsArgs {
    file_id: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<AssemblerError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &AssemblerError) -> u8 {
    match error {
        err if err.is_client_error() => 2,
        AssemblerError::IoFatal { .. } | AssemblerError::MissingFragment { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Put(args) => run_put(args, &config),
        Commands::Upload(args) => run_upload(args, &config),
        Commands::Fragments(args) => run_fragments(args, &config),
        Commands::Sweep => run_sweep(&config),
    }
}

fn run_put(args: PutArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let assembler = Assembler::open(config)?;
    let request = ChunkRequest::parse(&args.file_id, &args.file_name, args.index, args.total)?;
    request.validate()?;

    // Each invocation is a new process; the fragments on disk are the only state.
    if let Some(outcome @ ChunkOutcome::Complete { .. }) =
        assembler.recover(&request.file_id, &request.file_name, request.total_chunks)?
    {
        JsonOutput::print_outcome(&outcome).into_diagnostic()?;
        return Ok(());
    }

    let outcome = match args.input {
        Some(path) => {
            let file = fs::File::open(&path)
                .map_err(|err| AssemblerError::Filesystem(format!("{}: {err}", path.display())))?;
            assembler.accept_chunk(&request, file)?
        }
        None => assembler.accept_chunk(&request, io::stdin().lock())?,
    };
    JsonOutput::print_outcome(&outcome).into_diagnostic()?;
    Ok(())
}

fn run_upload(args: UploadArgs, config: &ResolvedConfig) -> miette::Result<()> {
    if args.chunk_size == 0 {
        return Err(AssemblerError::InvalidChunk("chunk size must be positive".to_string()).into());
    }
    let content = fs::read(&args.path)
        .map_err(|err| AssemblerError::Filesystem(format!("{}: {err}", args.path.display())))?;
    if content.is_empty() {
        return Err(AssemblerError::InvalidChunk("refusing to upload an empty file".to_string()).into());
    }

    let file_name: FileName = match &args.file_name {
        Some(name) => name.parse()?,
        None => args.path.to_string_lossy().parse()?,
    };
    let file_id: FileId = match &args.file_id {
        Some(id) => id.parse()?,
        None => default_file_id(&file_name).parse()?,
    };

    let chunks = content.chunks(args.chunk_size).collect::<Vec<_>>();
    let total = u32::try_from(chunks.len())
        .map_err(|_| AssemblerError::InvalidChunk("too many chunks".to_string()))?;

    // Popped from the back, so indices go out in descending order.
    let queue = Mutex::new((0..total).collect::<Vec<_>>());
    let outcomes = Mutex::new(Vec::new());
    let assembler = Assembler::open(config)?;

    thread::scope(|scope| -> Result<(), AssemblerError> {
        let workers = (0..args.workers.max(1))
            .map(|_| {
                scope.spawn(|| -> Result<(), AssemblerError> {
                    loop {
                        let Some(index) = queue
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .pop()
                        else {
                            return Ok(());
                        };
                        let request = ChunkRequest {
                            file_id: file_id.clone(),
                            file_name: file_name.clone(),
                            chunk_index: index,
                            total_chunks: total,
                        };
                        let outcome = assembler.accept_chunk(&request, chunks[index as usize])?;
                        outcomes
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .push(outcome);
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker
                .join()
                .map_err(|_| AssemblerError::Filesystem("upload worker panicked".to_string()))??;
        }
        Ok(())
    })?;

    let report = UploadReport {
        file_id: file_id.to_string(),
        chunk_size: args.chunk_size,
        outcomes: outcomes
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner),
        session: assembler.status(&file_id).ok(),
    };
    JsonOutput::print_upload(&report).into_diagnostic()?;
    Ok(())
}

fn run_fragments(args: FragmentsArgs, config: &ResolvedConfig) -> miette::Result<()> {
    let file_id: FileId = args.file_id.parse()?;
    let store = FsChunkStore::new(config.temp_root.clone());
    let indices = store
        .list(&file_id)
        .map_err(|err| AssemblerError::Filesystem(err.to_string()))?;
    JsonOutput::print_fragments(&FragmentsResult {
        file_id: file_id.to_string(),
        indices: indices.into_iter().collect(),
    })
    .into_diagnostic()?;
    Ok(())
}

fn run_sweep(config: &ResolvedConfig) -> miette::Result<()> {
    let store = FsChunkStore::new(config.temp_root.clone());
    let stale = store
        .stale_namespaces(config.idle_timeout)
        .map_err(|err| AssemblerError::Filesystem(err.to_string()))?;
    let mut reclaimed = Vec::new();
    for file_id in stale {
        match store.cleanup(&file_id) {
            Ok(()) => reclaimed.push(file_id.to_string()),
            Err(err) => tracing::warn!(%file_id, error = %err, "failed to reclaim chunk storage"),
        }
    }
    JsonOutput::print_sweep(&SweepResult { reclaimed }).into_diagnostic()?;
    Ok(())
}

fn default_file_id(file_name: &FileName) -> String {
    let stem = file_name
        .as_str()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .take(96)
        .collect::<String>();
    format!("{stem}-{}", Utc::now().timestamp_millis())
}

mod output;

use anyhow::{Context, Result};
use blockgc_core::{
    Cid, Codec, DeletionResult, GcConfig, GcStats, GcStream, PinFilter, PinMode, Repo, RepoConfig,
    parse_key,
};
use clap::{Parser, Subcommand};
use futures::{StreamExt, TryStreamExt};
use output::{
    BlockPutOutput, BlockStatOutput, CidOutput, FilesRootOutput, GcResultLine, GcSummaryOutput,
    InitOutput, OutputWriter, PinInfo, PinLsOutput, RefsOutput,
};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// blockgc - a content-addressed block repository with mark-and-sweep GC
#[derive(Parser)]
#[command(name = "blockgc")]
#[command(about = "Content-addressed block repository with garbage collection", long_about = None)]
#[command(version)]
struct Cli {
    /// Repository root directory (defaults to BLOCKGC_ROOT env var or ./blockgc-repo)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Emit JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new repository
    Init {
        /// Maximum concurrent deletes during gc
        #[arg(long)]
        gc_concurrency: Option<usize>,
    },

    /// Store and inspect raw blocks
    #[command(subcommand)]
    Block(BlockCommands),

    /// Manage pins
    #[command(subcommand)]
    Pin(PinCommands),

    /// Manage the MFS root
    #[command(subcommand)]
    Files(FilesCommands),

    /// List links of a block
    Refs {
        /// Block to list links of
        cid: String,

        /// Walk every reachable block, not just direct children
        #[arg(short, long)]
        recursive: bool,
    },

    /// Delete every block that is not pinned or reachable from the MFS root
    Gc {
        /// Report what would be deleted without deleting anything
        #[arg(long)]
        dry_run: bool,

        /// Print per-block errors as they happen
        #[arg(long)]
        stream_errors: bool,

        /// Print only CIDs, without the summary
        #[arg(short, long)]
        quiet: bool,
    },
}

#[derive(Subcommand)]
enum BlockCommands {
    /// Store a block from a file or stdin
    Put {
        /// Block codec
        #[arg(long, default_value = "raw")]
        codec: String,

        /// File to read (stdin when omitted)
        file: Option<PathBuf>,
    },

    /// Write a block's bytes to stdout
    Get {
        /// Block CID
        cid: String,
    },

    /// Show block metadata
    Stat {
        /// Block CID
        cid: String,
    },

    /// Delete an unpinned block
    Rm {
        /// Block CID
        cid: String,
    },
}

#[derive(Subcommand)]
enum PinCommands {
    /// Pin a block (recursively unless --direct)
    Add {
        /// Block CID
        cid: String,

        /// Pin only the block itself
        #[arg(long)]
        direct: bool,
    },

    /// Remove a pin
    Rm {
        /// Block CID
        cid: String,
    },

    /// List pins
    Ls {
        /// Pin type to list: all, recursive, direct or indirect
        #[arg(long = "type", default_value = "all")]
        pin_type: String,
    },
}

#[derive(Subcommand)]
enum FilesCommands {
    /// Show the MFS root
    Root,

    /// Point the MFS root at a stored block
    SetRoot {
        /// Block CID
        cid: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let output = OutputWriter::new(cli.json);

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
        .and_then(|runtime| runtime.block_on(run(cli, &output)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output.write_error(&e, 1);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, output: &OutputWriter) -> Result<()> {
    // Determine repo root: CLI arg > BLOCKGC_ROOT env var > ./blockgc-repo default
    let root = cli
        .root
        .or_else(|| std::env::var("BLOCKGC_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./blockgc-repo"));
    tracing::debug!(root = %root.display(), "using repository");

    match cli.command {
        Commands::Init { gc_concurrency } => cmd_init(&root, output, gc_concurrency),
        Commands::Block(cmd) => match cmd {
            BlockCommands::Put { codec, file } => cmd_block_put(&root, output, &codec, file).await,
            BlockCommands::Get { cid } => cmd_block_get(&root, output, &cid).await,
            BlockCommands::Stat { cid } => cmd_block_stat(&root, output, &cid).await,
            BlockCommands::Rm { cid } => cmd_block_rm(&root, output, &cid).await,
        },
        Commands::Pin(cmd) => match cmd {
            PinCommands::Add { cid, direct } => cmd_pin_add(&root, output, &cid, direct).await,
            PinCommands::Rm { cid } => cmd_pin_rm(&root, output, &cid).await,
            PinCommands::Ls { pin_type } => cmd_pin_ls(&root, output, &pin_type).await,
        },
        Commands::Files(cmd) => match cmd {
            FilesCommands::Root => cmd_files_root(&root, output).await,
            FilesCommands::SetRoot { cid } => cmd_files_set_root(&root, output, &cid).await,
        },
        Commands::Refs { cid, recursive } => cmd_refs(&root, output, &cid, recursive).await,
        Commands::Gc {
            dry_run,
            stream_errors,
            quiet,
        } => cmd_gc(&root, output, dry_run, stream_errors, quiet).await,
    }
}

fn open_repo(root: &Path) -> Result<Repo> {
    Repo::open(root).with_context(|| format!("Failed to open repository at {}", root.display()))
}

fn parse_cid(s: &str) -> Result<Cid> {
    parse_key(s).with_context(|| format!("Invalid CID: {}", s))
}

fn cmd_init(root: &Path, output: &OutputWriter, gc_concurrency: Option<usize>) -> Result<()> {
    let mut config = RepoConfig::default();
    if let Some(n) = gc_concurrency {
        anyhow::ensure!(n > 0, "--gc-concurrency must be positive");
        config.gc = config.gc.with_concurrency(n);
    }

    Repo::init(root, config)
        .with_context(|| format!("Failed to initialize repository at {}", root.display()))?;

    let data = InitOutput {
        success: true,
        result_code: 0,
        root: root.display().to_string(),
        algorithm: config.algorithm.as_str().to_string(),
        gc_concurrency: config.gc.concurrency,
    };
    output.write(&data, || {
        format!(
            "Initialized blockgc repository at {}\nAlgorithm: {}\n",
            root.display(),
            config.algorithm.as_str()
        )
    })
}

async fn cmd_block_put(
    root: &Path,
    output: &OutputWriter,
    codec: &str,
    file: Option<PathBuf>,
) -> Result<()> {
    let repo = open_repo(root)?;
    let codec = Codec::parse(codec)?;

    let data = match file {
        Some(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            if atty::is(atty::Stream::Stdin) {
                anyhow::bail!("No input: pass a FILE or pipe data on stdin");
            }
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let cid = repo
        .put_block(codec, &data)
        .await
        .context("Failed to store block")?;

    let out = BlockPutOutput {
        success: true,
        result_code: 0,
        cid: cid.to_string(),
        size: data.len(),
    };
    output.write(&out, || format!("{}\n", cid))
}

async fn cmd_block_get(root: &Path, output: &OutputWriter, cid: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_cid(cid)?;
    let data = repo
        .get_block(&cid)
        .await
        .with_context(|| format!("Failed to read block {}", cid))?;
    output.write_raw(&data)
}

async fn cmd_block_stat(root: &Path, output: &OutputWriter, cid: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_cid(cid)?;
    let data = repo
        .get_block(&cid)
        .await
        .with_context(|| format!("Failed to read block {}", cid))?;
    let codec = Codec::from_code(cid.codec())
        .map(|c| c.as_str().to_string())
        .unwrap_or_else(|_| format!("0x{:x}", cid.codec()));
    let pinned = repo.is_pinned(&cid).await?.map(|t| t.to_string());

    let out = BlockStatOutput {
        success: true,
        result_code: 0,
        cid: cid.to_string(),
        codec,
        size: data.len(),
        pinned,
    };
    output.write(&out, || {
        let mut text = format!("CID: {}\nCodec: {}\nSize: {} bytes\n", out.cid, out.codec, out.size);
        if let Some(pin_type) = &out.pinned {
            text.push_str(&format!("Pinned: {}\n", pin_type));
        }
        text
    })
}

async fn cmd_block_rm(root: &Path, output: &OutputWriter, cid: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_cid(cid)?;
    repo.remove_block(&cid)
        .await
        .with_context(|| format!("Failed to remove block {}", cid))?;
    output.write(&CidOutput::new(cid), || format!("removed {}\n", cid))
}

async fn cmd_pin_add(root: &Path, output: &OutputWriter, cid: &str, direct: bool) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_cid(cid)?;
    let mode = if direct {
        PinMode::Direct
    } else {
        PinMode::Recursive
    };
    repo.pin_add(&cid, mode)
        .await
        .with_context(|| format!("Failed to pin {}", cid))?;
    output.write(&CidOutput::new(cid), || format!("pinned {}\n", cid))
}

async fn cmd_pin_rm(root: &Path, output: &OutputWriter, cid: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_cid(cid)?;
    repo.pin_rm(&cid)
        .await
        .with_context(|| format!("Failed to unpin {}", cid))?;
    output.write(&CidOutput::new(cid), || format!("unpinned {}\n", cid))
}

async fn cmd_pin_ls(root: &Path, output: &OutputWriter, pin_type: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let filter = PinFilter::parse(pin_type)?;
    let pins: Vec<PinInfo> = repo
        .pins(filter)
        .map_ok(|pin| PinInfo::from(&pin))
        .try_collect()
        .await
        .context("Failed to list pins")?;

    let out = PinLsOutput {
        success: true,
        result_code: 0,
        pins,
    };
    output.write(&out, || {
        out.pins
            .iter()
            .map(|p| format!("{} {}\n", p.cid, p.pin_type))
            .collect()
    })
}

async fn cmd_files_root(root: &Path, output: &OutputWriter) -> Result<()> {
    let repo = open_repo(root)?;
    let files_root = repo
        .files_root()
        .await
        .context("Failed to read MFS root")?
        .map(|cid| cid.to_string());

    let out = FilesRootOutput {
        success: true,
        result_code: 0,
        root: files_root,
    };
    output.write(&out, || match &out.root {
        Some(cid) => format!("{}\n", cid),
        None => "No MFS root (use 'blockgc files set-root' to set one)\n".to_string(),
    })
}

async fn cmd_files_set_root(root: &Path, output: &OutputWriter, cid: &str) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_cid(cid)?;
    repo.set_files_root(&cid)
        .await
        .with_context(|| format!("Failed to set MFS root to {}", cid))?;
    output.write(&CidOutput::new(cid), || format!("MFS root set to {}\n", cid))
}

async fn cmd_refs(root: &Path, output: &OutputWriter, cid: &str, recursive: bool) -> Result<()> {
    let repo = open_repo(root)?;
    let cid = parse_cid(cid)?;
    let refs: Vec<String> = repo
        .refs(cid, recursive)
        .map_ok(|c| c.to_string())
        .try_collect()
        .await
        .with_context(|| format!("Failed to walk links of {}", cid))?;

    let out = RefsOutput {
        success: true,
        result_code: 0,
        refs,
    };
    output.write(&out, || out.refs.iter().map(|r| format!("{}\n", r)).collect())
}

/// Emit streamed gc results, then wait for the run to end.
///
/// The run is finished even when emitting fails, so the sweep winds down
/// and logs its summary before the write error is returned.
async fn drain_gc(
    mut results: GcStream,
    stream_errors: bool,
    mut emit: impl FnMut(&GcResultLine) -> Result<()>,
) -> Result<(GcStats, u64)> {
    let mut errors = 0u64;
    let mut written = Ok(());
    while let Some(result) = results.next().await {
        let line = GcResultLine::from(&result);
        let show = match result {
            DeletionResult::Deleted { .. } => true,
            _ => {
                errors += 1;
                stream_errors
            }
        };
        if show {
            written = emit(&line);
            if written.is_err() {
                break;
            }
        }
    }

    let stats = results.finish().await?;
    written.context("Failed to write gc results")?;
    Ok((stats, errors))
}

async fn cmd_gc(
    root: &Path,
    output: &OutputWriter,
    dry_run: bool,
    stream_errors: bool,
    quiet: bool,
) -> Result<()> {
    let repo = open_repo(root)?;
    let config: GcConfig = repo.config().gc.with_env_overrides().with_dry_run(dry_run);

    let results = repo
        .gc_with(config)
        .await
        .context("Garbage collection aborted")?;

    let (stats, errors) = drain_gc(results, stream_errors, |line| {
        output.write_line(line, || line.text(quiet))
    })
    .await?;

    if !quiet {
        let summary = GcSummaryOutput::from(stats);
        output.write_line(&summary, || summary.text())?;
    }

    if errors > 0 {
        if stream_errors {
            anyhow::bail!("Encountered {} errors during gc", errors);
        }
        anyhow::bail!(
            "Encountered {} errors during gc (use --stream-errors to see them)",
            errors
        );
    }

    Ok(())
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use filemux::{
    FileManager, OpResult,
    config::{self, ManagerConfig},
    core::{
        ConflictPolicy, CreateOptions, DeleteOptions, ListOptions, TransferOptions, WriteOptions,
    },
    observability::{init_logging, shutdown_logging},
    service::setup_shutdown_handler,
};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Level used when neither a config file nor --log-level is given
const CLI_LOG_LEVEL: &str = "warn";

#[derive(Parser, Debug)]
#[command(name = "filemux", version, about = "Copy, move and inspect files across backends")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the configured log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Print the full result as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy files or directory trees
    Copy {
        source: String,
        target: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Move files or directory trees
    Move {
        source: String,
        target: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Delete files or directory trees
    Delete {
        target: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Create files, or directories with a trailing slash or --directory
    Create {
        target: String,
        #[arg(short, long)]
        directory: bool,
        #[arg(short, long)]
        parents: bool,
    },
    /// Show entry metadata
    Info { target: String },
    /// List directory contents
    List {
        target: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Expand wildcards without touching the matches
    Resolve { pattern: String },
    /// Write file contents to stdout
    Cat { source: String },
    /// Write stdin to every target
    Put {
        target: String,
        #[arg(short, long)]
        append: bool,
        #[arg(short, long)]
        parents: bool,
    },
    /// Print an example configuration file
    ExampleConfig,
}

#[derive(Args, Debug)]
struct TransferArgs {
    /// Descend into directories
    #[arg(short, long)]
    recursive: bool,

    /// Create missing parent directories of the target
    #[arg(short, long)]
    parents: bool,

    /// Fail instead of replacing existing files
    #[arg(long, conflicts_with = "update")]
    no_overwrite: bool,

    /// Replace existing files only when the source is newer
    #[arg(short, long)]
    update: bool,
}

impl From<TransferArgs> for TransferOptions {
    fn from(args: TransferArgs) -> Self {
        let conflict = if args.no_overwrite {
            ConflictPolicy::NoOverwrite
        } else if args.update {
            ConflictPolicy::Update
        } else {
            ConflictPolicy::Overwrite
        };
        TransferOptions {
            recursive: args.recursive,
            make_parents: args.parents,
            conflict,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    if let Command::ExampleConfig = cli.command {
        println!("{}", config::example_config());
        return Ok(ExitCode::SUCCESS);
    }

    let mut config = match &cli.config {
        Some(path) => config::load(path)
            .await
            .context("Failed to load configuration")?,
        None => ManagerConfig {
            log_level: CLI_LOG_LEVEL.to_string(),
            ..ManagerConfig::default()
        },
    };
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    init_logging(
        &config.log_level,
        config.log_directory.as_deref(),
        config.log_rotation,
    )?;
    info!("filemux v{}", env!("CARGO_PKG_VERSION"));

    let manager = FileManager::from_config(&config).context("Failed to set up file manager")?;

    let cx = CancellationToken::new();
    setup_shutdown_handler(cx.clone());
    let maintenance = CancellationToken::new();
    let reaper = manager.spawn_reaper(maintenance.clone());

    let outcome = run(&manager, cli.command, cli.json, &cx).await;

    maintenance.cancel();
    if let Some(reaper) = reaper {
        let _ = reaper.await;
    }
    shutdown_logging();

    Ok(if outcome? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Run one command; `Ok(false)` means the operation reported failures.
async fn run(
    manager: &FileManager,
    command: Command,
    json: bool,
    cx: &CancellationToken,
) -> Result<bool> {
    debug!("Running {:?}", command);
    match command {
        Command::Copy {
            source,
            target,
            transfer,
        } => {
            let result = manager.copy(&source, &target, &transfer.into(), cx).await;
            report(&result, json, |_| None)
        }
        Command::Move {
            source,
            target,
            transfer,
        } => {
            let result = manager.move_to(&source, &target, &transfer.into(), cx).await;
            report(&result, json, |_| None)
        }
        Command::Delete { target, recursive } => {
            let result = manager
                .delete(&target, &DeleteOptions { recursive }, cx)
                .await;
            report(&result, json, |_| None)
        }
        Command::Create {
            target,
            directory,
            parents,
        } => {
            let opts = CreateOptions {
                directory,
                make_parents: parents,
                ..CreateOptions::default()
            };
            let result = manager.create(&target, &opts, cx).await;
            report(&result, json, |created| Some(created.redacted()))
        }
        Command::Info { target } => {
            let result = manager.info(&target, cx).await;
            report(&result, json, |info| match info {
                Some(info) => serde_json::to_string_pretty(info).ok(),
                None => Some(format!("{}: not found", target)),
            })
        }
        Command::List { target, recursive } => {
            let result = manager.list(&target, &ListOptions { recursive }, cx).await;
            report(&result, json, |entry| Some(entry.reference.redacted()))
        }
        Command::Resolve { pattern } => {
            let result = manager.resolve(&pattern, cx).await;
            report(&result, json, |matched| Some(matched.redacted()))
        }
        Command::Cat { source } => cat(manager, &source, cx).await,
        Command::Put {
            target,
            append,
            parents,
        } => {
            let opts = WriteOptions {
                append,
                make_parents: parents,
            };
            put(manager, &target, &opts, cx).await
        }
        Command::ExampleConfig => Ok(true),
    }
}

/// Print values (or the whole result as JSON) and every error.
fn report<T, F>(result: &OpResult<T>, json: bool, line: F) -> Result<bool>
where
    T: Serialize,
    F: Fn(&T) -> Option<String>,
{
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        result
            .values()
            .iter()
            .filter_map(line)
            .for_each(|text| println!("{}", text));
    }
    print_errors(result);
    Ok(result.success())
}

fn print_errors<T>(result: &OpResult<T>) {
    for error in result.errors() {
        eprintln!("error: {}", error);
    }
    if result.fail_count() > 0 {
        eprintln!(
            "{}: {} succeeded, {} failed",
            result.kind(),
            result.success_count(),
            result.fail_count()
        );
    }
}

async fn cat(manager: &FileManager, source: &str, cx: &CancellationToken) -> Result<bool> {
    let result = manager.get_input(source, cx).await;
    let mut stdout = tokio::io::stdout();
    print_errors(&result);
    let success = result.success();
    for mut input in result.into_values() {
        tokio::io::copy(&mut input.stream, &mut stdout)
            .await
            .with_context(|| format!("Failed to read {}", input.reference.redacted()))?;
    }
    stdout.flush().await?;
    Ok(success)
}

async fn put(
    manager: &FileManager,
    target: &str,
    opts: &WriteOptions,
    cx: &CancellationToken,
) -> Result<bool> {
    let mut data = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut data)
        .await
        .context("Failed to read stdin")?;

    let result = manager.get_output(target, opts, cx).await;
    print_errors(&result);
    let success = result.success();
    for mut output in result.into_values() {
        let shown = output.reference.redacted();
        output
            .stream
            .write_all(&data)
            .await
            .with_context(|| format!("Failed to write {}", shown))?;
        output
            .stream
            .shutdown()
            .await
            .with_context(|| format!("Failed to finish {}", shown))?;
    }
    Ok(success)
}

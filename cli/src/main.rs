mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    diff::DiffCommand, fsck::FsckCommand, gc::GcCommand, init::InitCommand, list::ListCommand,
    pack::{ExportCommand, ImportCommand},
    prune::PruneCommand, restore::RestoreCommand, snapshot::SnapshotCommand,
    verify::VerifyCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "timeclaw",
    version,
    about = "Deduplicated snapshots of an agent workspace",
    long_about = "TimeClaw takes content-addressed, deduplicated snapshots of a directory tree into a local destination, with retention, integrity checks and portable packs"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "TIMECLAW_CONFIG", help = "Config file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,

    #[arg(long, global = true, help = "Print results as JSON")]
    json: bool,

    #[arg(long, global = true, help = "Break a lock held by another command")]
    force_lock: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Initialize a destination and write a starter config")]
    Init(InitCommand),

    #[command(about = "Take a snapshot of the source root")]
    Snapshot(SnapshotCommand),

    #[command(about = "List snapshots")]
    List(ListCommand),

    #[command(about = "Re-hash a snapshot's objects")]
    Verify(VerifyCommand),

    #[command(about = "Restore a snapshot into a directory")]
    Restore(RestoreCommand),

    #[command(about = "Apply the retention policy")]
    Prune(PruneCommand),

    #[command(about = "Compare two snapshots")]
    Diff(DiffCommand),

    #[command(about = "Check every snapshot against the object store")]
    Fsck(FsckCommand),

    #[command(about = "Remove objects no snapshot references")]
    Gc(GcCommand),

    #[command(about = "Write a snapshot and its objects to a pack file")]
    Export(ExportCommand),

    #[command(about = "Import a pack file")]
    Import(ImportCommand),
}

/// Failure already reported on stdout; only the exit status remains.
#[derive(Debug, thiserror::Error)]
#[error("command failed with status {0}")]
pub struct Reported(pub u8);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    if let Err(err) = run(&cli).await {
        std::process::exit(report_error(&cli, &err));
    }
}

async fn run(cli: &Cli) -> Result<()> {
    debug!(json = cli.json, "starting timeclaw");
    match &cli.command {
        Commands::Init(cmd) => cmd.run(cli).await,
        Commands::Snapshot(cmd) => cmd.run(cli).await,
        Commands::List(cmd) => cmd.run(cli).await,
        Commands::Verify(cmd) => cmd.run(cli).await,
        Commands::Restore(cmd) => cmd.run(cli).await,
        Commands::Prune(cmd) => cmd.run(cli).await,
        Commands::Diff(cmd) => cmd.run(cli).await,
        Commands::Fsck(cmd) => cmd.run(cli).await,
        Commands::Gc(cmd) => cmd.run(cli).await,
        Commands::Export(cmd) => cmd.run(cli).await,
        Commands::Import(cmd) => cmd.run(cli).await,
    }
}

fn report_error(cli: &Cli, err: &anyhow::Error) -> i32 {
    if let Some(Reported(code)) = err.downcast_ref::<Reported>() {
        return i32::from(*code);
    }

    let core = err.downcast_ref::<timeclaw_core::Error>();
    let hint = core.and_then(|e| e.hint());
    let next = core.and_then(|e| e.next());

    if cli.json {
        let mut body = serde_json::json!({
            "ok": false,
            "error": {
                "code": core.map(|e| e.code()).unwrap_or("UNKNOWN"),
                "message": err.to_string(),
                "hint": hint,
                "next": next,
            }
        });
        if let Some(timeclaw_core::Error::FsckFailed { report }) = core {
            body["report"] = serde_json::to_value(report).unwrap_or_default();
        }
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
        if let Some(hint) = hint {
            eprintln!("Hint: {hint}");
        }
        if let Some(next) = next {
            eprintln!("Next: {next}");
        }
    }

    core.map(|e| i32::from(e.exit_code())).unwrap_or(1)
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "timeclaw={level},timeclaw_core={level},timeclaw_cli={level}"
        )))
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}

//! orbweave-dump: offline inspection of a cluster state directory.
//!
//! Prints every persisted control value (identities, term, vote, flushed
//! index, allocation windows, membership) without modifying anything. Run
//! it against a stopped node's state directory.

mod dump;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;

use crate::dump::Entry;

/// Dumps the control state of an orbweave node.
#[derive(Parser)]
#[command(name = "orbweave-dump", version, about)]
struct Args {
    /// Cluster state directory of the node.
    #[arg(short = 'd', long, env = "ORBWEAVE_STATE_DIR")]
    state_dir: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orbweave=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if !args.state_dir.is_dir() {
        eprintln!(
            "{}",
            format!("not a directory: {}", args.state_dir.display()).red()
        );
        return ExitCode::FAILURE;
    }

    println!("{}", args.state_dir.display().to_string().bold());
    let mut failed = false;
    for (kind, entry) in dump::collect(&args.state_dir) {
        failed |= matches!(entry, Entry::Error(_));
        println!("  {}", dump::format_entry(kind, &entry));
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

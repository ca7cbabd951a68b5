//! ulp CLI - コマンドラインインターフェース
//!
//! 実行中のプロセスにライブパッチを当て、取り消し、状態を確認するためのツール

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ulp_core::{PatchContainer, PatchError, PatchOptions, PatchRecord, RedirectionKind, Session};

/// ulp - Userspace live patching
#[derive(Parser)]
#[command(name = "ulp")]
#[command(version = "0.1.0")]
#[command(about = "Apply and revert binary patches in running processes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: PatchCommand,

    /// How many times to re-check a busy target before giving up
    #[arg(long, global = true, default_value_t = 10)]
    retries: u32,

    /// How long to let the target run between checks
    #[arg(long = "retry-delay-ms", global = true, default_value_t = 20)]
    retry_delay_ms: u64,

    /// Directory for per-process session locks
    #[arg(long, global = true)]
    lock_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum PatchCommand {
    /// Apply a patch container to a running process
    Apply {
        /// Process ID of the target
        pid: i32,

        /// Path to the patch container
        container: PathBuf,

        /// Label stored with the patch (defaults to the container file name)
        #[arg(long)]
        label: Option<String>,
    },

    /// Revert the most recent patch
    Revert {
        /// Process ID of the target
        pid: i32,

        /// Revert every applied patch, newest first
        #[arg(long)]
        all: bool,
    },

    /// List the patches applied to a process
    Status {
        /// Process ID of the target
        pid: i32,
    },

    /// List the modules loaded in a process
    Modules {
        /// Process ID of the target
        pid: i32,

        /// Also list symbols matching this pattern
        #[arg(long)]
        symbols: Option<String>,
    },

    /// Show the contents of a patch container
    Inspect {
        /// Path to the patch container
        container: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.chain().find_map(|c| c.downcast_ref::<PatchError>()) {
                Some(patch_error) => eprintln!("error[{}]: {:#}", patch_error.code(), e),
                None => eprintln!("error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

/// ログ出力を初期化する（RUST_LOG が設定されていればそちらを優先）
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

fn options(cli: &Cli) -> PatchOptions {
    let mut options = PatchOptions::default()
        .with_retries(cli.retries, Duration::from_millis(cli.retry_delay_ms));
    if let Some(dir) = &cli.lock_dir {
        options = options.with_lock_dir(dir);
    }
    options
}

fn run(cli: Cli) -> Result<()> {
    let options = options(&cli);
    tracing::debug!(?options, "session options");
    match cli.command {
        PatchCommand::Apply {
            pid,
            container,
            label,
        } => handle_apply(pid, &container, label, options),
        PatchCommand::Revert { pid, all } => handle_revert(pid, all, options),
        PatchCommand::Status { pid } => handle_status(pid, options),
        PatchCommand::Modules { pid, symbols } => handle_modules(pid, symbols.as_deref(), options),
        PatchCommand::Inspect { container } => handle_inspect(&container),
    }
}

/// Applyコマンドを処理する
fn handle_apply(pid: i32, path: &Path, label: Option<String>, options: PatchOptions) -> Result<()> {
    let container = PatchContainer::load(path)
        .with_context(|| format!("cannot read patch container {}", path.display()))?;
    let label = label.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "patch".to_string())
    });

    let mut session = Session::open(pid, options)?;
    let record = session.apply(&container, &label)?;
    session.close()?;

    println!(
        "Applied patch #{} ({}) to process {}: {} redirection(s)",
        record.sequence,
        record.label,
        pid,
        record.log.len()
    );
    println!(
        "Replacement code at 0x{:x}..0x{:x}",
        record.code_start, record.code_end
    );
    Ok(())
}

/// Revertコマンドを処理する
fn handle_revert(pid: i32, all: bool, options: PatchOptions) -> Result<()> {
    let mut session = Session::open(pid, options)?;
    let reverted = session.revert(all)?;
    session.close()?;

    for record in &reverted {
        println!(
            "Reverted patch #{} ({}) in process {}",
            record.sequence, record.label, pid
        );
    }
    Ok(())
}

/// Statusコマンドを処理する
fn handle_status(pid: i32, options: PatchOptions) -> Result<()> {
    let session = Session::open(pid, options)?;
    let records = session.status()?;
    session.close()?;

    if records.is_empty() {
        println!("No patches applied to process {}", pid);
        return Ok(());
    }

    println!("Patches applied to process {} ({} found):", pid, records.len());
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &PatchRecord) {
    println!(
        "  #{} {} @ 0x{:x} (size: {})",
        record.sequence, record.label, record.region, record.region_len
    );
    for entry in record.log.records() {
        let kind = match entry.kind {
            RedirectionKind::Function => "function",
            RedirectionKind::Data => "data",
        };
        println!("      {} 0x{:x} ({} bytes)", kind, entry.address, entry.len());
    }
}

/// Modulesコマンドを処理する
fn handle_modules(pid: i32, pattern: Option<&str>, options: PatchOptions) -> Result<()> {
    let session = Session::open(pid, options)?;
    let catalog = session.catalog().clone();
    session.close()?;

    println!("Modules loaded in process {} ({} found):", pid, catalog.modules().len());
    for module in catalog.modules() {
        let build_id = module
            .build_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        let stale = if module.stale { " (stale on disk)" } else { "" };
        println!(
            "  {} bias 0x{:x} build-id {}{}",
            module.path.display(),
            module.bias,
            build_id,
            stale
        );

        let Some(pattern) = pattern else { continue };
        let symbols = module.symbols.find_symbols(pattern);
        const LIMIT: usize = 20;
        for sym in symbols.iter().take(LIMIT) {
            let address = sym.address.wrapping_add(module.bias);
            if sym.size > 0 {
                println!("      {} @ 0x{:x} (size: {})", sym.display_name(), address, sym.size);
            } else {
                println!("      {} @ 0x{:x}", sym.display_name(), address);
            }
        }
        if symbols.len() > LIMIT {
            println!("      ... and {} more", symbols.len() - LIMIT);
        }
    }
    Ok(())
}

/// Inspectコマンドを処理する
fn handle_inspect(path: &Path) -> Result<()> {
    let container = PatchContainer::load(path)
        .with_context(|| format!("cannot read patch container {}", path.display()))?;

    println!("Dependencies:");
    for (module, build_id) in container.dependencies() {
        println!("  {} build-id {}", module, build_id);
    }

    println!("Redirections ({} found):", container.redirections().len());
    for (i, r) in container.redirections().iter().enumerate() {
        match r.kind {
            RedirectionKind::Function => println!(
                "  {}. function {}!{} ({} bytes of code)",
                i + 1,
                r.module,
                r.symbol,
                r.payload.len()
            ),
            RedirectionKind::Data => println!(
                "  {}. data {}!{} = {}",
                i + 1,
                r.module,
                r.symbol,
                hex(&r.payload)
            ),
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_with_globals() {
        let cli = Cli::try_parse_from([
            "ulp", "apply", "1234", "fix.ulp", "--label", "hotfix", "--retries", "3", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.retries, 3);
        assert_eq!(cli.verbose, 2);
        let opts = options(&cli);
        assert_eq!(opts.quiesce_retries, 3);
        assert_eq!(opts.retry_delay, Duration::from_millis(20));
        match cli.command {
            PatchCommand::Apply { pid, label, .. } => {
                assert_eq!(pid, 1234);
                assert_eq!(label.as_deref(), Some("hotfix"));
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_parse_revert_all() {
        let cli = Cli::try_parse_from(["ulp", "revert", "99", "--all", "--lock-dir", "/run/ulp"]).unwrap();
        assert!(matches!(cli.command, PatchCommand::Revert { pid: 99, all: true }));
        assert_eq!(options(&cli).lock_dir, PathBuf::from("/run/ulp"));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0x2a, 0xff]), "002aff");
    }
}

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

use vault_shuffle::config::{MigrationConfig, RegionConfig};
use vault_shuffle::events::ConsoleSink;
use vault_shuffle::logging::{self, LogFormat, LogLevel};
use vault_shuffle::pipeline::{CopyOptions, Pipeline};
use vault_shuffle::provider::AwsCliProvider;
use vault_shuffle::report::{self, OutputFormat};
use vault_shuffle::workspace::{self, Workspace};
use vault_shuffle::{Error, Result};

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a migration config TOML
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Plan and report without starting copy jobs or writing state
    #[arg(long, global = true)]
    dry_run: bool,
    /// DEBUG, INFO, WARNING or ERROR (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "INFO")]
    log_level: LogLevel,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Inventory vaults and recovery points
    List {
        /// Account to scan (defaults to source_account from --config)
        #[arg(long)]
        account: Option<String>,
        /// Comma-separated regions (defaults to regions from --config)
        #[arg(long)]
        regions: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
    /// Scan source and destination and print the copy plan
    Plan,
    /// Plan, then copy missing recovery points, resuming from the checkpoint
    Copy {
        /// Max copy jobs in flight (overrides concurrency_limit)
        #[arg(long)]
        concurrency: Option<usize>,
        /// Retries per task after the first attempt (overrides max_retries)
        #[arg(long)]
        max_retries: Option<u32>,
        /// Ignore and discard checkpointed progress
        #[arg(long)]
        fresh: bool,
        /// Verify copies once the run finishes
        #[arg(long)]
        verify: bool,
    },
    /// Check that copies recorded as SUCCEEDED landed intact
    Verify,
    /// Print checkpointed task progress
    Status,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = logging::init(args.log_level, args.log_format) {
        eprintln!("warning: {e}");
    }
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("error: {e}");
            if e.is_config() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::from(EXIT_FAILED)
            }
        }
    }
}

fn exit_if(failed: bool) -> ExitCode {
    if failed {
        ExitCode::from(EXIT_FAILED)
    } else {
        ExitCode::SUCCESS
    }
}

fn load_config(path: Option<&Path>, dry_run: bool) -> Result<(PathBuf, MigrationConfig)> {
    let (base, mut cfg) = match path {
        Some(p) => {
            let (doc, cfg) = MigrationConfig::load(p)?;
            (doc.base_dir(), cfg)
        }
        None => (PathBuf::from("."), MigrationConfig::default()),
    };
    cfg.dry_run |= dry_run;
    Ok((base, cfg))
}

fn install_interrupt_handler(lock_path: PathBuf) -> Result<Arc<AtomicBool>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            // `exit` skips the lock guard's destructor.
            workspace::release_if_owned(&lock_path);
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
        eprintln!("interrupt received: finishing current polls and saving the checkpoint (again to abort)");
    })
    .map_err(|e| Error::msg(format!("failed to install interrupt handler: {e}")))?;
    Ok(cancel)
}

fn list_scope(
    cfg: &MigrationConfig,
    account: Option<&str>,
    regions: Option<&str>,
) -> Result<RegionConfig> {
    let account = account
        .map(str::to_string)
        .or_else(|| (!cfg.source_account.trim().is_empty()).then(|| cfg.source_account.clone()))
        .ok_or_else(|| Error::config("list needs --account (or source_account in --config)"))?;
    match regions {
        Some(r) => RegionConfig::from_cli(&account, r),
        None if !cfg.regions.is_empty() => RegionConfig::new([account], cfg.regions.clone()),
        None => Err(Error::config(
            "list needs --regions (or regions in --config)",
        )),
    }
}

fn run(args: Args) -> Result<ExitCode> {
    let (base, mut cfg) = load_config(args.config.as_deref(), args.dry_run)?;
    if let Command::Copy {
        concurrency,
        max_retries,
        ..
    } = &args.cmd
    {
        if let Some(n) = concurrency {
            cfg.concurrency_limit = *n;
        }
        if let Some(n) = max_retries {
            cfg.max_retries = *n;
        }
    }

    let workspace = Workspace::resolve(&base, &cfg.state_dir)?;
    let provider = Arc::new(AwsCliProvider::new(cfg.aws.clone()));
    let cancel = install_interrupt_handler(workspace.lock_path())?;
    let needs_config = !matches!(args.cmd, Command::List { .. });
    if needs_config && args.config.is_none() {
        return Err(Error::config("--config is required for this command"));
    }

    let pipeline = Pipeline::new(cfg, provider, workspace)
        .with_sink(Arc::new(ConsoleSink::default()))
        .with_cancel(Arc::clone(&cancel));

    match args.cmd {
        Command::List {
            account,
            regions,
            output,
        } => {
            let scope = list_scope(pipeline.config(), account.as_deref(), regions.as_deref())?;
            let snap = pipeline.list(&scope);
            print!("{}", report::inventory(&snap, output)?);
            Ok(exit_if(!snap.is_complete()))
        }
        Command::Plan => {
            let planned = pipeline.plan()?;
            print!("{}", report::plan(&planned.plan));
            Ok(exit_if(!planned.scans_complete()))
        }
        Command::Copy { fresh, verify, .. } => {
            let cfg = pipeline.config();
            if !cfg.dry_run
                && cfg
                    .aws
                    .copy_role_arn
                    .as_deref()
                    .is_none_or(|r| r.trim().is_empty())
            {
                return Err(Error::config(
                    "aws.copy_role_arn must be set to start copy jobs",
                ));
            }
            let outcome = pipeline.copy(CopyOptions { fresh, verify })?;
            print!(
                "{}",
                report::run_summary(&outcome.execution.summary, outcome.execution.interrupted)
            );
            if let Some(v) = &outcome.verification {
                print!("{}", report::verification(v));
            }
            if outcome.execution.interrupted {
                return Ok(ExitCode::from(EXIT_INTERRUPTED));
            }
            Ok(exit_if(!outcome.is_success()))
        }
        Command::Verify => {
            let r = pipeline.verify()?;
            print!("{}", report::verification(&r));
            Ok(exit_if(!r.is_clean()))
        }
        Command::Status => {
            let state = pipeline.status()?;
            print!("{}", report::status(&state));
            Ok(ExitCode::SUCCESS)
        }
    }
}

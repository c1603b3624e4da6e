//! # timelocker
//!
//! A backup orchestration layer on top of an external content-addressed
//! snapshot engine (restic-compatible): repository management, file
//! selection, encrypted credential storage, backup/restore orchestration,
//! and a security audit trail.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────┐
//!                    │   CLI (clap) │
//!                    └──────┬──────┘
//!                           │
//!                 ┌─────────┴──────────┐
//!                 │ IntegrationService │
//!                 └─────────┬──────────┘
//!              ┌────────────┼────────────┬─────────────┐
//!              ▼            ▼            ▼             ▼
//!         ┌────────┐  ┌─────────┐  ┌──────────┐  ┌───────────┐
//!         │ Backup │  │ Restore │  │ Snapshot │  │ Credential│
//!         │Orchestr│  │ Service │  │ Service  │  │   Store   │
//!         └───┬────┘  └────┬────┘  └────┬─────┘  └─────┬─────┘
//!             └────────────┴──────┬─────┴──────────────┘
//!                                  ▼
//!                          ┌──────────────┐
//!                          │  Repository  │
//!                          │ (engine exec)│
//!                          └──────────────┘
//! ```

mod backup;
mod command;
mod config;
mod credential;
mod crypto;
mod error;
mod hasher;
mod importer;
mod integration;
mod repository;
mod restore;
mod retention;
mod security;
mod selection;
mod snapshot;
mod status;

use clap::{Parser, Subcommand};
use integration::IntegrationService;
use restore::{ConflictResolution, RestoreOptions};
use retention::RetentionPolicy;
use std::path::{Path, PathBuf};

/// timelocker — backup orchestration on top of a content-addressed snapshot engine
#[derive(Parser, Debug)]
#[command(
    name = "timelocker",
    version,
    about = "Backup orchestration with encrypted credentials and audit logging 🔒",
    long_about = "timelocker manages repositories, file selection, and encrypted \
                  credentials around an external content-addressed snapshot engine, \
                  with retry-aware backup orchestration, selective restore, and a \
                  tamper-evident security audit trail."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the configuration document (overrides default search)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a new configuration document
    Init {
        /// Output path for the configuration document
        #[arg(short, long, default_value = "timelocker.json")]
        output: PathBuf,
    },

    /// Create the encrypted credential store (prompts for a master password)
    InitCredentials,

    /// Store a repository's snapshot-engine password in the credential store
    SetPassword {
        /// Repository name as configured
        repository: String,
    },

    /// Initialize a configured repository's storage with the snapshot engine
    InitRepository {
        /// Repository name as configured
        repository: String,
    },

    /// Run a backup for one or more configured targets
    Backup {
        /// Repository to back up into
        repository: String,

        /// Backup targets to include (all configured targets if omitted)
        #[arg(short, long)]
        target: Vec<String>,

        /// Tags to attach to the resulting snapshot
        #[arg(long)]
        tag: Vec<String>,

        /// Show what would be backed up without running the engine
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore files from a snapshot
    Restore {
        /// Repository to restore from
        repository: String,

        /// Snapshot ID or prefix to restore from (latest if omitted)
        #[arg(short, long)]
        snapshot: Option<String>,

        /// Target directory to restore into
        #[arg(short, long)]
        output: PathBuf,

        /// Only restore paths under these prefixes
        #[arg(short, long)]
        include: Vec<String>,

        /// Exclude paths under these prefixes
        #[arg(short, long)]
        exclude: Vec<String>,

        /// How to handle an existing target directory
        #[arg(long, value_enum, default_value = "overwrite")]
        on_conflict: ConflictArg,

        /// Skip post-restore verification
        #[arg(long)]
        no_verify: bool,

        /// Show what would be restored without writing any files
        #[arg(long)]
        dry_run: bool,
    },

    /// List snapshots in a repository
    List {
        /// Repository to list snapshots from
        repository: String,
    },

    /// Show differences between two snapshots
    Diff {
        /// Repository containing both snapshots
        repository: String,
        /// Older snapshot ID (or prefix)
        older: String,
        /// Newer snapshot ID (or prefix)
        newer: String,
    },

    /// Remove snapshots that fall outside a retention policy
    Prune {
        /// Repository to prune
        repository: String,

        /// Keep this many most recent snapshots regardless of age
        #[arg(long)]
        keep_last: Option<u32>,
        /// Keep one snapshot per day for this many days
        #[arg(long)]
        keep_daily: Option<u32>,
        /// Keep one snapshot per week for this many weeks
        #[arg(long)]
        keep_weekly: Option<u32>,
        /// Keep one snapshot per month for this many months
        #[arg(long)]
        keep_monthly: Option<u32>,

        /// Show what would be removed without deleting anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Verify the integrity of a repository or a specific snapshot
    Verify {
        /// Repository to verify
        repository: String,
        /// Snapshot ID or prefix to verify (whole repository if omitted)
        #[arg(short, long)]
        snapshot: Option<String>,
    },

    /// Import an existing Timeshift configuration as a repository + target
    ImportTimeshift {
        /// Path to timeshift.json (auto-detected if omitted)
        #[arg(long)]
        config_path: Option<PathBuf>,
        /// Name to give the imported repository
        #[arg(long, default_value = "timeshift")]
        repository: String,
        /// Name to give the imported backup target
        #[arg(long, default_value = "system")]
        target: String,
        /// Repository path to use if the backup device can't be auto-resolved
        #[arg(long)]
        repository_path: Option<String>,
    },

    /// Declare an emergency lockdown, blocking further operations
    Lockdown {
        /// Reason recorded in the audit trail
        reason: String,
    },

    /// Clear an active emergency lockdown
    ClearLockdown,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ConflictArg {
    Overwrite,
    Skip,
    Prompt,
    Rename,
}

impl From<ConflictArg> for ConflictResolution {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Overwrite => ConflictResolution::Overwrite,
            ConflictArg::Skip => ConflictResolution::Skip,
            ConflictArg::Prompt => ConflictResolution::Prompt,
            ConflictArg::Rename => ConflictResolution::Rename,
        }
    }
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{} {}", colored::Colorize::red("error:"), e);
            std::process::exit(integration::exit_code(&e));
        }
    }
}

fn run(cli: Cli) -> error::Result<()> {
    match &cli.command {
        Command::Init { output } => cmd_init(output),
        Command::InitCredentials => cmd_init_credentials(&cli),
        Command::SetPassword { repository } => cmd_set_password(&cli, repository),
        Command::InitRepository { repository } => cmd_init_repository(&cli, repository),
        Command::Backup { repository, target, tag, dry_run } => {
            cmd_backup(&cli, repository, target, tag.clone(), *dry_run)
        }
        Command::Restore { repository, snapshot, output, include, exclude, on_conflict, no_verify, dry_run } => {
            cmd_restore(&cli, repository, snapshot.as_deref(), output, include.clone(), exclude.clone(), *on_conflict, !*no_verify, *dry_run)
        }
        Command::List { repository } => cmd_list(&cli, repository),
        Command::Diff { repository, older, newer } => cmd_diff(&cli, repository, older, newer),
        Command::Prune { repository, keep_last, keep_daily, keep_weekly, keep_monthly, dry_run } => {
            cmd_prune(&cli, repository, *keep_last, *keep_daily, *keep_weekly, *keep_monthly, *dry_run)
        }
        Command::Verify { repository, snapshot } => cmd_verify(&cli, repository, snapshot.as_deref()),
        Command::ImportTimeshift { config_path, repository, target, repository_path } => {
            cmd_import_timeshift(&cli, config_path.as_deref(), repository, target, repository_path.as_deref())
        }
        Command::Lockdown { reason } => cmd_lockdown(&cli, reason),
        Command::ClearLockdown => cmd_clear_lockdown(&cli),
    }
}

// ─── Command Implementations ────────────────────────────────────────────────

fn cmd_init(output: &Path) -> error::Result<()> {
    config::init_config(output)?;
    eprintln!("{} Created configuration document: {}", colored::Colorize::green("✓"), output.display());
    eprintln!("  Edit it to add a repository and backup target, then run:");
    eprintln!("  {} timelocker init-credentials", colored::Colorize::bold("$"));
    Ok(())
}

fn cmd_init_credentials(cli: &Cli) -> error::Result<()> {
    let service = load_service(cli)?;
    let password = prompt_password("Master password: ")?;
    let confirm = prompt_password("Confirm master password: ")?;
    if password != confirm {
        return Err(anyhow::anyhow!("passwords did not match").into());
    }
    service.create_credential_store(&password)?;
    eprintln!("{} Credential store created", colored::Colorize::green("✓"));
    Ok(())
}

fn cmd_set_password(cli: &Cli, repository: &str) -> error::Result<()> {
    let service = load_service(cli)?;
    unlock(&service)?;
    let password = prompt_password("Repository password: ")?;
    service.store_repository_password(repository, &password)?;
    eprintln!("{} Stored password for repository '{repository}'", colored::Colorize::green("✓"));
    Ok(())
}

fn cmd_init_repository(cli: &Cli, repository: &str) -> error::Result<()> {
    let service = load_service(cli)?;
    // Unlocking is best-effort here: storing the password in the credential
    // store is optional, so a store that hasn't been created yet (or a user
    // who didn't export a master password) shouldn't block initializing the
    // repository itself.
    if let Ok(master_password) = std::env::var("TIMELOCKER_MASTER_PASSWORD") {
        let _ = service.unlock_credentials(&master_password);
    }
    let password = prompt_password("Repository password: ")?;
    service.initialize_repository(repository, &password)?;
    eprintln!("{} Initialized repository '{repository}'", colored::Colorize::green("✓"));
    Ok(())
}

fn cmd_backup(cli: &Cli, repository: &str, targets: &[String], tags: Vec<String>, dry_run: bool) -> error::Result<()> {
    let mut service = load_service(cli)?;
    unlock(&service)?;

    print_header("Backup");
    let target_names: Vec<String> = if targets.is_empty() {
        service.config().backup_targets.keys().cloned().collect()
    } else {
        targets.to_vec()
    };

    let result = service.run_backup(repository, &target_names, tags, dry_run)?;
    backup::print_backup_summary(&result);
    if result.status == backup::BackupStatus::Error {
        return Err(anyhow::anyhow!("backup completed with errors").into());
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_restore(
    cli: &Cli,
    repository: &str,
    snapshot: Option<&str>,
    output: &Path,
    include: Vec<String>,
    exclude: Vec<String>,
    on_conflict: ConflictArg,
    verify: bool,
    dry_run: bool,
) -> error::Result<()> {
    let mut service = load_service(cli)?;
    unlock(&service)?;

    print_header("Restore");
    let options = RestoreOptions::new()
        .with_target_path(output.to_path_buf())
        .with_include_paths(include)
        .with_exclude_paths(exclude)
        .with_conflict_resolution(on_conflict.into())
        .with_verification(verify)
        .with_dry_run(dry_run);

    let result = match snapshot {
        Some(id) => service.run_restore(repository, id, options)?,
        None => service.run_restore_latest(repository, options)?,
    };
    restore::print_restore_summary(&result);
    if !result.success {
        return Err(anyhow::anyhow!("restore completed with errors").into());
    }
    Ok(())
}

fn cmd_list(cli: &Cli, repository: &str) -> error::Result<()> {
    let mut service = load_service(cli)?;
    let snapshots = service.list_snapshots(repository, None)?;

    if snapshots.is_empty() {
        eprintln!("No snapshots found.");
        return Ok(());
    }

    eprintln!("{:>10}  {:20}  {:>8}  {:>10}", "Snapshot", "Created", "Files", "Size");
    eprintln!("{}", "─".repeat(56));
    for snap in &snapshots {
        eprintln!(
            "{:>10}  {:20}  {:>8}  {:>10}",
            snap.short_id(),
            snap.timestamp.format("%Y-%m-%d %H:%M:%S"),
            snap.stats.total_files,
            backup::format_size(snap.stats.total_size),
        );
    }
    eprintln!();
    eprintln!("  {} snapshot(s)", snapshots.len());
    Ok(())
}

fn cmd_diff(cli: &Cli, repository: &str, older: &str, newer: &str) -> error::Result<()> {
    let mut service = load_service(cli)?;
    let diff = service.diff_snapshots(repository, older, newer)?;
    diff.print_summary();
    Ok(())
}

fn cmd_prune(
    cli: &Cli,
    repository: &str,
    keep_last: Option<u32>,
    keep_daily: Option<u32>,
    keep_weekly: Option<u32>,
    keep_monthly: Option<u32>,
    dry_run: bool,
) -> error::Result<()> {
    let service = load_service(cli)?;
    print_header("Prune");

    let policy = RetentionPolicy { keep_last, keep_daily, keep_weekly, keep_monthly, ..Default::default() };
    service.prune(repository, &policy, dry_run)?;
    eprintln!("{} Retention policy applied to '{repository}'", colored::Colorize::green("✓"));
    Ok(())
}

fn cmd_verify(cli: &Cli, repository: &str, snapshot: Option<&str>) -> error::Result<()> {
    let service = load_service(cli)?;
    let report = service.verify(repository, snapshot)?;

    for check in &report.checks {
        let mark = if check.passed { colored::Colorize::green("✓") } else { colored::Colorize::red("✗") };
        eprintln!("  {mark} {}", check.name);
    }
    for warning in &report.warnings {
        eprintln!("  {} {warning}", colored::Colorize::yellow("warn:"));
    }
    eprintln!();
    if report.success {
        eprintln!("{} All checks passed", colored::Colorize::green("✓"));
        Ok(())
    } else {
        eprintln!("{} One or more checks failed", colored::Colorize::red("✗"));
        Err(anyhow::anyhow!("verification failed").into())
    }
}

fn cmd_import_timeshift(
    cli: &Cli,
    config_path: Option<&Path>,
    repository: &str,
    target: &str,
    repository_path: Option<&str>,
) -> error::Result<()> {
    let mut service = load_service(cli)?;
    let result = service.import_timeshift(config_path, repository, target, repository_path);

    for warning in &result.warnings {
        eprintln!("{} {warning}", colored::Colorize::yellow("!"));
    }
    if !result.success {
        for err in &result.errors {
            eprintln!("{} {err}", colored::Colorize::red("✗"));
        }
        return Err(anyhow::anyhow!("import failed").into());
    }

    let path = cli.config.clone().unwrap_or_else(|| service.config().settings.config_dir.join("timelocker.json"));
    service.save_config(&path)?;
    eprintln!(
        "{} Imported repository '{}' and target '{}' into {}",
        colored::Colorize::green("✓"),
        result.repository_name,
        result.target_name,
        path.display(),
    );
    Ok(())
}

fn cmd_lockdown(cli: &Cli, reason: &str) -> error::Result<()> {
    let service = load_service(cli)?;
    service.emergency_lockdown(reason);
    eprintln!("{} Emergency lockdown active: {reason}", colored::Colorize::red("⚠"));
    Ok(())
}

fn cmd_clear_lockdown(cli: &Cli) -> error::Result<()> {
    let service = load_service(cli)?;
    service.clear_lockdown()?;
    eprintln!("{} Lockdown cleared", colored::Colorize::green("✓"));
    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn load_service(cli: &Cli) -> error::Result<IntegrationService> {
    let config = if let Some(path) = &cli.config { config::load_config_from(path)? } else { config::load_config()? };
    IntegrationService::new(config)
}

fn unlock(service: &IntegrationService) -> error::Result<()> {
    if let Ok(password) = std::env::var("TIMELOCKER_MASTER_PASSWORD") {
        return Ok(service.unlock_credentials(&password)?);
    }
    let password = prompt_password("Master password: ")?;
    Ok(service.unlock_credentials(&password)?)
}

fn prompt_password(prompt: &str) -> error::Result<String> {
    use std::io::{BufRead, Write};
    eprint!("{prompt}");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

fn print_header(action: &str) {
    eprintln!();
    eprintln!("  {} timelocker v{} — {action}", colored::Colorize::bold("⚡"), env!("CARGO_PKG_VERSION"));
    eprintln!();
}

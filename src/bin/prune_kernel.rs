//! Prune Kernel CLI
//!
//! Builds the import closure of one or more entry files inside an installed
//! package tree, writes the graph and impact artifacts, and optionally
//! commits the deletion and patches aggregators.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `PRUNE_ROOT`: package root (instead of `--root`)
//! - `RUST_LOG`: log level filter (default: prune_kernel=info)
//! - `LOG_FORMAT`: "json" for structured logs, "pretty" for development (default: json)
//!
//! ## Usage
//!
//! ```bash
//! prune-kernel analyze --root .venv/lib/python3.11/site-packages --entry app.py --out artifacts/
//! prune-kernel prune   --root ... --entry app.py --trace trace.jsonl --requirements requirements.txt
//! prune-kernel patch   --root ... --record artifacts/prune_record_v1.json
//! prune-kernel restore --root ... --record artifacts/prune_record_v1.json
//! ```

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use prune_kernel::manifest::read_requirements_file;
use prune_kernel::patcher::restore_backups;
use prune_kernel::pruner::restore;
use prune_kernel::types::read_trace;
use prune_kernel::{
    AggregatorPatcher, BatchAnalyzer, CanonicalPath, DeletionMode, EntryPoint, FsPackageStore, LockedRoot,
    PackageSnapshot, PruneRecord, PrunePolicy, PruneSession,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Parser)]
#[command(name = "prune-kernel", version, about = "Prune installed Python package trees to what an entry file needs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the graph and write artifacts without touching the tree.
    Analyze {
        #[command(flatten)]
        run: RunArgs,
        /// Also analyse each entry on its own and write a per-entry registry.
        #[arg(long)]
        per_entry: bool,
    },
    /// Build, delete unreachable files, patch aggregators, write artifacts.
    Prune {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Re-patch aggregators for the deletions of a prune record.
    Patch {
        #[command(flatten)]
        tree: TreeArgs,
        /// Prune record to read.
        #[arg(long)]
        record: PathBuf,
        /// Where to write the patch report.
        #[arg(long, default_value = "prune-artifacts")]
        out: PathBuf,
    },
    /// Move quarantined files of a prune record back and undo patches.
    Restore {
        #[command(flatten)]
        tree: TreeArgs,
        /// Prune record to read and update.
        #[arg(long)]
        record: PathBuf,
        /// Restore only these root-relative paths.
        #[arg(long)]
        only: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct TreeArgs {
    /// Package root (site-packages directory).
    #[arg(long, env = "PRUNE_ROOT")]
    root: PathBuf,
    /// Policy file (JSON).
    #[arg(long)]
    policy: Option<PathBuf>,
    /// Maximum closure size.
    #[arg(long)]
    max_nodes: Option<usize>,
    /// Restrict pruning to these top-level names.
    #[arg(long = "scope")]
    scope: Vec<String>,
    /// Never delete paths with these prefixes.
    #[arg(long = "protect")]
    protect: Vec<String>,
    /// Deletion mode: `delete` or `quarantine`.
    #[arg(long, value_parser = parse_mode)]
    mode: Option<DeletionMode>,
    /// Keep `__INITIAL_` copies of patched aggregators.
    #[arg(long)]
    keep_backups: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    tree: TreeArgs,
    /// Entry file(s).
    #[arg(long = "entry", required = true)]
    entries: Vec<PathBuf>,
    /// Runtime trace (JSON lines or bare paths).
    #[arg(long)]
    trace: Option<PathBuf>,
    /// Declared requirements to prune.
    #[arg(long)]
    requirements: Option<PathBuf>,
    /// Artifact directory.
    #[arg(long, default_value = "prune-artifacts")]
    out: PathBuf,
}

fn parse_mode(raw: &str) -> Result<DeletionMode, String> {
    match raw {
        "delete" => Ok(DeletionMode::Delete),
        "quarantine" => Ok(DeletionMode::Quarantine),
        other => Err(format!("unknown deletion mode `{other}` (expected delete or quarantine)")),
    }
}

impl TreeArgs {
    /// Policy file (or default) with command-line overrides applied.
    fn policy(&self) -> CliResult<PrunePolicy> {
        let mut policy = match &self.policy {
            Some(path) => PrunePolicy::from_json_file(path)?,
            None => PrunePolicy::default(),
        };
        if let Some(max) = self.max_nodes {
            policy.max_closure_nodes = max;
        }
        if !self.scope.is_empty() {
            policy.expand_scope = Some(self.scope.iter().cloned().collect());
        }
        policy.protected_prefixes.extend(self.protect.iter().cloned());
        if let Some(mode) = self.mode {
            policy.deletion_mode = mode;
        }
        policy.keep_backups |= self.keep_backups;
        policy.validate()?;
        info!(policy_hash = %policy.params_hash(), mode = ?policy.deletion_mode, "Policy loaded");
        Ok(policy)
    }
}

/// Initialize the tracing subscriber with JSON or pretty format
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "prune_kernel=info".into());

    if log_format == "pretty" {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .init();
    }
}

fn open_session(run: &RunArgs, policy: PrunePolicy) -> CliResult<PruneSession> {
    let root = &run.tree.root;
    let entries: Vec<EntryPoint> = run
        .entries
        .iter()
        .map(|file| EntryPoint::from_file(root, file))
        .collect();
    let mut session = PruneSession::open(root, entries, policy)?;

    if let Some(trace) = &run.trace {
        let hints = read_trace(BufReader::new(File::open(trace)?))?;
        let report = session.merge_hints(&hints)?;
        info!(
            accepted = report.accepted,
            rejected = report.rejected(),
            "Runtime trace merged"
        );
    }
    Ok(session)
}

fn write_artifacts(session: &PruneSession, run: &RunArgs) -> CliResult<()> {
    let requirements = run.requirements.as_deref().map(read_requirements_file).transpose()?;
    let bundle = session.artifacts(requirements.as_deref())?;
    bundle.write_all(&run.out)?;
    println!(
        "{} files, {} bytes removable ({:.1}%), {} ambiguous; artifacts in {}",
        bundle.impact.removed_files,
        bundle.impact.removed_bytes,
        bundle.impact.removed_percent,
        bundle.impact.ambiguous.len(),
        run.out.display()
    );
    Ok(())
}

async fn analyze(run: RunArgs, per_entry: bool) -> CliResult<()> {
    let policy = run.tree.policy()?;
    let session = open_session(&run, policy.clone())?;
    write_artifacts(&session, &run)?;

    if per_entry {
        let entries: Vec<EntryPoint> = run
            .entries
            .iter()
            .map(|file| EntryPoint::from_file(&run.tree.root, file))
            .collect();
        let batch = BatchAnalyzer::new(Arc::clone(session.snapshot()), policy);
        let result = batch.analyze_all(&entries).await?;
        let path = run.out.join("entry_registry_v1.json");
        std::fs::write(&path, serde_json::to_vec_pretty(&result.registry)?)?;
        info!(path = %path.display(), registry_hash = %result.registry_hash, "Wrote per-entry registry");
    }
    Ok(())
}

fn prune(run: RunArgs) -> CliResult<()> {
    let policy = run.tree.policy()?;
    let mut session = open_session(&run, policy)?;
    let outcome = session.commit()?;
    info!(
        deleted = outcome.record.entries.len(),
        patched = outcome.patch.patched.len(),
        failures = outcome.patch.failures.len(),
        "Prune committed"
    );
    write_artifacts(&session, &run)
}

fn read_record(path: &Path) -> CliResult<PruneRecord> {
    Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
}

fn patch(tree: TreeArgs, record: &Path, out: &Path) -> CliResult<()> {
    let policy = tree.policy()?;
    let record = read_record(record)?;
    let snapshot = PackageSnapshot::capture(Arc::new(FsPackageStore::open(&tree.root)?))?;
    let locked = LockedRoot::acquire(&tree.root)?;
    if policy.keep_backups {
        restore_backups(&locked, &snapshot)?;
    }
    let mut patcher = AggregatorPatcher::new(&snapshot, record.deleted_paths(), policy)?;
    let report = patcher.patch_all(&locked)?;

    std::fs::create_dir_all(out)?;
    let path = out.join("patch_report_v1.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;
    println!(
        "{} aggregators patched, {} failures; report in {}",
        report.patched.len(),
        report.failures.len(),
        path.display()
    );
    Ok(())
}

fn restore_record(tree: TreeArgs, record_path: &Path, only: Vec<String>) -> CliResult<()> {
    let mut record = read_record(record_path)?;
    let only: BTreeSet<CanonicalPath> = only.iter().map(CanonicalPath::new).collect();
    let locked = LockedRoot::acquire(&tree.root)?;
    let report = restore(&locked, &mut record, (!only.is_empty()).then_some(&only))?;

    let snapshot = PackageSnapshot::capture(Arc::new(FsPackageStore::open(&tree.root)?))?;
    let unpatched = restore_backups(&locked, &snapshot)?;
    std::fs::write(record_path, serde_json::to_vec_pretty(&record)?)?;
    println!(
        "{} files restored, {} unrecoverable, {} aggregators reverted",
        report.restored.len(),
        report.unrecoverable.len(),
        unpatched.len()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> CliResult<()> {
    init_tracing();
    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting prune-kernel");

    match cli.command {
        Command::Analyze { run, per_entry } => analyze(run, per_entry).await,
        Command::Prune { run } => prune(run),
        Command::Patch { tree, record, out } => patch(tree, &record, &out),
        Command::Restore { tree, record, only } => restore_record(tree, &record, only),
    }
}

//! Argument parsing and command execution for the `convsync` binary.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use convsync_sync::local::STATE_DIR;
use convsync_sync::{
    FileSecretStore, FsBlobStore, SyncConfig, SyncEngine, SyncEvent, SyncSession, SyncSummary,
};
use convsync_types::ConversationId;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Environment variable read for the passphrase before falling back to stdin.
pub const PASSPHRASE_ENV: &str = "CONVSYNC_PASSPHRASE";
/// Environment variable read for the replacement passphrase by `rotate`.
pub const NEW_PASSPHRASE_ENV: &str = "CONVSYNC_NEW_PASSPHRASE";
/// File holding the passphrase, inside the state directory.
pub const SECRET_FILE: &str = "secret";

#[derive(Parser, Debug)]
#[command(name = "convsync")]
#[command(about = "Encrypted sync of conversation folders through a shared drive")]
pub struct Args {
    /// Directory holding one subdirectory per conversation
    #[arg(short, long)]
    pub root: PathBuf,

    /// Shared directory used as the remote blob store
    #[arg(short, long)]
    pub store: PathBuf,

    /// Machine name recorded in the remote manifest
    #[arg(short, long)]
    pub name: Option<String>,

    /// JSON file with engine settings; flags take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store the passphrase after checking it against the remote manifest
    Init,
    /// Run one sync cycle
    Sync,
    /// Rehash every local file and drop cached remote listings, then sync
    ForceSync,
    /// Show how far local and remote overlap, and pending conflicts
    Status,
    /// Settle a conflict on a conversation
    Resolve {
        /// The conversation, or its conflict copy
        conversation: String,
        /// Which version survives
        #[arg(long, value_enum)]
        keep: Keep,
    },
    /// Re-encrypt every remote blob under a new passphrase
    Rotate,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    /// This machine's version; the conflict copy is discarded
    Local,
    /// The other machine's version from the conflict copy
    Conflict,
}

impl Command {
    /// Commands a Ctrl-C should cancel rather than kill.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Command::Sync | Command::ForceSync)
    }
}

impl Args {
    /// Engine configuration: the config file if given, overridden by flags.
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<SyncConfig>(&raw)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => SyncConfig::default(),
        };
        config.local_root = self.root.clone();
        if let Some(name) = &self.name {
            config.machine_name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Where `init` stores the passphrase for a local root.
pub fn secret_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join(SECRET_FILE)
}

/// Opens the engine over a directory blob store and a file secret store.
pub async fn open_engine(args: &Args, session: SyncSession) -> Result<SyncEngine> {
    let config = args.sync_config()?;
    let store = Arc::new(FsBlobStore::new(&args.store));
    let secrets = Arc::new(FileSecretStore::new(secret_path(&args.root)));
    SyncEngine::open(config, store, secrets, session)
        .await
        .context("opening sync engine")
}

/// Reads a passphrase from `var`, or else the first line of `input`.
pub fn read_passphrase(var: &str, input: &mut dyn BufRead) -> Result<String> {
    if let Ok(value) = std::env::var(var) {
        if !value.is_empty() {
            return Ok(value);
        }
    }
    let mut line = String::new();
    input.read_line(&mut line).context("reading passphrase")?;
    let passphrase = line.trim_end_matches(['\r', '\n']);
    if passphrase.is_empty() {
        bail!("no passphrase given (set {var} or pipe it on stdin)");
    }
    Ok(passphrase.to_string())
}

/// Runs `command`, writing human-readable results to `out`.
pub async fn run_command(
    engine: &SyncEngine,
    command: &Command,
    input: &mut dyn BufRead,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Command::Init => {
            let passphrase = read_passphrase(PASSPHRASE_ENV, input)?;
            engine.setup_passphrase(&passphrase).await?;
            writeln!(out, "Passphrase stored for machine {}", engine.machine_id())?;
        }
        Command::Sync => {
            let summary = engine.sync_now().await?;
            write!(out, "{}", format_summary(&summary))?;
        }
        Command::ForceSync => {
            let summary = engine.force_sync().await?;
            write!(out, "{}", format_summary(&summary))?;
        }
        Command::Status => write_status(engine, out).await?,
        Command::Resolve { conversation, keep } => {
            let id = ConversationId::new(conversation.as_str())
                .with_context(|| format!("invalid conversation id {conversation:?}"))?;
            let keep_local = *keep == Keep::Local;
            match engine.resolve_conflict(&id, keep_local).await? {
                Some(_) => writeln!(
                    out,
                    "Resolved {id}: kept the {} version",
                    if keep_local { "local" } else { "conflicting" }
                )?,
                None => writeln!(out, "No pending conflict on {id}")?,
            }
        }
        Command::Rotate => {
            let passphrase = read_passphrase(NEW_PASSPHRASE_ENV, input)?;
            let report = engine.rotate_passphrase(&passphrase).await?;
            writeln!(
                out,
                "Passphrase rotated: {} blob(s) re-encrypted, {} already current",
                report.resealed, report.already_current
            )?;
        }
    }
    Ok(())
}

async fn write_status(engine: &SyncEngine, out: &mut dyn Write) -> Result<()> {
    let stats = engine.stats().await?;
    let totals = engine.transfer_totals().await?;
    writeln!(
        out,
        "Machine {} ({})",
        engine.machine_id(),
        engine.config().machine_name
    )?;
    writeln!(
        out,
        "Local:  {} conversation(s), {:.0}% synced, {} local only",
        stats.local_total, stats.local_percent, stats.local_only
    )?;
    writeln!(
        out,
        "Remote: {} conversation(s), {:.0}% synced, {} remote only",
        stats.remote_total, stats.remote_percent, stats.remote_only
    )?;
    writeln!(
        out,
        "Created here: {} byte(s) in {} conversation(s); elsewhere: {} byte(s) in {}",
        totals.uploaded_bytes,
        totals.uploaded_conversations,
        totals.downloaded_bytes,
        totals.downloaded_conversations
    )?;

    let conflicts = engine.pending_conflicts().await;
    if conflicts.is_empty() {
        writeln!(out, "No pending conflicts")?;
    } else {
        writeln!(out, "Pending conflicts:")?;
        for conflict in conflicts {
            let paths: Vec<&str> = conflict.paths.iter().map(String::as_str).collect();
            writeln!(
                out,
                "  {} -> {} ({})",
                conflict.original,
                conflict.copy,
                paths.join(", ")
            )?;
        }
    }
    Ok(())
}

/// Multi-line, human-readable cycle summary.
pub fn format_summary(summary: &SyncSummary) -> String {
    let mut text = format!(
        "Uploaded {} file(s) ({} bytes), downloaded {} file(s) ({} bytes)\n",
        summary.uploaded_files,
        summary.uploaded_bytes,
        summary.downloaded_files,
        summary.downloaded_bytes
    );
    if summary.deleted_local + summary.deleted_remote > 0 {
        text.push_str(&format!(
            "Deleted {} local and {} remote file(s)\n",
            summary.deleted_local, summary.deleted_remote
        ));
    }
    if summary.skipped > 0 {
        text.push_str(&format!("Skipped {} file(s), retried next cycle\n", summary.skipped));
    }
    for failure in &summary.failures {
        text.push_str(&format!(
            "Failed {} ({:?}): {}\n",
            failure.conversation, failure.kind, failure.message
        ));
    }
    if summary.conflicts_pending > 0 {
        text.push_str(&format!(
            "{} conflict(s) pending; see `convsync status`\n",
            summary.conflicts_pending
        ));
    }
    if summary.cancelled {
        text.push_str("Cancelled; remaining work resumes next cycle\n");
    }
    text
}

/// Logs engine events until the session is dropped.
pub async fn log_events(mut events: mpsc::UnboundedReceiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Planned {
                upload_files,
                download_files,
                divergences,
                ..
            } => info!(
                "Planned {upload_files} upload(s), {download_files} download(s), {divergences} divergence(s)"
            ),
            SyncEvent::TransferStarted(t) => {
                debug!("{:?} {}/{} ({} bytes)", t.direction, t.conversation_id, t.path, t.bytes_total)
            }
            SyncEvent::TransferFinished { transfer, succeeded } if !succeeded => {
                debug!("{:?} {}/{} did not complete", transfer.direction, transfer.conversation_id, transfer.path)
            }
            SyncEvent::ConflictDetected { original, copy, paths } => {
                warn!("Conflict in {original}: remote version saved as {copy} ({})", paths.join(", "))
            }
            SyncEvent::CycleFailed { kind, message } => warn!("Sync failed ({kind:?}): {message}"),
            _ => {}
        }
    }
}

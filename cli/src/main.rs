//! convsync command-line client
//!
//! Syncs a directory of conversation folders with any other machine that
//! can see the same shared directory (a cloud drive folder, a network
//! share). Everything written to the shared directory is encrypted.
//!
//! Usage:
//!   echo "$PASSPHRASE" | convsync --root ~/conversations --store ~/Drive/convsync init
//!   convsync --root ~/conversations --store ~/Drive/convsync sync

use anyhow::Result;
use clap::Parser;
use convsync_cli::{log_events, open_engine, run_command, Args};
use convsync_sync::SyncSession;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let (session, events) = SyncSession::channel();
    let engine = Arc::new(open_engine(&args, session).await?);
    let logger = tokio::spawn(log_events(events));

    let interrupt = args.command.is_cycle().then(|| {
        let watcher = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; stopping after the current file");
                watcher.cancel_sync();
            }
        })
    });

    let mut stdin = std::io::stdin().lock();
    let mut stdout = std::io::stdout();
    let result = run_command(&engine, &args.command, &mut stdin, &mut stdout).await;

    // Once every engine handle is gone the event channel closes and the
    // logger drains.
    if let Some(task) = interrupt {
        task.abort();
        let _ = task.await;
    }
    drop(engine);
    let _ = logger.await;
    result
}

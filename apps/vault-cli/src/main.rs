//! TeleVault command-line front end.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use televault_index::{IndexStore, JsonIndexStore};
use televault_sync::{JobReport, SyncCoordinator, SyncEvent};
use televault_transport::{RemoteTransport, TelegramTransport};
use televault_types::{FileCategory, JobOutcome, JobProgress, JobState};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use config::VaultConfig;

#[derive(Parser)]
#[command(name = "televault", version, about = "Chunked file vault backed by a Telegram chat")]
struct Cli {
    /// Configuration file (defaults to the per-user location).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Upload one or more files
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Restore a file by id
    Restore {
        file_id: String,
        /// Destination directory (defaults to `download_dir`)
        #[arg(long)]
        dest: Option<PathBuf>,
    },
    /// List stored files
    List {
        /// Only show image, video, audio, document or other files
        #[arg(long)]
        category: Option<FileCategory>,
        /// Include uploads that never finished
        #[arg(long)]
        all: bool,
    },
    /// Resume unfinished uploads (all of them if no id is given)
    Resume { file_id: Option<String> },
    /// Delete a file and the remote chunks only it references
    Delete { file_id: String },
    /// Check the bot token and chat id
    TestConnection,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config, config_path) = VaultConfig::load(cli.config.as_deref())?;
    tracing::debug!(path = %config_path.display(), "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.cmd, config, config_path))
}

async fn run(cmd: Cmd, config: VaultConfig, config_path: PathBuf) -> anyhow::Result<()> {
    let index_path = config.index_path(&config_path);

    // Listing needs no network access.
    if let Cmd::List { category, all } = cmd {
        let index = JsonIndexStore::open(&index_path)?;
        for line in render_list(&index, category, all)? {
            println!("{line}");
        }
        return Ok(());
    }

    if !config.telegram.is_configured() {
        bail!(
            "bot_token and chat_id must be set in [telegram] of {}",
            config_path.display()
        );
    }
    let telegram = TelegramTransport::new(config.telegram.clone())?;

    let job = match cmd {
        Cmd::Upload { paths } => Job::Upload(paths),
        Cmd::Restore { file_id, dest } => Job::Restore(file_id, dest),
        Cmd::Resume { file_id } => Job::Resume(file_id),
        Cmd::Delete { file_id } => Job::Delete(file_id),
        Cmd::List { .. } => return Ok(()),
        Cmd::TestConnection => {
            let bot = telegram.verify().await?;
            println!(
                "Connected as @{} (test message {})",
                bot.username, bot.test_message_id
            );
            return Ok(());
        }
    };
    run_job(job, &config, &index_path, telegram).await
}

/// Commands that run through the coordinator.
enum Job {
    Upload(Vec<PathBuf>),
    Restore(String, Option<PathBuf>),
    Resume(Option<String>),
    Delete(String),
}

async fn run_job(
    job: Job,
    config: &VaultConfig,
    index_path: &Path,
    telegram: TelegramTransport,
) -> anyhow::Result<()> {
    let index: Arc<dyn IndexStore> = Arc::new(
        JsonIndexStore::open(index_path)
            .with_context(|| format!("opening index {}", index_path.display()))?,
    );
    let transport: Arc<dyn RemoteTransport> = Arc::new(telegram);
    let mut coordinator = SyncCoordinator::new(index, transport, config.sync.clone())?;

    let printer = coordinator.take_events().map(|rx| tokio::spawn(print_events(rx)));
    let shutdown = coordinator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling jobs");
            shutdown.cancel();
        }
    });

    let mut failed = 0;
    match job {
        Job::Upload(paths) => failed += upload_all(&coordinator, paths).await?,
        Job::Restore(file_id, dest) => {
            let dest = dest.unwrap_or_else(|| config.download_dir());
            let report = coordinator.restore(&file_id, &dest).await?;
            failed += summarize(&report);
        }
        Job::Resume(file_id) => {
            let ids = match file_id {
                Some(id) => vec![id],
                None => coordinator
                    .pending_uploads()?
                    .into_iter()
                    .filter(|m| m.source_path.is_some())
                    .map(|m| m.id)
                    .collect(),
            };
            if ids.is_empty() {
                println!("Nothing to resume");
            }
            for id in ids {
                let report = coordinator.resume(&id).await?;
                failed += summarize(&report);
            }
        }
        Job::Delete(file_id) => {
            let report = coordinator.delete_file(&file_id).await?;
            println!(
                "Deleted {file_id}: {} chunks removed, {} already gone, {} left on remote",
                report.removed, report.already_gone, report.failed
            );
        }
    }

    // Closing the event channel lets the printer finish.
    drop(coordinator);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if failed > 0 {
        bail!("{failed} job(s) did not complete");
    }
    Ok(())
}

/// Uploads `paths` one after another, stopping before the next file once
/// shutdown is requested. Returns how many files did not complete.
async fn upload_all(coordinator: &SyncCoordinator, paths: Vec<PathBuf>) -> anyhow::Result<usize> {
    let shutdown = coordinator.cancel_token();
    let total = paths.len();
    let mut failed = 0;
    for (done, path) in paths.into_iter().enumerate() {
        if shutdown.is_cancelled() {
            let left = total - done;
            eprintln!("Interrupted, {left} file(s) not uploaded");
            return Ok(failed + left);
        }
        let report = coordinator
            .upload(&path)
            .await
            .with_context(|| format!("uploading {}", path.display()))?;
        failed += summarize(&report);
    }
    Ok(failed)
}

/// One line per stored file, or a single `No files` line.
fn render_list(
    index: &dyn IndexStore,
    category: Option<FileCategory>,
    all: bool,
) -> anyhow::Result<Vec<String>> {
    let lines: Vec<_> = index
        .list_files()?
        .into_iter()
        .filter(|m| all || m.is_complete())
        .filter(|m| category.is_none_or(|c| FileCategory::from_name(&m.name) == c))
        .map(|m| {
            let status = if m.is_complete() {
                String::new()
            } else {
                format!("  [incomplete {}/{}]", m.chunks.len(), m.chunk_count)
            };
            format!(
                "{}  {:>10}  {:<8}  {}  {}{status}",
                m.id,
                format_size(m.size),
                FileCategory::from_name(&m.name).as_str(),
                m.created_at.format("%Y-%m-%d %H:%M"),
                m.name,
            )
        })
        .collect();

    if lines.is_empty() {
        return Ok(vec!["No files".to_string()]);
    }
    Ok(lines)
}

/// Prints the outcome of a job. Returns 1 if it did not complete.
fn summarize(report: &JobReport) -> usize {
    match &report.outcome {
        JobOutcome::Complete { file_id } => {
            let p = &report.progress;
            match &report.restored_to {
                Some(path) => println!("Restored {file_id} to {}", path.display()),
                None => println!(
                    "Stored {file_id} ({}, {} chunks, {} deduplicated)",
                    format_size(p.total_bytes),
                    p.total_chunks,
                    p.skipped_chunks
                ),
            }
            0
        }
        JobOutcome::Failed { class, reason } => {
            eprintln!("{} failed ({class:?}): {reason}", report.file_id);
            if class.is_resumable() {
                eprintln!("  run `televault resume {}` to continue", report.file_id);
            }
            1
        }
        JobOutcome::Cancelled => {
            eprintln!("{} cancelled", report.file_id);
            1
        }
    }
}

async fn print_events(mut rx: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SyncEvent::StateChanged { file_id, state, .. } if !state.is_terminal() => {
                tracing::debug!(file_id = %file_id, ?state, "job state");
            }
            SyncEvent::Progress(p) if p.state != JobState::Pending => {
                eprint!("\r{}    ", progress_line(&p));
            }
            SyncEvent::Finished(_) => eprintln!(),
            _ => {}
        }
    }
}

fn progress_line(p: &JobProgress) -> String {
    let mut line = format!(
        "{:>5.1}%  {}/{} chunks  {} / {}",
        p.percentage(),
        p.done_chunks,
        p.total_chunks,
        format_size(p.done_bytes),
        format_size(p.total_bytes),
    );
    if p.bytes_per_second > 0.0 {
        line.push_str(&format!("  {}/s", format_size(p.bytes_per_second as u64)));
    }
    if let Some(secs) = p.eta_secs {
        line.push_str(&format!("  ETA {}", format_eta(secs)));
    }
    line
}

/// `42s`, `3m07s` or `2h05m`.
fn format_eta(secs: u64) -> String {
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m{:02}s", secs / 60, secs % 60),
        _ => format!("{}h{:02}m", secs / 3600, secs % 3600 / 60),
    }
}

/// Formats a byte count with binary units, e.g. `1.5 MB`.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

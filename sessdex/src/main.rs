//! sessdex - keep a queryable index of assistant session transcripts
//!
//! Uses XDG Base Directory specification for file locations:
//! - Index: $XDG_DATA_HOME/sessdex/index.db (~/.local/share/sessdex/index.db)
//! - Logs: $XDG_STATE_HOME/sessdex/sessdex.log (~/.local/state/sessdex/sessdex.log)
//! - Config: $XDG_CONFIG_HOME/sessdex/config.toml (~/.config/sessdex/config.toml)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sessdex_core::{Config, Error, Indexer, RefreshPolicy, RefreshReport, SessionSummary};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sessdex")]
#[command(about = "Index assistant session transcripts")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring the index up to date with the session logs on disk
    Refresh {
        /// How summaries are obtained
        #[arg(long, value_enum, default_value_t = PolicyArg::Hybrid)]
        policy: PolicyArg,

        /// Wait for background exhaustive parses before exiting
        #[arg(long)]
        wait: bool,

        /// Watch mode - refresh continuously until Ctrl+C
        #[arg(short, long)]
        watch: bool,

        /// Poll interval in milliseconds (only with --watch)
        #[arg(long, default_value = "2000")]
        poll: u64,
    },
    /// Show the accepted summary for one session
    Get {
        session_id: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List indexed sessions, most recently started first
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-derive rows whose recorded line coverage looks implausible
    Sweep,
    /// Show configured session sources
    Sources,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    CacheOnly,
    ForceReparse,
    Hybrid,
}

impl From<PolicyArg> for RefreshPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::CacheOnly => RefreshPolicy::CacheOnly,
            PolicyArg::ForceReparse => RefreshPolicy::ForceReparse,
            PolicyArg::Hybrid => RefreshPolicy::Hybrid,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;
    let _log_guard =
        sessdex_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("sessdex starting");

    let indexer = Indexer::open(&config).context("failed to open index")?;

    match args.command {
        Command::Refresh {
            policy,
            wait,
            watch,
            poll,
        } => {
            if watch {
                run_watch_mode(&indexer, policy.into(), Duration::from_millis(poll)).await
            } else {
                run_single_refresh(&indexer, policy.into(), wait).await
            }
        }
        Command::Get { session_id, json } => {
            let summary = indexer
                .get(&session_id)
                .context("failed to read index")?
                .ok_or(Error::SessionNotFound(session_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
        Command::List { json } => {
            let summaries = indexer.store().list().context("failed to read index")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                print_table(&summaries);
            }
            Ok(())
        }
        Command::Sweep => {
            let report = indexer.sweep().await.context("sweep failed")?;
            println!("Sweep complete:");
            println!("  Suspect rows: {}", report.checked);
            println!("  Repaired:     {}", report.repaired.len());
            for (session_id, reason) in &report.kept {
                println!("  Kept {}: {}", session_id, reason);
            }
            Ok(())
        }
        Command::Sources => {
            for source in indexer.sources() {
                let root = source
                    .root_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                if !source.is_installed() {
                    println!("  - {}: not installed ({})", source.name(), root);
                    continue;
                }
                match source.discover_files() {
                    Ok(files) => {
                        println!("  - {}: {} file(s) at {}", source.name(), files.len(), root)
                    }
                    Err(e) => println!("  - {}: error discovering files: {}", source.name(), e),
                }
            }
            Ok(())
        }
    }
}

async fn run_single_refresh(indexer: &Indexer, policy: RefreshPolicy, wait: bool) -> Result<()> {
    let handler = indexer.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nCancelling...");
        handler.cancel();
    })
    .context("failed to set Ctrl+C handler")?;

    let report = indexer.refresh(policy).await.context("refresh failed")?;
    print_report(&report);

    if wait && report.scheduled > 0 {
        println!("Waiting for {} background parse(s)...", report.scheduled);
        indexer.settle().await.context("background parse failed")?;
    }

    tracing::info!(
        sessions = report.summaries.len(),
        parsed = report.files_parsed,
        "sessdex refresh complete"
    );
    Ok(())
}

async fn run_watch_mode(indexer: &Indexer, policy: RefreshPolicy, poll: Duration) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    let handler = indexer.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
        handler.cancel();
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Watch mode active (poll every {}ms). Press Ctrl+C to stop.",
        poll.as_millis()
    );

    let mut iteration = 0u64;
    while running.load(Ordering::SeqCst) {
        iteration += 1;
        let report = indexer.refresh(policy).await.context("refresh failed")?;

        if report.files_parsed > 0 {
            let timestamp = chrono::Local::now().format("%H:%M:%S");
            println!(
                "[{}] Parsed {} file(s), {} session(s) indexed",
                timestamp,
                report.files_parsed,
                report.summaries.len()
            );
            for (path, error) in &report.failures {
                println!("  Failed {}: {}", path.display(), error);
            }
            tracing::info!(iteration, parsed = report.files_parsed, "watch refresh iteration");
        }

        tokio::time::sleep(poll).await;
    }

    println!("Watch mode stopped.");
    tracing::info!("sessdex watch mode stopped");
    Ok(())
}

fn print_report(report: &RefreshReport) {
    println!("\nRefresh complete ({}):", report.policy);
    println!("  Files parsed:     {}", report.files_parsed);
    println!("  Files unchanged:  {}", report.files_unchanged);
    println!("  Sessions indexed: {}", report.summaries.len());
    println!("  Scheduled:        {}", report.scheduled);

    if !report.unindexable.is_empty() {
        println!("\nUnindexable ({}):", report.unindexable.len());
        for path in &report.unindexable {
            println!("  {}", path.display());
        }
    }
    if !report.failures.is_empty() {
        println!("\nErrors ({}):", report.failures.len());
        for (path, err) in &report.failures {
            println!("  {}: {}", path.display(), err);
        }
    }
    if report.cancelled {
        println!("\nPass was cancelled");
    }
}

fn print_summary(summary: &SessionSummary) {
    println!("Session:   {}", summary.session_id);
    println!("Source:    {}", summary.source_path.display());
    println!("Fidelity:  {}", summary.fidelity);
    if let Some(title) = &summary.title {
        println!("Title:     {}", title);
    }
    if let Some(started) = summary.started_at {
        println!("Started:   {}", started.to_rfc3339());
    }
    if let Some(cwd) = &summary.working_directory {
        println!("Directory: {}", cwd);
    }
    if let Some(model) = &summary.model {
        println!("Model:     {}", model);
    }
    println!(
        "Counts:    {} user, {} assistant, {} tools, {} thinking",
        summary.counts.user_messages,
        summary.counts.assistant_messages,
        summary.counts.tool_invocations,
        summary.counts.thinking
    );
    if let Some(secs) = summary.active_duration_secs {
        println!("Active:    {}m {}s", secs / 60, secs % 60);
    }
    println!("Lines:     {}", summary.lines_scanned);
}

fn print_table(summaries: &[SessionSummary]) {
    if summaries.is_empty() {
        println!("No sessions indexed");
        return;
    }
    for summary in summaries {
        let started = summary
            .started_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<38} {:<16} {:<9} {:>5} {}",
            summary.session_id,
            started,
            summary.fidelity.as_str(),
            summary.counts.total(),
            summary.title.as_deref().unwrap_or("")
        );
    }
}

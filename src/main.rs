use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use sender_sweep::auth::TokenProvider;
use sender_sweep::bulk::UnsubscribeOutcome;
use sender_sweep::cli::{self, Cli, Commands, ProgressReporter, SenderReport};
use sender_sweep::config::Config;
use sender_sweep::error::SyncError;
use sender_sweep::models::MutationOp;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.buffer.lock() {
            Ok(mut buffer) => buffer.extend_from_slice(buf),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(buf),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = match self.buffer.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// MakeWriter implementation for tracing
#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        eprintln!("\nFor help, run: sender-sweep --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Several dependencies pull in rustls; pick one crypto provider up front.
    // aws-lc-rs everywhere except Windows, where ring avoids the NASM/CMake toolchain.
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sender_sweep=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sender_sweep=info,warn"))
    };

    // Logs print above progress bars
    let multi_progress = Arc::new(MultiProgress::new());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: Arc::clone(&multi_progress),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());

    match &cli.command {
        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                return Err(SyncError::ConfigError(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }
            if let Some(parent) = output.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::write(output, Config::example_toml()).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - provider.kind: 'gmail' or 'graph'");
            println!("  - provider.account_id: the mailbox this store tracks");
            println!("  - batch.inter_batch_delay_ms: pause between chunks");
            println!("  - unsubscribe.one_click_post: send RFC 8058 POSTs yourself");
            return Ok(());
        }

        Commands::Auth { force } => {
            let config = Config::load(&cli.config).await?;
            if *force && cli.token_cache.exists() {
                tokio::fs::remove_file(&cli.token_cache).await?;
                tracing::info!("Removed existing token cache");
            }

            let spinner = reporter.add_spinner(&format!(
                "Authenticating with {}...",
                config.provider.kind.as_str()
            ));
            let tokens = cli::token_provider(&cli, config.provider.kind).await;
            spinner.finish_and_clear();
            let tokens = tokens?;
            tokens.access_token().await?;

            println!("Successfully authenticated with {}", config.provider.kind.as_str());
            println!("Token cached at: {:?}", cli.token_cache);
            return Ok(());
        }

        _ => {}
    }

    let config = Config::load(&cli.config).await?;
    let mut engine = cli::build_engine(&cli, &config).await?;

    match &cli.command {
        Commands::Sync { full } => {
            let report = cli::run_sync(&mut engine, *full, &reporter).await?;

            println!("\n========================================");
            println!("Sync Summary");
            println!("========================================");
            println!("Run ID: {}", report.run_id);
            println!("Mode: {:?}", report.mode);
            if report.cursor_expired {
                println!("Cursor expired: fell back to a full sync");
            }
            println!("Duration: {} seconds", report.duration_seconds());
            println!("Pages: {}", report.pages);
            println!("Messages fetched: {}", report.messages_fetched);
            println!("Senders updated: {}", report.senders_updated);
            println!("Messages removed: {}", report.removed);
            println!("Skipped (no sender): {}", report.skipped_messages);
            println!("Fetch failures: {}", report.enrichment_failures);
            println!("========================================");
        }

        Commands::Baseline => {
            let cursor = engine.establish_baseline().await?;
            println!("Baseline cursor recorded for {}", engine.account_id());
            tracing::debug!("Cursor token: {}", cursor.token);
        }

        Commands::Senders { sort, limit, output } => {
            let report = SenderReport::new(engine.account_id(), engine.senders().await?, *sort, *limit);
            println!("{}", report.to_markdown());
            if let Some(path) = output {
                report.save(path).await?;
                println!("Report saved to {:?}", path);
            }
        }

        Commands::Delete { senders } | Commands::Archive { senders } => {
            let op = if matches!(cli.command, Commands::Delete { .. }) {
                MutationOp::Trash
            } else {
                MutationOp::Archive
            };

            if let Some(report) = cli::run_mutation(&cli, &engine, op, senders, &reporter).await? {
                println!("\n========================================");
                for sender in &report.per_sender {
                    println!(
                        "{}: {} succeeded, {} failed",
                        sender.key, sender.succeeded, sender.failed
                    );
                }
                println!("----------------------------------------");
                println!("Total affected: {}", report.total_affected);
                println!("Total failed: {}", report.total_failed);
                println!("========================================");
            }
        }

        Commands::Unsubscribe { sender } => {
            match cli::run_unsubscribe(&cli, &engine, sender, &reporter).await? {
                Some(UnsubscribeOutcome::OpenLink { url, one_click }) => {
                    println!("Open this link to unsubscribe:\n  {}", url);
                    if one_click {
                        println!("(sender supports one-click; enable unsubscribe.one_click_post to POST it directly)");
                    }
                }
                Some(UnsubscribeOutcome::OneClickCompleted { url }) => {
                    println!("One-click unsubscribe accepted by {}", url);
                }
                Some(UnsubscribeOutcome::EmailSent { to }) => {
                    println!("Unsubscribe email sent to {}", to);
                }
                Some(UnsubscribeOutcome::RequiresManualAction) => {
                    println!("{} offers no unsubscribe link; manual action required", sender);
                }
                None => {}
            }
        }

        Commands::Status => {
            let status = engine.status().await?;
            println!("\n========================================");
            println!("Sync State");
            println!("========================================");
            println!("Account: {}", status.account_id);
            println!("Provider: {}", config.provider.kind.as_str());
            println!("Phase: {:?}", status.phase);
            println!("Cursor: {}", if status.cursor.is_some() { "stored" } else { "none" });
            println!("Senders: {}", status.sender_count);
            println!("Messages: {}", status.message_count);
            println!("Store: {:?}", config.sync.store_path);
            println!("========================================");
        }

        Commands::InitConfig { .. } | Commands::Auth { .. } => {}
    }

    Ok(())
}

/// Display error with context
fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    for cause in error.chain().skip(1) {
        eprintln!("  Caused by: {}", cause);
    }

    if let Some(sync_err) = error.downcast_ref::<SyncError>() {
        match sync_err {
            SyncError::AuthError(_) => {
                eprintln!("\nHint: Check your credentials file or SENDER_SWEEP_* environment variables.");
                eprintln!("      Try running: sender-sweep auth --force");
            }
            SyncError::RateLimitExceeded { .. } | SyncError::ServiceUnavailable { .. } => {
                eprintln!("\nHint: The provider is throttling requests.");
                eprintln!("      Wait a few minutes, or lower batch.max_concurrency in config.");
            }
            SyncError::CursorExpired(_) => {
                eprintln!("\nHint: Run: sender-sweep sync --full");
            }
            SyncError::ConfigError(_) => {
                eprintln!("\nHint: Check your configuration file for errors.");
                eprintln!("      Run: sender-sweep init-config --force");
            }
            _ => {}
        }
    }
}

//! Command-line interface

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::auth::{self, OAuthTokenProvider, StaticTokenProvider, TokenProvider};
use crate::bulk::{BulkMutationReport, SenderTarget, UnsubscribeOutcome};
use crate::config::{Config, ProviderKind};
use crate::engine::{SyncEngine, SyncReport};
use crate::error::{Result, SyncError};
use crate::models::{MutationOp, SenderStats};
use crate::provider::build_provider;
use crate::requester::{RateLimitedRequester, RetryPolicy};
use crate::store::JsonFileStore;

#[derive(Parser, Debug)]
#[command(name = "sender-sweep")]
#[command(version)]
#[command(about = "Sync mailbox senders and bulk delete, archive or unsubscribe", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Path to OAuth2 credentials file
    #[arg(long, default_value = "credentials.json")]
    pub credentials: PathBuf,

    /// Path to token cache file
    #[arg(long, default_value = ".sender-sweep/token.json")]
    pub token_cache: PathBuf,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Show what would change without touching the mailbox
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Skip confirmation prompts
    #[arg(short, long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with the configured provider
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },

    /// Synchronize sender statistics (incremental when possible)
    Sync {
        /// Ignore the stored cursor and enumerate the whole inbox
        #[arg(long)]
        full: bool,
    },

    /// Record a "from now on" cursor without pulling any messages
    Baseline,

    /// List senders by volume or recency
    Senders {
        #[arg(long, value_enum, default_value = "count")]
        sort: SortOrder,

        /// Show at most this many senders
        #[arg(short, long)]
        limit: Option<usize>,

        /// Also write the report as markdown
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Move every message from the given senders to trash
    Delete {
        /// Sender email addresses
        #[arg(required = true)]
        senders: Vec<String>,
    },

    /// Archive every message from the given senders
    Archive {
        /// Sender email addresses
        #[arg(required = true)]
        senders: Vec<String>,
    },

    /// Unsubscribe from a sender
    Unsubscribe {
        /// Sender email address
        sender: String,
    },

    /// Show sync state and stored totals
    Status,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortOrder {
    /// Most messages first
    Count,
    /// Most recently seen first
    Recent,
}

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Share the MultiProgress the log writer prints through
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        self.println(&format!("  ✓ {}", msg));
    }

    pub fn println(&self, msg: &str) {
        let _ = self.multi.println(msg);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Sender table for the `senders` command
pub struct SenderReport {
    pub account_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_senders: usize,
    pub total_messages: usize,
    pub senders: Vec<SenderStats>,
}

impl SenderReport {
    pub fn new(account_id: &str, mut senders: Vec<SenderStats>, sort: SortOrder, limit: Option<usize>) -> Self {
        let total_senders = senders.len();
        let total_messages = senders.iter().map(|s| s.count).sum();

        match sort {
            SortOrder::Count => senders.sort_by(|a, b| {
                b.count
                    .cmp(&a.count)
                    .then_with(|| b.last_date.cmp(&a.last_date))
                    .then_with(|| a.key.cmp(&b.key))
            }),
            SortOrder::Recent => senders.sort_by(|a, b| {
                b.last_date
                    .cmp(&a.last_date)
                    .then_with(|| a.key.cmp(&b.key))
            }),
        }
        if let Some(limit) = limit {
            senders.truncate(limit);
        }

        Self {
            account_id: account_id.to_string(),
            generated_at: Utc::now(),
            total_senders,
            total_messages,
            senders,
        }
    }

    /// Generate Markdown report
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str("# Sender Report\n\n");
        md.push_str(&format!(
            "Generated: {}\n\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S")
        ));

        md.push_str("## Summary\n\n");
        md.push_str(&format!("- **Account:** {}\n", self.account_id));
        md.push_str(&format!("- **Senders:** {}\n", self.total_senders));
        md.push_str(&format!("- **Messages:** {}\n", self.total_messages));
        let newsletters = self.senders.iter().filter(|s| s.is_newsletter).count();
        md.push_str(&format!("- **Newsletters shown:** {}\n\n", newsletters));

        if self.senders.is_empty() {
            md.push_str("_No senders recorded. Run `sender-sweep sync` first._\n");
            return md;
        }

        md.push_str("## Senders\n\n");
        md.push_str("| Sender | Email | Messages | Unread | First seen | Last seen | Unsubscribe |\n");
        md.push_str("|--------|-------|----------|--------|------------|-----------|-------------|\n");
        for s in &self.senders {
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                escape_cell(&truncate_string(&s.key.name, 40)),
                escape_cell(&s.key.email),
                s.count,
                s.unread_count,
                s.first_date.format("%Y-%m-%d"),
                s.last_date.format("%Y-%m-%d"),
                unsubscribe_label(s)
            ));
        }

        md
    }

    /// Save report to file
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, self.to_markdown()).await
    }
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|")
}

fn unsubscribe_label(stats: &SenderStats) -> &'static str {
    match (&stats.unsubscribe_link, &stats.mailto_link) {
        (Some(_), _) if stats.one_click => "one-click",
        (Some(_), _) => "link",
        (None, Some(_)) => "email",
        (None, None) => "-",
    }
}

/// Env token, then credentials file, then `SENDER_SWEEP_CLIENT_*` variables
pub async fn token_provider(cli: &Cli, kind: ProviderKind) -> Result<Arc<dyn TokenProvider>> {
    if let Some(token) = StaticTokenProvider::from_env() {
        info!("Using access token from SENDER_SWEEP_ACCESS_TOKEN");
        return Ok(Arc::new(token));
    }

    if let Some(parent) = cli.token_cache.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let provider = if cli.credentials.exists() {
        OAuthTokenProvider::initialize(kind, &cli.credentials, &cli.token_cache).await?
    } else {
        let secret = auth::load_credentials_from_env(kind).map_err(|e| {
            SyncError::AuthError(format!(
                "No credentials file at {:?} and no environment credentials: {}",
                cli.credentials, e
            ))
        })?;
        OAuthTokenProvider::with_secret(kind, secret, &cli.token_cache).await?
    };

    if cli.token_cache.exists() {
        auth::secure_token_file(&cli.token_cache).await?;
    }
    Ok(Arc::new(provider))
}

/// Wire requester, provider and JSON store into an engine
pub async fn build_engine(cli: &Cli, config: &Config) -> Result<SyncEngine> {
    let tokens = token_provider(cli, config.provider.kind).await?;
    let requester = RateLimitedRequester::new(
        tokens,
        RetryPolicy::from_config(&config.retry),
        &config.http,
    )?;
    let provider = build_provider(config, requester.clone());

    let store = Arc::new(JsonFileStore::open(&config.sync.store_path).await?);
    let engine = SyncEngine::new(provider, store.clone(), store, config).await?;

    Ok(if config.unsubscribe.one_click_post {
        engine.with_one_click_requester(requester)
    } else {
        engine
    })
}

pub async fn run_sync(engine: &mut SyncEngine, full: bool, reporter: &ProgressReporter) -> Result<SyncReport> {
    let spinner = reporter.add_spinner(if full {
        "Running full sync..."
    } else {
        "Synchronizing..."
    });

    match engine.run(full).await {
        Ok(report) => {
            reporter.finish_spinner(
                &spinner,
                &format!(
                    "{:?} sync: {} messages fetched over {} pages",
                    report.mode, report.messages_fetched, report.pages
                ),
            );
            Ok(report)
        }
        Err(e) => {
            spinner.finish_and_clear();
            Err(e)
        }
    }
}

/// Resolve addresses to targets; unknown addresses are reported and skipped
pub async fn resolve_targets(
    engine: &SyncEngine,
    emails: &[String],
    reporter: &ProgressReporter,
) -> Result<Vec<SenderTarget>> {
    let mut targets = Vec::new();
    for email in emails {
        let senders = engine.find_senders(email).await?;
        if senders.is_empty() {
            warn!("No messages recorded from {}", email);
            reporter.println(&format!("  ! No messages recorded from {}", email));
            continue;
        }
        targets.extend(senders.iter().map(SenderTarget::from));
    }
    Ok(targets)
}

/// Confirm, then delete or archive; `None` when nothing ran
pub async fn run_mutation(
    cli: &Cli,
    engine: &SyncEngine,
    op: MutationOp,
    emails: &[String],
    reporter: &ProgressReporter,
) -> Result<Option<BulkMutationReport>> {
    let targets = resolve_targets(engine, emails, reporter).await?;
    let total: usize = targets.iter().map(|t| t.message_ids.len()).sum();

    if total == 0 {
        reporter.println("Nothing to do.");
        return Ok(None);
    }

    reporter.println(&format!("\nMessages to {}:", op));
    for target in &targets {
        reporter.println(&format!("  - {}: {}", target.key, target.message_ids.len()));
    }

    if cli.dry_run {
        reporter.println(&format!("\nWould {} {} messages (dry run)", op, total));
        return Ok(None);
    }

    if !cli.yes && !confirm_action(&format!("{} {} messages?", capitalize(&op.to_string()), total))? {
        reporter.println("Aborted.");
        return Ok(None);
    }

    let pb = reporter.add_spinner(&format!("Applying {} to {} messages...", op, total));
    let result = engine.apply_mutation(op, &targets).await;
    pb.finish_and_clear();
    result.map(Some)
}

pub async fn run_unsubscribe(
    cli: &Cli,
    engine: &SyncEngine,
    email: &str,
    reporter: &ProgressReporter,
) -> Result<Option<UnsubscribeOutcome>> {
    let senders = engine.find_senders(email).await?;
    let Some(sender) = senders.iter().max_by_key(|s| s.last_date) else {
        return Err(SyncError::NotFound(format!("No sender with address {}", email)));
    };

    reporter.println(&format!(
        "{}: link {}, mailto {}, one-click {}",
        sender.key,
        sender.unsubscribe_link.as_deref().unwrap_or("-"),
        sender.mailto_link.as_deref().unwrap_or("-"),
        if sender.one_click { "yes" } else { "no" }
    ));

    if cli.dry_run {
        reporter.println("Dry run: no unsubscribe request sent.");
        return Ok(None);
    }

    if sender.unsubscribe_link.is_none()
        && sender.mailto_link.is_some()
        && !cli.yes
        && !confirm_action(&format!("Send an unsubscribe email for {}?", sender.key))?
    {
        reporter.println("Aborted.");
        return Ok(None);
    }

    engine.unsubscribe(email).await.map(Some)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Prompt user for confirmation
fn confirm_action(prompt: &str) -> Result<bool> {
    inquire::Confirm::new(prompt)
        .with_default(false)
        .prompt()
        .map_err(|e| SyncError::StateError(format!("Confirmation failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderKey;
    use chrono::TimeZone;

    fn sender(name: &str, email: &str, count: usize, day: u32) -> SenderStats {
        let date = Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap();
        let mut s = SenderStats::new(SenderKey::new(name, email), date);
        s.count = count;
        s.message_ids = (0..count).map(|i| format!("{}-{}", email, i)).collect();
        s
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short", 10), "short");
        assert_eq!(truncate_string("a much longer name", 10), "a much ...");
    }

    #[test]
    fn test_report_sorting_and_limit() {
        let senders = vec![
            sender("A", "a@x.test", 2, 20),
            sender("B", "b@x.test", 9, 1),
            sender("C", "c@x.test", 5, 25),
        ];

        let by_count = SenderReport::new("acct", senders.clone(), SortOrder::Count, Some(2));
        let emails: Vec<&str> = by_count.senders.iter().map(|s| s.key.email.as_str()).collect();
        assert_eq!(emails, vec!["b@x.test", "c@x.test"]);
        assert_eq!(by_count.total_senders, 3);
        assert_eq!(by_count.total_messages, 16);

        let by_recent = SenderReport::new("acct", senders, SortOrder::Recent, None);
        assert_eq!(by_recent.senders[0].key.email, "c@x.test");
    }

    #[test]
    fn test_markdown_escapes_pipes() {
        let mut s = sender("Pipe | Co", "p@x.test", 1, 1);
        s.offer_http_link("https://p.test/u", true, s.last_date);
        let md = SenderReport::new("acct", vec![s], SortOrder::Count, None).to_markdown();

        assert!(md.contains("Pipe \\| Co"));
        assert!(md.contains("| one-click |"));
        assert!(md.contains("- **Newsletters shown:** 1"));
    }

    #[test]
    fn test_empty_report() {
        let md = SenderReport::new("acct", Vec::new(), SortOrder::Count, None).to_markdown();
        assert!(md.contains("No senders recorded"));
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::parse_from(["sender-sweep", "delete", "a@x.test", "b@x.test", "--dry-run", "-y"]);
        assert!(cli.dry_run);
        assert!(cli.yes);
        match cli.command {
            Commands::Delete { senders } => assert_eq!(senders.len(), 2),
            other => panic!("unexpected command {:?}", other),
        }
    }
}

//! # tally-syncd
//!
//! Sync daemon and operator CLI for Tally.
//!
//! ## Usage
//! ```bash
//! # Run the scheduler until Ctrl+C / SIGTERM
//! tally-syncd run
//!
//! # One-off sync of every active account, or of one account
//! tally-syncd sync
//! tally-syncd sync --account <id> --full
//! tally-syncd sync --account <id> --since 2026-02-01T00:00:00Z
//!
//! # Account management
//! tally-syncd add-account file_import "Exports" '{"path": "/data/export.json"}'
//! tally-syncd accounts
//! tally-syncd history <account-id> --limit 20
//! tally-syncd providers
//!
//! # Use a specific config file
//! tally-syncd --config ./tally.toml sync
//! ```
//!
//! ## Startup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  TallyConfig::load ─► Database::new ─► CredentialVault::open           │
//! │        │                                       │                        │
//! │        │                                       ▼                        │
//! │        │                      migrate plaintext credentials             │
//! │        ▼                                                                │
//! │  FetcherRegistry::with_builtin ─► SyncOrchestrator ─► command           │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tally_core::Credentials;
use tally_db::{Database, DbConfig};
use tally_sync::{
    AccountService, CredentialVault, FetcherRegistry, OrchestratorSettings, ProgressTracker,
    SyncOptions, SyncOrchestrator, SyncScheduler, TallyConfig,
};

const USAGE: &str = "\
Usage: tally-syncd [--config <PATH>] <COMMAND>

Commands:
  run                                        Sync on an interval until stopped
  sync [--account <ID>] [--full] [--since <RFC3339>]
                                             Sync once and print the reports
  add-account <PROVIDER> <LABEL> <CREDENTIALS_JSON>
                                             Validate and store a new account
  accounts                                   List accounts
  history <ACCOUNT_ID> [--limit <N>]         Show recent sync attempts
  providers                                  List registered providers

Options:
  -c, --config <PATH>    Config file (default: platform config dir)
  -h, --help             Show this help message";

// =============================================================================
// Command Line
// =============================================================================

#[derive(Debug)]
enum Command {
    Run,
    Sync {
        account: Option<String>,
        options: SyncOptions,
    },
    AddAccount {
        provider_id: String,
        label: String,
        credentials: String,
    },
    Accounts,
    History {
        account_id: String,
        limit: u32,
    },
    Providers,
    Help,
}

#[derive(Debug)]
struct Cli {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> anyhow::Result<Cli> {
    let mut config_path = None;
    let mut positional = Vec::new();
    let mut account = None;
    let mut full = false;
    let mut since = None;
    let mut limit = 20;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(flag_value(args, i)?));
                i += 1;
            }
            "--account" | "-a" => {
                account = Some(flag_value(args, i)?.to_string());
                i += 1;
            }
            "--since" => {
                let value = flag_value(args, i)?;
                let parsed = value
                    .parse::<DateTime<Utc>>()
                    .with_context(|| format!("invalid --since value '{}'", value))?;
                since = Some(parsed);
                i += 1;
            }
            "--limit" | "-n" => {
                let value = flag_value(args, i)?;
                limit = value
                    .parse()
                    .with_context(|| format!("invalid --limit value '{}'", value))?;
                i += 1;
            }
            "--full" => full = true,
            "--help" | "-h" => {
                return Ok(Cli {
                    config_path,
                    command: Command::Help,
                })
            }
            other if other.starts_with('-') => bail!("unknown option '{}'", other),
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    if full && since.is_some() {
        bail!("--full and --since cannot be combined");
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("run") => Command::Run,
        Some("sync") => Command::Sync {
            account,
            options: match (full, since) {
                (true, _) => SyncOptions::full_resync(),
                (false, Some(since)) => SyncOptions::since(since),
                (false, None) => SyncOptions::incremental(),
            },
        },
        Some("add-account") => {
            let (Some(provider_id), Some(label), Some(credentials)) =
                (positional.next(), positional.next(), positional.next())
            else {
                bail!("add-account needs <PROVIDER> <LABEL> <CREDENTIALS_JSON>");
            };
            Command::AddAccount {
                provider_id,
                label,
                credentials,
            }
        }
        Some("accounts") => Command::Accounts,
        Some("history") => Command::History {
            account_id: positional
                .next()
                .ok_or_else(|| anyhow!("history needs <ACCOUNT_ID>"))?,
            limit,
        },
        Some("providers") => Command::Providers,
        Some(other) => bail!("unknown command '{}'", other),
    };

    if let Some(extra) = positional.next() {
        bail!("unexpected argument '{}'", extra);
    }

    Ok(Cli {
        config_path,
        command,
    })
}

fn flag_value(args: &[String], i: usize) -> anyhow::Result<&str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("{} needs a value", args[i]))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {:#}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    if let Command::Help = cli.command {
        println!("{}", USAGE);
        return Ok(());
    }

    init_tracing();

    let config = TallyConfig::load(cli.config_path).context("failed to load configuration")?;
    let app = App::open(&config).await?;

    match cli.command {
        Command::Run => app.run(&config).await,
        Command::Sync { account, options } => app.sync(account.as_deref(), options).await,
        Command::AddAccount {
            provider_id,
            label,
            credentials,
        } => app.add_account(&provider_id, &label, &credentials).await,
        Command::Accounts => app.list_accounts().await,
        Command::History { account_id, limit } => app.history(&account_id, limit).await,
        Command::Providers => {
            for provider_id in app.registry.provider_ids() {
                println!("{}", provider_id);
            }
            Ok(())
        }
        Command::Help => Ok(()),
    }
}

/// Initializes the tracing subscriber for logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tally_sync=trace` - Show trace for the sync engine only
/// - Default: INFO, DEBUG for tally crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Application
// =============================================================================

struct App {
    db: Database,
    registry: Arc<FetcherRegistry>,
    accounts: AccountService,
    orchestrator: SyncOrchestrator,
}

impl App {
    async fn open(config: &TallyConfig) -> anyhow::Result<Self> {
        let db_path = &config.storage.database_path;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let db = Database::new(DbConfig::new(db_path))
            .await
            .context("failed to open database")?;
        let vault = Arc::new(
            CredentialVault::open_async(&config.storage.key_path)
                .await
                .context("failed to open credential vault")?,
        );
        let registry = Arc::new(FetcherRegistry::with_builtin());
        info!(providers = ?registry.provider_ids(), "Fetchers registered");

        let accounts = AccountService::new(db.clone(), vault.clone(), registry.clone());
        accounts
            .migrate_plaintext_credentials()
            .await
            .context("failed to migrate plaintext credentials")?;

        let orchestrator = SyncOrchestrator::new(db.clone(), vault, registry.clone())
            .with_progress(ProgressTracker::new(config.sync.progress_idle()))
            .with_settings(OrchestratorSettings::from(&config.sync));

        Ok(App {
            db,
            registry,
            accounts,
            orchestrator,
        })
    }

    async fn run(self, config: &TallyConfig) -> anyhow::Result<()> {
        let (scheduler, handle) =
            SyncScheduler::new(self.orchestrator, self.db.clone(), &config.sync);
        let task = tokio::spawn(scheduler.run());

        shutdown_signal().await;

        if let Err(e) = handle.shutdown().await {
            warn!(error = %e, "Scheduler already stopped");
        }
        task.await.context("scheduler task failed")?;

        self.db.close().await;
        info!("Shutdown complete");
        Ok(())
    }

    async fn sync(&self, account: Option<&str>, options: SyncOptions) -> anyhow::Result<()> {
        let reports = match account {
            Some(account_id) => vec![self.orchestrator.sync_account(account_id, options).await?],
            None => {
                let mut reports = Vec::new();
                for result in self.orchestrator.sync_all_accounts(options).await? {
                    match result.result {
                        Ok(report) => reports.push(report),
                        Err(e) => error!(account_id = %result.account_id, error = %e, "Sync skipped"),
                    }
                }
                reports
            }
        };

        println!("{}", serde_json::to_string_pretty(&reports)?);
        Ok(())
    }

    async fn add_account(
        &self,
        provider_id: &str,
        label: &str,
        credentials_json: &str,
    ) -> anyhow::Result<()> {
        let credentials: Credentials =
            serde_json::from_str(credentials_json).context("credentials must be a JSON object")?;

        let account = self.accounts.create(provider_id, label, &credentials).await?;
        println!("{}", serde_json::to_string_pretty(&account)?);
        Ok(())
    }

    async fn list_accounts(&self) -> anyhow::Result<()> {
        let accounts = self.accounts.list().await?;
        println!("{}", serde_json::to_string_pretty(&accounts)?);
        Ok(())
    }

    async fn history(&self, account_id: &str, limit: u32) -> anyhow::Result<()> {
        self.accounts.get(account_id).await?;
        let logs = self.accounts.history(account_id, limit).await?;
        println!("{}", serde_json::to_string_pretty(&logs)?);
        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM.
///
/// A signal source that cannot be installed is logged and never fires, so the
/// other one still stops the daemon.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, stopping scheduler...");
}

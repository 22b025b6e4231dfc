use std::io::{self, BufRead};
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mailsync::config::{Config, EmailAccount};
use mailsync::connection::ImapIdleStore;
use mailsync::credentials::CredentialManager;
use mailsync::imap_store::ImapStore;
use mailsync::listener::LoggingListener;
use mailsync::store::LocalStore;
use mailsync::timer::ThreadRefreshManager;
use mailsync::wakelock::NoopWakeLock;
use mailsync::{AccountPusher, ImapSync, MailError, PushCallback, SqliteStore};

/// Keeps a local copy of IMAP folders in sync, using IDLE when the server supports it
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to config file
    #[clap(short, long, default_value = "~/.config/mailsync/config.json")]
    config: String,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync pass for a folder
    Sync {
        /// Folder to synchronize
        #[clap(short, long, default_value = "INBOX")]
        folder: String,

        /// Account name or email address (defaults to the default account)
        #[clap(short, long)]
        account: Option<String>,
    },

    /// Watch the account's push folders with IDLE and sync on every change
    Watch {
        /// Account name or email address (defaults to the default account)
        #[clap(short, long)]
        account: Option<String>,
    },

    /// List the server's folders and register them locally
    Folders {
        /// Account name or email address (defaults to the default account)
        #[clap(short, long)]
        account: Option<String>,
    },

    /// List configured accounts
    ListAccounts,

    /// Store the IMAP password in the system keyring (read from stdin)
    SetPassword {
        /// Account name or email address
        #[clap(short, long)]
        account: Option<String>,

        /// Remove the stored password instead
        #[clap(long)]
        delete: bool,
    },
}

/// Runs a sync pass for every folder the server reports as changed.
struct SyncOnPush {
    sync: ImapSync,
    config: Config,
    account: String,
    fallback: mpsc::Sender<String>,
}

impl PushCallback for SyncOnPush {
    fn on_push_event(&self, folder_server_id: &str) {
        let listener = LoggingListener::new(&self.account);
        self.sync.sync(folder_server_id, &self.config.sync_config(), &listener);
    }

    fn on_push_error(&self, folder_server_id: &str, error: &MailError) {
        log::warn!("[{}] Push for {} failed: {}", self.account, folder_server_id, error);
    }

    fn on_push_not_supported(&self, folder_server_id: &str) {
        log::warn!("[{}] Server does not support IDLE, {} will be polled", self.account, folder_server_id);
        if self.fallback.send(folder_server_id.to_string()).is_err() {
            log::debug!("Polling fallback is gone");
        }
    }
}

fn open_database(config: &Config) -> Result<Arc<SqliteStore>> {
    let path = config.database_path();
    let store = SqliteStore::new(&path)?;
    log::debug!("Using database {}", store.get_database_path());
    Ok(Arc::new(store))
}

fn build_sync(config: &Config, account: &EmailAccount, credentials: &CredentialManager) -> Result<ImapSync> {
    let settings = account.server_settings(credentials)?;
    let local: Arc<dyn LocalStore> = open_database(config)?;
    Ok(ImapSync::new(&account.name, local, Arc::new(ImapStore::new(settings))))
}

fn watch(config: &Config, account: &EmailAccount, credentials: &CredentialManager) -> Result<()> {
    if !config.push.enabled {
        anyhow::bail!("Push is disabled in the configuration");
    }

    let settings = account.server_settings(credentials)?;
    let sync_config = config.sync_config();
    let listener = LoggingListener::new(&account.name);
    let initial = build_sync(config, account, credentials)?;
    for folder in &account.push_folders {
        initial.sync(folder, &sync_config, &listener);
    }

    let (fallback_tx, fallback_rx) = mpsc::channel();
    let callback = Arc::new(SyncOnPush {
        sync: initial,
        config: config.clone(),
        account: account.name.clone(),
        fallback: fallback_tx,
    });

    let refresh_manager = Arc::new(ThreadRefreshManager::new());
    let mut pusher = AccountPusher::new(
        Arc::new(ImapIdleStore::new(settings)),
        refresh_manager,
        Arc::new(NoopWakeLock),
        callback.clone(),
        config.idle_refresh_timeout(),
    );
    pusher.start(&account.push_folders);
    log::info!("[{}] Watching {:?}", account.name, pusher.folders());

    // Folders without IDLE support are polled at the refresh interval.
    let mut polled: Vec<String> = Vec::new();
    loop {
        match fallback_rx.recv_timeout(config.idle_refresh_timeout()) {
            Ok(folder) => {
                if !polled.contains(&folder) {
                    polled.push(folder);
                }
                let pushed: Vec<String> = account
                    .push_folders
                    .iter()
                    .filter(|f| !polled.contains(f))
                    .cloned()
                    .collect();
                pusher.update_folders(&pushed);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                for folder in &polled {
                    callback.on_push_event(folder);
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    pusher.stop();
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logger
    env_logger::Builder::new()
        .filter_level(if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .parse_default_env()
        .init();

    // Load configuration
    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    let credentials = CredentialManager::new();

    match args.command {
        Commands::Sync { folder, account } => {
            let account = config.get_account(account.as_deref())?;
            let sync = build_sync(&config, account, &credentials)?;
            let listener = LoggingListener::new(&account.name);
            sync.sync(&folder, &config.sync_config(), &listener);
        }
        Commands::Watch { account } => {
            let account = config.get_account(account.as_deref())?;
            watch(&config, account, &credentials)?;
        }
        Commands::Folders { account } => {
            let account = config.get_account(account.as_deref())?;
            let store = ImapStore::new(account.server_settings(&credentials)?);
            let folders = store.list_folders()?;
            open_database(&config)?.create_folders(&folders)?;
            for folder in &folders {
                println!("{}", folder.server_id);
            }
        }
        Commands::ListAccounts => {
            println!("Configured accounts:");
            for (i, account) in config.accounts.iter().enumerate() {
                println!(
                    "{}. {} <{}> {}",
                    i,
                    account.name,
                    account.email,
                    if i == config.default_account { "(default)" } else { "" }
                );
            }
        }
        Commands::SetPassword { account, delete } => {
            let account = config.get_account(account.as_deref())?;
            if delete {
                credentials.delete_password(&account.email, "imap")?;
                println!("Password removed for {}", account.email);
            } else {
                println!("Enter IMAP password for {}:", account.email);
                let mut password = String::new();
                io::stdin().lock().read_line(&mut password)?;
                credentials.store_password(&account.email, "imap", password.trim_end_matches(['\r', '\n']))?;
                println!("Password stored for {}", account.email);
            }
        }
    }

    Ok(())
}

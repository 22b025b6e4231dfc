pub mod config;
pub mod connection;
pub mod credentials;
pub mod database;
pub mod error;
pub mod idle;
pub mod imap_store;
pub mod listener;
pub mod memory;
pub mod message;
pub mod push;
pub mod remote;
pub mod store;
pub mod sync;
pub mod timer;
pub mod wakelock;

// Re-export commonly used types
pub use config::{Config, EmailAccount};
pub use database::SqliteStore;
pub use error::MailError;
pub use idle::{FolderIdler, IdlePhase, IdleResult};
pub use listener::{ChannelListener, SyncEvent, SyncListener};
pub use memory::MemoryStore;
pub use message::{DownloadState, ExpungePolicy, Flag, LocalMessageRecord, RemoteMessageSummary, SyncConfig};
pub use push::{AccountPusher, FolderPusher, PushCallback};
pub use store::LocalStore;
pub use sync::ImapSync;

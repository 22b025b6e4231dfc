use std::sync::mpsc;

use crate::error::MailError;

/// Receives progress of a sync pass, synchronously and in order.
///
/// For every pass `sync_started` comes first and `sync_finished` comes last,
/// exactly once, whatever happened in between.
pub trait SyncListener {
    fn sync_started(&self, folder_server_id: &str);
    fn sync_authentication_success(&self);
    fn sync_new_message(&self, folder_server_id: &str, message_server_id: &str, is_old_message: bool);
    fn sync_flags_updated(&self, folder_server_id: &str, message_server_id: &str);
    fn sync_removed_message(&self, folder_server_id: &str, message_server_id: &str);
    fn sync_failed(&self, folder_server_id: &str, message: &str, error: &MailError);
    fn sync_finished(&self, folder_server_id: &str);
}

/// The listener callbacks as values, for consumers that prefer a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Started {
        folder: String,
    },
    AuthenticationSuccess,
    NewMessage {
        folder: String,
        server_id: String,
        is_old_message: bool,
    },
    FlagsUpdated {
        folder: String,
        server_id: String,
    },
    RemovedMessage {
        folder: String,
        server_id: String,
    },
    Failed {
        folder: String,
        message: String,
        error: String,
    },
    Finished {
        folder: String,
    },
}

/// Forwards every callback as a [`SyncEvent`] over an mpsc channel.
///
/// A closed receiver is not an error for the sync pass; events are dropped.
#[derive(Clone)]
pub struct ChannelListener {
    tx: mpsc::Sender<SyncEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::Sender<SyncEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::Receiver<SyncEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SyncEvent) {
        if let Err(e) = self.tx.send(event) {
            log::trace!("Sync event dropped, receiver closed: {:?}", e.0);
        }
    }
}

impl SyncListener for ChannelListener {
    fn sync_started(&self, folder_server_id: &str) {
        self.send(SyncEvent::Started {
            folder: folder_server_id.to_string(),
        });
    }

    fn sync_authentication_success(&self) {
        self.send(SyncEvent::AuthenticationSuccess);
    }

    fn sync_new_message(&self, folder_server_id: &str, message_server_id: &str, is_old_message: bool) {
        self.send(SyncEvent::NewMessage {
            folder: folder_server_id.to_string(),
            server_id: message_server_id.to_string(),
            is_old_message,
        });
    }

    fn sync_flags_updated(&self, folder_server_id: &str, message_server_id: &str) {
        self.send(SyncEvent::FlagsUpdated {
            folder: folder_server_id.to_string(),
            server_id: message_server_id.to_string(),
        });
    }

    fn sync_removed_message(&self, folder_server_id: &str, message_server_id: &str) {
        self.send(SyncEvent::RemovedMessage {
            folder: folder_server_id.to_string(),
            server_id: message_server_id.to_string(),
        });
    }

    fn sync_failed(&self, folder_server_id: &str, message: &str, error: &MailError) {
        self.send(SyncEvent::Failed {
            folder: folder_server_id.to_string(),
            message: message.to_string(),
            error: error.to_string(),
        });
    }

    fn sync_finished(&self, folder_server_id: &str) {
        self.send(SyncEvent::Finished {
            folder: folder_server_id.to_string(),
        });
    }
}

/// Writes sync progress to the log. Used by the command line front end.
pub struct LoggingListener {
    account: String,
}

impl LoggingListener {
    pub fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
        }
    }
}

impl SyncListener for LoggingListener {
    fn sync_started(&self, folder_server_id: &str) {
        log::info!("[{}] Sync of {} started", self.account, folder_server_id);
    }

    fn sync_authentication_success(&self) {
        log::debug!("[{}] Authenticated", self.account);
    }

    fn sync_new_message(&self, folder_server_id: &str, message_server_id: &str, is_old_message: bool) {
        if is_old_message {
            log::info!("[{}] {}: downloaded previously missed message {}", self.account, folder_server_id, message_server_id);
        } else {
            log::info!("[{}] {}: new message {}", self.account, folder_server_id, message_server_id);
        }
    }

    fn sync_flags_updated(&self, folder_server_id: &str, message_server_id: &str) {
        log::debug!("[{}] {}: flags of {} changed", self.account, folder_server_id, message_server_id);
    }

    fn sync_removed_message(&self, folder_server_id: &str, message_server_id: &str) {
        log::info!("[{}] {}: message {} removed", self.account, folder_server_id, message_server_id);
    }

    fn sync_failed(&self, folder_server_id: &str, message: &str, error: &MailError) {
        log::error!("[{}] Sync of {} failed: {} ({})", self.account, folder_server_id, message, error);
    }

    fn sync_finished(&self, folder_server_id: &str) {
        log::info!("[{}] Sync of {} finished", self.account, folder_server_id);
    }
}

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::MailError;
use crate::listener::SyncListener;
use crate::message::{
    DownloadState, ExpungePolicy, Flag, FolderInfo, LocalMessageRecord, RemoteMessageSummary, SyncConfig,
};
use crate::remote::{FetchMode, OpenMode, RemoteFolder, RemoteStore};
use crate::store::{FolderSyncState, LocalStore};

/// An error together with the step that produced it.
#[derive(Debug)]
struct SyncFailure {
    context: String,
    error: MailError,
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.error)
    }
}

trait SyncStep<T> {
    fn step<F: FnOnce() -> String>(self, context: F) -> Result<T, SyncFailure>;
}

impl<T, E: Into<MailError>> SyncStep<T> for Result<T, E> {
    fn step<F: FnOnce() -> String>(self, context: F) -> Result<T, SyncFailure> {
        self.map_err(|e| SyncFailure {
            context: context(),
            error: e.into(),
        })
    }
}

/// Sequence numbers to list for a folder of `count` messages.
///
/// Returns `None` for an empty folder. A limit of 0 means the whole folder.
pub fn listing_window(count: u32, visible_limit: u32) -> Option<(u32, u32)> {
    if count == 0 {
        return None;
    }
    let start = if visible_limit == 0 || count <= visible_limit {
        1
    } else {
        count - visible_limit + 1
    };
    Some((start, count))
}

fn tracked(flags: &HashSet<Flag>, sync_flags: &HashSet<Flag>) -> HashSet<Flag> {
    flags.intersection(sync_flags).cloned().collect()
}

/// Brings the local copy of a folder in line with the server.
///
/// Passes for the same folder must not run concurrently.
pub struct ImapSync {
    account_name: String,
    local_store: Arc<dyn LocalStore>,
    remote_store: Arc<dyn RemoteStore>,
}

impl ImapSync {
    pub fn new(account_name: &str, local_store: Arc<dyn LocalStore>, remote_store: Arc<dyn RemoteStore>) -> Self {
        Self {
            account_name: account_name.to_string(),
            local_store,
            remote_store,
        }
    }

    /// Run one pass. Never fails: problems are reported through
    /// `sync_failed`, and `sync_finished` is always the last callback.
    pub fn sync(&self, folder: &str, config: &SyncConfig, listener: &dyn SyncListener) {
        log::info!("[{}] Synchronizing folder {}", self.account_name, folder);
        listener.sync_started(folder);

        let mut remote_folder: Option<Box<dyn RemoteFolder>> = None;
        if let Err(failure) = self.synchronize(folder, config, listener, &mut remote_folder) {
            log::error!("[{}] Sync of {} failed: {}", self.account_name, folder, failure);
            listener.sync_failed(folder, &failure.to_string(), &failure.error);
        }

        if let Some(mut remote_folder) = remote_folder {
            remote_folder.close();
        }

        log::info!("[{}] Done synchronizing folder {}", self.account_name, folder);
        listener.sync_finished(folder);
    }

    fn synchronize(
        &self,
        folder: &str,
        config: &SyncConfig,
        listener: &dyn SyncListener,
        remote_slot: &mut Option<Box<dyn RemoteFolder>>,
    ) -> Result<(), SyncFailure> {
        let local = self.local_store.as_ref();

        local
            .create_folders(&[FolderInfo {
                server_id: folder.to_string(),
                name: folder.to_string(),
            }])
            .step(|| format!("Preparing local folder {}", folder))?;

        let remote = remote_slot.insert(
            self.remote_store
                .folder(folder)
                .step(|| format!("Getting remote folder {}", folder))?,
        );
        remote
            .open(OpenMode::ReadOnly)
            .step(|| format!("Opening remote folder {}", folder))?;
        listener.sync_authentication_success();

        let count = remote
            .message_count()
            .step(|| format!("Getting message count of {}", folder))?;
        if count < 0 {
            return Err(SyncFailure {
                context: "Checking message count".to_string(),
                error: MailError::Sync(format!("Message count {} for folder {}", count, folder)),
            });
        }
        log::debug!("[{}] Remote folder {} has {} message(s)", self.account_name, folder, count);

        let mut state = FolderSyncState::load(local, folder)
            .step(|| format!("Loading sync state of {}", folder))?;
        self.check_uid_validity(folder, remote.uid_validity(), &mut state)?;

        let count = u32::try_from(count).unwrap_or(u32::MAX);
        let remote_messages = match listing_window(count, config.default_visible_limit) {
            Some((start, end)) => remote
                .list_messages(start, end, config.earliest_poll_date)
                .step(|| format!("Listing messages {}:{} of {}", start, end, folder))?,
            None => Vec::new(),
        };

        // Messages older than the cutoff are not kept, whatever the server says.
        let remote_messages: Vec<RemoteMessageSummary> = remote_messages
            .into_iter()
            .filter(|m| match (config.earliest_poll_date, m.date) {
                (Some(cutoff), Some(date)) => date >= cutoff,
                _ => true,
            })
            .collect();

        let local_messages = local
            .get_all_messages_and_dates(folder)
            .step(|| format!("Reading local messages of {}", folder))?;
        let remote_ids: HashSet<String> = remote_messages.iter().map(|m| m.server_id()).collect();

        let mut highest_seen: Option<u32> = None;
        let mut new_messages = Vec::new();

        for message in &remote_messages {
            highest_seen = highest_seen.max(Some(message.uid));
            let server_id = message.server_id();

            if local_messages.contains_key(&server_id) {
                self.update_existing(folder, config, message, listener)?;
            } else if message.is_deleted() {
                log::debug!("Not downloading {} in {}, flagged as deleted", server_id, folder);
            } else {
                new_messages.push(message);
            }
        }

        new_messages.sort_by_key(|m| m.uid);
        for message in new_messages {
            self.download(folder, config, remote.as_mut(), message, &state, listener)?;
        }

        if config.sync_remote_deletions {
            self.remove_vanished(folder, config, &local_messages, &remote_ids, listener)?;
        }

        if let Some(uid) = highest_seen {
            state
                .update_highest_known_uid(local, folder, u64::from(uid))
                .step(|| format!("Storing highest known UID of {}", folder))?;
        }

        match config.expunge_policy {
            ExpungePolicy::OnPoll => {
                log::debug!("[{}] Expunging {}", self.account_name, folder);
                remote
                    .expunge()
                    .step(|| format!("Expunging {}", folder))?;
            }
            ExpungePolicy::Immediately | ExpungePolicy::Manually => {}
        }

        Ok(())
    }

    fn check_uid_validity(
        &self,
        folder: &str,
        remote_validity: Option<u64>,
        state: &mut FolderSyncState,
    ) -> Result<(), SyncFailure> {
        let local = self.local_store.as_ref();
        let Some(remote_validity) = remote_validity else {
            return Ok(());
        };

        match state.uid_validity {
            Some(known) if known != remote_validity => {
                log::info!(
                    "[{}] UIDVALIDITY of {} changed from {} to {}, clearing local messages",
                    self.account_name,
                    folder,
                    known,
                    remote_validity
                );
                local
                    .remove_all_messages(folder)
                    .step(|| format!("Clearing messages of {}", folder))?;
                state
                    .reset_epoch(local, folder, remote_validity)
                    .step(|| format!("Resetting sync state of {}", folder))?;
            }
            Some(_) => {}
            None => {
                state
                    .record_uid_validity(local, folder, remote_validity)
                    .step(|| format!("Storing UIDVALIDITY of {}", folder))?;
            }
        }
        Ok(())
    }

    fn update_existing(
        &self,
        folder: &str,
        config: &SyncConfig,
        message: &RemoteMessageSummary,
        listener: &dyn SyncListener,
    ) -> Result<(), SyncFailure> {
        let local = self.local_store.as_ref();
        let server_id = message.server_id();

        if message.is_deleted() && config.sync_remote_deletions {
            local
                .remove_messages(folder, &[server_id.clone()])
                .step(|| format!("Removing deleted message {} from {}", server_id, folder))?;
            listener.sync_removed_message(folder, &server_id);
            return Ok(());
        }

        let local_flags = local
            .get_message_flags(folder, &server_id)
            .step(|| format!("Reading flags of {} in {}", server_id, folder))?
            .unwrap_or_default();

        let remote_tracked = tracked(&message.flags, &config.sync_flags);
        if tracked(&local_flags, &config.sync_flags) == remote_tracked {
            return Ok(());
        }

        let mut updated: HashSet<Flag> = local_flags
            .into_iter()
            .filter(|f| !config.sync_flags.contains(f))
            .collect();
        updated.extend(remote_tracked);

        local
            .set_message_flags(folder, &[server_id.clone()], &updated)
            .step(|| format!("Updating flags of {} in {}", server_id, folder))?;
        listener.sync_flags_updated(folder, &server_id);
        Ok(())
    }

    fn download(
        &self,
        folder: &str,
        config: &SyncConfig,
        remote: &mut dyn RemoteFolder,
        message: &RemoteMessageSummary,
        state: &FolderSyncState,
        listener: &dyn SyncListener,
    ) -> Result<(), SyncFailure> {
        let server_id = message.server_id();
        let fits = message
            .size
            .map(|size| size <= config.maximum_auto_download_message_size)
            .unwrap_or(true);
        let (mode, download_state) = if fits {
            (FetchMode::Full, DownloadState::Full)
        } else {
            (FetchMode::Header, DownloadState::Envelope)
        };

        let raw = remote
            .fetch_message(message.uid, mode)
            .step(|| format!("Downloading message {} of {}", server_id, folder))?;
        let record = LocalMessageRecord::from_download(message, &raw, download_state);
        self.local_store
            .save_message(folder, &record)
            .step(|| format!("Saving message {} of {}", server_id, folder))?;

        let is_old_message = u64::from(message.uid) <= state.highest_known_uid;
        log::debug!(
            "[{}] Downloaded {} in {} ({:?}, old={})",
            self.account_name,
            server_id,
            folder,
            download_state,
            is_old_message
        );
        listener.sync_new_message(folder, &server_id, is_old_message);
        Ok(())
    }

    fn remove_vanished(
        &self,
        folder: &str,
        config: &SyncConfig,
        local_messages: &HashMap<String, Option<chrono::DateTime<chrono::Utc>>>,
        remote_ids: &HashSet<String>,
        listener: &dyn SyncListener,
    ) -> Result<(), SyncFailure> {
        let mut vanished: Vec<&String> = local_messages
            .iter()
            .filter(|(id, date)| {
                let too_old = match (config.earliest_poll_date, date) {
                    (Some(cutoff), Some(date)) => *date < cutoff,
                    _ => false,
                };
                too_old || !remote_ids.contains(*id)
            })
            .map(|(id, _)| id)
            .collect();
        if vanished.is_empty() {
            return Ok(());
        }
        vanished.sort_by_key(|id| id.parse::<u64>().unwrap_or(u64::MAX));

        let ids: Vec<String> = vanished.into_iter().cloned().collect();
        self.local_store
            .remove_messages(folder, &ids)
            .step(|| format!("Removing {} message(s) from {}", ids.len(), folder))?;
        for id in &ids {
            listener.sync_removed_message(folder, id);
        }
        Ok(())
    }
}

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::message::{Flag, FolderInfo, LocalMessageRecord};

pub const EXTRA_HIGHEST_KNOWN_UID: &str = "imapHighestKnownUid";
pub const EXTRA_UID_VALIDITY: &str = "imapUidValidity";

/// Persisted per-folder view of the mailbox, owned by the local side.
///
/// Only the reconciler creates, updates or deletes message records.
pub trait LocalStore: Send + Sync {
    /// Create the given folders in one transaction. Existing folders are left untouched.
    fn create_folders(&self, folders: &[FolderInfo]) -> Result<()>;

    fn get_message_server_ids(&self, folder: &str) -> Result<HashSet<String>>;

    /// Server ids of all messages in the folder together with their dates.
    fn get_all_messages_and_dates(&self, folder: &str) -> Result<HashMap<String, Option<DateTime<Utc>>>>;

    fn get_message(&self, folder: &str, server_id: &str) -> Result<Option<LocalMessageRecord>>;

    fn get_message_flags(&self, folder: &str, server_id: &str) -> Result<Option<HashSet<Flag>>>;

    /// Insert or replace a message record.
    fn save_message(&self, folder: &str, message: &LocalMessageRecord) -> Result<()>;

    fn set_message_flags(&self, folder: &str, server_ids: &[String], flags: &HashSet<Flag>) -> Result<()>;

    fn remove_messages(&self, folder: &str, server_ids: &[String]) -> Result<()>;

    fn remove_all_messages(&self, folder: &str) -> Result<()>;

    fn get_folder_extra_number(&self, folder: &str, key: &str) -> Result<Option<i64>>;

    fn set_folder_extra_number(&self, folder: &str, key: &str, value: i64) -> Result<()>;
}

/// The small counters a folder keeps between passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FolderSyncState {
    pub highest_known_uid: u64,
    pub uid_validity: Option<u64>,
}

impl FolderSyncState {
    pub fn load(store: &dyn LocalStore, folder: &str) -> Result<Self> {
        let highest_known_uid = store
            .get_folder_extra_number(folder, EXTRA_HIGHEST_KNOWN_UID)?
            .map(|v| v.max(0) as u64)
            .unwrap_or(0);
        let uid_validity = store
            .get_folder_extra_number(folder, EXTRA_UID_VALIDITY)?
            .map(|v| v as u64);
        Ok(Self {
            highest_known_uid,
            uid_validity,
        })
    }

    /// Raise the highest known UID. Lower values are ignored.
    pub fn update_highest_known_uid(&mut self, store: &dyn LocalStore, folder: &str, uid: u64) -> Result<()> {
        if uid > self.highest_known_uid {
            store.set_folder_extra_number(folder, EXTRA_HIGHEST_KNOWN_UID, uid as i64)?;
            self.highest_known_uid = uid;
        }
        Ok(())
    }

    /// Start a new UIDVALIDITY epoch: the counter goes back to zero.
    pub fn reset_epoch(&mut self, store: &dyn LocalStore, folder: &str, uid_validity: u64) -> Result<()> {
        store.set_folder_extra_number(folder, EXTRA_HIGHEST_KNOWN_UID, 0)?;
        store.set_folder_extra_number(folder, EXTRA_UID_VALIDITY, uid_validity as i64)?;
        self.highest_known_uid = 0;
        self.uid_validity = Some(uid_validity);
        Ok(())
    }

    pub fn record_uid_validity(&mut self, store: &dyn LocalStore, folder: &str, uid_validity: u64) -> Result<()> {
        store.set_folder_extra_number(folder, EXTRA_UID_VALIDITY, uid_validity as i64)?;
        self.uid_validity = Some(uid_validity);
        Ok(())
    }
}

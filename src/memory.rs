use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::message::{Flag, FolderInfo, LocalMessageRecord};
use crate::store::LocalStore;

#[derive(Default)]
struct MemoryFolder {
    name: String,
    messages: BTreeMap<String, LocalMessageRecord>,
    extra_numbers: HashMap<String, i64>,
}

/// A [`LocalStore`] that keeps everything in process memory.
///
/// Folders are created on first use, so callers do not have to announce them.
#[derive(Default)]
pub struct MemoryStore {
    folders: Mutex<HashMap<String, MemoryFolder>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryFolder>> {
        self.folders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn folder_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().values().map(|f| f.name.clone()).collect();
        names.sort();
        names
    }
}

impl LocalStore for MemoryStore {
    fn create_folders(&self, folders: &[FolderInfo]) -> Result<()> {
        let mut guard = self.lock();
        for info in folders {
            guard
                .entry(info.server_id.clone())
                .or_insert_with(|| MemoryFolder {
                    name: info.name.clone(),
                    ..Default::default()
                });
        }
        Ok(())
    }

    fn get_message_server_ids(&self, folder: &str) -> Result<HashSet<String>> {
        Ok(self
            .lock()
            .get(folder)
            .map(|f| f.messages.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn get_all_messages_and_dates(&self, folder: &str) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
        Ok(self
            .lock()
            .get(folder)
            .map(|f| {
                f.messages
                    .iter()
                    .map(|(id, record)| (id.clone(), record.date))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_message(&self, folder: &str, server_id: &str) -> Result<Option<LocalMessageRecord>> {
        Ok(self
            .lock()
            .get(folder)
            .and_then(|f| f.messages.get(server_id).cloned()))
    }

    fn get_message_flags(&self, folder: &str, server_id: &str) -> Result<Option<HashSet<Flag>>> {
        Ok(self
            .lock()
            .get(folder)
            .and_then(|f| f.messages.get(server_id).map(|m| m.flags.clone())))
    }

    fn save_message(&self, folder: &str, message: &LocalMessageRecord) -> Result<()> {
        let mut guard = self.lock();
        let entry = guard.entry(folder.to_string()).or_insert_with(|| MemoryFolder {
            name: folder.to_string(),
            ..Default::default()
        });
        entry.messages.insert(message.server_id.clone(), message.clone());
        Ok(())
    }

    fn set_message_flags(&self, folder: &str, server_ids: &[String], flags: &HashSet<Flag>) -> Result<()> {
        if let Some(f) = self.lock().get_mut(folder) {
            for id in server_ids {
                if let Some(message) = f.messages.get_mut(id) {
                    message.flags = flags.clone();
                }
            }
        }
        Ok(())
    }

    fn remove_messages(&self, folder: &str, server_ids: &[String]) -> Result<()> {
        if let Some(f) = self.lock().get_mut(folder) {
            for id in server_ids {
                f.messages.remove(id);
            }
        }
        Ok(())
    }

    fn remove_all_messages(&self, folder: &str) -> Result<()> {
        if let Some(f) = self.lock().get_mut(folder) {
            f.messages.clear();
        }
        Ok(())
    }

    fn get_folder_extra_number(&self, folder: &str, key: &str) -> Result<Option<i64>> {
        Ok(self
            .lock()
            .get(folder)
            .and_then(|f| f.extra_numbers.get(key).copied()))
    }

    fn set_folder_extra_number(&self, folder: &str, key: &str, value: i64) -> Result<()> {
        let mut guard = self.lock();
        let entry = guard.entry(folder.to_string()).or_insert_with(|| MemoryFolder {
            name: folder.to_string(),
            ..Default::default()
        });
        entry.extra_numbers.insert(key.to_string(), value);
        Ok(())
    }
}

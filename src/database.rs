use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::message::{DownloadState, Flag, FolderInfo, LocalMessageRecord};
use crate::store::LocalStore;

/// SQLite backed [`LocalStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {:?}", db_path))?;

        let db = SqliteStore {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = SqliteStore {
            conn: Mutex::new(conn),
            db_path: None,
        };
        db.initialize_schema()?;
        Ok(db)
    }

    pub fn get_database_path(&self) -> String {
        self.db_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS folders (
                server_id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                folder TEXT NOT NULL,
                server_id TEXT NOT NULL,
                flags TEXT NOT NULL,          -- JSON array
                download_state TEXT NOT NULL,
                date_received INTEGER,        -- Unix timestamp
                size INTEGER,
                subject TEXT NOT NULL,
                from_address TEXT NOT NULL,
                body BLOB,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY(folder, server_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS folder_extra_numbers (
                folder TEXT NOT NULL,
                key TEXT NOT NULL,
                value INTEGER NOT NULL,
                PRIMARY KEY(folder, key)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_date
             ON messages(folder, date_received DESC)",
            [],
        )?;

        Ok(())
    }

    pub fn get_message_count(&self, folder: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE folder = ?1",
            params![folder],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn timestamp_to_date(ts: Option<i64>) -> Option<DateTime<Utc>> {
    ts.and_then(|ts| DateTime::from_timestamp(ts, 0))
}

impl LocalStore for SqliteStore {
    fn create_folders(&self, folders: &[FolderInfo]) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        for folder in folders {
            tx.execute(
                "INSERT OR IGNORE INTO folders (server_id, name) VALUES (?1, ?2)",
                params![folder.server_id, folder.name],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_message_server_ids(&self, folder: &str) -> Result<HashSet<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT server_id FROM messages WHERE folder = ?1")?;
        let rows = stmt.query_map(params![folder], |row| row.get::<_, String>(0))?;

        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    fn get_all_messages_and_dates(&self, folder: &str) -> Result<HashMap<String, Option<DateTime<Utc>>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT server_id, date_received FROM messages WHERE folder = ?1")?;
        let rows = stmt.query_map(params![folder], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;

        let mut result = HashMap::new();
        for row in rows {
            let (id, ts) = row?;
            result.insert(id, timestamp_to_date(ts));
        }
        Ok(result)
    }

    fn get_message(&self, folder: &str, server_id: &str) -> Result<Option<LocalMessageRecord>> {
        let row = self
            .conn()
            .query_row(
                "SELECT flags, download_state, date_received, size, subject, from_address, body
                 FROM messages WHERE folder = ?1 AND server_id = ?2",
                params![folder, server_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,          // flags
                        row.get::<_, String>(1)?,          // download_state
                        row.get::<_, Option<i64>>(2)?,     // date_received
                        row.get::<_, Option<u32>>(3)?,     // size
                        row.get::<_, String>(4)?,          // subject
                        row.get::<_, String>(5)?,          // from_address
                        row.get::<_, Option<Vec<u8>>>(6)?, // body
                    ))
                },
            )
            .optional()?;

        let Some((flags_json, state, ts, size, subject, from, body)) = row else {
            return Ok(None);
        };

        Ok(Some(LocalMessageRecord {
            server_id: server_id.to_string(),
            flags: serde_json::from_str(&flags_json)
                .with_context(|| format!("Corrupt flags for message {} in {}", server_id, folder))?,
            download_state: DownloadState::from_str_lossy(&state),
            date: timestamp_to_date(ts),
            size,
            subject,
            from,
            body,
        }))
    }

    fn get_message_flags(&self, folder: &str, server_id: &str) -> Result<Option<HashSet<Flag>>> {
        let flags_json: Option<String> = self
            .conn()
            .query_row(
                "SELECT flags FROM messages WHERE folder = ?1 AND server_id = ?2",
                params![folder, server_id],
                |row| row.get(0),
            )
            .optional()?;

        match flags_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save_message(&self, folder: &str, message: &LocalMessageRecord) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO messages (
                folder, server_id, flags, download_state, date_received,
                size, subject, from_address, body, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, strftime('%s', 'now'))",
            params![
                folder,
                message.server_id,
                serde_json::to_string(&message.flags)?,
                message.download_state.as_str(),
                message.date.map(|d| d.timestamp()),
                message.size,
                message.subject,
                message.from,
                message.body.as_deref(),
            ],
        )?;
        Ok(())
    }

    fn set_message_flags(&self, folder: &str, server_ids: &[String], flags: &HashSet<Flag>) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let flags_json = serde_json::to_string(flags)?;
        for id in server_ids {
            tx.execute(
                "UPDATE messages SET flags = ?1, updated_at = strftime('%s', 'now')
                 WHERE folder = ?2 AND server_id = ?3",
                params![flags_json, folder, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_messages(&self, folder: &str, server_ids: &[String]) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        for id in server_ids {
            tx.execute(
                "DELETE FROM messages WHERE folder = ?1 AND server_id = ?2",
                params![folder, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_all_messages(&self, folder: &str) -> Result<()> {
        self.conn()
            .execute("DELETE FROM messages WHERE folder = ?1", params![folder])?;
        Ok(())
    }

    fn get_folder_extra_number(&self, folder: &str, key: &str) -> Result<Option<i64>> {
        let value = self
            .conn()
            .query_row(
                "SELECT value FROM folder_extra_numbers WHERE folder = ?1 AND key = ?2",
                params![folder, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set_folder_extra_number(&self, folder: &str, key: &str, value: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO folder_extra_numbers (folder, key, value) VALUES (?1, ?2, ?3)",
            params![folder, key, value],
        )?;
        Ok(())
    }
}

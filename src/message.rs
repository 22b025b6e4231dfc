use std::collections::HashSet;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// Message flags the engine knows how to track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flag {
    Seen,
    Answered,
    Flagged,
    Deleted,
    Draft,
    Forwarded,
    Custom(String),
}

impl Flag {
    /// Parse an IMAP flag atom such as `\Seen` or `$Forwarded`.
    ///
    /// `\Recent` is session state rather than message state, so it is dropped.
    pub fn parse(atom: &str) -> Option<Flag> {
        let atom = atom.trim();
        if atom.is_empty() {
            return None;
        }
        let flag = match atom.to_ascii_lowercase().as_str() {
            "\\seen" => Flag::Seen,
            "\\answered" => Flag::Answered,
            "\\flagged" => Flag::Flagged,
            "\\deleted" => Flag::Deleted,
            "\\draft" => Flag::Draft,
            "\\recent" => return None,
            "$forwarded" => Flag::Forwarded,
            _ => Flag::Custom(atom.to_string()),
        };
        Some(flag)
    }

    pub fn as_imap_str(&self) -> &str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Answered => "\\Answered",
            Flag::Flagged => "\\Flagged",
            Flag::Deleted => "\\Deleted",
            Flag::Draft => "\\Draft",
            Flag::Forwarded => "$Forwarded",
            Flag::Custom(name) => name,
        }
    }
}

/// How much of a message body the local store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    /// Headers only; the message exceeded the auto-download size.
    Envelope,
    Full,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadState::Envelope => "envelope",
            DownloadState::Full => "full",
        }
    }

    pub fn from_str_lossy(value: &str) -> DownloadState {
        match value {
            "envelope" => DownloadState::Envelope,
            _ => DownloadState::Full,
        }
    }
}

/// What a UID listing returns for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessageSummary {
    pub uid: u32,
    pub flags: HashSet<Flag>,
    pub date: Option<DateTime<FixedOffset>>,
    pub size: Option<u32>,
}

impl RemoteMessageSummary {
    pub fn server_id(&self) -> String {
        self.uid.to_string()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(&Flag::Deleted)
    }
}

/// A message as persisted by the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessageRecord {
    pub server_id: String,
    pub flags: HashSet<Flag>,
    pub download_state: DownloadState,
    pub date: Option<DateTime<Utc>>,
    pub size: Option<u32>,
    pub subject: String,
    pub from: String,
    pub body: Option<Vec<u8>>,
}

impl LocalMessageRecord {
    /// Build a record from a downloaded message, filling subject and sender from its headers.
    pub fn from_download(
        summary: &RemoteMessageSummary,
        raw: &[u8],
        download_state: DownloadState,
    ) -> Self {
        let mut record = LocalMessageRecord {
            server_id: summary.server_id(),
            flags: summary.flags.clone(),
            download_state,
            date: summary.date.map(|d| d.with_timezone(&Utc)),
            size: summary.size,
            subject: String::new(),
            from: String::new(),
            body: Some(raw.to_vec()),
        };

        if let Some(parsed) = mail_parser::Message::parse(raw) {
            record.subject = parsed.subject().unwrap_or_default().to_string();

            if record.date.is_none() {
                if let Some(date) = parsed.date() {
                    record.date = DateTime::from_timestamp(date.to_timestamp(), 0);
                }
            }

            record.from = match parsed.from() {
                mail_parser::HeaderValue::Address(addr) => format_address(addr),
                mail_parser::HeaderValue::AddressList(addrs) => addrs
                    .iter()
                    .map(format_address)
                    .collect::<Vec<_>>()
                    .join(", "),
                _ => String::new(),
            };
        }

        record
    }
}

fn format_address(addr: &mail_parser::Addr) -> String {
    let name = addr.name.as_ref().map(|n| n.to_string()).unwrap_or_default();
    let address = addr.address.as_ref().map(|a| a.to_string()).unwrap_or_default();
    if name.is_empty() {
        address
    } else {
        format!("{} <{}>", name, address)
    }
}

/// When deleted messages are expunged on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpungePolicy {
    Immediately,
    Manually,
    OnPoll,
}

/// Caller-supplied settings for one sync pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub expunge_policy: ExpungePolicy,
    pub earliest_poll_date: Option<DateTime<FixedOffset>>,
    pub sync_remote_deletions: bool,
    pub maximum_auto_download_message_size: u32,
    /// Number of most recent messages considered; 0 means the whole folder.
    pub default_visible_limit: u32,
    pub sync_flags: HashSet<Flag>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            expunge_policy: ExpungePolicy::Immediately,
            earliest_poll_date: None,
            sync_remote_deletions: true,
            maximum_auto_download_message_size: 32 * 1024,
            default_visible_limit: 25,
            sync_flags: [Flag::Seen, Flag::Flagged, Flag::Answered, Flag::Forwarded]
                .into_iter()
                .collect(),
        }
    }
}

/// A folder as announced to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub server_id: String,
    pub name: String,
}

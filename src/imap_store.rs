use std::io::{Read, Write};
use std::net::TcpStream;

use chrono::{DateTime, FixedOffset};
use imap::types::Fetch;
use imap::Session;
use native_tls::{TlsConnector, TlsStream};

use crate::config::{ImapSecurity, ServerSettings};
use crate::error::MailError;
use crate::message::{Flag, FolderInfo, RemoteMessageSummary};
use crate::remote::{FetchMode, OpenMode, RemoteFolder, RemoteStore};

const SUMMARY_QUERY: &str = "(UID FLAGS INTERNALDATE RFC822.SIZE)";

enum ImapSession {
    Secure(Session<TlsStream<TcpStream>>),
    Plain(Session<TcpStream>),
}

macro_rules! on_session {
    ($session:expr, $s:ident => $body:expr) => {
        match $session {
            ImapSession::Secure($s) => $body,
            ImapSession::Plain($s) => $body,
        }
    };
}

fn connect(settings: &ServerSettings) -> Result<ImapSession, MailError> {
    let domain = settings.host.as_str();
    let addr = (domain, settings.port);

    match settings.security {
        ImapSecurity::SSL | ImapSecurity::StartTLS => {
            let tls = TlsConnector::builder().build()?;
            let client = if settings.security == ImapSecurity::SSL {
                imap::connect(addr, domain, &tls)?
            } else {
                imap::connect_starttls(addr, domain, &tls)?
            };
            let session = client
                .login(&settings.username, &settings.password)
                .map_err(|e| e.0)?;
            Ok(ImapSession::Secure(session))
        }
        ImapSecurity::None => {
            let tcp_stream = TcpStream::connect(addr)?;
            let client = imap::Client::new(tcp_stream);
            let session = client
                .login(&settings.username, &settings.password)
                .map_err(|e| e.0)?;
            Ok(ImapSession::Plain(session))
        }
    }
}

fn summary_from_fetch(fetch: &Fetch) -> Option<RemoteMessageSummary> {
    let uid = fetch.uid?;
    Some(RemoteMessageSummary {
        uid,
        flags: fetch
            .flags()
            .iter()
            .filter_map(|f| Flag::parse(&f.to_string()))
            .collect(),
        date: fetch.internal_date(),
        size: fetch.size,
    })
}

fn list_range<T: Read + Write>(
    session: &mut Session<T>,
    start: u32,
    end: u32,
    earliest_date: Option<DateTime<FixedOffset>>,
) -> Result<Vec<RemoteMessageSummary>, MailError> {
    let sequence = format!("{}:{}", start, end);

    let fetches = match earliest_date {
        None => session.fetch(sequence, SUMMARY_QUERY)?,
        Some(date) => {
            let query = format!("{} SINCE {}", sequence, date.format("%d-%b-%Y"));
            let mut uids: Vec<u32> = session.uid_search(query)?.into_iter().collect();
            if uids.is_empty() {
                return Ok(Vec::new());
            }
            uids.sort_unstable();
            let uid_set = uids
                .iter()
                .map(|uid| uid.to_string())
                .collect::<Vec<_>>()
                .join(",");
            session.uid_fetch(uid_set, SUMMARY_QUERY)?
        }
    };

    Ok(fetches.iter().filter_map(summary_from_fetch).collect())
}

fn fetch_one<T: Read + Write>(session: &mut Session<T>, uid: u32, mode: FetchMode) -> Result<Vec<u8>, MailError> {
    let query = match mode {
        FetchMode::Full => "(UID BODY.PEEK[])",
        FetchMode::Header => "(UID BODY.PEEK[HEADER])",
    };
    let fetches = session.uid_fetch(uid.to_string(), query)?;
    let fetch = fetches
        .iter()
        .find(|f| f.uid == Some(uid))
        .or_else(|| fetches.iter().next())
        .ok_or_else(|| MailError::Imap(format!("Message {} not found", uid)))?;

    let data = match mode {
        FetchMode::Full => fetch.body(),
        FetchMode::Header => fetch.header(),
    };
    data.map(|d| d.to_vec())
        .ok_or_else(|| MailError::Imap(format!("Server returned no data for message {}", uid)))
}

/// [`RemoteStore`] backed by a blocking `imap` session per folder handle.
pub struct ImapStore {
    settings: ServerSettings,
}

impl ImapStore {
    pub fn new(settings: ServerSettings) -> Self {
        Self { settings }
    }

    pub fn list_folders(&self) -> Result<Vec<FolderInfo>, MailError> {
        let mut session = connect(&self.settings)?;
        let folders = on_session!(&mut session, s => {
            let names = s.list(None, Some("*"))?;
            names
                .iter()
                .map(|n| FolderInfo {
                    server_id: n.name().to_string(),
                    name: n.name().to_string(),
                })
                .collect::<Vec<_>>()
        });
        if let Err(e) = on_session!(&mut session, s => s.logout()) {
            log::debug!("LOGOUT after LIST failed: {}", e);
        }
        Ok(folders)
    }
}

impl RemoteStore for ImapStore {
    fn folder(&self, server_id: &str) -> Result<Box<dyn RemoteFolder>, MailError> {
        Ok(Box::new(ImapFolder {
            settings: self.settings.clone(),
            server_id: server_id.to_string(),
            session: None,
            mode: None,
            exists: None,
            uid_validity: None,
        }))
    }
}

pub struct ImapFolder {
    settings: ServerSettings,
    server_id: String,
    session: Option<ImapSession>,
    mode: Option<OpenMode>,
    exists: Option<u32>,
    uid_validity: Option<u32>,
}

impl ImapFolder {
    fn session(&mut self) -> Result<&mut ImapSession, MailError> {
        self.session
            .as_mut()
            .ok_or_else(|| MailError::InvalidState(format!("Folder {} is not open", self.server_id)))
    }
}

impl RemoteFolder for ImapFolder {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn open(&mut self, mode: OpenMode) -> Result<(), MailError> {
        if self.session.is_none() {
            self.session = Some(connect(&self.settings)?);
        }
        let name = self.server_id.clone();
        let session = self.session()?;
        let mailbox = match mode {
            OpenMode::ReadOnly => on_session!(session, s => s.examine(&name)?),
            OpenMode::ReadWrite => on_session!(session, s => s.select(&name)?),
        };

        log::debug!(
            "Opened {} ({:?}): exists={}, uidvalidity={:?}",
            self.server_id,
            mode,
            mailbox.exists,
            mailbox.uid_validity
        );
        self.mode = Some(mode);
        self.exists = Some(mailbox.exists);
        self.uid_validity = mailbox.uid_validity;
        Ok(())
    }

    fn message_count(&self) -> Result<i64, MailError> {
        self.exists
            .map(i64::from)
            .ok_or_else(|| MailError::InvalidState(format!("Folder {} is not open", self.server_id)))
    }

    fn uid_validity(&self) -> Option<u64> {
        self.uid_validity.map(u64::from)
    }

    fn list_messages(
        &mut self,
        start: u32,
        end: u32,
        earliest_date: Option<DateTime<FixedOffset>>,
    ) -> Result<Vec<RemoteMessageSummary>, MailError> {
        if start == 0 || start > end {
            return Ok(Vec::new());
        }
        let session = self.session()?;
        on_session!(session, s => list_range(s, start, end, earliest_date))
    }

    fn fetch_message(&mut self, uid: u32, mode: FetchMode) -> Result<Vec<u8>, MailError> {
        let session = self.session()?;
        on_session!(session, s => fetch_one(s, uid, mode))
    }

    fn expunge(&mut self) -> Result<(), MailError> {
        if self.mode != Some(OpenMode::ReadWrite) {
            // EXPUNGE needs the folder selected read-write.
            self.open(OpenMode::ReadWrite)?;
        }
        let session = self.session()?;
        on_session!(session, s => s.expunge()?);
        log::debug!("Expunged {}", self.server_id);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            // LOGOUT rather than CLOSE: CLOSE would expunge a read-write folder.
            if let Err(e) = on_session!(&mut session, s => s.logout()) {
                log::debug!("LOGOUT for {} failed: {}", self.server_id, e);
            }
        }
        self.mode = None;
        self.exists = None;
    }
}

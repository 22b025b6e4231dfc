use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use imap_proto::parser::parse_response;
use imap_proto::{Capability, MailboxDatum, Response, Status};

use crate::error::MailError;
use crate::message::RemoteMessageSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// How much of a message to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Full,
    /// Header section only, for messages above the auto-download size.
    Header,
}

/// Entry point to the server side of one account.
pub trait RemoteStore: Send + Sync {
    /// Get a handle for a folder. The handle is not opened yet.
    fn folder(&self, server_id: &str) -> Result<Box<dyn RemoteFolder>, MailError>;
}

/// One folder on the server. A handle is single-owner for its lifetime.
pub trait RemoteFolder: Send {
    fn server_id(&self) -> &str;

    fn open(&mut self, mode: OpenMode) -> Result<(), MailError>;

    /// Number of messages reported by the server when the folder was opened.
    fn message_count(&self) -> Result<i64, MailError>;

    fn uid_validity(&self) -> Option<u64>;

    /// List UIDs, flags, dates and sizes for the sequence range `start..=end`,
    /// limited to messages received on or after `earliest_date` when given.
    fn list_messages(
        &mut self,
        start: u32,
        end: u32,
        earliest_date: Option<DateTime<FixedOffset>>,
    ) -> Result<Vec<RemoteMessageSummary>, MailError>;

    fn fetch_message(&mut self, uid: u32, mode: FetchMode) -> Result<Vec<u8>, MailError>;

    fn expunge(&mut self) -> Result<(), MailError>;

    /// Release the folder. Never fails; problems are only logged.
    fn close(&mut self);
}

/// Raw protocol access needed to run IDLE on a folder.
///
/// All methods take `&self`: `send_continuation` is called from other threads
/// while `read_response` is blocked on the idling thread.
pub trait IdleConnection: Send + Sync {
    /// Connect if needed and open the folder.
    fn open(&self, mode: OpenMode) -> Result<(), MailError>;

    fn is_idle_capable(&self) -> Result<bool, MailError>;

    fn is_connected(&self) -> bool;

    /// Send a tagged command and return its tag.
    fn send_command(&self, command: &str) -> Result<String, MailError>;

    /// Send a bare line such as `DONE`.
    fn send_continuation(&self, text: &str) -> Result<(), MailError>;

    /// Block until the next complete response arrives.
    fn read_response(&self) -> Result<ImapResponse, MailError>;

    fn set_socket_read_timeout(&self, timeout: Duration) -> Result<(), MailError>;

    fn set_socket_default_read_timeout(&self) -> Result<(), MailError>;

    fn close(&self);
}

/// Hands out IDLE connections per folder.
pub trait IdleStore: Send + Sync {
    fn idle_connection(&self, folder_server_id: &str) -> Result<Arc<dyn IdleConnection>, MailError>;
}

/// Condition of a status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    No,
    Bad,
    PreAuth,
    Bye,
}

impl From<Status> for ResponseStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => ResponseStatus::Ok,
            Status::No => ResponseStatus::No,
            Status::Bad => ResponseStatus::Bad,
            Status::PreAuth => ResponseStatus::PreAuth,
            Status::Bye => ResponseStatus::Bye,
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResponseStatus::Ok => "OK",
            ResponseStatus::No => "NO",
            ResponseStatus::Bad => "BAD",
            ResponseStatus::PreAuth => "PREAUTH",
            ResponseStatus::Bye => "BYE",
        };
        f.write_str(s)
    }
}

/// The parts of a server response the engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    /// `+` continuation request.
    Continuation,
    /// Tagged completion of a command.
    Completion { tag: String, status: ResponseStatus },
    /// Untagged `OK`, `NO`, `BAD`, `PREAUTH` or `BYE`.
    Status(ResponseStatus),
    Exists(u32),
    Expunge(u32),
    Fetch(u32),
    Capabilities(Vec<String>),
    /// Untagged data nothing here looks at.
    Other,
}

/// One server response, parsed by `imap-proto`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapResponse {
    pub kind: ResponseKind,
    /// Human readable text of status and continuation responses.
    pub text: String,
}

/// Outcome of looking for one response at the start of a buffer.
pub(crate) enum Framed {
    /// A response and the number of bytes it took.
    Response(ImapResponse, usize),
    Incomplete,
    /// A complete line the parser does not understand, and its length.
    Unparsed(usize),
}

pub(crate) fn parse_next(buf: &[u8]) -> Framed {
    match parse_response(buf) {
        Ok((rest, response)) => Framed::Response(ImapResponse::from(response), buf.len() - rest.len()),
        Err(e) if e.is_incomplete() => Framed::Incomplete,
        Err(_) => match buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => Framed::Unparsed(pos + 2),
            None => Framed::Incomplete,
        },
    }
}

fn capability_name(capability: &Capability<'_>) -> String {
    match capability {
        Capability::Imap4rev1 => "IMAP4rev1".to_string(),
        Capability::Auth(mechanism) => format!("AUTH={}", mechanism),
        Capability::Atom(atom) => atom.to_string(),
    }
}

impl From<Response<'_>> for ImapResponse {
    fn from(response: Response<'_>) -> Self {
        let (kind, information) = match response {
            Response::Continue { information, .. } => (ResponseKind::Continuation, information),
            Response::Done {
                tag,
                status,
                information,
                ..
            } => (
                ResponseKind::Completion {
                    tag: tag.0,
                    status: status.into(),
                },
                information,
            ),
            Response::Data {
                status, information, ..
            } => (ResponseKind::Status(status.into()), information),
            Response::MailboxData(MailboxDatum::Exists(n)) => (ResponseKind::Exists(n), None),
            Response::Expunge(n) => (ResponseKind::Expunge(n), None),
            Response::Fetch(n, _) => (ResponseKind::Fetch(n), None),
            Response::Capabilities(caps) => (
                ResponseKind::Capabilities(caps.iter().map(capability_name).collect()),
                None,
            ),
            _ => (ResponseKind::Other, None),
        };
        ImapResponse {
            kind,
            text: information.map(|t| t.into_owned()).unwrap_or_default(),
        }
    }
}

impl ImapResponse {
    /// Parse exactly one complete response.
    pub fn parse(raw: &[u8]) -> Result<ImapResponse, MailError> {
        match parse_next(raw) {
            Framed::Response(response, _) => Ok(response),
            Framed::Incomplete => Err(MailError::Protocol("Incomplete response".to_string())),
            Framed::Unparsed(len) => Err(MailError::Protocol(format!(
                "Unparseable response: {}",
                String::from_utf8_lossy(&raw[..len]).trim_end()
            ))),
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.kind == ResponseKind::Continuation
    }

    pub fn is_tagged(&self) -> bool {
        matches!(self.kind, ResponseKind::Completion { .. })
    }

    pub fn is_tagged_with(&self, tag: &str) -> bool {
        matches!(&self.kind, ResponseKind::Completion { tag: t, .. } if t == tag)
    }

    /// Untagged `EXISTS`, `EXPUNGE` or `FETCH`: something a sync pass should look at.
    pub fn is_relevant(&self) -> bool {
        matches!(
            self.kind,
            ResponseKind::Exists(_) | ResponseKind::Expunge(_) | ResponseKind::Fetch(_)
        )
    }

    /// Tagged completion with `OK`.
    pub fn is_ok(&self) -> bool {
        matches!(
            self.kind,
            ResponseKind::Completion {
                status: ResponseStatus::Ok,
                ..
            }
        )
    }

    pub fn status(&self) -> Option<ResponseStatus> {
        match &self.kind {
            ResponseKind::Completion { status, .. } | ResponseKind::Status(status) => Some(*status),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> Option<&[String]> {
        match &self.kind {
            ResponseKind::Capabilities(caps) => Some(caps),
            _ => None,
        }
    }

    /// Untagged `CAPABILITY` response listing `IDLE`.
    pub fn lists_idle_capability(&self) -> bool {
        self.capabilities()
            .map(|caps| caps.iter().any(|cap| cap.eq_ignore_ascii_case("IDLE")))
            .unwrap_or(false)
    }
}

impl fmt::Display for ImapResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ResponseKind::Continuation => write!(f, "+")?,
            ResponseKind::Completion { tag, status } => write!(f, "{} {}", tag, status)?,
            ResponseKind::Status(status) => write!(f, "* {}", status)?,
            ResponseKind::Exists(n) => write!(f, "* {} EXISTS", n)?,
            ResponseKind::Expunge(n) => write!(f, "* {} EXPUNGE", n)?,
            ResponseKind::Fetch(n) => write!(f, "* {} FETCH", n)?,
            ResponseKind::Capabilities(caps) => write!(f, "* CAPABILITY {}", caps.join(" "))?,
            ResponseKind::Other => write!(f, "*")?,
        }
        if !self.text.is_empty() {
            write!(f, " {}", self.text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_untagged_exists() {
        let response = ImapResponse::parse(b"* 23 EXISTS\r\n").unwrap();
        assert_eq!(response.kind, ResponseKind::Exists(23));
        assert!(!response.is_tagged());
        assert!(response.is_relevant());
    }

    #[test]
    fn fetch_and_expunge_are_relevant() {
        let fetch = ImapResponse::parse(b"* 4 FETCH (FLAGS (\\Seen \\Answered) UID 17)\r\n").unwrap();
        assert_eq!(fetch.kind, ResponseKind::Fetch(4));
        assert!(fetch.is_relevant());

        let expunge = ImapResponse::parse(b"* 9 EXPUNGE\r\n").unwrap();
        assert_eq!(expunge.kind, ResponseKind::Expunge(9));
        assert!(expunge.is_relevant());
    }

    #[test]
    fn classifies_tagged_and_continuation_responses() {
        let done = ImapResponse::parse(b"A7 OK IDLE terminated\r\n").unwrap();
        assert!(done.is_tagged_with("A7"));
        assert!(!done.is_tagged_with("A8"));
        assert!(done.is_ok());
        assert!(!done.is_relevant());

        let refused = ImapResponse::parse(b"A8 NO not now\r\n").unwrap();
        assert!(!refused.is_ok());
        assert_eq!(refused.status(), Some(ResponseStatus::No));
        assert_eq!(refused.to_string(), "A8 NO not now");

        let cont = ImapResponse::parse(b"+ idling\r\n").unwrap();
        assert!(cont.is_continuation());
        assert!(!cont.is_tagged());
        assert!(!cont.is_relevant());
    }

    #[test]
    fn status_responses_are_not_relevant() {
        let recent = ImapResponse::parse(b"* 2 RECENT\r\n").unwrap();
        let ok = ImapResponse::parse(b"* OK Still here\r\n").unwrap();
        assert!(!recent.is_relevant());
        assert!(!ok.is_relevant());
        assert_eq!(ok.status(), Some(ResponseStatus::Ok));
        assert_eq!(ok.text, "Still here");
    }

    #[test]
    fn literal_must_arrive_completely() {
        let raw = b"* 1 FETCH (UID 8 BODY[] {5}\r\nHello)\r\n+ idling\r\n";
        match parse_next(raw) {
            Framed::Response(response, len) => {
                assert_eq!(response.kind, ResponseKind::Fetch(1));
                assert_eq!(&raw[len..], b"+ idling\r\n");
            }
            _ => panic!("expected a complete FETCH"),
        }
        assert!(matches!(parse_next(&raw[..30]), Framed::Incomplete));
        assert!(matches!(parse_next(b"* 3 EXI"), Framed::Incomplete));
    }

    #[test]
    fn detects_idle_capability() {
        let caps = ImapResponse::parse(b"* CAPABILITY IMAP4rev1 LITERAL+ idle\r\n").unwrap();
        assert!(caps.lists_idle_capability());
        let without = ImapResponse::parse(b"* CAPABILITY IMAP4rev1 UIDPLUS\r\n").unwrap();
        assert!(!without.lists_idle_capability());
    }

    #[test]
    fn garbage_line_is_skipped_whole() {
        assert!(matches!(parse_next(b"\x01\x02 what\r\n* 1 EXISTS\r\n"), Framed::Unparsed(9)));
        assert!(matches!(ImapResponse::parse(b"\r\n"), Err(MailError::Protocol(_))));
        assert!(matches!(ImapResponse::parse(b""), Err(MailError::Protocol(_))));
    }
}
